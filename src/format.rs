// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mapping between V4L2 pixel formats and the decoded picture formats we hand out, and the
//! plane geometry derived from a negotiated multi-planar format.

use std::fmt;
use std::str::FromStr;

use crate::device::PixFormatMplane;
use crate::Fourcc;

pub const V4L2_PIX_FMT_NV12: Fourcc = Fourcc(u32::from_le_bytes(*b"NV12"));
pub const V4L2_PIX_FMT_NV12M: Fourcc = Fourcc(u32::from_le_bytes(*b"NM12"));
pub const V4L2_PIX_FMT_YUV420: Fourcc = Fourcc(u32::from_le_bytes(*b"YU12"));
pub const V4L2_PIX_FMT_YUV420M: Fourcc = Fourcc(u32::from_le_bytes(*b"YM12"));
pub const V4L2_PIX_FMT_YUYV: Fourcc = Fourcc(u32::from_le_bytes(*b"YUYV"));
pub const V4L2_PIX_FMT_P010: Fourcc = Fourcc(u32::from_le_bytes(*b"P010"));
pub const V4L2_PIX_FMT_MM21: Fourcc = Fourcc(u32::from_le_bytes(*b"MM21"));
pub const V4L2_PIX_FMT_NV12_4L4: Fourcc = Fourcc(u32::from_le_bytes(*b"VT12"));
pub const V4L2_PIX_FMT_NV12_32L32: Fourcc = Fourcc(u32::from_le_bytes(*b"ST12"));

/// Layout of a decoded picture as exposed to the rest of the pipeline.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
    YUYV,
    P010,
    /// MediaTek 16x32 tiled NV12.
    MM21,
    /// NV12 in 4x4 tiles.
    NV12_4L4,
    /// NV12 in 32x32 tiles.
    NV12_32L32,
}

impl DecodedFormat {
    /// Maps a driver pixel format. Formats we cannot describe return `None`.
    pub fn from_fourcc(fourcc: Fourcc) -> Option<Self> {
        match fourcc {
            V4L2_PIX_FMT_NV12 | V4L2_PIX_FMT_NV12M => Some(DecodedFormat::NV12),
            V4L2_PIX_FMT_YUV420 | V4L2_PIX_FMT_YUV420M => Some(DecodedFormat::I420),
            V4L2_PIX_FMT_YUYV => Some(DecodedFormat::YUYV),
            V4L2_PIX_FMT_P010 => Some(DecodedFormat::P010),
            V4L2_PIX_FMT_MM21 => Some(DecodedFormat::MM21),
            V4L2_PIX_FMT_NV12_4L4 => Some(DecodedFormat::NV12_4L4),
            V4L2_PIX_FMT_NV12_32L32 => Some(DecodedFormat::NV12_32L32),
            _ => None,
        }
    }

    /// The pixel format to request from the driver for this layout.
    pub fn to_fourcc(self) -> Fourcc {
        match self {
            DecodedFormat::NV12 => V4L2_PIX_FMT_NV12,
            DecodedFormat::I420 => V4L2_PIX_FMT_YUV420,
            DecodedFormat::YUYV => V4L2_PIX_FMT_YUYV,
            DecodedFormat::P010 => V4L2_PIX_FMT_P010,
            DecodedFormat::MM21 => V4L2_PIX_FMT_MM21,
            DecodedFormat::NV12_4L4 => V4L2_PIX_FMT_NV12_4L4,
            DecodedFormat::NV12_32L32 => V4L2_PIX_FMT_NV12_32L32,
        }
    }

    /// Number of colour planes, independently of how many memory planes carry them.
    pub fn num_planes(self) -> usize {
        match self {
            DecodedFormat::YUYV => 1,
            DecodedFormat::I420 => 3,
            _ => 2,
        }
    }

    fn height_alignment(self) -> u32 {
        match self {
            DecodedFormat::MM21 | DecodedFormat::NV12_32L32 => 32,
            DecodedFormat::NV12_4L4 => 4,
            _ => 1,
        }
    }

    fn plane_stride(self, plane: usize, luma_stride: u32) -> u32 {
        match (self, plane) {
            (_, 0) => luma_stride,
            (DecodedFormat::I420, _) => luma_stride.div_ceil(2),
            _ => luma_stride,
        }
    }

    fn plane_height(self, plane: usize, height: u32) -> u32 {
        match plane {
            0 => height,
            _ => height.div_ceil(2),
        }
    }
}

impl fmt::Display for DecodedFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DecodedFormat::NV12 => "NV12",
            DecodedFormat::I420 => "I420",
            DecodedFormat::YUYV => "YUYV",
            DecodedFormat::P010 => "P010",
            DecodedFormat::MM21 => "MM21",
            DecodedFormat::NV12_4L4 => "NV12_4L4",
            DecodedFormat::NV12_32L32 => "NV12_32L32",
        };
        f.write_str(name)
    }
}

impl FromStr for DecodedFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nv12" => Ok(DecodedFormat::NV12),
            "i420" => Ok(DecodedFormat::I420),
            "yuyv" => Ok(DecodedFormat::YUYV),
            "p010" => Ok(DecodedFormat::P010),
            "mm21" => Ok(DecodedFormat::MM21),
            "nv12_4l4" => Ok(DecodedFormat::NV12_4L4),
            "nv12_32l32" => Ok(DecodedFormat::NV12_32L32),
            _ => Err(format!("unrecognized decoded format: {}", s)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Bytes per line.
    pub stride: u32,
    /// Offset of the plane from the start of the picture's first memory plane, counting all
    /// previous memory planes back to back.
    pub offset: usize,
}

/// Full geometry of a negotiated decoded picture format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoInfo {
    pub format: DecodedFormat,
    pub fourcc: Fourcc,
    pub width: u32,
    pub height: u32,
    /// Number of separate memory planes a buffer of this format is made of.
    pub num_memory_planes: usize,
    pub planes: Vec<PlaneInfo>,
    pub size: usize,
}

impl VideoInfo {
    /// Derives the geometry of `fmt`. Returns `None` if the pixel format is unknown or its memory
    /// plane count does not match any layout we can describe.
    pub fn from_pix_format(fmt: &PixFormatMplane) -> Option<Self> {
        let format = DecodedFormat::from_fourcc(fmt.pixelformat)?;
        let num_planes = format.num_planes();

        let (planes, size) = match fmt.planes.len() {
            // One memory plane per colour plane.
            n if n == num_planes => {
                let mut offset = 0usize;
                let planes = fmt
                    .planes
                    .iter()
                    .map(|p| {
                        let plane = PlaneInfo { stride: p.bytesperline, offset };
                        offset += p.sizeimage as usize;
                        plane
                    })
                    .collect();
                (planes, offset)
            }
            // All colour planes packed in a single memory plane.
            1 => {
                let luma_stride = fmt.planes[0].bytesperline;
                let height = fmt.height.next_multiple_of(format.height_alignment());
                let mut offset = 0usize;
                let planes = (0..num_planes)
                    .map(|i| {
                        let stride = format.plane_stride(i, luma_stride);
                        let plane = PlaneInfo { stride, offset };
                        offset += stride as usize * format.plane_height(i, height) as usize;
                        plane
                    })
                    .collect();
                (planes, std::cmp::max(offset, fmt.planes[0].sizeimage as usize))
            }
            _ => return None,
        };

        Some(Self {
            format,
            fourcc: fmt.pixelformat,
            width: fmt.width,
            height: fmt.height,
            num_memory_planes: fmt.planes.len(),
            planes,
            size,
        })
    }
}

/// Ordered set of decoded formats a decoder can produce. The first entry is the format the
/// driver currently has selected.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputCaps {
    formats: Vec<DecodedFormat>,
}

impl OutputCaps {
    /// Appends `format` unless it is already present.
    pub fn push(&mut self, format: DecodedFormat) {
        if !self.formats.contains(&format) {
            self.formats.push(format);
        }
    }

    /// The driver's current format, if it could be mapped.
    pub fn preferred(&self) -> Option<DecodedFormat> {
        self.formats.first().copied()
    }

    pub fn formats(&self) -> &[DecodedFormat] {
        &self.formats
    }

    pub fn contains(&self, format: DecodedFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }
}

impl FromIterator<DecodedFormat> for OutputCaps {
    fn from_iter<I: IntoIterator<Item = DecodedFormat>>(iter: I) -> Self {
        let mut caps = OutputCaps::default();
        for format in iter {
            caps.push(format);
        }
        caps
    }
}
