// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel format negotiation on the bitstream and picture queues.

use nix::errno::Errno;

use crate::decoder::ioctl_error;
use crate::decoder::DecoderError;
use crate::decoder::DecoderResult;
use crate::decoder::V4l2Decoder;
use crate::device::DecoderDevice;
use crate::device::PixFormatMplane;
use crate::format::DecodedFormat;
use crate::format::OutputCaps;
use crate::format::VideoInfo;
use crate::Fourcc;
use crate::QueueKind;

pub(crate) const VIDIOC_S_FMT: &str = "VIDIOC_S_FMT";

impl<D: DecoderDevice> V4l2Decoder<D> {
    /// Returns the bitstream format at position `index` of the driver's list, or `None` once
    /// `index` is past the end of it.
    pub fn enumerate_input_formats(&self, index: u32) -> DecoderResult<Option<Fourcc>> {
        let shared = self.shared();
        let nodes = shared.nodes();

        match shared.device.enum_fmt(nodes.video()?, QueueKind::Input, index) {
            Ok(desc) => {
                log::debug!("Found format {} ({})", desc.pixelformat, desc.description);
                Ok(Some(desc.pixelformat))
            }
            Err(Errno::EINVAL) => Ok(None),
            Err(errno) => Err(ioctl_error("VIDIOC_ENUM_FMT")(errno)),
        }
    }

    /// Every bitstream format the driver accepts, in driver order.
    pub fn input_formats(&self) -> DecoderResult<Vec<Fourcc>> {
        let mut formats = Vec::new();
        for index in 0.. {
            match self.enumerate_input_formats(index)? {
                Some(fourcc) => formats.push(fourcc),
                None => break,
            }
        }
        Ok(formats)
    }

    /// Sets the bitstream format. The driver must accept exactly the requested pixel format
    /// and coded size, anything else is reported as [`DecoderError::FormatMismatch`].
    pub fn set_input_format(
        &self,
        pixelformat: Fourcc,
        width: u32,
        height: u32,
    ) -> DecoderResult<()> {
        let shared = self.shared();
        let nodes = shared.nodes();

        let requested = PixFormatMplane { pixelformat, width, height, planes: Vec::new() };
        let applied = shared
            .device
            .s_fmt(nodes.video()?, QueueKind::Input, &requested)
            .map_err(ioctl_error(VIDIOC_S_FMT))?;

        if applied.pixelformat != pixelformat || applied.width != width || applied.height != height
        {
            log::warn!(
                "Failed to set input format to {} {}x{}, driver selected {} {}x{}",
                pixelformat,
                width,
                height,
                applied.pixelformat,
                applied.width,
                applied.height
            );
            return Err(DecoderError::FormatMismatch {
                queue: QueueKind::Input,
                requested: pixelformat,
                width,
                height,
                got: applied.pixelformat,
                got_width: applied.width,
                got_height: applied.height,
            });
        }

        Ok(())
    }

    /// The decoded formats the picture queue can produce, the currently selected one first.
    ///
    /// Driver formats with no [`DecodedFormat`] equivalent are skipped.
    pub fn enumerate_output_formats(&self) -> DecoderResult<OutputCaps> {
        let shared = self.shared();
        let nodes = shared.nodes();
        let video = nodes.video()?;

        let current = shared
            .device
            .g_fmt(video, QueueKind::Output)
            .map_err(ioctl_error("VIDIOC_G_FMT"))?;

        let mut caps = OutputCaps::default();
        match DecodedFormat::from_fourcc(current.pixelformat) {
            Some(format) => caps.push(format),
            None => log::debug!("Current output format {} is not mappable", current.pixelformat),
        }

        for index in 0.. {
            let desc = match shared.device.enum_fmt(video, QueueKind::Output, index) {
                Ok(desc) => desc,
                Err(Errno::EINVAL) => break,
                Err(errno) => {
                    log::error!("VIDIOC_ENUM_FMT failed: {}", errno);
                    break;
                }
            };

            if let Some(format) = DecodedFormat::from_fourcc(desc.pixelformat) {
                caps.push(format);
            }
        }

        Ok(caps)
    }

    /// Settles the picture format against the formats acceptable to the caller.
    ///
    /// The driver's current format is kept if it is one of `candidates`. Otherwise the first
    /// candidate is applied. Returns the geometry of the resulting format.
    pub fn select_output_format(&self, candidates: &[DecodedFormat]) -> DecoderResult<VideoInfo> {
        let preferred = *candidates.first().ok_or(DecoderError::NoCandidates)?;

        let shared = self.shared();
        let nodes = shared.nodes();
        let video = nodes.video()?;

        let mut format = shared
            .device
            .g_fmt(video, QueueKind::Output)
            .map_err(ioctl_error("VIDIOC_G_FMT"))?;

        let keep_current = DecodedFormat::from_fourcc(format.pixelformat)
            .is_some_and(|current| candidates.contains(&current));

        if !keep_current {
            log::debug!("Trying to use peer format: {}", preferred);
            format.pixelformat = preferred.to_fourcc();
            format = shared
                .device
                .s_fmt(video, QueueKind::Output, &format)
                .map_err(ioctl_error(VIDIOC_S_FMT))?;
        }

        let info = VideoInfo::from_pix_format(&format).ok_or_else(|| {
            log::error!("Unsupported V4L2 pixelformat {}", format.pixelformat);
            DecoderError::UnsupportedPixelFormat(format.pixelformat)
        })?;

        log::info!("Selected format {} {}x{}", info.format, info.width, info.height);

        Ok(info)
    }
}
