// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Request and buffer lifecycle engine for V4L2 stateless video decoders.
//!
//! A decode operation is expressed as a media *request*: one bitstream buffer on the input
//! queue, the per-frame codec controls, and a picture buffer on the output queue. This crate
//! owns the device nodes, negotiates formats, exports buffers as DMA-BUF descriptors, and
//! pools kernel request objects. Deciding *what* to submit is left to codec-aware callers.

pub mod config;
pub mod decoder;
pub mod device;
pub mod format;

#[cfg(feature = "v4l2")]
pub use v4l2r;

pub use config::CodecDevice;
pub use config::DecoderConfig;
pub use decoder::request::PollStatus;
pub use decoder::request::Request;
pub use decoder::request::RequestId;
pub use decoder::DecoderError;
pub use decoder::DecoderResult;
pub use decoder::ExportedBuffer;
pub use decoder::V4l2Decoder;
pub use format::DecodedFormat;
pub use format::OutputCaps;
pub use format::VideoInfo;

use std::fmt;

/// A V4L2 pixel format code.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Fourcc(pub u32);

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        [n.0 as u8, (n.0 >> 8) as u8, (n.0 >> 16) as u8, (n.0 >> 24) as u8]
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let c: [u8; 4] = (*self).into();
        f.write_fmt(format_args!(
            "{}{}{}{}",
            c[0] as char, c[1] as char, c[2] as char, c[3] as char
        ))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// The two queues of a stateless decoder.
///
/// V4L2 names queues from the device's point of view: `Input` is the bitstream queue
/// (`V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE`) and `Output` is the decoded picture queue
/// (`V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Input,
    Output,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueKind::Input => f.write_str("input"),
            QueueKind::Output => f.write_str("output"),
        }
    }
}
