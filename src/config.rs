// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Construction-time parameters of a decoder session.

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

/// `MEDIA_ENT_F_PROC_VIDEO_DECODER` from `linux/media.h`.
pub const MEDIA_ENT_F_PROC_VIDEO_DECODER: u32 = 0x4005;

/// A media controller entity found while probing the system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecDevice {
    pub name: String,
    /// Media entity function, one of the `MEDIA_ENT_F_*` values.
    pub function: u32,
    pub media_device_path: PathBuf,
    pub video_device_path: PathBuf,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("entity {name} has function {function:#x}, not a stateless video decoder")]
    NotADecoder { name: String, function: u32 },
}

/// Immutable description of the two device nodes backing a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    media_device: PathBuf,
    video_device: PathBuf,
    nonblocking_dqbuf: bool,
}

impl DecoderConfig {
    pub fn new<M: AsRef<Path>, V: AsRef<Path>>(media_device: M, video_device: V) -> Self {
        Self {
            media_device: media_device.as_ref().to_path_buf(),
            video_device: video_device.as_ref().to_path_buf(),
            nonblocking_dqbuf: true,
        }
    }

    /// Open the video node in blocking mode, so that dequeueing waits for a completed buffer
    /// instead of failing with `EAGAIN`.
    pub fn blocking_dqbuf(mut self) -> Self {
        self.nonblocking_dqbuf = false;
        self
    }

    pub fn media_device(&self) -> &Path {
        &self.media_device
    }

    pub fn video_device(&self) -> &Path {
        &self.video_device
    }

    pub fn nonblocking_dqbuf(&self) -> bool {
        self.nonblocking_dqbuf
    }
}

impl TryFrom<&CodecDevice> for DecoderConfig {
    type Error = ConfigError;

    fn try_from(device: &CodecDevice) -> Result<Self, Self::Error> {
        if device.function != MEDIA_ENT_F_PROC_VIDEO_DECODER {
            return Err(ConfigError::NotADecoder {
                name: device.name.clone(),
                function: device.function,
            });
        }

        Ok(Self::new(&device.media_device_path, &device.video_device_path))
    }
}
