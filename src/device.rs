// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The kernel calls a stateless decoder session is built on.
//!
//! Every call is blocking and fallible, and reports failure through the `errno` of the
//! underlying system call. [`DecoderDevice`] is deliberately narrow so the session logic can run
//! against an in-memory driver in tests.

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;

use crate::Fourcc;
use crate::QueueKind;

#[cfg(test)]
pub(crate) mod fake;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub type DeviceResult<T> = Result<T, Errno>;

/// Maximum number of memory planes of a V4L2 buffer (`VIDEO_MAX_PLANES`).
pub const MAX_PLANES: usize = 8;

/// The two nodes a stateless decoder is exposed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceNode {
    /// Media controller node, used to allocate requests.
    Media,
    /// Video node, used for formats, buffers, streaming and controls.
    Video,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    pub bytesperline: u32,
    pub sizeimage: u32,
}

/// The subset of `v4l2_pix_format_mplane` the session negotiates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PixFormatMplane {
    pub pixelformat: Fourcc,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneFormat>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatDesc {
    pub pixelformat: Fourcc,
    pub description: String,
}

/// Layout of one memory plane of an allocated buffer, as returned by `VIDIOC_QUERYBUF`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub length: u32,
    pub data_offset: u32,
}

/// Parameters of a single `VIDIOC_QBUF` on an MMAP queue.
#[derive(Debug)]
pub struct QueueBuffer<'a, F> {
    pub queue: QueueKind,
    pub index: u32,
    /// Carried in the buffer timestamp and returned unchanged on dequeue.
    pub frame_id: u32,
    /// Bytes used, one entry per memory plane.
    pub bytes_used: &'a [u32],
    /// Request the buffer is bound to, if any.
    pub request: Option<&'a F>,
}

/// A buffer returned by `VIDIOC_DQBUF`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub frame_id: u32,
    pub bytes_used: Vec<u32>,
    /// `V4L2_BUF_FLAG_*` flags reported by the driver.
    pub flags: u32,
}

impl DequeuedBuffer {
    /// `V4L2_BUF_FLAG_ERROR`
    pub const FLAG_ERROR: u32 = 0x0000_0040;

    /// Whether the driver flagged the buffer's content as corrupted.
    pub fn is_error(&self) -> bool {
        self.flags & Self::FLAG_ERROR != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlPayload {
    Value(i32),
    Value64(i64),
    /// Raw bytes of a compound control such as `v4l2_ctrl_h264_sps`.
    Compound(Vec<u8>),
}

/// One entry of a `VIDIOC_S_EXT_CTRLS` batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtControl {
    pub id: u32,
    pub payload: ControlPayload,
}

impl ExtControl {
    pub fn value(id: u32, value: i32) -> Self {
        Self { id, payload: ControlPayload::Value(value) }
    }

    pub fn value64(id: u32, value: i64) -> Self {
        Self { id, payload: ControlPayload::Value64(value) }
    }

    pub fn compound(id: u32, data: Vec<u8>) -> Self {
        Self { id, payload: ControlPayload::Compound(data) }
    }
}

/// Where a batch of controls applies.
#[derive(Debug)]
pub enum CtrlScope<'a, F> {
    /// Applied immediately to the device (`V4L2_CTRL_WHICH_CUR_VAL`).
    Current,
    /// Stored in a request and applied when it executes (`V4L2_CTRL_WHICH_REQUEST_VAL`).
    Request(&'a F),
}

pub trait DecoderDevice: Send + Sync {
    /// An open kernel object. Dropping it closes the underlying descriptor.
    type Fd: Debug + Send + Sync;
    /// Waits for a request to signal completion.
    type Waiter: Send + Sync;

    fn open(&self, path: &Path, node: DeviceNode, nonblocking: bool) -> DeviceResult<Self::Fd>;

    fn stream_on(&self, video: &Self::Fd, queue: QueueKind) -> DeviceResult<()>;
    fn stream_off(&self, video: &Self::Fd, queue: QueueKind) -> DeviceResult<()>;

    /// `VIDIOC_ENUM_FMT`. `EINVAL` marks the end of the enumeration.
    fn enum_fmt(&self, video: &Self::Fd, queue: QueueKind, index: u32) -> DeviceResult<FormatDesc>;
    fn g_fmt(&self, video: &Self::Fd, queue: QueueKind) -> DeviceResult<PixFormatMplane>;
    /// `VIDIOC_S_FMT`. Returns the format the driver actually applied.
    fn s_fmt(
        &self,
        video: &Self::Fd,
        queue: QueueKind,
        format: &PixFormatMplane,
    ) -> DeviceResult<PixFormatMplane>;

    /// `VIDIOC_REQBUFS` with MMAP memory. Returns the number of buffers allocated.
    fn reqbufs(&self, video: &Self::Fd, queue: QueueKind, count: u32) -> DeviceResult<u32>;
    fn querybuf(&self, video: &Self::Fd, queue: QueueKind, index: u32)
        -> DeviceResult<Vec<PlaneLayout>>;
    /// `VIDIOC_EXPBUF`. Returns a DMA-BUF descriptor for one plane of a buffer.
    fn expbuf(
        &self,
        video: &Self::Fd,
        queue: QueueKind,
        index: u32,
        plane: u32,
    ) -> DeviceResult<Self::Fd>;

    fn qbuf(&self, video: &Self::Fd, buffer: &QueueBuffer<'_, Self::Fd>) -> DeviceResult<()>;
    fn dqbuf(&self, video: &Self::Fd, queue: QueueKind) -> DeviceResult<DequeuedBuffer>;

    /// `VIDIOC_S_EXT_CTRLS`. The kernel applies the whole batch or nothing.
    fn s_ext_ctrls(
        &self,
        video: &Self::Fd,
        scope: CtrlScope<'_, Self::Fd>,
        controls: &[ExtControl],
    ) -> DeviceResult<()>;

    /// `MEDIA_IOC_REQUEST_ALLOC`
    fn request_alloc(&self, media: &Self::Fd) -> DeviceResult<Self::Fd>;
    /// `MEDIA_REQUEST_IOC_QUEUE`
    fn request_queue(&self, request: &Self::Fd) -> DeviceResult<()>;
    /// `MEDIA_REQUEST_IOC_REINIT`
    fn request_reinit(&self, request: &Self::Fd) -> DeviceResult<()>;
    /// Creates the wait handle used to poll `request` for completion.
    fn request_waiter(&self, request: &Self::Fd) -> DeviceResult<Self::Waiter>;
    /// Blocks until the request watched by `waiter` completes or `timeout` elapses. `None`
    /// waits forever. Returns `false` on timeout.
    fn wait(&self, waiter: &Self::Waiter, timeout: Option<Duration>) -> DeviceResult<bool>;
}
