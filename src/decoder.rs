// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A stateless decoder session: the media and video device nodes, the pool of reusable media
//! requests, and the operations codec backends drive them with.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use nix::errno::Errno;
use thiserror::Error;

use crate::config::DecoderConfig;
use crate::decoder::request::RequestId;
use crate::decoder::request::RequestSlot;
use crate::device::DecoderDevice;
use crate::device::DeviceNode;
use crate::Fourcc;
use crate::QueueKind;

pub mod buffer;
pub mod controls;
pub mod negotiation;
pub mod request;

pub use buffer::ExportedBuffer;
pub use buffer::ExportedPlane;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("decoder is not opened")]
    NotOpened,
    #[error("failed to open '{}': {errno}", path.display())]
    Open { path: PathBuf, errno: Errno },
    #[error("{op} failed: {errno}")]
    Ioctl { op: &'static str, errno: Errno },
    #[error(
        "failed to set {queue} format to {requested} {width}x{height}, driver selected \
         {got} {got_width}x{got_height}"
    )]
    FormatMismatch {
        queue: QueueKind,
        requested: Fourcc,
        width: u32,
        height: u32,
        got: Fourcc,
        got_width: u32,
        got_height: u32,
    },
    #[error("unsupported V4L2 pixel format {0}")]
    UnsupportedPixelFormat(Fourcc),
    #[error("no candidate output format")]
    NoCandidates,
    #[error("driver allocated no buffers on the {0} queue")]
    NoBuffersAllocated(QueueKind),
    #[error("no completed buffer available on the {0} queue")]
    NotReady(QueueKind),
    #[error("buffer {index} belongs to the {actual} queue, expected the {expected} queue")]
    WrongQueue { index: u32, expected: QueueKind, actual: QueueKind },
    #[error("request {0} has no bitstream buffer attached")]
    NoBitstream(RequestId),
    #[error("request {0} was allocated by another decoder")]
    ForeignRequest(RequestId),
}

impl DecoderError {
    /// The system error code behind this failure, if any.
    ///
    /// A format the driver accepted with different parameters reports `EINVAL`, and an empty
    /// non-blocking queue reports `EAGAIN`.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            DecoderError::Open { errno, .. } | DecoderError::Ioctl { errno, .. } => Some(*errno),
            DecoderError::FormatMismatch { .. } => Some(Errno::EINVAL),
            DecoderError::NotReady(_) => Some(Errno::EAGAIN),
            _ => None,
        }
    }

    /// Whether the session cannot continue after this error. Anything else only fails the
    /// frame being decoded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecoderError::NotOpened
                | DecoderError::Open { .. }
                | DecoderError::FormatMismatch { .. }
                | DecoderError::Ioctl { op: negotiation::VIDIOC_S_FMT, .. }
        )
    }
}

pub type DecoderResult<T> = Result<T, DecoderError>;

/// Logs a failed kernel call and wraps it into a [`DecoderError`].
pub(crate) fn ioctl_error(op: &'static str) -> impl FnOnce(Errno) -> DecoderError {
    move |errno| {
        log::error!("{} failed: {}", op, errno);
        DecoderError::Ioctl { op, errno }
    }
}

pub(crate) struct Nodes<F> {
    media: Option<F>,
    video: Option<F>,
    opened: bool,
}

impl<F> Nodes<F> {
    pub(crate) fn is_opened(&self) -> bool {
        self.opened
    }

    pub(crate) fn media(&self) -> DecoderResult<&F> {
        match (self.opened, &self.media) {
            (true, Some(media)) => Ok(media),
            _ => Err(DecoderError::NotOpened),
        }
    }

    pub(crate) fn video(&self) -> DecoderResult<&F> {
        match (self.opened, &self.video) {
            (true, Some(video)) => Ok(video),
            _ => Err(DecoderError::NotOpened),
        }
    }
}

/// State shared between a session and the requests it has lent out.
pub(crate) struct DecoderShared<D: DecoderDevice> {
    pub(crate) device: D,
    config: DecoderConfig,
    nodes: RwLock<Nodes<D::Fd>>,
    pool: Mutex<VecDeque<RequestSlot<D>>>,
    next_request_id: AtomicU64,
}

impl<D: DecoderDevice> DecoderShared<D> {
    pub(crate) fn nodes(&self) -> RwLockReadGuard<'_, Nodes<D::Fd>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn nodes_mut(&self) -> RwLockWriteGuard<'_, Nodes<D::Fd>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn pool(&self) -> MutexGuard<'_, VecDeque<RequestSlot<D>>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// A stateless decoder session over one media node and one video node.
///
/// All operations take `&self`: requests may be allocated, polled and freed from several
/// threads at once, and the kernel is relied upon to serialize concurrent calls on the device
/// nodes.
pub struct V4l2Decoder<D: DecoderDevice> {
    shared: Arc<DecoderShared<D>>,
}

impl<D: DecoderDevice> V4l2Decoder<D> {
    pub fn new(device: D, config: DecoderConfig) -> Self {
        Self {
            shared: Arc::new(DecoderShared {
                device,
                config,
                nodes: RwLock::new(Nodes { media: None, video: None, opened: false }),
                pool: Mutex::new(VecDeque::new()),
                next_request_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.shared.config
    }

    pub fn is_opened(&self) -> bool {
        self.shared.nodes().is_opened()
    }

    /// Opens the media node and then the video node.
    ///
    /// If the video node fails to open the media node stays open until [`Self::close`] is
    /// called or the decoder is dropped.
    pub fn open(&self) -> DecoderResult<()> {
        let shared = &self.shared;
        let config = &shared.config;
        let mut nodes = shared.nodes_mut();

        if nodes.opened {
            log::warn!("Decoder is already opened");
            return Ok(());
        }

        let media = shared.device.open(config.media_device(), DeviceNode::Media, false).map_err(
            |errno| {
                log::error!("Failed to open '{}': {}", config.media_device().display(), errno);
                DecoderError::Open { path: config.media_device().to_path_buf(), errno }
            },
        )?;
        nodes.media = Some(media);

        let video = shared
            .device
            .open(config.video_device(), DeviceNode::Video, config.nonblocking_dqbuf())
            .map_err(|errno| {
                log::error!("Failed to open '{}': {}", config.video_device().display(), errno);
                DecoderError::Open { path: config.video_device().to_path_buf(), errno }
            })?;
        nodes.video = Some(video);
        nodes.opened = true;

        log::debug!(
            "Opened {} and {}",
            config.media_device().display(),
            config.video_device().display()
        );

        Ok(())
    }

    /// Destroys every pooled request and closes both device nodes.
    ///
    /// Requests still on loan are destroyed when they are freed. Their pending kernel
    /// transactions are invalidated by closing the nodes. Dropping the decoder does not close
    /// anything while requests are on loan: the nodes are closed once the last of them is freed.
    pub fn close(&self) {
        let shared = &self.shared;
        let mut nodes = shared.nodes_mut();

        let drained: Vec<_> = shared.pool().drain(..).collect();
        for slot in drained {
            log::debug!("Destroying pooled request {}", slot.id());
        }

        // Each node is closed exactly once, when its handle is dropped.
        nodes.media = None;
        nodes.video = None;
        nodes.opened = false;
    }

    pub fn stream_on(&self, queue: QueueKind) -> DecoderResult<()> {
        let nodes = self.shared.nodes();
        self.shared
            .device
            .stream_on(nodes.video()?, queue)
            .map_err(ioctl_error("VIDIOC_STREAMON"))
    }

    pub fn stream_off(&self, queue: QueueKind) -> DecoderResult<()> {
        let nodes = self.shared.nodes();
        self.shared
            .device
            .stream_off(nodes.video()?, queue)
            .map_err(ioctl_error("VIDIOC_STREAMOFF"))
    }

    /// Stops and restarts both queues, returning every queued buffer to userspace.
    pub fn flush(&self) -> DecoderResult<()> {
        // A failed stop does not prevent the queues from being started again, which is all
        // that matters here.
        let _ = self.stream_off(QueueKind::Input);
        let _ = self.stream_off(QueueKind::Output);

        self.stream_on(QueueKind::Input)?;
        self.stream_on(QueueKind::Output)
    }

    /// Number of idle requests ready to be handed out without a kernel allocation.
    pub fn idle_requests(&self) -> usize {
        self.shared.pool().len()
    }

    pub(crate) fn shared(&self) -> &Arc<DecoderShared<D>> {
        &self.shared
    }
}

// Runs once the session handle and every loaned request are gone.
impl<D: DecoderDevice> Drop for DecoderShared<D> {
    fn drop(&mut self) {
        let pooled = self.pool.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !pooled.is_empty() {
            log::debug!("Destroying {} pooled requests", pooled.len());
        }
        pooled.clear();

        let nodes = self.nodes.get_mut().unwrap_or_else(PoisonError::into_inner);
        if nodes.opened {
            log::debug!(
                "Closing {} and {}",
                self.config.media_device().display(),
                self.config.video_device().display()
            );
        }
        nodes.media = None;
        nodes.video = None;
        nodes.opened = false;
    }
}

#[cfg(feature = "v4l2")]
impl V4l2Decoder<crate::device::v4l2::V4l2Device> {
    /// Creates a session backed by the kernel's V4L2 and media controller interfaces.
    pub fn from_config(config: DecoderConfig) -> Self {
        Self::new(crate::device::v4l2::V4l2Device, config)
    }
}
