// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Media requests and their pool.
//!
//! A request moves through `pooled -> loaned -> pending -> loaned -> pooled`. Allocating pops an
//! idle kernel request from the session's pool, or allocates a new one when the pool is empty.
//! Freeing re-initializes the kernel request and pushes it back. Requests that are still pending,
//! that fail to re-initialize, or whose session has been closed are destroyed instead, so the
//! pool only ever holds clean kernel objects.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::decoder::ioctl_error;
use crate::decoder::DecoderError;
use crate::decoder::DecoderResult;
use crate::decoder::DecoderShared;
use crate::decoder::ExportedBuffer;
use crate::decoder::V4l2Decoder;
use crate::device::DecoderDevice;
use crate::QueueKind;

/// Identity of a kernel request object, stable across recycling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of waiting on a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    Ready,
    TimedOut,
}

/// A kernel request object together with its wait handle. Dropping it closes both.
pub(crate) struct RequestSlot<D: DecoderDevice> {
    id: RequestId,
    fd: D::Fd,
    waiter: D::Waiter,
}

impl<D: DecoderDevice> RequestSlot<D> {
    pub(crate) fn id(&self) -> RequestId {
        self.id
    }
}

/// A media request on loan from a [`V4l2Decoder`].
///
/// Holds the session alive while on loan. Dropping a request is the same as calling
/// [`Request::free`].
pub struct Request<D: DecoderDevice> {
    decoder: Arc<DecoderShared<D>>,
    id: RequestId,
    /// Always `Some` until the request is dropped.
    slot: Option<RequestSlot<D>>,
    bitstream: Option<Arc<ExportedBuffer<D::Fd>>>,
    pending: bool,
}

impl<D: DecoderDevice> fmt::Debug for Request<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("fd", &self.slot.as_ref().map(|slot| &slot.fd))
            .field("bitstream", &self.bitstream.as_ref().map(|b| b.index()))
            .field("pending", &self.pending)
            .finish()
    }
}

impl<D: DecoderDevice> V4l2Decoder<D> {
    /// Hands out an idle request, allocating a new kernel request if none is pooled.
    pub fn alloc_request(&self) -> DecoderResult<Request<D>> {
        let shared = self.shared();
        let nodes = shared.nodes();
        let media = nodes.media()?;

        let pooled = shared.pool().pop_front();
        let slot = match pooled {
            Some(slot) => {
                log::debug!("Reusing request {}", slot.id);
                slot
            }
            None => {
                let fd = shared
                    .device
                    .request_alloc(media)
                    .map_err(ioctl_error("MEDIA_IOC_REQUEST_ALLOC"))?;
                let waiter = shared
                    .device
                    .request_waiter(&fd)
                    .map_err(ioctl_error("request wait handle creation"))?;
                let id = shared.next_request_id();
                log::debug!("Allocated request {}", id);
                RequestSlot { id, fd, waiter }
            }
        };

        Ok(Request {
            decoder: Arc::clone(shared),
            id: slot.id,
            slot: Some(slot),
            bitstream: None,
            pending: false,
        })
    }
}

impl<D: DecoderDevice> Request<D> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Whether the request has been queued and not yet marked done.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn is_done(&self) -> bool {
        !self.pending
    }

    pub fn has_bitstream(&self) -> bool {
        self.bitstream.is_some()
    }

    fn slot(&self) -> &RequestSlot<D> {
        self.slot.as_ref().expect("request slot is only taken on drop")
    }

    pub(crate) fn fd(&self) -> &D::Fd {
        &self.slot().fd
    }

    pub(crate) fn belongs_to(&self, decoder: &Arc<DecoderShared<D>>) -> bool {
        Arc::ptr_eq(&self.decoder, decoder)
    }

    pub(crate) fn attach_bitstream(&mut self, buffer: Arc<ExportedBuffer<D::Fd>>) {
        if let Some(previous) = self.bitstream.replace(buffer) {
            log::warn!(
                "Request {} already carried input buffer {}, replacing it",
                self.id,
                previous.index()
            );
        }
    }

    /// Submits the request for execution.
    ///
    /// A request can only be queued once an input buffer has been enqueued with it, otherwise
    /// this fails with [`DecoderError::NoBitstream`] and the request stays idle.
    pub fn queue(&mut self) -> DecoderResult<()> {
        if self.bitstream.is_none() {
            log::error!("Refusing to queue request {} without a bitstream buffer", self.id);
            return Err(DecoderError::NoBitstream(self.id));
        }

        log::debug!("Queuing request {}", self.id);
        self.decoder
            .device
            .request_queue(self.fd())
            .map_err(ioctl_error("MEDIA_REQUEST_IOC_QUEUE"))?;
        self.pending = true;

        Ok(())
    }

    /// Waits until the request completes, or `timeout` elapses. `None` waits forever.
    pub fn poll(&self, timeout: Option<Duration>) -> DecoderResult<PollStatus> {
        let ready = self
            .decoder
            .device
            .wait(&self.slot().waiter, timeout)
            .map_err(ioctl_error("request poll"))?;

        Ok(if ready { PollStatus::Ready } else { PollStatus::TimedOut })
    }

    /// Marks a completed request as done.
    ///
    /// If an input buffer is attached, its completion is dequeued from the input queue and the
    /// buffer is released. The request is no longer pending afterwards even if the dequeue
    /// failed.
    pub fn set_done(&mut self) -> DecoderResult<()> {
        let result = match self.bitstream.take() {
            Some(_bitstream) => self.decoder.dequeue(QueueKind::Input).map(|_| ()),
            None => Ok(()),
        };
        self.pending = false;

        result
    }

    /// Returns the request to its session's pool.
    pub fn free(self) {}
}

impl<D: DecoderDevice> Drop for Request<D> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        self.bitstream = None;

        if self.pending {
            log::debug!("Freeing pending request {}", slot.id);
            return;
        }

        // Holding the nodes lock keeps `close()` from draining the pool under our feet.
        let nodes = self.decoder.nodes();
        if !nodes.is_opened() {
            log::debug!("Destroying request {} of a closed decoder", slot.id);
            return;
        }

        if let Err(errno) = self.decoder.device.request_reinit(&slot.fd) {
            log::error!("MEDIA_REQUEST_IOC_REINIT failed on request {}: {}", slot.id, errno);
            return;
        }

        log::debug!("Recycling request {}", slot.id);
        self.decoder.pool().push_back(slot);
    }
}
