// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer allocation, DMA-BUF export, and the queue/dequeue protocol of both queues.

use std::sync::Arc;

use nix::errno::Errno;

use crate::decoder::ioctl_error;
use crate::decoder::request::Request;
use crate::decoder::DecoderError;
use crate::decoder::DecoderResult;
use crate::decoder::DecoderShared;
use crate::decoder::V4l2Decoder;
use crate::device::DecoderDevice;
use crate::device::DequeuedBuffer;
use crate::device::QueueBuffer;
use crate::QueueKind;

/// One memory plane of an exported buffer.
#[derive(Debug)]
pub struct ExportedPlane<F> {
    /// DMA-BUF descriptor, closed when the plane is dropped.
    pub fd: F,
    pub size: usize,
    pub offset: usize,
}

/// A driver-allocated MMAP buffer whose planes have been exported for zero-copy sharing.
#[derive(Debug)]
pub struct ExportedBuffer<F> {
    queue: QueueKind,
    index: u32,
    planes: Vec<ExportedPlane<F>>,
}

impl<F> ExportedBuffer<F> {
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn planes(&self) -> &[ExportedPlane<F>] {
        &self.planes
    }

    fn expect_queue(&self, expected: QueueKind) -> DecoderResult<()> {
        if self.queue != expected {
            return Err(DecoderError::WrongQueue {
                index: self.index,
                expected,
                actual: self.queue,
            });
        }
        Ok(())
    }
}

impl<D: DecoderDevice> DecoderShared<D> {
    pub(crate) fn dequeue(&self, queue: QueueKind) -> DecoderResult<DequeuedBuffer> {
        let nodes = self.nodes();
        match self.device.dqbuf(nodes.video()?, queue) {
            Ok(buffer) => {
                log::debug!(
                    "Dequeued {} buffer {} (frame {})",
                    queue,
                    buffer.index,
                    buffer.frame_id
                );
                Ok(buffer)
            }
            Err(Errno::EAGAIN) => {
                log::debug!("No completed buffer on the {} queue", queue);
                Err(DecoderError::NotReady(queue))
            }
            Err(errno) => Err(ioctl_error("VIDIOC_DQBUF")(errno)),
        }
    }
}

impl<D: DecoderDevice> V4l2Decoder<D> {
    /// Allocates `count` MMAP buffers on `queue` and returns how many the driver actually
    /// allocated, which may be fewer.
    pub fn request_buffers(&self, queue: QueueKind, count: u32) -> DecoderResult<u32> {
        let shared = self.shared();
        let nodes = shared.nodes();

        log::debug!("Requesting {} buffers on the {} queue", count, queue);
        let allocated = shared
            .device
            .reqbufs(nodes.video()?, queue, count)
            .map_err(ioctl_error("VIDIOC_REQBUFS"))?;

        if count > 0 && allocated == 0 {
            log::error!("Driver allocated no buffers on the {} queue", queue);
            return Err(DecoderError::NoBuffersAllocated(queue));
        }

        Ok(allocated)
    }

    /// Frees every buffer of `queue`. Exported descriptors stay valid until closed.
    pub fn release_buffers(&self, queue: QueueKind) -> DecoderResult<()> {
        self.request_buffers(queue, 0).map(|_| ())
    }

    /// Exports every plane of buffer `index` of `queue` as a DMA-BUF.
    ///
    /// Either all planes are exported, or none is: descriptors exported before a failing plane
    /// are closed before returning the error.
    pub fn export_buffer(
        &self,
        queue: QueueKind,
        index: u32,
    ) -> DecoderResult<ExportedBuffer<D::Fd>> {
        let shared = self.shared();
        let nodes = shared.nodes();
        let video = nodes.video()?;

        let layouts = shared
            .device
            .querybuf(video, queue, index)
            .map_err(ioctl_error("VIDIOC_QUERYBUF"))?;

        let mut planes = Vec::with_capacity(layouts.len());
        for (plane, layout) in layouts.iter().enumerate() {
            let fd = match shared.device.expbuf(video, queue, index, plane as u32) {
                Ok(fd) => fd,
                Err(errno) => {
                    if !planes.is_empty() {
                        log::debug!(
                            "Closing {} planes already exported for {} buffer {}",
                            planes.len(),
                            queue,
                            index
                        );
                    }
                    return Err(ioctl_error("VIDIOC_EXPBUF")(errno));
                }
            };
            planes.push(ExportedPlane {
                fd,
                size: layout.length as usize,
                offset: layout.data_offset as usize,
            });
        }

        Ok(ExportedBuffer { queue, index, planes })
    }

    /// Queues `bytes_used` bytes of bitstream in `buffer` as part of `request`.
    ///
    /// `frame_id` is carried through to the decoded picture. The request keeps `buffer` alive
    /// until it is marked done or freed.
    pub fn enqueue_input(
        &self,
        request: &mut Request<D>,
        buffer: &Arc<ExportedBuffer<D::Fd>>,
        frame_id: u32,
        bytes_used: u32,
    ) -> DecoderResult<()> {
        let shared = self.shared();
        if !request.belongs_to(shared) {
            return Err(DecoderError::ForeignRequest(request.id()));
        }
        buffer.expect_queue(QueueKind::Input)?;

        {
            let nodes = shared.nodes();
            shared
                .device
                .qbuf(
                    nodes.video()?,
                    &QueueBuffer {
                        queue: QueueKind::Input,
                        index: buffer.index(),
                        frame_id,
                        bytes_used: &[bytes_used],
                        request: Some(request.fd()),
                    },
                )
                .map_err(ioctl_error("VIDIOC_QBUF"))?;
        }

        request.attach_bitstream(Arc::clone(buffer));

        Ok(())
    }

    /// Queues a picture buffer to be decoded into. Every plane is handed over whole.
    ///
    /// Picture buffers are not bound to a request: the driver picks the destination through
    /// the `frame_id` references carried in the codec controls.
    pub fn enqueue_output(
        &self,
        buffer: &ExportedBuffer<D::Fd>,
        frame_id: u32,
    ) -> DecoderResult<()> {
        buffer.expect_queue(QueueKind::Output)?;

        let bytes_used: Vec<u32> = buffer.planes().iter().map(|p| p.size as u32).collect();
        let shared = self.shared();
        let nodes = shared.nodes();
        shared
            .device
            .qbuf(
                nodes.video()?,
                &QueueBuffer {
                    queue: QueueKind::Output,
                    index: buffer.index(),
                    frame_id,
                    bytes_used: &bytes_used,
                    request: None,
                },
            )
            .map_err(ioctl_error("VIDIOC_QBUF"))
    }

    /// Dequeues the next consumed bitstream buffer.
    ///
    /// Completion order on the input queue is up to the driver; callers normally let
    /// [`Request::set_done`] do this.
    pub fn dequeue_input(&self) -> DecoderResult<DequeuedBuffer> {
        self.shared().dequeue(QueueKind::Input)
    }

    /// Dequeues the next decoded picture. Its `frame_id` identifies the frame it belongs to.
    pub fn dequeue_output(&self) -> DecoderResult<DequeuedBuffer> {
        self.shared().dequeue(QueueKind::Output)
    }
}
