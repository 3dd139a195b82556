// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory stateless decoder driver for unit tests.
//!
//! Tracks every handle it gives out so tests can check that nothing leaks, records the calls
//! that matter for negotiation and queuing, and lets tests inject failures. Requests complete
//! as soon as they are queued unless completion is held back.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use nix::errno::Errno;

use crate::device::CtrlScope;
use crate::device::DecoderDevice;
use crate::device::DequeuedBuffer;
use crate::device::DeviceNode;
use crate::device::DeviceResult;
use crate::device::ExtControl;
use crate::device::FormatDesc;
use crate::device::PixFormatMplane;
use crate::device::PlaneFormat;
use crate::device::PlaneLayout;
use crate::device::QueueBuffer;
use crate::format::V4L2_PIX_FMT_MM21;
use crate::format::V4L2_PIX_FMT_NV12;
use crate::format::V4L2_PIX_FMT_NV12M;
use crate::Fourcc;
use crate::QueueKind;

const BITSTREAM_BUFFER_SIZE: u32 = 1 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum FdKind {
    Node(DeviceNode),
    Request,
    DmaBuf,
}

pub(crate) struct FakeFd {
    raw: i32,
    kind: FdKind,
    state: Arc<Mutex<FakeState>>,
}

impl fmt::Debug for FakeFd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FakeFd").field("raw", &self.raw).field("kind", &self.kind).finish()
    }
}

impl Drop for FakeFd {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.open.remove(&self.raw).is_some(), "fd {} closed twice", self.raw);
        *state.closed.entry(self.kind).or_default() += 1;
    }
}

pub(crate) struct FakeWaiter {
    request: i32,
}

/// A buffer as it was handed to `VIDIOC_QBUF`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct QueuedRecord {
    pub index: u32,
    pub frame_id: u32,
    pub bytes_used: Vec<u32>,
    pub request: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ControlBatch {
    pub request: Option<i32>,
    pub controls: Vec<ExtControl>,
}

#[derive(Default)]
struct FakeState {
    next_raw: i32,
    open: HashMap<i32, FdKind>,
    closed: HashMap<FdKind, usize>,
    open_failures: HashMap<DeviceNode, Errno>,
    video_nonblocking: bool,

    streaming: HashSet<QueueKind>,
    stream_on_calls: Vec<QueueKind>,
    stream_on_failures: HashMap<QueueKind, Errno>,
    stream_off_failure: Option<Errno>,

    input_formats: Vec<Fourcc>,
    output_formats: Vec<Fourcc>,
    formats: HashMap<QueueKind, PixFormatMplane>,
    max_input_size: (u32, u32),
    s_fmt_calls: HashMap<QueueKind, Vec<Fourcc>>,
    s_fmt_failure: Option<Errno>,
    enum_failure: Option<Errno>,

    buffer_caps: HashMap<QueueKind, u32>,
    buffer_counts: HashMap<QueueKind, u32>,
    reqbufs_failure: Option<Errno>,
    querybuf_calls: Vec<(QueueKind, u32)>,
    expbuf_failure_plane: Option<u32>,
    qbuf_failure: Option<Errno>,
    queued: HashMap<QueueKind, Vec<QueuedRecord>>,
    in_flight: HashMap<QueueKind, VecDeque<QueuedRecord>>,
    dequeued: HashMap<QueueKind, Vec<u32>>,
    next_output_error: bool,

    controls: HashMap<u32, ExtControl>,
    control_batches: Vec<ControlBatch>,
    rejected_controls: HashSet<u32>,

    allocated_requests: usize,
    request_alloc_failure: Option<Errno>,
    queued_requests: usize,
    executing: HashSet<i32>,
    reinit_calls: usize,
    reinit_failure: Option<Errno>,
    hold_completion: bool,
    wait_failure: Option<Errno>,
}

impl FakeState {
    fn count_open(&self, kind: FdKind) -> usize {
        self.open.values().filter(|k| **k == kind).count()
    }

    fn is_complete(&self, request: i32) -> bool {
        !self.hold_completion && self.executing.contains(&request)
    }
}

fn input_format(pixelformat: Fourcc, width: u32, height: u32) -> PixFormatMplane {
    PixFormatMplane {
        pixelformat,
        width,
        height,
        planes: vec![PlaneFormat { bytesperline: 0, sizeimage: BITSTREAM_BUFFER_SIZE }],
    }
}

fn output_format(pixelformat: Fourcc, width: u32, height: u32) -> PixFormatMplane {
    let plane = |bytesperline: u32, sizeimage: u32| PlaneFormat { bytesperline, sizeimage };
    let planes = match pixelformat {
        V4L2_PIX_FMT_NV12M => vec![plane(width, width * height), plane(width, width * height / 2)],
        V4L2_PIX_FMT_MM21 => {
            let height = height.next_multiple_of(32);
            vec![plane(width, width * height), plane(width, width * height / 2)]
        }
        _ => vec![plane(width, width * height * 3 / 2)],
    };
    PixFormatMplane { pixelformat, width, height, planes }
}

#[derive(Clone)]
pub(crate) struct FakeDevice {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub(crate) fn new() -> Self {
        let h264 = Fourcc::from(b"S264");
        let state = FakeState {
            next_raw: 3,
            input_formats: vec![h264, Fourcc::from(b"S265"), Fourcc::from(b"VP9F")],
            output_formats: vec![V4L2_PIX_FMT_NV12, V4L2_PIX_FMT_NV12M, V4L2_PIX_FMT_MM21],
            formats: HashMap::from([
                (QueueKind::Input, input_format(h264, 1920, 1080)),
                (QueueKind::Output, output_format(V4L2_PIX_FMT_NV12, 1920, 1080)),
            ]),
            max_input_size: (4096, 2304),
            ..Default::default()
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn new_fd(&self, state: &mut FakeState, kind: FdKind) -> FakeFd {
        let raw = state.next_raw;
        state.next_raw += 1;
        state.open.insert(raw, kind);
        FakeFd { raw, kind, state: Arc::clone(&self.state) }
    }

    // Failure injection.

    pub(crate) fn fail_open(&self, node: DeviceNode, errno: Errno) {
        self.state().open_failures.insert(node, errno);
    }

    pub(crate) fn fail_stream_on(&self, queue: QueueKind, errno: Errno) {
        self.state().stream_on_failures.insert(queue, errno);
    }

    pub(crate) fn fail_stream_off(&self, errno: Errno) {
        self.state().stream_off_failure = Some(errno);
    }

    pub(crate) fn fail_enum_fmt(&self, errno: Errno) {
        self.state().enum_failure = Some(errno);
    }

    pub(crate) fn fail_s_fmt(&self, errno: Errno) {
        self.state().s_fmt_failure = Some(errno);
    }

    pub(crate) fn fail_reqbufs(&self, errno: Errno) {
        self.state().reqbufs_failure = Some(errno);
    }

    pub(crate) fn fail_expbuf_at_plane(&self, plane: Option<u32>) {
        self.state().expbuf_failure_plane = plane;
    }

    pub(crate) fn fail_qbuf(&self, errno: Errno) {
        self.state().qbuf_failure = Some(errno);
    }

    pub(crate) fn fail_request_alloc(&self, errno: Errno) {
        self.state().request_alloc_failure = Some(errno);
    }

    pub(crate) fn fail_reinit(&self, errno: Errno) {
        self.state().reinit_failure = Some(errno);
    }

    pub(crate) fn fail_wait(&self, errno: Errno) {
        self.state().wait_failure = Some(errno);
    }

    pub(crate) fn reject_control(&self, id: u32) {
        self.state().rejected_controls.insert(id);
    }

    // Driver configuration.

    pub(crate) fn set_input_formats(&self, formats: &[Fourcc]) {
        self.state().input_formats = formats.to_vec();
    }

    pub(crate) fn set_output_formats(&self, formats: &[Fourcc]) {
        self.state().output_formats = formats.to_vec();
    }

    pub(crate) fn set_output_format(&self, pixelformat: Fourcc, width: u32, height: u32) {
        self.state().formats.insert(QueueKind::Output, output_format(pixelformat, width, height));
    }

    pub(crate) fn set_max_input_size(&self, width: u32, height: u32) {
        self.state().max_input_size = (width, height);
    }

    /// Caps the number of buffers `VIDIOC_REQBUFS` allocates on `queue`.
    pub(crate) fn set_buffer_count(&self, queue: QueueKind, count: u32) {
        self.state().buffer_caps.insert(queue, count);
    }

    pub(crate) fn hold_request_completion(&self, hold: bool) {
        self.state().hold_completion = hold;
    }

    pub(crate) fn complete_output_out_of_order(&self) {
        let mut state = self.state();
        let in_flight = state.in_flight.entry(QueueKind::Output).or_default();
        in_flight.make_contiguous().reverse();
    }

    pub(crate) fn flag_next_output_error(&self) {
        self.state().next_output_error = true;
    }

    // Observation.

    pub(crate) fn open_handles(&self, node: DeviceNode) -> usize {
        self.state().count_open(FdKind::Node(node))
    }

    pub(crate) fn closed_handles(&self, node: DeviceNode) -> usize {
        self.state().closed.get(&FdKind::Node(node)).copied().unwrap_or(0)
    }

    pub(crate) fn video_opened_nonblocking(&self) -> bool {
        self.state().video_nonblocking
    }

    pub(crate) fn exported_handles(&self) -> usize {
        self.state().count_open(FdKind::DmaBuf)
    }

    pub(crate) fn closed_exported_handles(&self) -> usize {
        self.state().closed.get(&FdKind::DmaBuf).copied().unwrap_or(0)
    }

    pub(crate) fn reset_closed_exported_handles(&self) {
        self.state().closed.remove(&FdKind::DmaBuf);
    }

    pub(crate) fn open_requests(&self) -> usize {
        self.state().count_open(FdKind::Request)
    }

    pub(crate) fn allocated_requests(&self) -> usize {
        self.state().allocated_requests
    }

    pub(crate) fn queued_requests(&self) -> usize {
        self.state().queued_requests
    }

    pub(crate) fn reinit_calls(&self) -> usize {
        self.state().reinit_calls
    }

    pub(crate) fn request_raw(&self, fd: &FakeFd) -> i32 {
        fd.raw
    }

    pub(crate) fn is_streaming(&self, queue: QueueKind) -> bool {
        self.state().streaming.contains(&queue)
    }

    pub(crate) fn stream_on_calls(&self) -> Vec<QueueKind> {
        self.state().stream_on_calls.clone()
    }

    pub(crate) fn current_format(&self, queue: QueueKind) -> PixFormatMplane {
        self.state().formats.get(&queue).cloned().unwrap_or_default()
    }

    pub(crate) fn s_fmt_calls(&self, queue: QueueKind) -> Vec<Fourcc> {
        self.state().s_fmt_calls.get(&queue).cloned().unwrap_or_default()
    }

    pub(crate) fn querybuf_calls(&self) -> Vec<(QueueKind, u32)> {
        self.state().querybuf_calls.clone()
    }

    pub(crate) fn queued_buffers(&self, queue: QueueKind) -> Vec<QueuedRecord> {
        self.state().queued.get(&queue).cloned().unwrap_or_default()
    }

    pub(crate) fn dequeued(&self, queue: QueueKind) -> Vec<u32> {
        self.state().dequeued.get(&queue).cloned().unwrap_or_default()
    }

    pub(crate) fn control_batches(&self) -> Vec<ControlBatch> {
        self.state().control_batches.clone()
    }

    pub(crate) fn current_control(&self, id: u32) -> Option<ExtControl> {
        self.state().controls.get(&id).cloned()
    }
}

impl DecoderDevice for FakeDevice {
    type Fd = FakeFd;
    type Waiter = FakeWaiter;

    fn open(&self, _path: &Path, node: DeviceNode, nonblocking: bool) -> DeviceResult<FakeFd> {
        let mut state = self.state();
        if let Some(errno) = state.open_failures.get(&node) {
            return Err(*errno);
        }
        if node == DeviceNode::Video {
            state.video_nonblocking = nonblocking;
        }
        Ok(self.new_fd(&mut state, FdKind::Node(node)))
    }

    fn stream_on(&self, _video: &FakeFd, queue: QueueKind) -> DeviceResult<()> {
        let mut state = self.state();
        state.stream_on_calls.push(queue);
        if let Some(errno) = state.stream_on_failures.get(&queue) {
            return Err(*errno);
        }
        state.streaming.insert(queue);
        Ok(())
    }

    fn stream_off(&self, _video: &FakeFd, queue: QueueKind) -> DeviceResult<()> {
        let mut state = self.state();
        if let Some(errno) = state.stream_off_failure {
            return Err(errno);
        }
        state.streaming.remove(&queue);
        state.in_flight.remove(&queue);
        Ok(())
    }

    fn enum_fmt(&self, _video: &FakeFd, queue: QueueKind, index: u32) -> DeviceResult<FormatDesc> {
        let state = self.state();
        if let Some(errno) = state.enum_failure {
            return Err(errno);
        }
        let formats = match queue {
            QueueKind::Input => &state.input_formats,
            QueueKind::Output => &state.output_formats,
        };
        formats
            .get(index as usize)
            .map(|&pixelformat| FormatDesc { pixelformat, description: pixelformat.to_string() })
            .ok_or(Errno::EINVAL)
    }

    fn g_fmt(&self, _video: &FakeFd, queue: QueueKind) -> DeviceResult<PixFormatMplane> {
        self.state().formats.get(&queue).cloned().ok_or(Errno::EINVAL)
    }

    fn s_fmt(
        &self,
        _video: &FakeFd,
        queue: QueueKind,
        format: &PixFormatMplane,
    ) -> DeviceResult<PixFormatMplane> {
        let mut state = self.state();
        state.s_fmt_calls.entry(queue).or_default().push(format.pixelformat);
        if let Some(errno) = state.s_fmt_failure {
            return Err(errno);
        }

        let applied = match queue {
            QueueKind::Input => {
                let pixelformat = if state.input_formats.contains(&format.pixelformat) {
                    format.pixelformat
                } else {
                    *state.input_formats.first().ok_or(Errno::EINVAL)?
                };
                let (max_width, max_height) = state.max_input_size;
                input_format(
                    pixelformat,
                    format.width.min(max_width),
                    format.height.min(max_height),
                )
            }
            QueueKind::Output => {
                if state.output_formats.contains(&format.pixelformat) {
                    output_format(format.pixelformat, format.width, format.height)
                } else {
                    state.formats.get(&QueueKind::Output).cloned().ok_or(Errno::EINVAL)?
                }
            }
        };
        state.formats.insert(queue, applied.clone());

        Ok(applied)
    }

    fn reqbufs(&self, _video: &FakeFd, queue: QueueKind, count: u32) -> DeviceResult<u32> {
        let mut state = self.state();
        if let Some(errno) = state.reqbufs_failure {
            return Err(errno);
        }
        let allocated = count.min(state.buffer_caps.get(&queue).copied().unwrap_or(u32::MAX));
        state.buffer_counts.insert(queue, allocated);
        Ok(allocated)
    }

    fn querybuf(
        &self,
        _video: &FakeFd,
        queue: QueueKind,
        index: u32,
    ) -> DeviceResult<Vec<PlaneLayout>> {
        let mut state = self.state();
        state.querybuf_calls.push((queue, index));
        if index >= state.buffer_counts.get(&queue).copied().unwrap_or(0) {
            return Err(Errno::EINVAL);
        }
        let format = state.formats.get(&queue).ok_or(Errno::EINVAL)?;
        Ok(format
            .planes
            .iter()
            .map(|p| PlaneLayout { length: p.sizeimage, data_offset: 0 })
            .collect())
    }

    fn expbuf(
        &self,
        _video: &FakeFd,
        queue: QueueKind,
        index: u32,
        plane: u32,
    ) -> DeviceResult<FakeFd> {
        let mut state = self.state();
        if index >= state.buffer_counts.get(&queue).copied().unwrap_or(0) {
            return Err(Errno::EINVAL);
        }
        if state.expbuf_failure_plane == Some(plane) {
            return Err(Errno::EINVAL);
        }
        Ok(self.new_fd(&mut state, FdKind::DmaBuf))
    }

    fn qbuf(&self, _video: &FakeFd, buffer: &QueueBuffer<'_, FakeFd>) -> DeviceResult<()> {
        let mut state = self.state();
        if let Some(errno) = state.qbuf_failure {
            return Err(errno);
        }
        let record = QueuedRecord {
            index: buffer.index,
            frame_id: buffer.frame_id,
            bytes_used: buffer.bytes_used.to_vec(),
            request: buffer.request.map(|fd| fd.raw),
        };
        state.queued.entry(buffer.queue).or_default().push(record.clone());
        state.in_flight.entry(buffer.queue).or_default().push_back(record);
        Ok(())
    }

    fn dqbuf(&self, _video: &FakeFd, queue: QueueKind) -> DeviceResult<DequeuedBuffer> {
        let mut state = self.state();
        let position = {
            let state = &*state;
            state.in_flight.get(&queue).and_then(|in_flight| {
                in_flight.iter().position(|record| match record.request {
                    Some(request) => state.is_complete(request),
                    None => true,
                })
            })
        };
        let record = position
            .and_then(|position| state.in_flight.get_mut(&queue)?.remove(position))
            .ok_or(Errno::EAGAIN)?;

        let mut flags = 0;
        if queue == QueueKind::Output && state.next_output_error {
            state.next_output_error = false;
            flags |= DequeuedBuffer::FLAG_ERROR;
        }
        state.dequeued.entry(queue).or_default().push(record.index);

        Ok(DequeuedBuffer {
            index: record.index,
            frame_id: record.frame_id,
            bytes_used: record.bytes_used,
            flags,
        })
    }

    fn s_ext_ctrls(
        &self,
        _video: &FakeFd,
        scope: CtrlScope<'_, FakeFd>,
        controls: &[ExtControl],
    ) -> DeviceResult<()> {
        let mut state = self.state();
        if controls.iter().any(|c| state.rejected_controls.contains(&c.id)) {
            return Err(Errno::EINVAL);
        }
        let request = match scope {
            CtrlScope::Current => {
                for control in controls {
                    state.controls.insert(control.id, control.clone());
                }
                None
            }
            CtrlScope::Request(fd) => Some(fd.raw),
        };
        state.control_batches.push(ControlBatch { request, controls: controls.to_vec() });
        Ok(())
    }

    fn request_alloc(&self, _media: &FakeFd) -> DeviceResult<FakeFd> {
        let mut state = self.state();
        if let Some(errno) = state.request_alloc_failure {
            return Err(errno);
        }
        state.allocated_requests += 1;
        Ok(self.new_fd(&mut state, FdKind::Request))
    }

    fn request_queue(&self, request: &FakeFd) -> DeviceResult<()> {
        let mut state = self.state();
        if !state.executing.insert(request.raw) {
            return Err(Errno::EBUSY);
        }
        state.queued_requests += 1;
        Ok(())
    }

    fn request_reinit(&self, request: &FakeFd) -> DeviceResult<()> {
        let mut state = self.state();
        state.reinit_calls += 1;
        if let Some(errno) = state.reinit_failure {
            return Err(errno);
        }
        state.executing.remove(&request.raw);
        Ok(())
    }

    fn request_waiter(&self, request: &FakeFd) -> DeviceResult<FakeWaiter> {
        Ok(FakeWaiter { request: request.raw })
    }

    fn wait(&self, waiter: &FakeWaiter, _timeout: Option<Duration>) -> DeviceResult<bool> {
        let state = self.state();
        if let Some(errno) = state.wait_failure {
            return Err(errno);
        }
        Ok(state.is_complete(waiter.request))
    }
}
