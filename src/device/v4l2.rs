// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`DecoderDevice`] backed by the kernel V4L2 and media request interfaces.

use std::ffi::c_int;
use std::ffi::c_void;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::stat::Mode;
use v4l2r::bindings;
use v4l2r::bindings::v4l2_buffer;
use v4l2r::bindings::v4l2_buffer__bindgen_ty_1;
use v4l2r::bindings::v4l2_buffer__bindgen_ty_2;
use v4l2r::bindings::v4l2_exportbuffer;
use v4l2r::bindings::v4l2_ext_control;
use v4l2r::bindings::v4l2_ext_control__bindgen_ty_1;
use v4l2r::bindings::v4l2_ext_controls;
use v4l2r::bindings::v4l2_ext_controls__bindgen_ty_1;
use v4l2r::bindings::v4l2_fmtdesc;
use v4l2r::bindings::v4l2_format;
use v4l2r::bindings::v4l2_plane;
use v4l2r::bindings::v4l2_requestbuffers;

use crate::device::ControlPayload;
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
use crate::device::MAX_PLANES;
use crate::Fourcc;
use crate::QueueKind;

nix::ioctl_readwrite!(vidioc_enum_fmt, b'V', 2, v4l2_fmtdesc);
nix::ioctl_readwrite!(vidioc_g_fmt, b'V', 4, v4l2_format);
nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_expbuf, b'V', 16, v4l2_exportbuffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);
nix::ioctl_readwrite!(vidioc_s_ext_ctrls, b'V', 72, v4l2_ext_controls);

nix::ioctl_read!(media_ioc_request_alloc, b'|', 0x05, c_int);
nix::ioctl_none!(media_request_ioc_queue, b'|', 0x80);
nix::ioctl_none!(media_request_ioc_reinit, b'|', 0x81);

fn buf_type(queue: QueueKind) -> u32 {
    match queue {
        QueueKind::Input => bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
        QueueKind::Output => bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
    }
}

fn pix_format_from_raw(format: &v4l2_format) -> PixFormatMplane {
    // SAFETY: the format was filled for a multi-planar queue, so `pix_mp` is the active member.
    let pix_mp = unsafe { format.fmt.pix_mp };
    let plane_fmt = pix_mp.plane_fmt;
    let num_planes = (pix_mp.num_planes as usize).min(MAX_PLANES);

    PixFormatMplane {
        pixelformat: Fourcc(pix_mp.pixelformat),
        width: pix_mp.width,
        height: pix_mp.height,
        planes: plane_fmt[..num_planes]
            .iter()
            .map(|p| PlaneFormat { bytesperline: p.bytesperline, sizeimage: p.sizeimage })
            .collect(),
    }
}

fn pix_format_to_raw(queue: QueueKind, format: &PixFormatMplane) -> v4l2_format {
    let mut raw = v4l2_format { type_: buf_type(queue), ..Default::default() };
    // SAFETY: `pix_mp` is the member matching a multi-planar buffer type.
    let pix_mp = unsafe { &mut raw.fmt.pix_mp };
    pix_mp.pixelformat = format.pixelformat.0;
    pix_mp.width = format.width;
    pix_mp.height = format.height;
    pix_mp.num_planes = format.planes.len().min(MAX_PLANES) as u8;
    for (raw_plane, plane) in pix_mp.plane_fmt.iter_mut().zip(&format.planes) {
        raw_plane.bytesperline = plane.bytesperline;
        raw_plane.sizeimage = plane.sizeimage;
    }
    raw
}

const USEC_PER_SEC: u32 = 1_000_000;

/// Stores `frame_id` in the buffer timestamp.
///
/// vb2 normalizes the timeval when the buffer is dequeued, so ids of a second or more must be
/// carried in `tv_sec` to come back unchanged.
fn set_frame_id(buffer: &mut v4l2_buffer, frame_id: u32) {
    buffer.timestamp.tv_sec = (frame_id / USEC_PER_SEC) as _;
    buffer.timestamp.tv_usec = (frame_id % USEC_PER_SEC) as _;
}

fn frame_id(buffer: &v4l2_buffer) -> u32 {
    let sec = buffer.timestamp.tv_sec as u64;
    let usec = buffer.timestamp.tv_usec as u64;
    (sec * USEC_PER_SEC as u64 + usec) as u32
}

fn mmap_buffer(queue: QueueKind, index: u32, planes: &mut [v4l2_plane]) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: buf_type(queue),
        memory: bindings::v4l2_memory_V4L2_MEMORY_MMAP,
        length: planes.len() as u32,
        m: v4l2_buffer__bindgen_ty_1 { planes: planes.as_mut_ptr() },
        ..Default::default()
    }
}

fn raw_control(control: &ExtControl) -> v4l2_ext_control {
    match &control.payload {
        ControlPayload::Value(value) => v4l2_ext_control {
            id: control.id,
            __bindgen_anon_1: v4l2_ext_control__bindgen_ty_1 { value: *value },
            ..Default::default()
        },
        ControlPayload::Value64(value64) => v4l2_ext_control {
            id: control.id,
            __bindgen_anon_1: v4l2_ext_control__bindgen_ty_1 { value64: *value64 },
            ..Default::default()
        },
        // The kernel only reads compound payloads on `VIDIOC_S_EXT_CTRLS`.
        ControlPayload::Compound(data) => v4l2_ext_control {
            id: control.id,
            size: data.len() as u32,
            __bindgen_anon_1: v4l2_ext_control__bindgen_ty_1 {
                ptr: data.as_ptr() as *mut c_void,
            },
            ..Default::default()
        },
    }
}

/// The kernel V4L2 stateless decoder interface.
#[derive(Clone, Copy, Debug, Default)]
pub struct V4l2Device;

impl DecoderDevice for V4l2Device {
    type Fd = OwnedFd;
    type Waiter = Epoll;

    fn open(&self, path: &Path, node: DeviceNode, nonblocking: bool) -> DeviceResult<OwnedFd> {
        let mut flags = OFlag::O_RDWR | OFlag::O_CLOEXEC;
        if nonblocking {
            flags |= OFlag::O_NONBLOCK;
        }
        log::debug!("opening {:?} node {}", node, path.display());
        let fd = nix::fcntl::open(path, flags, Mode::empty())?;
        // SAFETY: `fd` was just opened and is owned by nothing else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn stream_on(&self, video: &OwnedFd, queue: QueueKind) -> DeviceResult<()> {
        let type_ = buf_type(queue) as c_int;
        // SAFETY: `type_` outlives the call.
        unsafe { vidioc_streamon(video.as_raw_fd(), &type_) }.map(drop)
    }

    fn stream_off(&self, video: &OwnedFd, queue: QueueKind) -> DeviceResult<()> {
        let type_ = buf_type(queue) as c_int;
        // SAFETY: `type_` outlives the call.
        unsafe { vidioc_streamoff(video.as_raw_fd(), &type_) }.map(drop)
    }

    fn enum_fmt(&self, video: &OwnedFd, queue: QueueKind, index: u32) -> DeviceResult<FormatDesc> {
        let mut desc = v4l2_fmtdesc { index, type_: buf_type(queue), ..Default::default() };
        // SAFETY: `desc` is a valid v4l2_fmtdesc for the duration of the call.
        unsafe { vidioc_enum_fmt(video.as_raw_fd(), &mut desc) }?;

        let len = desc.description.iter().position(|c| *c == 0).unwrap_or(desc.description.len());
        let description = desc.description[..len].iter().map(|c| *c as u8).collect::<Vec<_>>();
        Ok(FormatDesc {
            pixelformat: Fourcc(desc.pixelformat),
            description: String::from_utf8_lossy(&description).into_owned(),
        })
    }

    fn g_fmt(&self, video: &OwnedFd, queue: QueueKind) -> DeviceResult<PixFormatMplane> {
        let mut format = v4l2_format { type_: buf_type(queue), ..Default::default() };
        // SAFETY: `format` is a valid v4l2_format for the duration of the call.
        unsafe { vidioc_g_fmt(video.as_raw_fd(), &mut format) }?;
        Ok(pix_format_from_raw(&format))
    }

    fn s_fmt(
        &self,
        video: &OwnedFd,
        queue: QueueKind,
        format: &PixFormatMplane,
    ) -> DeviceResult<PixFormatMplane> {
        let mut raw = pix_format_to_raw(queue, format);
        // SAFETY: `raw` is a valid v4l2_format for the duration of the call.
        unsafe { vidioc_s_fmt(video.as_raw_fd(), &mut raw) }?;
        Ok(pix_format_from_raw(&raw))
    }

    fn reqbufs(&self, video: &OwnedFd, queue: QueueKind, count: u32) -> DeviceResult<u32> {
        let mut reqbufs = v4l2_requestbuffers {
            count,
            type_: buf_type(queue),
            memory: bindings::v4l2_memory_V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        // SAFETY: `reqbufs` is a valid v4l2_requestbuffers for the duration of the call.
        unsafe { vidioc_reqbufs(video.as_raw_fd(), &mut reqbufs) }?;
        Ok(reqbufs.count)
    }

    fn querybuf(
        &self,
        video: &OwnedFd,
        queue: QueueKind,
        index: u32,
    ) -> DeviceResult<Vec<PlaneLayout>> {
        let mut planes = [v4l2_plane::default(); MAX_PLANES];
        let mut buffer = mmap_buffer(queue, index, &mut planes);
        // SAFETY: `buffer.m.planes` points to `planes`, which holds `buffer.length` entries.
        unsafe { vidioc_querybuf(video.as_raw_fd(), &mut buffer) }?;

        let num_planes = (buffer.length as usize).min(MAX_PLANES);
        Ok(planes[..num_planes]
            .iter()
            .map(|p| PlaneLayout { length: p.length, data_offset: p.data_offset })
            .collect())
    }

    fn expbuf(
        &self,
        video: &OwnedFd,
        queue: QueueKind,
        index: u32,
        plane: u32,
    ) -> DeviceResult<OwnedFd> {
        let mut expbuf = v4l2_exportbuffer {
            type_: buf_type(queue),
            index,
            plane,
            flags: (OFlag::O_CLOEXEC | OFlag::O_RDWR).bits() as u32,
            ..Default::default()
        };
        // SAFETY: `expbuf` is a valid v4l2_exportbuffer for the duration of the call.
        unsafe { vidioc_expbuf(video.as_raw_fd(), &mut expbuf) }?;
        // SAFETY: the kernel returned a new descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(expbuf.fd) })
    }

    fn qbuf(&self, video: &OwnedFd, buffer: &QueueBuffer<'_, OwnedFd>) -> DeviceResult<()> {
        let mut planes: Vec<v4l2_plane> = buffer
            .bytes_used
            .iter()
            .map(|bytesused| v4l2_plane { bytesused: *bytesused, ..Default::default() })
            .collect();
        let mut raw = mmap_buffer(buffer.queue, buffer.index, &mut planes);
        set_frame_id(&mut raw, buffer.frame_id);
        if let Some(request) = buffer.request {
            raw.flags |= bindings::V4L2_BUF_FLAG_REQUEST_FD;
            raw.__bindgen_anon_1 = v4l2_buffer__bindgen_ty_2 { request_fd: request.as_raw_fd() };
        }
        // SAFETY: `raw.m.planes` points to `planes`, which holds `raw.length` entries.
        unsafe { vidioc_qbuf(video.as_raw_fd(), &mut raw) }.map(drop)
    }

    fn dqbuf(&self, video: &OwnedFd, queue: QueueKind) -> DeviceResult<DequeuedBuffer> {
        let mut planes = [v4l2_plane::default(); MAX_PLANES];
        let mut raw = mmap_buffer(queue, 0, &mut planes);
        // SAFETY: `raw.m.planes` points to `planes`, which holds `raw.length` entries.
        unsafe { vidioc_dqbuf(video.as_raw_fd(), &mut raw) }?;

        let num_planes = (raw.length as usize).min(MAX_PLANES);
        Ok(DequeuedBuffer {
            index: raw.index,
            frame_id: frame_id(&raw),
            bytes_used: planes[..num_planes].iter().map(|p| p.bytesused).collect(),
            flags: raw.flags,
        })
    }

    fn s_ext_ctrls(
        &self,
        video: &OwnedFd,
        scope: CtrlScope<'_, OwnedFd>,
        controls: &[ExtControl],
    ) -> DeviceResult<()> {
        let mut raw_controls: Vec<v4l2_ext_control> = controls.iter().map(raw_control).collect();
        let (which, request_fd) = match scope {
            CtrlScope::Current => (bindings::V4L2_CTRL_WHICH_CUR_VAL, 0),
            CtrlScope::Request(request) => {
                (bindings::V4L2_CTRL_WHICH_REQUEST_VAL, request.as_raw_fd())
            }
        };
        let mut ext_ctrls = v4l2_ext_controls {
            __bindgen_anon_1: v4l2_ext_controls__bindgen_ty_1 { which },
            count: raw_controls.len() as u32,
            request_fd,
            controls: raw_controls.as_mut_ptr(),
            ..Default::default()
        };
        // SAFETY: `controls` points to `count` entries whose compound payloads are borrowed
        // from `controls` for the duration of the call.
        unsafe { vidioc_s_ext_ctrls(video.as_raw_fd(), &mut ext_ctrls) }.map(drop)
    }

    fn request_alloc(&self, media: &OwnedFd) -> DeviceResult<OwnedFd> {
        let mut fd: c_int = -1;
        // SAFETY: `fd` outlives the call.
        unsafe { media_ioc_request_alloc(media.as_raw_fd(), &mut fd) }?;
        // SAFETY: the kernel returned a new descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn request_queue(&self, request: &OwnedFd) -> DeviceResult<()> {
        // SAFETY: the ioctl takes no argument.
        unsafe { media_request_ioc_queue(request.as_raw_fd()) }.map(drop)
    }

    fn request_reinit(&self, request: &OwnedFd) -> DeviceResult<()> {
        // SAFETY: the ioctl takes no argument.
        unsafe { media_request_ioc_reinit(request.as_raw_fd()) }.map(drop)
    }

    fn request_waiter(&self, request: &OwnedFd) -> DeviceResult<Epoll> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        // A request signals completion as an exceptional condition.
        epoll.add(request.as_fd(), EpollEvent::new(EpollFlags::EPOLLPRI, 0))?;
        Ok(epoll)
    }

    fn wait(&self, waiter: &Epoll, timeout: Option<Duration>) -> DeviceResult<bool> {
        let timeout = match timeout {
            Some(timeout) => EpollTimeout::try_from(timeout).unwrap_or(EpollTimeout::NONE),
            None => EpollTimeout::NONE,
        };
        let mut events = [EpollEvent::empty()];
        loop {
            match waiter.wait(&mut events, timeout) {
                Ok(ready) => return Ok(ready > 0),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno),
            }
        }
    }
}
