// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::decoder::ioctl_error;
use crate::decoder::request::Request;
use crate::decoder::DecoderError;
use crate::decoder::DecoderResult;
use crate::decoder::V4l2Decoder;
use crate::device::CtrlScope;
use crate::device::DecoderDevice;
use crate::device::ExtControl;

impl<D: DecoderDevice> V4l2Decoder<D> {
    /// Applies `controls` as one atomic batch.
    ///
    /// With a `request`, the values are stored in it and only take effect when it executes.
    /// Without one they apply to the device immediately. If the driver rejects any control, none
    /// is applied.
    pub fn set_controls(
        &self,
        request: Option<&Request<D>>,
        controls: &[ExtControl],
    ) -> DecoderResult<()> {
        let shared = self.shared();

        let scope = match request {
            Some(request) if !request.belongs_to(shared) => {
                return Err(DecoderError::ForeignRequest(request.id()));
            }
            Some(request) => CtrlScope::Request(request.fd()),
            None => CtrlScope::Current,
        };

        let nodes = shared.nodes();
        shared
            .device
            .s_ext_ctrls(nodes.video()?, scope, controls)
            .map_err(ioctl_error("VIDIOC_S_EXT_CTRLS"))
    }
}
