// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::{DeviceId, Mailbox, MonitorError, MonitorResult};

/// A device request decoded from the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Target device.
    pub device: DeviceId,
    /// Unit of that device (disk number, console index).
    pub unit: u32,
    /// Device specific opcode.
    pub opcode: u32,
}

impl DeviceRequest {
    /// Decodes the request from `mailbox`, or hands back the raw device id.
    pub fn decode(mailbox: &Mailbox) -> Result<Self, u32> {
        let device = DeviceId::try_from(mailbox.params[0]).map_err(|_| mailbox.params[0])?;
        Ok(Self {
            device,
            unit: mailbox.params[1],
            opcode: mailbox.params[2],
        })
    }
}

/// The host side device backends: block, console, network, timer.
///
/// These live outside the monitor core. The run loop calls into them when the
/// guest yields. Every method has a default that does nothing, so a backend
/// only implements what it serves.
pub trait MonitorDevices {
    /// A device request from the guest. The mailbox holds the request and may
    /// be used to return data.
    fn request(&mut self, request: DeviceRequest, mailbox: &mut Mailbox) -> MonitorResult {
        let _ = (request, mailbox);
        Err(MonitorError::NotFound)
    }

    /// A hardware interrupt came in while the guest ran.
    fn forward_interrupt(&mut self) {}

    /// The guest went idle; a good time to block until something happens.
    fn idle(&mut self) {}

    /// Gives backends a chance to queue data for the guest.
    fn poll(&mut self) {}
}

/// No devices at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevices;

impl MonitorDevices for NoDevices {}
