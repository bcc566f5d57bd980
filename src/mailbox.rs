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

use alloc::string::String;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Number of parameter words in the mailbox.
pub const MAILBOX_PARAMS: usize = 256;

/// Longest debug line the guest may pass, terminator included.
pub const DEBUG_LINE_MAX: usize = 0x200;

/// What the side that last switched asks of its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Operation {
    /// Host to guest, first entry. Parameters: kernel end, boot memory pages,
    /// memory size, frame table window size.
    Start = 0,
    /// The guest is going away. Parameter 0 is a [`TerminateReason`].
    Terminate = 1,
    /// A NUL terminated line of guest output packed into the parameters.
    DebugLine = 2,
    /// A hardware interrupt arrived while the guest ran.
    ForwardInterrupt = 3,
    /// The guest has nothing to do.
    Idle = 4,
    /// The guest consumed data and can take more.
    MoreData = 5,
    /// A request for the device layer: device, unit, opcode. The status goes
    /// back in parameter 3.
    Device = 6,
    /// Back pseudo-physical memory at an address: address, order. The status
    /// goes back in parameter 2.
    AllocPages = 7,
    /// Release memory backed by [`Operation::AllocPages`]: address. The status
    /// goes back in parameter 2.
    FreePages = 8,
}

/// Why the guest terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum TerminateReason {
    Reboot = 0,
    Poweroff = 1,
    Halt = 2,
    /// The guest hit something this monitor does not support.
    NotSupported = 3,
    /// The guest sent a request the monitor could not decode.
    Unknown = 4,
}

/// Devices the guest can address through [`Operation::Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum DeviceId {
    Console = 0,
    Timer = 1,
    Power = 2,
    Block = 3,
    Network = 4,
    Serial = 5,
}

/// The request record at a fixed offset of the passage page.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mailbox {
    /// Raw [`Operation`] code.
    pub operation: u32,
    /// Operation specific parameters.
    pub params: [u32; MAILBOX_PARAMS],
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Mailbox {
    /// An empty mailbox.
    pub const fn zeroed() -> Self {
        Self {
            operation: 0,
            params: [0; MAILBOX_PARAMS],
        }
    }

    /// Decodes the operation code, handing back the raw value if unknown.
    pub fn operation(&self) -> Result<Operation, u32> {
        Operation::try_from(self.operation).map_err(|_| self.operation)
    }

    /// Posts `operation` with leading `params`; the remaining words are cleared.
    pub fn post(&mut self, operation: Operation, params: &[u32]) {
        self.operation = operation.into();
        self.params = [0; MAILBOX_PARAMS];
        let n = params.len().min(MAILBOX_PARAMS);
        self.params[..n].copy_from_slice(&params[..n]);
    }

    /// The terminate reason in parameter 0. Unrecognized codes read as
    /// [`TerminateReason::Unknown`].
    pub fn terminate_reason(&self) -> TerminateReason {
        TerminateReason::try_from(self.params[0]).unwrap_or(TerminateReason::Unknown)
    }

    /// Decodes a debug line packed into the parameters, stopping at the first NUL
    /// or after [`DEBUG_LINE_MAX`] bytes. Invalid UTF-8 is replaced.
    pub fn debug_line(&self) -> String {
        let mut bytes = [0u8; DEBUG_LINE_MAX];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.params.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(DEBUG_LINE_MAX);
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }

    /// Packs `line` the way the guest does for [`Operation::DebugLine`],
    /// truncating it to fit with its terminator.
    pub fn post_debug_line(&mut self, line: &str) {
        let mut bytes = [0u8; DEBUG_LINE_MAX];
        let n = line.len().min(DEBUG_LINE_MAX - 1);
        bytes[..n].copy_from_slice(&line.as_bytes()[..n]);
        self.operation = Operation::DebugLine.into();
        self.params = [0; MAILBOX_PARAMS];
        for (word, chunk) in self.params.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }
}
