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

use core::fmt;

use axerrno::AxError;

/// A specialized [`Result`] type for monitor operations.
pub type MonitorResult<T = ()> = Result<T, MonitorError>;

/// Errors raised by the monitor core.
///
/// Boot-time errors carry enough context to tell an operator which step failed;
/// they are also convertible into [`AxError`] for callers living in the ArceOS
/// error domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// The host could not provide the pages needed for `what`.
    OutOfMemory {
        /// The resource being allocated.
        what: &'static str,
        /// Number of pages requested.
        pages: usize,
    },
    /// The guest image or the boot layout cannot be used.
    Initialization(InitError),
    /// A frame is already mapped to a different host page.
    InconsistentState {
        /// The guest pseudo-physical frame involved.
        frame: usize,
    },
    /// A region overlaps a previous allocation of a different shape.
    InsaneAllocation {
        /// The guest pseudo-physical frame at the base of the region.
        frame: usize,
        /// Number of pages requested.
        pages: usize,
    },
    /// Passed through from the host device or file layers.
    AccessDenied,
    /// Passed through from the host device or file layers.
    NotFound,
    /// A guest address outside of the memory the monitor manages.
    BadGuestAddress(usize),
    /// An operation was issued in the wrong lifecycle state.
    BadState,
}

/// Why a monitor could not be initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The guest image does not export a required symbol.
    MissingSymbol(&'static str),
    /// The kernel image range is empty or below the kernel base.
    BadKernelRange {
        /// `kernel_start` from the import table.
        start: usize,
        /// `kernel_end` from the import table.
        end: usize,
    },
    /// The guest virtual layout does not fit the pseudo-physical memory.
    LayoutOverflow(&'static str),
    /// A structure shared with the switch routine lies above 4 GiB.
    NotAddressable(&'static str),
    /// The transitional tables could not be built.
    TransitionalSpace(&'static str),
    /// The host CPU lacks what a requested mode needs.
    Unsupported(&'static str),
}

impl MonitorError {
    /// Status code reported back to the guest through the mailbox.
    pub const fn status_code(&self) -> i32 {
        match self {
            Self::OutOfMemory { .. } => -12,
            Self::Initialization(_) => -22,
            Self::InconsistentState { .. } | Self::InsaneAllocation { .. } => -5,
            Self::AccessDenied => -13,
            Self::NotFound => -2,
            Self::BadGuestAddress(_) => -14,
            Self::BadState => -16,
        }
    }

    /// Whether this error reveals a bug in the monitor itself.
    pub const fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::InconsistentState { .. } | Self::InsaneAllocation { .. }
        )
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { what, pages } => {
                write!(f, "out of memory allocating {what} ({pages} pages)")
            }
            Self::Initialization(err) => write!(f, "initialization failed: {err}"),
            Self::InconsistentState { frame } => {
                write!(f, "frame {frame:#x} is already mapped to another host page")
            }
            Self::InsaneAllocation { frame, pages } => write!(
                f,
                "insane allocation of {pages} pages at frame {frame:#x}: region partially allocated"
            ),
            Self::AccessDenied => write!(f, "access denied"),
            Self::NotFound => write!(f, "not found"),
            Self::BadGuestAddress(addr) => write!(f, "bad guest address {addr:#x}"),
            Self::BadState => write!(f, "monitor is in the wrong state"),
        }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSymbol(name) => write!(f, "guest image missing required symbol `{name}`"),
            Self::BadKernelRange { start, end } => {
                write!(f, "bad kernel image range {start:#x}..{end:#x}")
            }
            Self::LayoutOverflow(what) => write!(f, "{what} does not fit in guest memory"),
            Self::NotAddressable(what) => write!(f, "{what} is not addressable from 32-bit code"),
            Self::TransitionalSpace(why) => write!(f, "transitional address space: {why}"),
            Self::Unsupported(what) => write!(f, "{what} is not supported on this CPU"),
        }
    }
}

impl From<InitError> for MonitorError {
    fn from(err: InitError) -> Self {
        Self::Initialization(err)
    }
}

impl From<MonitorError> for AxError {
    fn from(err: MonitorError) -> Self {
        match err {
            MonitorError::OutOfMemory { .. } => AxError::NoMemory,
            MonitorError::Initialization(_) => AxError::InvalidData,
            MonitorError::InconsistentState { .. } | MonitorError::InsaneAllocation { .. } => {
                AxError::BadState
            }
            MonitorError::AccessDenied => AxError::PermissionDenied,
            MonitorError::NotFound => AxError::NotFound,
            MonitorError::BadGuestAddress(_) => AxError::BadAddress,
            MonitorError::BadState => AxError::BadState,
        }
    }
}
