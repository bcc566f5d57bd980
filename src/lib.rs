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

//! AxCoMon - cooperative dual-OS monitor core for ArceOS hosts.
//!
//! This crate shares one physical CPU between a host kernel and a cooperatively
//! scheduled guest kernel. Instead of hardware virtualization extensions it relies
//! on a *passage page*: a pinned page run, mapped in both address spaces, that holds
//! the saved CPU state of each side, a tiny transitional page table and the switch
//! routine itself. The guest yields back to the host by leaving a request in the
//! mailbox of that page.
//!
//! # Features
//!
//! - Fixed-layout CPU context descriptors shared with the switch routine
//! - Transitional address space builders for flat and PAE paging
//! - A symmetric context switch, with a real i386 routine and an in-memory simulation
//! - Pseudo-physical memory management backed by host pages
//! - Monitor lifecycle (boot, run loop, reverse teardown) and a shared host page pool

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate alloc;

// Core modules
mod addr; // Host and guest address types
pub mod arch; // Real context switch routines
mod config; // Monitor configuration
mod context; // CPU context descriptor
mod device; // Device layer seam
mod error; // Monitor error taxonomy
mod hal; // Host abstraction layer
pub mod layout; // Raw byte layout of the passage page
mod mailbox; // Guest to host request protocol
mod manager; // Shared host page pool and monitor handle
mod memory; // Pseudo-physical memory mapper
mod monitor; // Monitor lifecycle and run loop
mod nx; // No-execute workaround around the switch
mod passage; // Passage page manager
pub mod sim; // In-memory CPU used to drive the monitor without hardware
mod space; // Transitional address space builders
mod switch; // Context switch seam

#[cfg(test)]
mod test; // Unit tests for the monitor

// Public API exports
pub use addr::{GuestVirtAddr, HostPhysAddr, HostVirtAddr};
pub use config::{MonitorConfig, DEFAULT_BOOTMEM_PAGES};
pub use context::{CpuContext, DescriptorTablePointer, RFlags};
pub use device::{DeviceRequest, MonitorDevices, NoDevices};
pub use error::{InitError, MonitorError, MonitorResult};
pub use hal::MonitorHal;
pub use mailbox::{DeviceId, Mailbox, Operation, TerminateReason, MAILBOX_PARAMS};
pub use manager::{Manager, SharedHal};
pub use memory::FrameTable;
pub use monitor::{BootLayout, ImportTable, Monitor, MonitorState, MAX_GUEST_MEMORY};
pub use nx::NxWorkaround;
pub use passage::{
    guest_context, GuestBootParams, Passage, PassageHeader, PassagePage, GUEST_KERNEL_CS,
    GUEST_KERNEL_DS, PASSAGE_PAGES,
};
pub use space::{
    build_transitional, builder_for, other_maps, AddressSpaceBuilder, ExtendedBuilder,
    FlatBuilder, PagingMode, TransitionalSpace, TransitionalSpaces, TransitionalTables,
};
pub use switch::{
    transition, ArchCpu, CpuFeatures, RegisterFile, Side, SwitchFault, Transition, SWITCH_DR7,
};
