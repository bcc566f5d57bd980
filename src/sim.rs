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

//! A CPU that exists only in memory.
//!
//! [`SimulatedCpu`] runs the passage protocol of [`crate::transition`] on a
//! [`RegisterFile`] and hands control to a [`GuestKernel`] in between, which
//! makes the monitor's scheduling and mailbox logic testable on any host.

use alloc::vec::Vec;

use crate::switch::Transition;
use crate::{
    transition, ArchCpu, CpuContext, CpuFeatures, DescriptorTablePointer, Mailbox, PassagePage,
    RFlags, RegisterFile, Side,
};

/// Stand-in bytes for the switch routine: `cli; nop...; ret`.
const SIMULATED_CODE: [u8; 16] = [
    0xfa, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0xc3,
];

/// The guest side of a simulation.
pub trait GuestKernel {
    /// Runs the guest from the state in `regs` until it yields, leaving its
    /// request in `mailbox`.
    fn run(&mut self, regs: &mut RegisterFile, mailbox: &mut Mailbox);
}

impl<F: FnMut(&mut RegisterFile, &mut Mailbox)> GuestKernel for F {
    fn run(&mut self, regs: &mut RegisterFile, mailbox: &mut Mailbox) {
        self(regs, mailbox)
    }
}

/// A CPU simulated on a register file.
pub struct SimulatedCpu<G: GuestKernel> {
    /// The live registers.
    pub regs: RegisterFile,
    /// The guest entered on every switch.
    pub guest: G,
    features: CpuFeatures,
    /// Round trips through the passage.
    pub switches: usize,
    /// TLB flushes requested.
    pub tlb_flushes: usize,
    /// Every one-way transition made, in order.
    pub transitions: Vec<Transition>,
}

impl<G: GuestKernel> SimulatedCpu<G> {
    /// A CPU in state `regs` with `features`.
    pub fn new(regs: RegisterFile, features: CpuFeatures, guest: G) -> Self {
        Self {
            regs,
            guest,
            features,
            switches: 0,
            tlb_flushes: 0,
            transitions: Vec::new(),
        }
    }

    /// A CPU with typical 32-bit host kernel registers.
    pub fn with_host_state(features: CpuFeatures, cr3: u32, guest: G) -> Self {
        let mut cr4 = 0x0000_06d0;
        if features.contains(CpuFeatures::PAE_ENABLED) {
            cr4 |= 0x20;
        }
        let regs = RegisterFile {
            cs: 0x08,
            ds: 0x23,
            es: 0x23,
            fs: 0x30,
            gs: 0x00,
            ss: 0x10,
            cr0: 0x8001_003b,
            cr2: 0,
            cr3,
            cr4,
            dr: [0, 0, 0, 0, 0xffff_0ff0, 0x0000_0400],
            gdt: DescriptorTablePointer::new(0x8003_f000, 0x03ff),
            idt: DescriptorTablePointer::new(0x8003_f400, 0x07ff),
            ldt: 0,
            tr: 0x28,
            esp: 0xf789_2c40,
            eflags: (RFlags::IF | RFlags::RESERVED_1).bits(),
            eip: 0x8052_1000,
        };
        Self::new(regs, features, guest)
    }

    fn step(&mut self, page: &mut PassagePage, from: Side) {
        match transition(&mut self.regs, page, from) {
            Ok(done) => self.transitions.push(done),
            // A real CPU would triple fault here.
            Err(fault) => panic!("switch from {from:?} faulted: {fault:?}"),
        }
    }
}

impl<G: GuestKernel> ArchCpu for SimulatedCpu<G> {
    fn features(&self) -> CpuFeatures {
        self.features
    }

    fn capture(&self) -> CpuContext {
        let mut ctx = CpuContext::zeroed();
        self.regs.save(&mut ctx);
        ctx
    }

    fn passage_code(&self) -> &[u8] {
        &SIMULATED_CODE
    }

    fn flush_tlb(&mut self) {
        self.tlb_flushes += 1;
    }

    fn irq_save(&mut self) -> bool {
        let enabled = self.regs.eflags & RFlags::IF.bits() != 0;
        self.regs.eflags &= !RFlags::IF.bits();
        enabled
    }

    fn irq_restore(&mut self, enabled: bool) {
        if enabled {
            self.regs.eflags |= RFlags::IF.bits();
        }
    }

    /// # Panics
    ///
    /// Panics where the hardware would fault: when the passage code is not
    /// reachable through the transitional tables at either view.
    unsafe fn switch(&mut self, page: &mut PassagePage) {
        self.step(page, Side::Host);
        self.guest.run(&mut self.regs, &mut page.header.mailbox);
        self.step(page, Side::Guest);
        self.switches += 1;
    }
}
