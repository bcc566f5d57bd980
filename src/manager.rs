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

use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::{
    ArchCpu, HostPhysAddr, HostVirtAddr, ImportTable, Monitor, MonitorConfig, MonitorDevices,
    MonitorHal, MonitorResult,
};

/// Host memory accounting shared by all monitors of a manager.
#[derive(Debug)]
struct HostMemory {
    used_pages: usize,
    limit_pages: usize,
}

struct ManagerInner<H> {
    host: H,
    memory: Mutex<HostMemory>,
}

/// The handle through which monitors are created.
///
/// All monitors of one manager draw their pages from the same host allocator,
/// serialized by a single lock and capped by a usage limit. The handle is passed
/// around explicitly; there is no global manager.
pub struct Manager<H: MonitorHal> {
    inner: Arc<ManagerInner<H>>,
}

/// The [`MonitorHal`] given to each monitor of a [`Manager`].
pub struct SharedHal<H: MonitorHal> {
    inner: Arc<ManagerInner<H>>,
}

impl<H: MonitorHal> Manager<H> {
    /// Creates a manager on top of `host`, letting monitors use at most
    /// `limit_pages` pages in total.
    pub fn new(host: H, limit_pages: usize) -> Self {
        info!("monitor manager up, host memory limit {limit_pages} pages");
        Self {
            inner: Arc::new(ManagerInner {
                host,
                memory: Mutex::new(HostMemory {
                    used_pages: 0,
                    limit_pages,
                }),
            }),
        }
    }

    /// A [`MonitorHal`] drawing from this manager's pool.
    pub fn hal(&self) -> SharedHal<H> {
        SharedHal {
            inner: self.inner.clone(),
        }
    }

    /// Creates a monitor whose pages come from this manager's pool.
    pub fn create_monitor<A: ArchCpu, D: MonitorDevices>(
        &self,
        arch: A,
        devices: D,
        config: MonitorConfig,
        import: ImportTable,
    ) -> MonitorResult<Monitor<SharedHal<H>, A, D>> {
        Monitor::new(self.hal(), arch, devices, config, import)
    }

    /// Pages currently handed out to monitors.
    pub fn used_pages(&self) -> usize {
        self.inner.memory.lock().used_pages
    }

    /// The usage limit in pages.
    pub fn limit_pages(&self) -> usize {
        self.inner.memory.lock().limit_pages
    }

    /// Changes the usage limit. Pages already in use are not reclaimed.
    pub fn set_limit_pages(&self, limit_pages: usize) {
        self.inner.memory.lock().limit_pages = limit_pages;
    }

    /// Number of monitors (more exactly, [`SharedHal`] handles) alive.
    pub fn monitors(&self) -> usize {
        Arc::strong_count(&self.inner) - 1
    }
}

impl<H: MonitorHal> Drop for Manager<H> {
    fn drop(&mut self) {
        let memory = self.inner.memory.lock();
        if memory.used_pages != 0 {
            warn!(
                "monitor manager going down with {} pages still in use",
                memory.used_pages
            );
        }
    }
}

impl<H: MonitorHal> MonitorHal for SharedHal<H> {
    fn host_memory_pages(&self) -> usize {
        self.inner.host.host_memory_pages()
    }

    fn alloc_pages(&self, count: usize) -> AxResult<HostVirtAddr> {
        let mut memory = self.inner.memory.lock();
        if memory.used_pages + count > memory.limit_pages {
            return ax_err!(NoMemory, "host memory usage limit reached");
        }
        let vaddr = self.inner.host.alloc_pages(count)?;
        memory.used_pages += count;
        Ok(vaddr)
    }

    fn free_pages(&self, vaddr: HostVirtAddr, count: usize) {
        let mut memory = self.inner.memory.lock();
        self.inner.host.free_pages(vaddr, count);
        memory.used_pages = memory.used_pages.saturating_sub(count);
    }

    fn map(&self, paddr: HostPhysAddr) -> AxResult<HostVirtAddr> {
        self.inner.host.map(paddr)
    }

    fn unmap(&self, vaddr: HostVirtAddr, paddr: HostPhysAddr) {
        self.inner.host.unmap(vaddr, paddr)
    }

    fn virt_to_phys(&self, vaddr: HostVirtAddr) -> HostPhysAddr {
        self.inner.host.virt_to_phys(vaddr)
    }

    fn host_ptr(&self, vaddr: HostVirtAddr) -> *mut u8 {
        self.inner.host.host_ptr(vaddr)
    }
}
