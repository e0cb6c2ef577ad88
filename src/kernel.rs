//! The kernel aggregate.
//!
//! One value owns every process-wide table: the filesystem (buffer cache,
//! open-inode set, free map, all behind the filesystem-wide mutex) and the
//! VM state (frame table, swap area, per-process supplemental page tables,
//! all behind the VM lock). Subsystems receive the collaborators they need
//! as explicit arguments instead of reaching for globals.
//!
//! Lock order: VM before filesystem. Fault handling holds the VM lock and
//! calls into the filesystem for mmap traffic; the filesystem never calls
//! back into VM.

use alloc::boxed::Box;

use spin::Mutex;

use crate::addr::UVAddr;
use crate::block::BlockDevice;
use crate::file::File;
use crate::frame::AllocFlags;
use crate::fs::FileSys;
use crate::swap::SwapArea;
use crate::vm::{MapId, Pid, Role, VmState};
use crate::Result;

pub struct Kernel {
    pub fs: FileSys,
    vm: Mutex<VmState>,
}

impl Kernel {
    /// Boots on a fresh filesystem device, formatting it first.
    pub fn format(
        fs_dev: Box<dyn BlockDevice>,
        swap_dev: Box<dyn BlockDevice>,
        user_pages: usize,
    ) -> Self {
        Self {
            fs: FileSys::format(fs_dev),
            vm: Mutex::new(VmState::new(SwapArea::new(swap_dev), user_pages)),
        }
    }

    /// Boots on an already-formatted filesystem device.
    pub fn mount(
        fs_dev: Box<dyn BlockDevice>,
        swap_dev: Box<dyn BlockDevice>,
        user_pages: usize,
    ) -> Self {
        Self {
            fs: FileSys::mount(fs_dev),
            vm: Mutex::new(VmState::new(SwapArea::new(swap_dev), user_pages)),
        }
    }

    /// Flushes dirty cached data at shutdown.
    pub fn shutdown(&self) {
        self.fs.writeback_all();
    }

    pub fn init_process(&self, pid: Pid) {
        self.vm.lock().init_process(pid);
    }

    /// Full VM teardown for an exiting process: mmap writebacks, then the
    /// page table. The process layer closes file descriptors and re-allows
    /// writes on the executable afterwards, then flushes the cache.
    pub fn exit_process(&self, pid: Pid) {
        self.vm.lock().destroy_process(&self.fs, pid);
        self.fs.writeback_all();
    }

    /// Resolves a page fault; an error means the faulting process dies
    /// with exit status −1.
    pub fn page_fault(&self, pid: Pid, addr: UVAddr, write: bool) -> Result<()> {
        self.vm.lock().page_fault(&self.fs, pid, addr, write)
    }

    pub fn copy_out(&self, pid: Pid, addr: UVAddr, bytes: &[u8]) -> Result<()> {
        self.vm.lock().copy_out(&self.fs, pid, addr, bytes)
    }

    pub fn copy_in(&self, pid: Pid, addr: UVAddr, bytes: &mut [u8]) -> Result<()> {
        self.vm.lock().copy_in(&self.fs, pid, addr, bytes)
    }

    pub fn set_segment(&self, pid: Pid, role: Role, start: usize, end: usize) {
        self.vm.lock().set_segment(pid, role, start, end);
    }

    pub fn record_esp(&self, pid: Pid, esp: usize) {
        self.vm.lock().record_esp(pid, esp);
    }

    pub fn set_loading(&self, pid: Pid, loading: bool) {
        self.vm.lock().set_loading(pid, loading);
    }

    pub fn get_new_page(
        &self,
        pid: Pid,
        upage: UVAddr,
        role: Role,
        flags: AllocFlags,
    ) -> Result<()> {
        self.vm.lock().get_new_page(&self.fs, pid, upage, role, flags)
    }

    pub fn free_page(&self, pid: Pid, upage: UVAddr) {
        self.vm.lock().free_page(pid, upage);
    }

    pub fn mmap(&self, pid: Pid, file: &File, base: UVAddr) -> Result<MapId> {
        self.vm.lock().mmap(&self.fs, pid, file, base)
    }

    pub fn munmap(&self, pid: Pid, mapid: MapId) -> Result<()> {
        self.vm.lock().munmap(&self.fs, pid, mapid)
    }

    pub fn mmap_writeback(&self, pid: Pid, mapid: MapId) -> Result<()> {
        self.vm.lock().mmap_writeback(&self.fs, pid, mapid)
    }

    pub fn memory_full(&self) -> bool {
        self.vm.lock().memory_full()
    }
}
