//! The supplemental page table.
//!
//! Per-process virtual memory: one descriptor per tracked user page,
//! recording where the page's contents live (a frame, a swap slot, a
//! mapped file, or nowhere yet) and what the page is for (stack, code,
//! data, or mmap). The registry of every process's state lives behind the
//! kernel's VM lock together with the frame table and the swap area;
//! eviction reaches into the victim owner's page table, and holding the
//! one lock is what makes that sound.
//!
//! A page fault lands in [`VmState::page_fault`]:
//! 1. faults outside user space and writes to read-only pages kill the
//!    process (the caller turns the error into exit status −1);
//! 2. the faulting address is classified by segment, by the PUSH/PUSHA
//!    stack probes below the recorded stack pointer, or by mmap region;
//! 3. a known page is pulled back in from swap or its file;
//! 4. an unknown page in a growable role materializes zero-filled.
//!
//! `copy_in`/`copy_out` emulate user-mode loads and stores: they fault
//! pages in the same way the MMU would and maintain the accessed and dirty
//! bits that the clock sweeps consult.
//!
//! Lock order: the VM lock is acquired first; filesystem calls (mmap
//! read-in and writeback) take the filesystem lock inside it. Nothing in
//! the filesystem calls back into here.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cmp::min;

use crate::addr::UVAddr;
use crate::file::File;
use crate::frame::{AllocFlags, FrameId, FrameTable, PageBits, PteView};
use crate::fs::FileSys;
use crate::pagedir::PageDir;
use crate::param::{PGSIZE, PHYS_BASE};
use crate::swap::SwapArea;
use crate::{KernelError, Result};

pub type Pid = u32;

/// Identifies one mmap region within its process.
pub type MapId = i32;

/// What a user page is for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Stack,
    Code,
    Data,
    Mmap,
}

/// Where a page's contents currently live.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Location {
    Memory,
    Swap,
    File,
    NotPresent,
}

/// One tracked user page.
struct PageDesc {
    role: Role,
    loc: Location,
    /// Back-reference to the occupied frame, iff `loc == Memory`.
    frame: Option<FrameId>,
    /// The swap slot holding the page, iff `loc == Swap`.
    swap_slot: Option<usize>,
    writable: bool,
    /// Sharing hint; stored, never acted on (no sharing protocol exists).
    #[allow(dead_code)]
    shared: bool,
}

/// A memory-mapped file region. Owns an independently reopened file
/// handle, so the user closing the descriptor does not tear the mapping
/// down.
struct MmapRegion {
    mapid: MapId,
    file: File,
    base: UVAddr,
    /// `base + file length`.
    end: UVAddr,
}

#[derive(Clone, Copy)]
struct Seg {
    start: usize,
    end: usize,
}

impl Seg {
    fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }
}

/// The segment layout the loader reports for one process.
struct VmLayout {
    code_seg: Option<Seg>,
    data_seg: Option<Seg>,
    stack_seg: Option<Seg>,
    /// Set while the executable image is being loaded; addresses one past
    /// a segment's end are then classified as that segment growing.
    loading_exe: bool,
    /// The user stack pointer recorded at the last trap.
    esp: usize,
}

struct ProcVm {
    pagedir: PageDir,
    spt: BTreeMap<UVAddr, PageDesc>,
    layout: VmLayout,
    mmaps: Vec<MmapRegion>,
    next_mapid: MapId,
}

impl ProcVm {
    fn new() -> Self {
        Self {
            pagedir: PageDir::new(),
            spt: BTreeMap::new(),
            layout: VmLayout {
                code_seg: None,
                data_seg: None,
                stack_seg: None,
                loading_exe: false,
                esp: 0,
            },
            mmaps: Vec::new(),
            next_mapid: 0,
        }
    }

    fn region_index(&self, mapid: MapId) -> Option<usize> {
        self.mmaps.iter().position(|r| r.mapid == mapid)
    }

    fn region_of(&self, addr: usize) -> Option<&MmapRegion> {
        self.mmaps
            .iter()
            .find(|r| (r.base.into_usize()..r.end.into_usize()).contains(&addr))
    }
}

/// The page-table view the frame table's clock sweep reads.
struct ProcPages<'a>(&'a mut BTreeMap<Pid, ProcVm>);

impl PageBits for ProcPages<'_> {
    fn view(&self, pid: Pid, upage: UVAddr) -> PteView {
        let pd = &self.0.get(&pid).expect("vm: occupant without process").pagedir;
        PteView {
            accessed: pd.is_accessed(upage),
            dirty: pd.is_dirty(upage),
            writable: pd.is_writable(upage),
        }
    }

    fn clear_accessed(&mut self, pid: Pid, upage: UVAddr) {
        self.0
            .get_mut(&pid)
            .expect("vm: occupant without process")
            .pagedir
            .set_accessed(upage, false);
    }
}

pub struct VmState {
    frames: FrameTable,
    swap: SwapArea,
    procs: BTreeMap<Pid, ProcVm>,
}

impl VmState {
    pub fn new(swap: SwapArea, pool_pages: usize) -> Self {
        Self {
            frames: FrameTable::new(pool_pages),
            swap,
            procs: BTreeMap::new(),
        }
    }

    /// Registers a process with an empty address space.
    pub fn init_process(&mut self, pid: Pid) {
        let prev = self.procs.insert(pid, ProcVm::new());
        assert!(prev.is_none(), "vm: pid {} already registered", pid);
    }

    /// Tears a process down: mmap writebacks first, then every page and its
    /// backing. Swap slots of swapped-out pages are reclaimed here.
    pub fn destroy_process(&mut self, fs: &FileSys, pid: Pid) {
        self.unmap_all(fs, pid);
        let mut proc = self.procs.remove(&pid).expect("vm: unknown pid");
        for (upage, desc) in proc.spt {
            if let Some(frame) = desc.frame {
                self.frames.destroy(frame);
            }
            if let Some(slot) = desc.swap_slot {
                self.swap.release(slot);
            }
            proc.pagedir.clear_page(upage);
        }
    }

    /// Reports a segment the loader has placed. `start` and `end` are byte
    /// addresses; the stack segment's `start` is its lowest mapped address.
    pub fn set_segment(&mut self, pid: Pid, role: Role, start: usize, end: usize) {
        let layout = &mut self.proc_mut(pid).layout;
        let seg = Some(Seg { start, end });
        match role {
            Role::Code => layout.code_seg = seg,
            Role::Data => layout.data_seg = seg,
            Role::Stack => layout.stack_seg = seg,
            Role::Mmap => panic!("vm: mmap is not a segment"),
        }
    }

    /// Records the user stack pointer at trap entry, for the stack-growth
    /// probes.
    pub fn record_esp(&mut self, pid: Pid, esp: usize) {
        self.proc_mut(pid).layout.esp = esp;
    }

    /// Brackets executable load; while set, addresses one past a segment's
    /// current end are treated as that segment growing.
    pub fn set_loading(&mut self, pid: Pid, loading: bool) {
        self.proc_mut(pid).layout.loading_exe = loading;
    }

    /// Inserts a descriptor without backing it yet.
    pub fn add_page(&mut self, pid: Pid, upage: UVAddr, role: Role, writable: bool, shared: bool) {
        assert!(upage.is_page_aligned());
        let proc = self.proc_mut(pid);
        let prev = proc.spt.insert(
            upage,
            PageDesc {
                role,
                loc: Location::NotPresent,
                frame: None,
                swap_slot: None,
                writable,
                shared,
            },
        );
        assert!(prev.is_none(), "vm: page already tracked");
    }

    /// Allocates a frame (evicting if necessary), registers a descriptor,
    /// and installs the mapping. Memory-mapped pages also pull their file
    /// contents in.
    pub fn get_new_page(
        &mut self,
        fs: &FileSys,
        pid: Pid,
        upage: UVAddr,
        role: Role,
        flags: AllocFlags,
    ) -> Result<()> {
        let writable = !flags.contains(AllocFlags::RDONLY) && role != Role::Code;
        self.add_page(pid, upage, role, writable, flags.contains(AllocFlags::SHARED));
        let frame = self.take_frame(fs, flags)?;
        self.assign_frame(pid, upage, frame);
        if role == Role::Mmap {
            self.mmap_readin(fs, pid, upage)?;
        }
        Ok(())
    }

    /// Looks up the descriptor covering `addr` (rounded down to its page)
    /// and reports where that page currently lives.
    pub fn seek(&self, pid: Pid, addr: UVAddr) -> Option<Location> {
        self.procs.get(&pid)?.spt.get(&addr.page()).map(|d| d.loc)
    }

    /// Removes a page: the descriptor, the mapping, and whatever backs it.
    pub fn free_page(&mut self, pid: Pid, upage: UVAddr) {
        let proc = self.procs.get_mut(&pid).expect("vm: unknown pid");
        let desc = proc.spt.remove(&upage).expect("vm: freeing untracked page");
        if let Some(frame) = desc.frame {
            self.frames.destroy(frame);
        }
        if let Some(slot) = desc.swap_slot {
            self.swap.release(slot);
        }
        proc.pagedir.clear_page(upage);
    }

    /// Whether the next frame allocation must evict.
    pub fn memory_full(&self) -> bool {
        self.frames.full()
    }

    pub fn swap_slots_used(&self) -> usize {
        self.swap.used_slots()
    }

    /// Resolves a page fault at `addr`. An error means the process must be
    /// killed with exit status −1.
    pub fn page_fault(&mut self, fs: &FileSys, pid: Pid, addr: UVAddr, write: bool) -> Result<()> {
        if !addr.is_user() {
            return Err(KernelError::BadAccess);
        }
        let upage = addr.page();
        let proc = self.procs.get(&pid).ok_or(KernelError::BadAccess)?;

        // A fault on a present page is a protection fault: writing somewhere
        // read-only kills; anything else is a benign race with another
        // fault and resumes.
        if let Some(pte) = proc.pagedir.get(upage) {
            if write && !pte.flags.contains(crate::pagedir::PteFlags::WRITABLE) {
                log::debug!("vm: pid {} write to read-only {:?}", pid, addr);
                return Err(KernelError::BadAccess);
            }
            return Ok(());
        }

        let role = match Self::check_role(proc, addr) {
            Some(role) => role,
            None => {
                log::debug!("vm: pid {} fault at unused {:?}", pid, addr);
                return Err(KernelError::BadAccess);
            }
        };
        if write && role == Role::Code {
            return Err(KernelError::BadAccess);
        }

        if proc.spt.contains_key(&upage) {
            self.pull_page(fs, pid, upage)?;
        } else {
            let flags = match role {
                Role::Stack | Role::Data => AllocFlags::ZERO,
                Role::Code => AllocFlags::ZERO | AllocFlags::RDONLY,
                Role::Mmap => AllocFlags::empty(),
            };
            self.get_new_page(fs, pid, upage, role, flags)?;
            self.note_growth(pid, upage, role);
        }
        Ok(())
    }

    /// Emulates user-mode stores at `addr`: faults pages in as the MMU
    /// would, sets accessed and dirty bits, and copies `bytes` in.
    pub fn copy_out(&mut self, fs: &FileSys, pid: Pid, addr: UVAddr, bytes: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let at = addr + done;
            let (upage, off) = (at.page(), at.page_offset());
            let chunk = min(bytes.len() - done, PGSIZE - off);
            self.touch(fs, pid, at, true)?;
            let proc = self.procs.get_mut(&pid).unwrap();
            let frame = proc.pagedir.frame_of(upage).unwrap();
            proc.pagedir.set_accessed(upage, true);
            proc.pagedir.set_dirty(upage, true);
            self.frames.page_mut(frame)[off..off + chunk]
                .copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Emulates user-mode loads at `addr`.
    pub fn copy_in(&mut self, fs: &FileSys, pid: Pid, addr: UVAddr, bytes: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let at = addr + done;
            let (upage, off) = (at.page(), at.page_offset());
            let chunk = min(bytes.len() - done, PGSIZE - off);
            self.touch(fs, pid, at, false)?;
            let proc = self.procs.get_mut(&pid).unwrap();
            let frame = proc.pagedir.frame_of(upage).unwrap();
            proc.pagedir.set_accessed(upage, true);
            bytes[done..done + chunk]
                .copy_from_slice(&self.frames.page(frame)[off..off + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Maps `file` at `base`, reopening it for independent state. The
    /// region's pages materialize lazily on fault.
    pub fn mmap(&mut self, fs: &FileSys, pid: Pid, file: &File, base: UVAddr) -> Result<MapId> {
        let len = file.len(fs);
        if base.is_null() || !base.is_page_aligned() || len == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let start = base.into_usize();
        let end = start + len;
        if end > PHYS_BASE {
            return Err(KernelError::InvalidArgument);
        }
        let proc = self.procs.get_mut(&pid).expect("vm: unknown pid");
        let covered = Seg {
            start,
            end: crate::addr::pgroundup(end),
        };
        let segs = [
            proc.layout.code_seg,
            proc.layout.data_seg,
            proc.layout.stack_seg,
        ];
        for seg in segs.iter().flatten() {
            if covered.start < seg.end && seg.start < covered.end {
                return Err(KernelError::InvalidArgument);
            }
        }
        for r in &proc.mmaps {
            let rseg = (r.base.into_usize(), crate::addr::pgroundup(r.end.into_usize()));
            if covered.start < rseg.1 && rseg.0 < covered.end {
                return Err(KernelError::InvalidArgument);
            }
        }

        let mapid = proc.next_mapid;
        proc.next_mapid += 1;
        proc.mmaps.push(MmapRegion {
            mapid,
            file: file.reopen(fs),
            base,
            end: UVAddr::from(end),
        });
        log::trace!("vm: pid {} mapped {} bytes at {:?} as map {}", pid, len, base, mapid);
        Ok(mapid)
    }

    /// Writes the region's accessed-and-dirty pages back to the file.
    pub fn mmap_writeback(&mut self, fs: &FileSys, pid: Pid, mapid: MapId) -> Result<()> {
        self.writeback_region(fs, pid, mapid, true)
    }

    /// Writes back, then unmaps every page and drops the region.
    pub fn munmap(&mut self, fs: &FileSys, pid: Pid, mapid: MapId) -> Result<()> {
        self.writeback_region(fs, pid, mapid, true)?;
        let proc = self.procs.get_mut(&pid).expect("vm: unknown pid");
        let ridx = proc.region_index(mapid).ok_or(KernelError::NotFound)?;
        let region = proc.mmaps.remove(ridx);
        let start = region.base.into_usize();
        let end = crate::addr::pgroundup(region.end.into_usize());
        for page in (start..end).step_by(PGSIZE) {
            let upage = UVAddr::from(page);
            if self
                .procs
                .get(&pid)
                .map_or(false, |p| p.spt.contains_key(&upage))
            {
                self.free_page(pid, upage);
            }
        }
        region.file.close(fs);
        Ok(())
    }

    /// Unmaps every region at process exit. The list is snapshotted first,
    /// so removal during the walk is safe.
    pub fn unmap_all(&mut self, fs: &FileSys, pid: Pid) {
        let mapids: Vec<MapId> = self
            .procs
            .get(&pid)
            .map(|p| p.mmaps.iter().map(|r| r.mapid).collect())
            .unwrap_or_default();
        for mapid in mapids {
            // Writeback errors at exit are not recoverable; the teardown
            // continues regardless.
            if let Err(e) = self.munmap(fs, pid, mapid) {
                log::warn!("vm: pid {} unmap of map {} failed: {:?}", pid, mapid, e);
            }
        }
    }

    /// Classifies a user address against the process layout: its segment,
    /// the stack-growth probes, its mmap region, or (during load) a
    /// segment's one-past-the-end growth address.
    fn check_role(proc: &ProcVm, addr: UVAddr) -> Option<Role> {
        let a = addr.into_usize();
        let l = &proc.layout;
        if l.code_seg.map_or(false, |s| s.contains(a)) {
            return Some(Role::Code);
        }
        if l.data_seg.map_or(false, |s| s.contains(a)) {
            return Some(Role::Data);
        }
        if l.stack_seg.map_or(false, |s| s.contains(a)) {
            return Some(Role::Stack);
        }
        // PUSH writes 4 bytes below ESP, PUSHA 32, both before the stack
        // has grown to cover them.
        if a == l.esp.wrapping_sub(4) || a == l.esp.wrapping_sub(32) {
            return Some(Role::Stack);
        }
        if proc.region_of(a).is_some() {
            return Some(Role::Mmap);
        }
        if l.loading_exe {
            if l.data_seg.map_or(false, |s| a == s.end) {
                return Some(Role::Data);
            }
            if l.code_seg.map_or(false, |s| a == s.end) {
                return Some(Role::Code);
            }
        }
        None
    }

    /// Extends the recorded layout after a fault grew a segment.
    fn note_growth(&mut self, pid: Pid, upage: UVAddr, role: Role) {
        let layout = &mut self.proc_mut(pid).layout;
        let page = upage.into_usize();
        match role {
            Role::Stack => {
                if let Some(seg) = &mut layout.stack_seg {
                    seg.start = min(seg.start, page);
                } else {
                    layout.stack_seg = Some(Seg {
                        start: page,
                        end: PHYS_BASE,
                    });
                }
            }
            Role::Data => {
                if let Some(seg) = &mut layout.data_seg {
                    seg.end = seg.end.max(page + PGSIZE);
                }
            }
            Role::Code => {
                if let Some(seg) = &mut layout.code_seg {
                    seg.end = seg.end.max(page + PGSIZE);
                }
            }
            Role::Mmap => {}
        }
    }

    /// Faults `addr` in if needed and verifies the access is permitted.
    fn touch(&mut self, fs: &FileSys, pid: Pid, addr: UVAddr, write: bool) -> Result<()> {
        let proc = self.procs.get(&pid).ok_or(KernelError::BadAccess)?;
        match proc.pagedir.get(addr.page()) {
            Some(pte) => {
                if write && !pte.flags.contains(crate::pagedir::PteFlags::WRITABLE) {
                    Err(KernelError::BadAccess)
                } else {
                    Ok(())
                }
            }
            None => self.page_fault(fs, pid, addr, write),
        }
    }

    /// Services a fault on a tracked, non-resident page: allocates a frame
    /// (evicting if necessary), restores the contents, and installs the
    /// mapping.
    fn pull_page(&mut self, fs: &FileSys, pid: Pid, upage: UVAddr) -> Result<()> {
        let (role, loc, slot) = {
            let desc = &self.procs[&pid].spt[&upage];
            (desc.role, desc.loc, desc.swap_slot)
        };
        let flags = match (loc, role) {
            (Location::NotPresent, Role::Code) => AllocFlags::ZERO | AllocFlags::RDONLY,
            (Location::NotPresent, _) => AllocFlags::ZERO,
            (_, Role::Code) => AllocFlags::RDONLY,
            _ => AllocFlags::empty(),
        };
        let frame = self.take_frame(fs, flags)?;

        match loc {
            Location::Swap => {
                let slot = slot.expect("vm: swap location without slot");
                let Self { frames, swap, .. } = self;
                swap.take(slot, frames.page_mut(frame));
                let desc = self.procs.get_mut(&pid).unwrap().spt.get_mut(&upage).unwrap();
                desc.swap_slot = None;
            }
            Location::File | Location::NotPresent => {}
            Location::Memory => unreachable!("vm: pulling a resident page"),
        }

        self.assign_frame(pid, upage, frame);
        if loc == Location::File {
            self.mmap_readin(fs, pid, upage)?;
        }
        Ok(())
    }

    /// Cross-links descriptor and frame and installs the hardware mapping.
    fn assign_frame(&mut self, pid: Pid, upage: UVAddr, frame: FrameId) {
        let proc = self.procs.get_mut(&pid).expect("vm: unknown pid");
        let desc = proc.spt.get_mut(&upage).expect("vm: assigning untracked page");
        assert!(desc.frame.is_none());
        desc.frame = Some(frame);
        desc.loc = Location::Memory;
        proc.pagedir.set_page(upage, frame, desc.writable);
        self.frames.set_occupant(frame, Some((pid, upage)));
    }

    /// A frame from the pool, or an evicted one.
    fn take_frame(&mut self, fs: &FileSys, flags: AllocFlags) -> Result<FrameId> {
        if let Some(id) = self.frames.try_allocate(flags) {
            return Ok(id);
        }
        let id = self.evict_one(fs)?;
        self.frames.repurpose(id, flags);
        Ok(id)
    }

    /// Evicts one frame: picks a victim by the clock, arranges its backing
    /// (mmap writeback, swap, or reload-from-source), and severs the
    /// descriptor/frame link on both sides.
    fn evict_one(&mut self, fs: &FileSys) -> Result<FrameId> {
        let victim = {
            let Self { frames, procs, .. } = self;
            frames.pick_victim(&mut ProcPages(procs))
        };
        let (pid, upage) = self
            .frames
            .occupant(victim)
            .expect("vm: victim without occupant");

        let proc = self.procs.get_mut(&pid).unwrap();
        let dirty = proc.pagedir.is_dirty(upage);
        let role = proc.spt[&upage].role;

        match role {
            Role::Mmap => {
                if dirty {
                    let mapid = proc
                        .region_of(upage.into_usize())
                        .expect("vm: mmap page outside any region")
                        .mapid;
                    self.writeback_region(fs, pid, mapid, false)?;
                }
                let desc = self.procs.get_mut(&pid).unwrap().spt.get_mut(&upage).unwrap();
                desc.loc = Location::File;
            }
            _ if dirty => {
                let Self { frames, swap, procs } = self;
                let slot = swap
                    .put(frames.page(victim))
                    .expect("vm: out of swap during eviction");
                let desc = procs.get_mut(&pid).unwrap().spt.get_mut(&upage).unwrap();
                desc.loc = Location::Swap;
                desc.swap_slot = Some(slot);
                log::trace!("vm: pid {} page {:?} swapped to slot {}", pid, upage, slot);
            }
            _ => {
                // Clean and not file-backed: reloadable from its source
                // (zeros for stack and data, the image for code).
                let desc = self.procs.get_mut(&pid).unwrap().spt.get_mut(&upage).unwrap();
                desc.loc = Location::NotPresent;
            }
        }

        let proc = self.procs.get_mut(&pid).unwrap();
        proc.pagedir.clear_page(upage);
        proc.spt.get_mut(&upage).unwrap().frame = None;
        self.frames.set_occupant(victim, None);
        Ok(victim)
    }

    /// Reads one page of an mmap region from its file: the tail past the
    /// file's length is zeroed, the file cursor is saved and restored, and
    /// the page starts with clean hardware bits.
    fn mmap_readin(&mut self, fs: &FileSys, pid: Pid, upage: UVAddr) -> Result<()> {
        let Self { frames, procs, .. } = self;
        let proc = procs.get_mut(&pid).expect("vm: unknown pid");
        let frame = proc
            .pagedir
            .frame_of(upage)
            .expect("vm: readin before assignment");
        let page = frames.page_mut(frame);

        let addr = upage.into_usize();
        let region = proc
            .mmaps
            .iter_mut()
            .find(|r| (r.base.into_usize()..r.end.into_usize()).contains(&addr))
            .expect("vm: mmap page outside any region");
        let offset = addr - region.base.into_usize();
        let len = min(PGSIZE, region.end.into_usize() - addr);

        let saved = region.file.tell();
        let mut file = scopeguard::guard(&mut region.file, move |f| f.seek(saved));
        file.seek(offset);
        let n = file.read(fs, &mut page[..len]);
        drop(file);
        page[n..].fill(0);

        proc.pagedir.set_accessed(upage, false);
        proc.pagedir.set_dirty(upage, false);
        Ok(())
    }

    /// Writes a region's dirty resident pages back to the file at their
    /// mapped offsets, preserving the file cursor. With `require_accessed`,
    /// only pages whose hardware bits show both accessed and dirty are
    /// written (the explicit writeback and unmap paths); eviction writes
    /// every dirty page.
    fn writeback_region(
        &mut self,
        fs: &FileSys,
        pid: Pid,
        mapid: MapId,
        require_accessed: bool,
    ) -> Result<()> {
        let Self { frames, procs, .. } = self;
        let proc = procs.get_mut(&pid).expect("vm: unknown pid");
        let ridx = proc.region_index(mapid).ok_or(KernelError::NotFound)?;
        let start = proc.mmaps[ridx].base.into_usize();
        let end = proc.mmaps[ridx].end.into_usize();

        for page_addr in (start..crate::addr::pgroundup(end)).step_by(PGSIZE) {
            let upage = UVAddr::from(page_addr);
            let resident = proc
                .spt
                .get(&upage)
                .map_or(false, |d| d.loc == Location::Memory);
            if !resident {
                continue;
            }
            let dirty = proc.pagedir.is_dirty(upage);
            let accessed = proc.pagedir.is_accessed(upage);
            if !dirty || (require_accessed && !accessed) {
                continue;
            }
            let frame = proc.pagedir.frame_of(upage).unwrap();
            let offset = page_addr - start;
            let len = min(PGSIZE, end - page_addr);

            let region = &mut proc.mmaps[ridx];
            let saved = region.file.tell();
            let mut file = scopeguard::guard(&mut region.file, move |f| f.seek(saved));
            file.seek(offset);
            file.write(fs, &frames.page(frame)[..len])?;
            drop(file);
            proc.pagedir.set_dirty(upage, false);
            log::trace!("vm: pid {} wrote back mmap page {:?}", pid, upage);
        }
        Ok(())
    }

    fn proc_mut(&mut self, pid: Pid) -> &mut ProcVm {
        self.procs.get_mut(&pid).expect("vm: unknown pid")
    }
}

#[cfg(test)]
impl VmState {
    /// Cross-checks every descriptor/frame/page-table linkage.
    fn check_invariants(&self) {
        let mut swap_refs = 0;
        for (pid, proc) in &self.procs {
            for (upage, desc) in &proc.spt {
                match desc.loc {
                    Location::Memory => {
                        let frame = desc.frame.expect("resident page without frame");
                        assert_eq!(self.frames.occupant(frame), Some((*pid, *upage)));
                        assert_eq!(proc.pagedir.frame_of(*upage), Some(frame));
                    }
                    loc => {
                        assert!(desc.frame.is_none());
                        assert!(!proc.pagedir.is_present(*upage));
                        match loc {
                            Location::Swap => {
                                assert!(desc.swap_slot.is_some());
                                swap_refs += 1;
                            }
                            Location::File => assert_eq!(desc.role, Role::Mmap),
                            _ => assert!(desc.swap_slot.is_none()),
                        }
                    }
                }
            }
        }
        assert_eq!(
            swap_refs,
            self.swap.used_slots(),
            "a slot is used iff exactly one descriptor records it"
        );
    }
}
