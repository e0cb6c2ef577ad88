//! Per-process page tables.
//!
//! A `PageDir` is the hardware page table of one process, modelled in
//! software: one entry per present user page, carrying the frame it maps to
//! and the present/writable/accessed/dirty bits the MMU would maintain.
//! The accessed and dirty bits feed both clock sweeps; clearing a page is
//! the point where a real kernel would also invalidate the TLB entry, so
//! everything an unmapped page needs is done by the time `clear_page`
//! returns.

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::addr::UVAddr;
use crate::frame::FrameId;

bitflags! {
    pub struct PteFlags: u8 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const ACCESSED = 1 << 2;
        const DIRTY = 1 << 3;
    }
}

#[derive(Clone, Copy)]
pub struct Pte {
    pub frame: FrameId,
    pub flags: PteFlags,
}

pub struct PageDir {
    entries: BTreeMap<UVAddr, Pte>,
}

impl PageDir {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Maps `upage` to `frame`. The page must not already be present.
    pub fn set_page(&mut self, upage: UVAddr, frame: FrameId, writable: bool) {
        assert!(upage.is_page_aligned(), "pagedir: unaligned page");
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        let prev = self.entries.insert(upage, Pte { frame, flags });
        assert!(prev.is_none(), "pagedir: page already present");
    }

    /// Unmaps `upage`. On real hardware this is paired with a TLB
    /// invalidation for the page.
    pub fn clear_page(&mut self, upage: UVAddr) {
        let _ = self.entries.remove(&upage);
    }

    pub fn get(&self, upage: UVAddr) -> Option<&Pte> {
        self.entries.get(&upage)
    }

    pub fn is_present(&self, upage: UVAddr) -> bool {
        self.entries.contains_key(&upage)
    }

    pub fn frame_of(&self, upage: UVAddr) -> Option<FrameId> {
        self.entries.get(&upage).map(|pte| pte.frame)
    }

    pub fn is_writable(&self, upage: UVAddr) -> bool {
        self.flag(upage, PteFlags::WRITABLE)
    }

    pub fn is_accessed(&self, upage: UVAddr) -> bool {
        self.flag(upage, PteFlags::ACCESSED)
    }

    pub fn is_dirty(&self, upage: UVAddr) -> bool {
        self.flag(upage, PteFlags::DIRTY)
    }

    pub fn set_accessed(&mut self, upage: UVAddr, accessed: bool) {
        self.set_flag(upage, PteFlags::ACCESSED, accessed);
    }

    pub fn set_dirty(&mut self, upage: UVAddr, dirty: bool) {
        self.set_flag(upage, PteFlags::DIRTY, dirty);
    }

    /// Every present page, for teardown walks.
    pub fn pages(&self) -> impl Iterator<Item = UVAddr> + '_ {
        self.entries.keys().copied()
    }

    fn flag(&self, upage: UVAddr, flag: PteFlags) -> bool {
        self.entries
            .get(&upage)
            .map_or(false, |pte| pte.flags.contains(flag))
    }

    fn set_flag(&mut self, upage: UVAddr, flag: PteFlags, value: bool) {
        if let Some(pte) = self.entries.get_mut(&upage) {
            pte.flags.set(flag, value);
        }
    }
}
