//! The frame table.
//!
//! One record per allocated user frame, kept in an arena addressed by
//! stable [`FrameId`] handles. A frame and the page descriptor occupying it
//! hold weak back-references to each other; eviction severs the link on
//! both sides under the frame lock.
//!
//! All frames form a ring walked by a shared clock hand. The sweep
//! consults the owning process's page table through the [`PageBits`] seam:
//! the first revolution takes an unaccessed clean frame, the second settles
//! for unaccessed, clearing accessed bits as it passes. Only evictable
//! (non-pinned), writable frames are candidates, so a victim is guaranteed
//! within two revolutions whenever one exists.
//!
//! What happens to a victim's contents is the supplemental page table's
//! business; this module only picks victims and keeps the arena.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::addr::UVAddr;
use crate::kalloc::UserPool;
use crate::page::Page;
use crate::vm::Pid;

bitflags! {
    /// Frame allocation flags.
    pub struct AllocFlags: u8 {
        /// Zero the frame before handing it out.
        const ZERO = 1 << 0;
        /// The mapping will be read-only.
        const RDONLY = 1 << 1;
        /// Never evict this frame.
        const PINNED = 1 << 2;
        /// The occupant may be shared between processes. Stored as a hint;
        /// no sharing protocol exists.
        const SHARED = 1 << 3;
    }
}

/// A stable handle into the frame arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameId(usize);

impl FrameId {
    #[cfg(test)]
    pub(crate) fn new_for_test(i: usize) -> Self {
        Self(i)
    }
}

/// The page-table bits the clock sweep needs from a frame's owner.
pub(crate) struct PteView {
    pub accessed: bool,
    pub dirty: bool,
    pub writable: bool,
}

/// How the frame table reaches into the owning process's page table during
/// a sweep. Implemented by the supplemental page table's process registry;
/// both sit behind the same lock, which is what makes these cross-process
/// reads sound.
pub(crate) trait PageBits {
    fn view(&self, pid: Pid, upage: UVAddr) -> PteView;
    fn clear_accessed(&mut self, pid: Pid, upage: UVAddr);
}

struct Frame {
    page: Box<Page>,
    evictable: bool,
    /// The descriptor currently holding this frame, or `None` between
    /// eviction and reassignment.
    occupant: Option<(Pid, UVAddr)>,
}

pub struct FrameTable {
    pool: UserPool,
    slots: Vec<Option<Frame>>,
    /// The clock hand, shared by every sweep.
    cursor: usize,
}

impl FrameTable {
    pub fn new(pool_pages: usize) -> Self {
        Self {
            pool: UserPool::new(pool_pages),
            slots: Vec::new(),
            cursor: 0,
        }
    }

    /// Whether the next allocation must evict.
    pub fn full(&self) -> bool {
        self.pool.pages_free() == 0
    }

    /// Takes a frame from the pool, or `None` when the pool demands an
    /// eviction first. The frame starts with no occupant.
    pub fn try_allocate(&mut self, flags: AllocFlags) -> Option<FrameId> {
        let page = self.pool.alloc()?;
        let frame = Frame {
            page,
            evictable: !flags.contains(AllocFlags::PINNED),
            occupant: None,
        };
        let id = match self.slots.iter().position(|s| s.is_none()) {
            Some(i) => {
                self.slots[i] = Some(frame);
                i
            }
            None => {
                self.slots.push(Some(frame));
                self.slots.len() - 1
            }
        };
        Some(FrameId(id))
    }

    /// Readies an evicted frame for its next occupant.
    pub fn repurpose(&mut self, id: FrameId, flags: AllocFlags) {
        let frame = self.frame_mut(id);
        assert!(frame.occupant.is_none(), "frame: repurposing a live frame");
        frame.evictable = !flags.contains(AllocFlags::PINNED);
        if flags.contains(AllocFlags::ZERO) {
            frame.page.clear();
        }
    }

    /// Releases the frame record and its page.
    pub fn destroy(&mut self, id: FrameId) {
        let frame = self.slots[id.0].take().expect("frame: double destroy");
        self.pool.free(frame.page);
    }

    pub fn page(&self, id: FrameId) -> &Page {
        &self.frame(id).page
    }

    pub fn page_mut(&mut self, id: FrameId) -> &mut Page {
        &mut self.frame_mut(id).page
    }

    pub fn occupant(&self, id: FrameId) -> Option<(Pid, UVAddr)> {
        self.frame(id).occupant
    }

    pub fn set_occupant(&mut self, id: FrameId, occupant: Option<(Pid, UVAddr)>) {
        self.frame_mut(id).occupant = occupant;
    }

    /// The two-revolution clock sweep. Consults hardware accessed/dirty
    /// bits through `bits`; clears accessed bits on frames the second
    /// revolution passes over. The hand stops one step past the victim.
    pub(crate) fn pick_victim(&mut self, bits: &mut impl PageBits) -> FrameId {
        let n = self.slots.len();
        assert!(n > 0, "frame: eviction with an empty table");
        let mut steps = 0;
        loop {
            let i = self.cursor;
            self.cursor = (self.cursor + 1) % n;
            steps += 1;
            assert!(steps <= 2 * n + 1, "frame: no evictable frame");

            let second_turn = steps > n;
            let frame = match &self.slots[i] {
                Some(f) => f,
                None => continue,
            };
            let (pid, upage) = match frame.occupant {
                Some(o) => o,
                None => continue,
            };
            if !frame.evictable {
                continue;
            }
            let view = bits.view(pid, upage);
            if !view.writable {
                continue;
            }
            if !view.accessed && (second_turn || !view.dirty) {
                log::trace!("frame: evicting frame {} of pid {}", i, pid);
                return FrameId(i);
            }
            if second_turn && view.accessed {
                bits.clear_accessed(pid, upage);
            }
        }
    }

    fn frame(&self, id: FrameId) -> &Frame {
        self.slots[id.0].as_ref().expect("frame: stale frame id")
    }

    fn frame_mut(&mut self, id: FrameId) -> &mut Frame {
        self.slots[id.0].as_mut().expect("frame: stale frame id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    /// A stand-in page table: (accessed, dirty) per occupant.
    struct Bits(BTreeMap<(Pid, usize), (bool, bool)>);

    impl PageBits for Bits {
        fn view(&self, pid: Pid, upage: UVAddr) -> PteView {
            let &(accessed, dirty) = self.0.get(&(pid, upage.into_usize())).unwrap();
            PteView {
                accessed,
                dirty,
                writable: true,
            }
        }

        fn clear_accessed(&mut self, pid: Pid, upage: UVAddr) {
            self.0.get_mut(&(pid, upage.into_usize())).unwrap().0 = false;
        }
    }

    fn occupied_table(n: usize, bits: &[(bool, bool)]) -> (FrameTable, Bits) {
        let mut table = FrameTable::new(n);
        let mut map = BTreeMap::new();
        for i in 0..n {
            let id = table.try_allocate(AllocFlags::ZERO).unwrap();
            let upage = UVAddr::from(0x1000 * (i + 1));
            table.set_occupant(id, Some((7, upage)));
            map.insert((7, upage.into_usize()), bits[i]);
        }
        assert!(table.full());
        (table, Bits(map))
    }

    #[test]
    fn first_revolution_takes_clean_unaccessed() {
        let (mut table, mut bits) = occupied_table(
            4,
            &[(true, false), (true, true), (false, false), (false, true)],
        );
        let victim = table.pick_victim(&mut bits);
        assert_eq!(victim, FrameId(2));
        // Hand advanced one step past the victim.
        assert_eq!(table.cursor, 3);
    }

    #[test]
    fn second_revolution_clears_accessed_bits() {
        let (mut table, mut bits) = occupied_table(
            3,
            &[(true, true), (true, true), (true, true)],
        );
        let victim = table.pick_victim(&mut bits);
        // First slot re-examined after one clearing revolution.
        assert_eq!(victim, FrameId(0));
        for (_, &(accessed, _)) in bits.0.iter() {
            assert!(!accessed, "all accessed bits stripped by the sweep");
        }
    }

    #[test]
    fn pinned_frames_are_skipped() {
        let mut table = FrameTable::new(2);
        let pinned = table.try_allocate(AllocFlags::PINNED).unwrap();
        let plain = table.try_allocate(AllocFlags::empty()).unwrap();
        let mut map = BTreeMap::new();
        for (id, addr) in [(pinned, 0x1000), (plain, 0x2000)] {
            table.set_occupant(id, Some((1, UVAddr::from(addr))));
            map.insert((1, addr), (false, false));
        }
        let victim = table.pick_victim(&mut Bits(map));
        assert_eq!(victim, plain);
    }

    #[test]
    fn destroy_refills_the_pool() {
        let mut table = FrameTable::new(1);
        let id = table.try_allocate(AllocFlags::ZERO).unwrap();
        assert!(table.full());
        table.destroy(id);
        assert!(!table.full());
        assert!(table.try_allocate(AllocFlags::ZERO).is_some());
    }
}
