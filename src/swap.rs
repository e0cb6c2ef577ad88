//! The swap area.
//!
//! The swap block device, carved into page-sized slots of 8 consecutive
//! sectors. An in-memory bitmap tracks which slots hold a page; it is not
//! persisted, since swap contents mean nothing across a boot. A slot is
//! used iff exactly one page descriptor records its index: `put` hands the
//! slot to the descriptor, `take` gives it back.

use alloc::boxed::Box;
use core::convert::TryInto;

use crate::bitmap::Bitmap;
use crate::block::BlockDevice;
use crate::page::Page;
use crate::param::{SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::{KernelError, Result};

pub struct SwapArea {
    dev: Box<dyn BlockDevice>,
    map: Bitmap,
}

impl SwapArea {
    pub fn new(dev: Box<dyn BlockDevice>) -> Self {
        let slots = dev.sector_count() as usize / SECTORS_PER_PAGE;
        Self {
            dev,
            map: Bitmap::new(slots),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.map.len()
    }

    pub fn used_slots(&self) -> usize {
        self.map.count_set()
    }

    /// Writes `page` into a fresh slot and returns its index.
    pub fn put(&mut self, page: &Page) -> Result<usize> {
        let slot = self.map.scan_and_flip(0, 1).ok_or_else(|| {
            log::warn!("swap: out of slots");
            KernelError::NoSwap
        })?;
        let first = (slot * SECTORS_PER_PAGE) as u32;
        for i in 0..SECTORS_PER_PAGE {
            let sector: &[u8; SECTOR_SIZE] = page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                .try_into()
                .unwrap();
            self.dev.write_sector(first + i as u32, sector);
        }
        Ok(slot)
    }

    /// Reads the page stored in `slot` into `page` and releases the slot.
    pub fn take(&mut self, slot: usize, page: &mut Page) {
        assert!(self.map.is_set(slot), "swap: taking a free slot");
        let first = (slot * SECTORS_PER_PAGE) as u32;
        for i in 0..SECTORS_PER_PAGE {
            let sector: &mut [u8; SECTOR_SIZE] = (&mut page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            self.dev.read_sector(first + i as u32, sector);
        }
        self.map.reset(slot);
    }

    /// Releases `slot` without reading it back. Used when a process exits
    /// with pages still swapped out.
    pub fn release(&mut self, slot: usize) {
        assert!(self.map.is_set(slot), "swap: releasing a free slot");
        self.map.reset(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockRole, MemDisk};

    fn swap_with_slots(slots: usize) -> SwapArea {
        SwapArea::new(MemDisk::new(
            BlockRole::Swap,
            (slots * SECTORS_PER_PAGE) as u32,
        ))
    }

    /// Round-trip law: a page written to swap comes back byte-identical.
    #[test]
    fn put_take_round_trip() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let mut swap = swap_with_slots(4);
        let mut page = Box::new(Page::DEFAULT);
        rng.fill(&mut page[..]);
        let original: [u8; crate::param::PGSIZE] = **page;

        let slot = swap.put(&page).unwrap();
        assert_eq!(swap.used_slots(), 1);

        let mut back = Box::new(Page::DEFAULT);
        swap.take(slot, &mut back);
        assert_eq!(back[..], original[..]);
        assert_eq!(swap.used_slots(), 0, "take releases the slot");
    }

    #[test]
    fn slots_are_reused_after_release() {
        let mut swap = swap_with_slots(2);
        let page = Box::new(Page::DEFAULT);
        let a = swap.put(&page).unwrap();
        let b = swap.put(&page).unwrap();
        assert_eq!(swap.put(&page), Err(KernelError::NoSwap));
        swap.release(a);
        assert_eq!(swap.put(&page).unwrap(), a);
        swap.release(b);
    }
}
