//! Buffer cache.
//!
//! A fixed pool of 64 sector-sized slots sitting between the filesystem and
//! the block device. Caching sectors in memory reduces disk traffic and
//! gives the filesystem a single synchronization point per sector.
//!
//! A slot caches one of two things:
//! * a plain data sector, written back to disk when the slot is evicted or
//!   when `writeback_all` runs, or
//! * a pack of fixed-size inode records. Whole-slot writeback is impossible
//!   for these (one slot aggregates unrelated inodes), so every inode
//!   mutation is written through to disk immediately.
//!
//! Interface:
//! * `read` / `write` move whole data sectors in and out of the cache.
//! * `read_inode` / `write_inode` move inode records; `write_inode` is
//!   write-through.
//! * `with_inode` borrows the cached record in place. The borrow must not
//!   be retained across any call that may evict, which is why it is scoped
//!   to a closure.
//! * `writeback_all` flushes every dirty data slot.
//!
//! Eviction is a two-revolution clock sweep over the slot ring: the first
//! revolution takes the first unreferenced clean slot, the second settles
//! for unreferenced, clearing reference marks as the hand passes. All
//! operations run under the filesystem-wide lock.

use alloc::collections::BTreeMap;
use core::convert::TryInto;
use core::mem;

use array_macro::array;
use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::block::BlockDevice;
use crate::param::{CACHE_SIZE, NDIRECT, SECTOR_SIZE};

/// Inode records packed into one metadata slot.
pub const INODES_PER_SLOT: usize = SECTOR_SIZE / mem::size_of::<InodeRecord>();

/// The cached portion of a disk inode.
///
/// A disk inode occupies a full sector, but everything past these fields is
/// zero padding, so the cache packs several records into one slot. The field
/// order matches the on-disk layout; a record is the prefix of its sector
/// image.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct InodeRecord {
    /// File size in bytes.
    pub length: i32,
    /// Directory flag, preserved as an opaque byte.
    pub is_dir: u8,
    pub _pad: [u8; 3],
    /// Direct data sector numbers; 0 means unallocated.
    pub direct: [u32; NDIRECT],
    /// Indirect sector number; 0 means unallocated.
    pub indirect: u32,
    /// Double-indirect sector number; 0 means unallocated.
    pub double_indirect: u32,
    pub magic: u32,
    pub _reserved: [u8; 24],
}

const_assert!(mem::size_of::<InodeRecord>() == 64);
const_assert!(SECTOR_SIZE % mem::size_of::<InodeRecord>() == 0);

impl InodeRecord {
    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }

    /// The full sector image of this record: the record itself followed by
    /// zero padding.
    pub fn sector_image(&self) -> [u8; SECTOR_SIZE] {
        let mut image = [0; SECTOR_SIZE];
        image[..mem::size_of::<Self>()].copy_from_slice(self.as_bytes());
        image
    }

    fn from_sector(image: &[u8; SECTOR_SIZE]) -> Self {
        Self::read_from_prefix(&image[..]).expect("bio: short sector image")
    }
}

struct MetaEntry {
    sector: u32,
    rec: InodeRecord,
}

enum SlotState {
    Empty,
    Data {
        sector: u32,
        bytes: [u8; SECTOR_SIZE],
    },
    Meta {
        entries: ArrayVec<MetaEntry, INODES_PER_SLOT>,
    },
}

struct Slot {
    state: SlotState,
    accessed: bool,
    dirty: bool,
}

impl Slot {
    const fn new() -> Self {
        Self {
            state: SlotState::Empty,
            accessed: false,
            dirty: false,
        }
    }
}

/// Where the hash index says a sector lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Pos {
    Data(usize),
    Meta(usize, usize),
}

pub struct BufCache {
    slots: [Slot; CACHE_SIZE],
    /// Sector number -> slot position. One entry per data slot, one per
    /// packed inode record.
    index: BTreeMap<u32, Pos>,
    /// Slots handed out so far; slots beyond this have never been used.
    used: usize,
    /// The metadata slot currently accepting new inode records.
    cur_meta: Option<usize>,
    /// The clock hand.
    cursor: usize,
}

impl BufCache {
    pub fn new() -> Self {
        Self {
            slots: array![_ => Slot::new(); CACHE_SIZE],
            index: BTreeMap::new(),
            used: 0,
            cur_meta: None,
            cursor: 0,
        }
    }

    /// Reads a data sector, filling the slot from disk on a miss.
    pub fn read(&mut self, dev: &mut dyn BlockDevice, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let i = match self.index.get(&sector) {
            Some(&Pos::Data(i)) => i,
            Some(&Pos::Meta(..)) => panic!("bio: sector {} cached as inode metadata", sector),
            None => self.fill_data(dev, sector, true),
        };
        self.slots[i].accessed = true;
        match &self.slots[i].state {
            SlotState::Data { bytes, .. } => *buf = *bytes,
            _ => unreachable!(),
        }
    }

    /// Writes a whole data sector into the cache. The slot is filled without
    /// reading the disk: the caller overwrites every byte anyway.
    pub fn write(&mut self, dev: &mut dyn BlockDevice, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let i = match self.index.get(&sector) {
            Some(&Pos::Data(i)) => i,
            Some(&Pos::Meta(..)) => panic!("bio: sector {} cached as inode metadata", sector),
            None => self.fill_data(dev, sector, false),
        };
        let slot = &mut self.slots[i];
        slot.accessed = true;
        slot.dirty = true;
        match &mut slot.state {
            SlotState::Data { bytes, .. } => *bytes = *buf,
            _ => unreachable!(),
        }
    }

    /// Copies out the cached record for the inode at `sector`, filling from
    /// disk if absent.
    pub fn read_inode(&mut self, dev: &mut dyn BlockDevice, sector: u32) -> InodeRecord {
        self.with_inode(dev, sector, |rec| *rec)
    }

    /// Runs `f` on the cached record for the inode at `sector`, filling from
    /// disk if absent. Mutations must go through `write_inode` instead, so
    /// that they reach the disk.
    pub fn with_inode<R>(
        &mut self,
        dev: &mut dyn BlockDevice,
        sector: u32,
        f: impl FnOnce(&InodeRecord) -> R,
    ) -> R {
        let (i, j) = match self.index.get(&sector) {
            Some(&Pos::Meta(i, j)) => (i, j),
            Some(&Pos::Data(_)) => panic!("bio: sector {} cached as file data", sector),
            None => self.fill_inode(dev, sector, true),
        };
        self.slots[i].accessed = true;
        match &self.slots[i].state {
            SlotState::Meta { entries } => f(&entries[j].rec),
            _ => unreachable!(),
        }
    }

    /// Updates the cached record for the inode at `sector` and writes its
    /// sector through to disk.
    ///
    /// Inode records cannot participate in whole-slot writeback, so the
    /// write-through here is what keeps the disk current.
    pub fn write_inode(&mut self, dev: &mut dyn BlockDevice, sector: u32, rec: &InodeRecord) {
        let (i, j) = match self.index.get(&sector) {
            Some(&Pos::Meta(i, j)) => (i, j),
            Some(&Pos::Data(_)) => panic!("bio: sector {} cached as file data", sector),
            None => self.fill_inode(dev, sector, false),
        };
        let slot = &mut self.slots[i];
        slot.accessed = true;
        slot.dirty = true;
        match &mut slot.state {
            SlotState::Meta { entries } => entries[j].rec = *rec,
            _ => unreachable!(),
        }
        dev.write_sector(sector, &rec.sector_image());
    }

    /// Flushes every dirty data slot to disk.
    pub fn writeback_all(&mut self, dev: &mut dyn BlockDevice) {
        for slot in self.slots[..self.used].iter_mut() {
            if let SlotState::Data { sector, bytes } = &slot.state {
                if slot.dirty {
                    dev.write_sector(*sector, bytes);
                    slot.dirty = false;
                }
            }
        }
    }

    /// Drops any cached state for `sector`. Called when the sector is
    /// released to the free map, so a later reuse under the other slot class
    /// starts clean.
    pub fn forget(&mut self, sector: u32) {
        match self.index.remove(&sector) {
            None => {}
            Some(Pos::Data(i)) => {
                let slot = &mut self.slots[i];
                slot.state = SlotState::Empty;
                slot.accessed = false;
                slot.dirty = false;
            }
            Some(Pos::Meta(i, j)) => {
                let entries = match &mut self.slots[i].state {
                    SlotState::Meta { entries } => entries,
                    _ => unreachable!(),
                };
                let _ = entries.swap_remove(j);
                // The former last entry now sits at `j`; re-point its index
                // entry.
                if let Some(moved) = entries.get(j) {
                    let _ = self.index.insert(moved.sector, Pos::Meta(i, j));
                }
            }
        }
    }

    /// Caches `sector` as a data slot, reading it from disk when `fill` is
    /// set. Returns the slot index.
    fn fill_data(&mut self, dev: &mut dyn BlockDevice, sector: u32, fill: bool) -> usize {
        let i = self.get_free_slot(dev);
        let mut bytes = [0; SECTOR_SIZE];
        if fill {
            dev.read_sector(sector, &mut bytes);
        }
        self.slots[i].state = SlotState::Data { sector, bytes };
        let prev = self.index.insert(sector, Pos::Data(i));
        assert!(prev.is_none(), "bio: sector {} double-cached", sector);
        i
    }

    /// Caches the inode at `sector` in the current free metadata slot,
    /// reading the record from disk when `fill` is set. Returns the slot and
    /// entry index.
    fn fill_inode(&mut self, dev: &mut dyn BlockDevice, sector: u32, fill: bool) -> (usize, usize) {
        let rec = if fill {
            let mut image = [0; SECTOR_SIZE];
            dev.read_sector(sector, &mut image);
            InodeRecord::from_sector(&image)
        } else {
            InodeRecord::zeroed()
        };

        let i = match self.cur_meta {
            Some(i) if !self.meta_full(i) => i,
            _ => {
                let i = self.get_free_slot(dev);
                self.slots[i].state = SlotState::Meta {
                    entries: ArrayVec::new(),
                };
                self.cur_meta = Some(i);
                i
            }
        };
        let entries = match &mut self.slots[i].state {
            SlotState::Meta { entries } => entries,
            _ => unreachable!(),
        };
        entries.push(MetaEntry { sector, rec });
        let j = entries.len() - 1;
        let prev = self.index.insert(sector, Pos::Meta(i, j));
        assert!(prev.is_none(), "bio: sector {} double-cached", sector);
        (i, j)
    }

    fn meta_full(&self, i: usize) -> bool {
        match &self.slots[i].state {
            SlotState::Meta { entries } => entries.is_full(),
            _ => true,
        }
    }

    /// Produces an empty slot, evicting if every slot is in use.
    fn get_free_slot(&mut self, dev: &mut dyn BlockDevice) -> usize {
        if self.used < CACHE_SIZE {
            let i = self.used;
            self.used += 1;
            return i;
        }
        // A `forget` may have emptied a slot in place; reuse it before
        // evicting a live one.
        if let Some(i) = self.slots[..self.used]
            .iter()
            .position(|s| matches!(s.state, SlotState::Empty))
        {
            return i;
        }
        self.evict(dev)
    }

    /// Evicts one slot and returns it, empty. Dirty data goes back to disk;
    /// dropped inode records are already on disk by write-through.
    fn evict(&mut self, dev: &mut dyn BlockDevice) -> usize {
        let i = self.pick_victim();
        let slot = &mut self.slots[i];
        match mem::replace(&mut slot.state, SlotState::Empty) {
            SlotState::Data { sector, bytes } => {
                if slot.dirty {
                    dev.write_sector(sector, &bytes);
                }
                let _ = self.index.remove(&sector);
                log::trace!("bio: evicted data sector {}", sector);
            }
            SlotState::Meta { entries } => {
                for entry in &entries {
                    let _ = self.index.remove(&entry.sector);
                }
                if self.cur_meta == Some(i) {
                    self.cur_meta = None;
                }
                log::trace!("bio: evicted metadata slot of {} inodes", entries.len());
            }
            SlotState::Empty => unreachable!(),
        }
        slot.accessed = false;
        slot.dirty = false;
        i
    }

    /// The two-revolution clock sweep. The first revolution wants an
    /// unreferenced clean slot; the second settles for unreferenced and
    /// clears reference marks as the hand passes. A revolution counter
    /// bounds the sweep instead of a saved-pointer sentinel.
    fn pick_victim(&mut self) -> usize {
        let n = self.used;
        assert!(n == CACHE_SIZE, "bio: evicting before the cache is full");
        let mut steps = 0;
        loop {
            let i = self.cursor;
            self.cursor = (self.cursor + 1) % n;
            steps += 1;
            assert!(steps <= 2 * n + 1, "bio: clock sweep found no victim");

            let second_turn = steps > n;
            let slot = &mut self.slots[i];
            if matches!(slot.state, SlotState::Empty) {
                return i;
            }
            if !slot.accessed && (second_turn || !slot.dirty) {
                return i;
            }
            if second_turn {
                slot.accessed = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockRole, MemDisk};
    use crate::param::INODE_MAGIC;

    fn disk(sectors: u32) -> alloc::boxed::Box<MemDisk> {
        MemDisk::new(BlockRole::Filesys, sectors)
    }

    fn sector_of(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn read_miss_fills_from_disk() {
        let mut dev = disk(128);
        dev.write_sector(7, &sector_of(0x7e));
        let mut cache = BufCache::new();
        let mut buf = [0; SECTOR_SIZE];
        cache.read(&mut *dev, 7, &mut buf);
        assert_eq!(buf, sector_of(0x7e));
        // A hit must not touch the device again.
        dev.write_sector(7, &sector_of(0));
        cache.read(&mut *dev, 7, &mut buf);
        assert_eq!(buf, sector_of(0x7e));
    }

    #[test]
    fn data_writes_are_write_back() {
        let mut dev = disk(128);
        let mut cache = BufCache::new();
        cache.write(&mut *dev, 3, &sector_of(0x33));
        let mut raw = [0; SECTOR_SIZE];
        dev.read_sector(3, &mut raw);
        assert_eq!(raw, sector_of(0), "data write must not reach disk yet");
        cache.writeback_all(&mut *dev);
        dev.read_sector(3, &mut raw);
        assert_eq!(raw, sector_of(0x33));
    }

    #[test]
    fn inode_writes_are_write_through() {
        let mut dev = disk(128);
        let mut cache = BufCache::new();
        let mut rec = InodeRecord::zeroed();
        rec.length = 1234;
        rec.magic = INODE_MAGIC;
        cache.write_inode(&mut *dev, 9, &rec);
        let mut raw = [0; SECTOR_SIZE];
        dev.read_sector(9, &mut raw);
        let back = InodeRecord::from_sector(&raw);
        assert_eq!(back.length, 1234);
        assert_eq!(back.magic, INODE_MAGIC);
    }

    #[test]
    fn metadata_slots_pack_records() {
        let mut dev = disk(128);
        let mut cache = BufCache::new();
        for s in 0..(INODES_PER_SLOT as u32 + 1) {
            let mut rec = InodeRecord::zeroed();
            rec.length = s as i32;
            cache.write_inode(&mut *dev, s, &rec);
        }
        // Nine records need two slots; the data ring is otherwise untouched.
        assert_eq!(cache.used, 2);
        for s in 0..(INODES_PER_SLOT as u32 + 1) {
            assert_eq!(cache.read_inode(&mut *dev, s).length, s as i32);
        }
    }

    #[test]
    fn forget_drops_a_packed_record() {
        let mut dev = disk(128);
        let mut cache = BufCache::new();
        for s in 0..4 {
            cache.write_inode(&mut *dev, s, &InodeRecord::zeroed());
        }
        cache.forget(1);
        // The surviving records are still reachable, including the one that
        // was relocated into the vacated entry.
        for s in [0u32, 2, 3] {
            let _ = cache.read_inode(&mut *dev, s);
        }
        assert!(cache.index.get(&1).is_none());
    }

    /// Boundary scenario: fill the cache, touch every slot, then demand one
    /// more. The victim is the slot at the hand after one clearing
    /// revolution, and the sweep has cleared every other reference mark.
    #[test]
    fn clock_two_revolution_eviction() {
        let mut dev = disk(256);
        let mut cache = BufCache::new();
        let mut buf = [0; SECTOR_SIZE];
        for s in 0..CACHE_SIZE as u32 {
            cache.read(&mut *dev, s, &mut buf);
        }
        assert_eq!(cache.used, CACHE_SIZE);
        assert!(cache.slots.iter().all(|s| s.accessed));

        let hand = cache.cursor;
        cache.read(&mut *dev, 200, &mut buf);

        // Sector at the original hand position is gone; the newcomer holds
        // its slot.
        assert_eq!(cache.index.get(&(hand as u32)), None);
        assert_eq!(cache.index.get(&200), Some(&Pos::Data(hand)));
        // All other slots were stripped of their reference marks by the
        // second revolution.
        for (i, slot) in cache.slots.iter().enumerate() {
            if i != hand {
                assert!(!slot.accessed, "slot {} still referenced", i);
            }
        }
    }

    #[test]
    fn eviction_prefers_clean_slots() {
        let mut dev = disk(512);
        let mut cache = BufCache::new();
        let mut buf = [0; SECTOR_SIZE];
        for s in 0..CACHE_SIZE as u32 {
            cache.write(&mut *dev, s, &sector_of(s as u8));
        }
        // Slot 0 is the only clean one; everything is unreferenced.
        for slot in cache.slots.iter_mut() {
            slot.accessed = false;
        }
        cache.slots[0].dirty = false;
        cache.read(&mut *dev, 300, &mut buf);
        assert_eq!(cache.index.get(&0), None, "the clean slot is the victim");
    }

    #[test]
    fn evicted_dirty_data_reaches_disk() {
        let mut dev = disk(256);
        let mut cache = BufCache::new();
        for s in 0..CACHE_SIZE as u32 {
            cache.write(&mut *dev, s, &sector_of(0x11));
        }
        let mut buf = [0; SECTOR_SIZE];
        // One more fill forces an eviction of some dirty slot.
        cache.read(&mut *dev, 99, &mut buf);
        let victim = (0..CACHE_SIZE as u32)
            .find(|s| cache.index.get(s).is_none())
            .unwrap();
        let mut raw = [0; SECTOR_SIZE];
        dev.read_sector(victim, &mut raw);
        assert_eq!(raw, sector_of(0x11));
    }
}
