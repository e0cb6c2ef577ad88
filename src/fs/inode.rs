//! Inodes and the index layer.
//!
//! A disk inode occupies exactly one sector and maps a file onto data
//! sectors through three levels: five direct pointers, one indirect sector
//! of 128 pointers, and one double-indirect sector of pointers to indirect
//! sectors. A pointer of 0 means unallocated; inside the file length such a
//! pointer is a sparse hole that reads as zeros.
//!
//! The cached form of a disk inode is [`InodeRecord`] (the sector minus its
//! zero padding); all record traffic goes through the buffer cache, which
//! writes inode sectors through to disk on every mutation.
//!
//! The in-memory inode lives in the [`Itable`]: one entry per open inode,
//! carrying the open count, the removed flag, and the deny-write count.
//! Opening an already-open sector returns the existing entry; the last close
//! of a removed inode releases every data sector, the indirection sectors,
//! and finally the inode sector itself.
//!
//! Everything here runs under the filesystem-wide lock.

use alloc::vec::Vec;
use core::convert::TryInto;
use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::FsCtx;
use crate::bio::InodeRecord;
use crate::param::{INODE_MAGIC, MAXSECTORS, NDIRECT, NINDIRECT, NINODE, SECTOR_SIZE};
use crate::{KernelError, Result};

/// Magic of an inode whose creation is still in progress. Distinct from
/// both a valid inode and an uninitialized sector, so `open` can tell a
/// half-built inode from garbage.
pub(crate) const INODE_BUILDING: u32 = 0xcccc_cccc;

/// An indirect or double-indirect sector: 128 packed sector numbers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct SectorTable {
    entries: [u32; NINDIRECT],
}

const_assert!(mem::size_of::<SectorTable>() == SECTOR_SIZE);

fn sectors_for(bytes: usize) -> usize {
    (bytes + SECTOR_SIZE - 1) / SECTOR_SIZE
}

fn nonzero(sector: u32) -> Option<u32> {
    if sector == 0 {
        None
    } else {
        Some(sector)
    }
}

impl FsCtx<'_> {
    fn read_table(&mut self, sector: u32) -> SectorTable {
        let mut t = SectorTable::new_zeroed();
        let buf: &mut [u8; SECTOR_SIZE] = t.as_bytes_mut().try_into().expect("table is sector-sized");
        self.cache.read(&mut *self.dev, sector, buf);
        t
    }

    fn write_table(&mut self, sector: u32, t: &SectorTable) {
        let buf: &[u8; SECTOR_SIZE] = t.as_bytes().try_into().expect("table is sector-sized");
        self.cache.write(&mut *self.dev, sector, buf);
    }

    /// Allocates one sector and zero-fills it through the cache.
    fn alloc_zeroed(&mut self, allocated: &mut Vec<u32>) -> Result<u32> {
        let s = self.freemap.allocate(1).ok_or(KernelError::NoSpace)?;
        self.cache.write(&mut *self.dev, s, &[0; SECTOR_SIZE]);
        allocated.push(s);
        Ok(s)
    }

    /// Translates a byte offset into the disk sector holding it. `None` for
    /// offsets past the length and for sparse holes.
    pub(crate) fn byte_to_sector(&mut self, rec: &InodeRecord, pos: usize) -> Option<u32> {
        if pos >= rec.length as usize {
            return None;
        }
        let s = pos / SECTOR_SIZE;
        if s < NDIRECT {
            return nonzero(rec.direct[s]);
        }
        let s = s - NDIRECT;
        if s < NINDIRECT {
            let table = nonzero(rec.indirect)?;
            let t = self.read_table(table);
            return nonzero(t.entries[s]);
        }
        let r = s - NINDIRECT;
        assert!(r < NINDIRECT * NINDIRECT, "inode: offset beyond index reach");
        let outer_sector = nonzero(rec.double_indirect)?;
        let outer = self.read_table(outer_sector);
        let inner_sector = nonzero(outer.entries[r / NINDIRECT])?;
        let inner = self.read_table(inner_sector);
        nonzero(inner.entries[r % NINDIRECT])
    }

    /// Allocates every still-missing sector slot covering the byte range
    /// `[start, end)`, growing the length to `end` if it lies past it, and
    /// writes the inode back.
    ///
    /// Any allocation failure releases every sector this call allocated,
    /// zeroes every pointer it wrote into surviving indirection sectors, and
    /// leaves the inode on disk unchanged. The caller must then discard
    /// `rec` and re-read it.
    pub(crate) fn extend(
        &mut self,
        inode_sector: u32,
        rec: &mut InodeRecord,
        start: usize,
        end: usize,
    ) -> Result<()> {
        if end > MAXSECTORS * SECTOR_SIZE {
            return Err(KernelError::NoSpace);
        }
        let mut allocated = Vec::new();
        let mut table_writes = Vec::new();
        match self.extend_slots(rec, start / SECTOR_SIZE, sectors_for(end), &mut allocated, &mut table_writes) {
            Ok(()) => {
                let grew = end > rec.length as usize;
                if grew {
                    rec.length = end as i32;
                }
                if grew || !allocated.is_empty() {
                    self.cache.write_inode(&mut *self.dev, inode_sector, rec);
                }
                Ok(())
            }
            Err(e) => {
                // Zero the pointers written into indirection sectors that
                // outlive this extension, then give every new sector back.
                for (table, idx) in table_writes {
                    if !allocated.contains(&table) {
                        let mut t = self.read_table(table);
                        t.entries[idx] = 0;
                        self.write_table(table, &t);
                    }
                }
                for s in allocated {
                    self.freemap.release(s, 1);
                    self.cache.forget(s);
                }
                Err(e)
            }
        }
    }

    fn extend_slots(
        &mut self,
        rec: &mut InodeRecord,
        first: usize,
        end: usize,
        allocated: &mut Vec<u32>,
        table_writes: &mut Vec<(u32, usize)>,
    ) -> Result<()> {
        for s in first..end {
            if s < NDIRECT {
                if rec.direct[s] == 0 {
                    rec.direct[s] = self.alloc_zeroed(allocated)?;
                }
                continue;
            }
            let i = s - NDIRECT;
            if i < NINDIRECT {
                if rec.indirect == 0 {
                    rec.indirect = self.alloc_zeroed(allocated)?;
                }
                let mut t = self.read_table(rec.indirect);
                if t.entries[i] == 0 {
                    t.entries[i] = self.alloc_zeroed(allocated)?;
                    self.write_table(rec.indirect, &t);
                    table_writes.push((rec.indirect, i));
                }
                continue;
            }
            let r = i - NINDIRECT;
            if rec.double_indirect == 0 {
                rec.double_indirect = self.alloc_zeroed(allocated)?;
            }
            let mut outer = self.read_table(rec.double_indirect);
            let oi = r / NINDIRECT;
            if outer.entries[oi] == 0 {
                outer.entries[oi] = self.alloc_zeroed(allocated)?;
                self.write_table(rec.double_indirect, &outer);
                table_writes.push((rec.double_indirect, oi));
            }
            let inner_sector = outer.entries[oi];
            let mut inner = self.read_table(inner_sector);
            let ii = r % NINDIRECT;
            if inner.entries[ii] == 0 {
                inner.entries[ii] = self.alloc_zeroed(allocated)?;
                // The refreshed table goes back under its own, freshly
                // assigned sector number.
                self.write_table(inner_sector, &inner);
                table_writes.push((inner_sector, ii));
            }
        }
        Ok(())
    }

    fn release_sector(&mut self, sector: u32) {
        self.freemap.release(sector, 1);
        self.cache.forget(sector);
    }

    /// Releases every data sector and indirection sector of an inode. The
    /// inode's own sector is the caller's to release.
    pub(crate) fn release_all(&mut self, rec: &InodeRecord) {
        for &d in &rec.direct {
            if d != 0 {
                self.release_sector(d);
            }
        }
        if rec.indirect != 0 {
            let t = self.read_table(rec.indirect);
            for &e in &t.entries {
                if e != 0 {
                    self.release_sector(e);
                }
            }
            self.release_sector(rec.indirect);
        }
        if rec.double_indirect != 0 {
            let outer = self.read_table(rec.double_indirect);
            for &inner_sector in &outer.entries {
                if inner_sector == 0 {
                    continue;
                }
                let inner = self.read_table(inner_sector);
                for &e in &inner.entries {
                    if e != 0 {
                        self.release_sector(e);
                    }
                }
                self.release_sector(inner_sector);
            }
            self.release_sector(rec.double_indirect);
        }
    }

    /// Builds a fresh inode at `sector` with `length` bytes of zero-filled
    /// data. The record is published with an in-progress magic first, so a
    /// concurrent open can tell the inode is still being assembled.
    pub(crate) fn inode_create(&mut self, sector: u32, length: usize, is_dir: bool) -> Result<()> {
        let mut rec = InodeRecord::zeroed();
        rec.is_dir = is_dir as u8;
        rec.magic = INODE_BUILDING;
        self.cache.write_inode(&mut *self.dev, sector, &rec);

        rec.magic = INODE_MAGIC;
        if length > 0 {
            if let Err(e) = self.extend(sector, &mut rec, 0, length) {
                self.cache.forget(sector);
                return Err(e);
            }
        } else {
            self.cache.write_inode(&mut *self.dev, sector, &rec);
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read, short when the file ends. Holes read as zeros.
    pub(crate) fn inode_read_at(&mut self, inode_sector: u32, buf: &mut [u8], offset: usize) -> usize {
        let rec = self.cache.read_inode(&mut *self.dev, inode_sector);
        let length = rec.length as usize;
        if offset >= length {
            return 0;
        }
        let n = buf.len().min(length - offset);

        let mut done = 0;
        while done < n {
            let off = offset + done;
            let sector_ofs = off % SECTOR_SIZE;
            let chunk = (n - done).min(SECTOR_SIZE - sector_ofs);
            let dst = &mut buf[done..done + chunk];

            match self.byte_to_sector(&rec, off) {
                None => dst.fill(0),
                Some(sector) if sector_ofs == 0 && chunk == SECTOR_SIZE => {
                    self.cache
                        .read(&mut *self.dev, sector, dst.try_into().unwrap());
                }
                Some(sector) => {
                    let mut bounce = [0; SECTOR_SIZE];
                    self.cache.read(&mut *self.dev, sector, &mut bounce);
                    dst.copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
                }
            }
            done += chunk;
        }
        n
    }

    /// Writes `buf` at `offset`, extending the file when the range reaches
    /// past its length. Either every byte is written or the file is left
    /// untouched.
    pub(crate) fn inode_write_at(&mut self, inode_sector: u32, buf: &[u8], offset: usize) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut rec = self.cache.read_inode(&mut *self.dev, inode_sector);
        self.extend(inode_sector, &mut rec, offset, offset + buf.len())?;

        let mut done = 0;
        while done < buf.len() {
            let off = offset + done;
            let sector_ofs = off % SECTOR_SIZE;
            let chunk = (buf.len() - done).min(SECTOR_SIZE - sector_ofs);
            let src = &buf[done..done + chunk];
            let sector = self
                .byte_to_sector(&rec, off)
                .expect("inode: extended range has no hole");

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                self.cache
                    .write(&mut *self.dev, sector, src.try_into().unwrap());
            } else {
                // Read-modify-write through a bounce buffer for partial
                // sectors.
                let mut bounce = [0; SECTOR_SIZE];
                self.cache.read(&mut *self.dev, sector, &mut bounce);
                bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(src);
                self.cache.write(&mut *self.dev, sector, &bounce);
            }
            done += chunk;
        }
        Ok(buf.len())
    }
}

/// A handle into the open-inode table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InodeId(usize);

#[derive(Clone, Copy)]
struct InodeMeta {
    sector: u32,
    open_cnt: u32,
    removed: bool,
    deny_write_cnt: u32,
}

/// The set of in-memory inodes. One entry per open disk inode; reopening
/// the same sector bumps the entry's count instead of adding another.
pub struct Itable {
    slots: [Option<InodeMeta>; NINODE],
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            slots: [None; NINODE],
        }
    }

    fn get(&self, id: InodeId) -> &InodeMeta {
        self.slots[id.0].as_ref().expect("itable: stale inode id")
    }

    fn get_mut(&mut self, id: InodeId) -> &mut InodeMeta {
        self.slots[id.0].as_mut().expect("itable: stale inode id")
    }

    /// Opens the inode at `sector`, reusing the existing entry when the
    /// inode is already open.
    pub(crate) fn open(&mut self, ctx: &mut FsCtx<'_>, sector: u32) -> Result<InodeId> {
        // Another task may still be assembling this inode; wait for it to
        // publish the finished record. With the filesystem lock held on a
        // single CPU, creation always completes before we can get here, so
        // the loop settles immediately.
        let magic = loop {
            let magic = ctx.cache.with_inode(&mut *ctx.dev, sector, |rec| rec.magic);
            if magic != INODE_BUILDING {
                break magic;
            }
            core::hint::spin_loop();
        };
        if magic != INODE_MAGIC {
            return Err(KernelError::NotFound);
        }

        if let Some(i) = self
            .slots
            .iter()
            .position(|m| matches!(m, Some(m) if m.sector == sector))
        {
            self.slots[i].as_mut().unwrap().open_cnt += 1;
            return Ok(InodeId(i));
        }
        let i = self
            .slots
            .iter()
            .position(|m| m.is_none())
            .expect("itable: out of inode entries");
        self.slots[i] = Some(InodeMeta {
            sector,
            open_cnt: 1,
            removed: false,
            deny_write_cnt: 0,
        });
        Ok(InodeId(i))
    }

    /// Bumps the open count of an already-open inode.
    pub(crate) fn reopen(&mut self, id: InodeId) -> InodeId {
        self.get_mut(id).open_cnt += 1;
        id
    }

    /// Drops one reference. On the last close of a removed inode, releases
    /// all of its sectors and the inode sector itself.
    pub(crate) fn close(&mut self, ctx: &mut FsCtx<'_>, id: InodeId) {
        let meta = self.get_mut(id);
        assert!(meta.open_cnt > 0);
        meta.open_cnt -= 1;
        if meta.open_cnt > 0 {
            return;
        }
        let meta = self.slots[id.0].take().unwrap();
        if meta.removed {
            let rec = ctx.cache.read_inode(&mut *ctx.dev, meta.sector);
            ctx.release_all(&rec);
            ctx.cache.forget(meta.sector);
            ctx.freemap.release(meta.sector, 1);
        }
    }

    /// Marks the inode for deletion on its last close.
    pub(crate) fn remove(&mut self, id: InodeId) {
        self.get_mut(id).removed = true;
    }

    pub(crate) fn sector(&self, id: InodeId) -> u32 {
        self.get(id).sector
    }

    pub(crate) fn deny_write(&mut self, id: InodeId) {
        let meta = self.get_mut(id);
        meta.deny_write_cnt += 1;
        assert!(meta.deny_write_cnt <= meta.open_cnt);
    }

    pub(crate) fn allow_write(&mut self, id: InodeId) {
        let meta = self.get_mut(id);
        assert!(meta.deny_write_cnt > 0);
        assert!(meta.deny_write_cnt <= meta.open_cnt);
        meta.deny_write_cnt -= 1;
    }

    pub(crate) fn write_denied(&self, id: InodeId) -> bool {
        self.get(id).deny_write_cnt > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::BufCache;
    use crate::block::{BlockRole, MemDisk};
    use crate::fs::freemap::FreeMap;

    struct Fixture {
        dev: alloc::boxed::Box<MemDisk>,
        cache: BufCache,
        freemap: FreeMap,
    }

    impl Fixture {
        fn new(sectors: u32) -> Self {
            Self {
                dev: MemDisk::new(BlockRole::Filesys, sectors),
                cache: BufCache::new(),
                freemap: FreeMap::format(sectors),
            }
        }

        fn ctx(&mut self) -> FsCtx<'_> {
            FsCtx {
                dev: &mut *self.dev,
                cache: &mut self.cache,
                freemap: &mut self.freemap,
            }
        }
    }

    /// Allocates an inode sector and builds an inode there.
    fn create(ctx: &mut FsCtx<'_>, length: usize) -> u32 {
        let sector = ctx.freemap.allocate(1).unwrap();
        ctx.inode_create(sector, length, false).unwrap();
        sector
    }

    fn leaves_of(ctx: &mut FsCtx<'_>, rec: &InodeRecord) -> usize {
        let mut n = rec.direct.iter().filter(|&&d| d != 0).count();
        if rec.indirect != 0 {
            let t = ctx.read_table(rec.indirect);
            n += t.entries.iter().filter(|&&e| e != 0).count();
        }
        if rec.double_indirect != 0 {
            let outer = ctx.read_table(rec.double_indirect);
            for i in 0..NINDIRECT {
                if outer.entries[i] != 0 {
                    let inner = ctx.read_table(outer.entries[i]);
                    n += inner.entries.iter().filter(|&&e| e != 0).count();
                }
            }
        }
        n
    }

    /// Boundary scenario: sequential growth across the direct/indirect
    /// boundary.
    #[test]
    fn growth_across_direct_indirect_boundary() {
        let mut fx = Fixture::new(1024);
        let mut ctx = fx.ctx();
        let ino = create(&mut ctx, 0);

        let data = [0xaa; SECTOR_SIZE];
        for i in 0..NDIRECT {
            assert_eq!(
                ctx.inode_write_at(ino, &data, i * SECTOR_SIZE).unwrap(),
                SECTOR_SIZE
            );
        }
        let rec = ctx.cache.read_inode(&mut *ctx.dev, ino);
        assert!(rec.direct.iter().all(|&d| d != 0));
        assert_eq!(rec.indirect, 0);

        ctx.inode_write_at(ino, &data, NDIRECT * SECTOR_SIZE).unwrap();
        let rec = ctx.cache.read_inode(&mut *ctx.dev, ino);
        assert_ne!(rec.indirect, 0);
        let t = ctx.read_table(rec.indirect);
        assert_ne!(t.entries[0], 0);
        assert!(t.entries[1..].iter().all(|&e| e == 0));
        assert_eq!(rec.length, 6 * SECTOR_SIZE as i32);
        assert_eq!(rec.length as usize, leaves_of(&mut ctx, &rec) * SECTOR_SIZE);
    }

    /// Boundary scenario: one byte written far past the end lands in a
    /// double-indirect leaf; every untouched pointer stays 0.
    #[test]
    fn double_indirect_leaf() {
        let mut fx = Fixture::new(1024);
        let mut ctx = fx.ctx();
        let ino = create(&mut ctx, 0);

        let offset = (NDIRECT + NINDIRECT + 2) * SECTOR_SIZE;
        ctx.inode_write_at(ino, &[0x41], offset).unwrap();

        let rec = ctx.cache.read_inode(&mut *ctx.dev, ino);
        assert!(rec.direct.iter().all(|&d| d == 0));
        assert_eq!(rec.indirect, 0);
        assert_ne!(rec.double_indirect, 0);
        let outer = ctx.read_table(rec.double_indirect);
        assert_ne!(outer.entries[0], 0);
        assert!(outer.entries[1..].iter().all(|&e| e == 0));
        let inner = ctx.read_table(outer.entries[0]);
        assert_ne!(inner.entries[2], 0);
        for (i, &e) in inner.entries.iter().enumerate() {
            if i != 2 {
                assert_eq!(e, 0);
            }
        }
        assert_eq!(rec.length as usize, offset + 1);

        // The hole before the leaf reads as zeros; the byte reads back.
        let mut buf = [0xff; 8];
        assert_eq!(ctx.inode_read_at(ino, &mut buf, 0), 8);
        assert_eq!(buf, [0; 8]);
        let mut one = [0u8; 1];
        assert_eq!(ctx.inode_read_at(ino, &mut one, offset), 1);
        assert_eq!(one[0], 0x41);
    }

    /// Round-trip law: write then read of any byte range returns the bytes
    /// written.
    #[test]
    fn write_read_round_trip() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1234);

        let mut fx = Fixture::new(2048);
        let mut ctx = fx.ctx();
        let ino = create(&mut ctx, 0);

        let mut data = alloc::vec![0u8; 3 * SECTOR_SIZE + 100];
        rng.fill(&mut data[..]);
        // Unaligned offset forces the bounce path on both ends.
        ctx.inode_write_at(ino, &data, 37).unwrap();

        let mut back = alloc::vec![0u8; data.len()];
        assert_eq!(ctx.inode_read_at(ino, &mut back, 37), data.len());
        assert_eq!(back, data);

        // Overwrite a slice in the middle.
        ctx.inode_write_at(ino, &[0x5a; 200], 600).unwrap();
        let mut mid = [0u8; 200];
        ctx.inode_read_at(ino, &mut mid, 600);
        assert_eq!(mid, [0x5a; 200]);
    }

    #[test]
    fn eager_create_allocates_every_sector() {
        let mut fx = Fixture::new(1024);
        let mut ctx = fx.ctx();
        let ino = create(&mut ctx, 7 * SECTOR_SIZE + 9);
        let rec = ctx.cache.read_inode(&mut *ctx.dev, ino);
        assert_eq!(rec.length as usize, 7 * SECTOR_SIZE + 9);
        assert_eq!(leaves_of(&mut ctx, &rec), 8);
        // Reading the zero-filled tail works.
        let mut buf = [0xffu8; 16];
        assert_eq!(ctx.inode_read_at(ino, &mut buf, 7 * SECTOR_SIZE), 9);
        assert_eq!(&buf[..9], &[0; 9]);
    }

    /// A failed extension rolls everything back: the free map, the
    /// indirection tables, and the on-disk inode.
    #[test]
    fn failed_extension_rolls_back() {
        // Small disk: room for the inode and a few sectors, not for 200.
        let mut fx = Fixture::new(64);
        let mut ctx = fx.ctx();
        let ino = create(&mut ctx, 2 * SECTOR_SIZE);
        let used_before = ctx.freemap.used_count();
        let disk_rec = ctx.cache.read_inode(&mut *ctx.dev, ino);

        let mut rec = disk_rec;
        let err = ctx.extend(ino, &mut rec, 0, 200 * SECTOR_SIZE).unwrap_err();
        assert_eq!(err, KernelError::NoSpace);
        assert_eq!(ctx.freemap.used_count(), used_before);

        let after = ctx.cache.read_inode(&mut *ctx.dev, ino);
        assert_eq!(after.length, disk_rec.length);
        assert_eq!(after.direct, disk_rec.direct);
        assert_eq!(after.indirect, disk_rec.indirect);
        // No dangling pointers survive anywhere reachable.
        assert_eq!(leaves_of(&mut ctx, &after), 2);
    }

    #[test]
    fn release_restores_free_map() {
        let mut fx = Fixture::new(2048);
        let mut ctx = fx.ctx();
        let used_before = ctx.freemap.used_count();

        let sector = ctx.freemap.allocate(1).unwrap();
        ctx.inode_create(sector, 0, false).unwrap();
        // Touch all three levels.
        ctx.inode_write_at(sector, &[1; SECTOR_SIZE], 0).unwrap();
        ctx.inode_write_at(sector, &[2; SECTOR_SIZE], (NDIRECT + 3) * SECTOR_SIZE)
            .unwrap();
        ctx.inode_write_at(sector, &[3], (NDIRECT + NINDIRECT + 1) * SECTOR_SIZE)
            .unwrap();
        assert!(ctx.freemap.used_count() > used_before);

        let rec = ctx.cache.read_inode(&mut *ctx.dev, sector);
        ctx.release_all(&rec);
        ctx.cache.forget(sector);
        ctx.freemap.release(sector, 1);
        assert_eq!(ctx.freemap.used_count(), used_before);
    }

    #[test]
    fn itable_open_close_lifecycle() {
        let mut fx = Fixture::new(1024);
        let mut itable = Itable::new();
        let mut ctx = fx.ctx();
        let ino = create(&mut ctx, SECTOR_SIZE);

        let a = itable.open(&mut ctx, ino).unwrap();
        let b = itable.open(&mut ctx, ino).unwrap();
        assert_eq!(a, b, "same sector, same entry");
        assert_eq!(itable.get(a).open_cnt, 2);

        itable.deny_write(a);
        assert!(itable.write_denied(a));
        itable.allow_write(a);
        assert!(!itable.write_denied(a));

        let used = ctx.freemap.used_count();
        itable.remove(a);
        itable.close(&mut ctx, a);
        // Still open once; nothing released yet.
        assert_eq!(ctx.freemap.used_count(), used);
        itable.close(&mut ctx, b);
        // Data sector and inode sector both returned.
        assert_eq!(ctx.freemap.used_count(), used - 2);
    }

    #[test]
    fn open_rejects_garbage() {
        let mut fx = Fixture::new(64);
        let mut itable = Itable::new();
        let mut ctx = fx.ctx();
        assert_eq!(itable.open(&mut ctx, 30), Err(KernelError::NotFound));
    }
}
