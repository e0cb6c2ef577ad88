//! The filesystem.
//!
//! Three layers, bottom up:
//! * the buffer cache, which owns all sector traffic to the device,
//! * the free-sector map, one bit per sector, persisted at sector 0,
//! * inodes and the index layer, which map byte offsets to data sectors.
//!
//! [`FileSys`] is the facade the rest of the kernel talks to. Every public
//! operation acquires the filesystem-wide mutex at entry and releases it at
//! exit; the buffer cache, the open-inode table, and the free map are only
//! ever touched under that lock. Directory naming lives outside this crate;
//! files are addressed by the sector of their inode. The root-directory
//! inode is created at its reserved sector by `format` and is otherwise an
//! ordinary inode.

pub mod freemap;
pub mod inode;

use alloc::boxed::Box;

use spin::Mutex;

use crate::bio::BufCache;
use crate::block::BlockDevice;
use crate::param::ROOT_DIR_SECTOR;
use crate::{KernelError, Result};

pub use freemap::FreeMap;
pub use inode::{InodeId, Itable};

/// The collaborators an index-layer operation needs, split out of the
/// locked core so the borrow of each piece is explicit.
pub(crate) struct FsCtx<'a> {
    pub dev: &'a mut dyn BlockDevice,
    pub cache: &'a mut BufCache,
    pub freemap: &'a mut FreeMap,
}

struct FsCore {
    dev: Box<dyn BlockDevice>,
    cache: BufCache,
    itable: Itable,
    freemap: FreeMap,
}

impl FsCore {
    fn split(&mut self) -> (FsCtx<'_>, &mut Itable) {
        (
            FsCtx {
                dev: &mut *self.dev,
                cache: &mut self.cache,
                freemap: &mut self.freemap,
            },
            &mut self.itable,
        )
    }

    fn sync_freemap(&mut self) {
        self.freemap.sync(&mut *self.dev);
    }
}

pub struct FileSys {
    inner: Mutex<FsCore>,
}

impl FileSys {
    /// Formats `dev`: a fresh free map at sector 0 and an empty
    /// root-directory inode at sector 1.
    pub fn format(mut dev: Box<dyn BlockDevice>) -> Self {
        let freemap = FreeMap::format(dev.sector_count());
        freemap.sync(&mut *dev);
        let mut core = FsCore {
            dev,
            cache: BufCache::new(),
            itable: Itable::new(),
            freemap,
        };
        let (mut ctx, _) = core.split();
        ctx.inode_create(ROOT_DIR_SECTOR, 0, true)
            .expect("format: root directory creation failed");
        core.sync_freemap();
        Self {
            inner: Mutex::new(core),
        }
    }

    /// Mounts an already-formatted device, reading the free map back from
    /// its reserved sector.
    pub fn mount(mut dev: Box<dyn BlockDevice>) -> Self {
        let freemap = FreeMap::open(&mut *dev);
        Self {
            inner: Mutex::new(FsCore {
                dev,
                cache: BufCache::new(),
                itable: Itable::new(),
                freemap,
            }),
        }
    }

    /// Creates a file of `length` zero bytes, returning the sector of its
    /// new inode.
    pub fn create(&self, length: usize, is_dir: bool) -> Result<u32> {
        let mut core = self.inner.lock();
        let (mut ctx, _) = core.split();
        let sector = ctx.freemap.allocate(1).ok_or(KernelError::NoSpace)?;
        if let Err(e) = ctx.inode_create(sector, length, is_dir) {
            ctx.freemap.release(sector, 1);
            ctx.cache.forget(sector);
            core.sync_freemap();
            return Err(e);
        }
        core.sync_freemap();
        Ok(sector)
    }

    /// Opens the inode at `sector`.
    pub fn open(&self, sector: u32) -> Result<InodeId> {
        let mut core = self.inner.lock();
        let (mut ctx, itable) = core.split();
        itable.open(&mut ctx, sector)
    }

    /// Takes another reference to an open inode.
    pub fn reopen(&self, id: InodeId) -> InodeId {
        self.inner.lock().itable.reopen(id)
    }

    /// Drops a reference; the last close of a removed inode releases its
    /// sectors.
    pub fn close(&self, id: InodeId) {
        let mut core = self.inner.lock();
        let (mut ctx, itable) = core.split();
        itable.close(&mut ctx, id);
        core.sync_freemap();
    }

    /// Marks an open inode for deletion on its last close.
    pub fn remove(&self, id: InodeId) {
        self.inner.lock().itable.remove(id);
    }

    /// Reads into `buf` from byte `offset`; returns the bytes read, short
    /// at end of file.
    pub fn read_at(&self, id: InodeId, buf: &mut [u8], offset: usize) -> usize {
        let mut core = self.inner.lock();
        let (mut ctx, itable) = core.split();
        let sector = itable.sector(id);
        ctx.inode_read_at(sector, buf, offset)
    }

    /// Writes `buf` at byte `offset`, growing the file as needed.
    pub fn write_at(&self, id: InodeId, buf: &[u8], offset: usize) -> Result<usize> {
        let mut core = self.inner.lock();
        let (mut ctx, itable) = core.split();
        if itable.write_denied(id) {
            return Err(KernelError::WriteDenied);
        }
        let sector = itable.sector(id);
        let n = ctx.inode_write_at(sector, buf, offset)?;
        core.sync_freemap();
        Ok(n)
    }

    /// Current file length in bytes.
    pub fn length(&self, id: InodeId) -> usize {
        let mut core = self.inner.lock();
        let (mut ctx, itable) = core.split();
        let sector = itable.sector(id);
        ctx.cache.read_inode(&mut *ctx.dev, sector).length as usize
    }

    pub fn sector_of(&self, id: InodeId) -> u32 {
        self.inner.lock().itable.sector(id)
    }

    /// Blocks writers of an executable image.
    pub fn deny_write(&self, id: InodeId) {
        self.inner.lock().itable.deny_write(id);
    }

    pub fn allow_write(&self, id: InodeId) {
        self.inner.lock().itable.allow_write(id);
    }

    /// Flushes every dirty data sector in the cache.
    pub fn writeback_all(&self) {
        let mut core = self.inner.lock();
        let (ctx, _) = core.split();
        ctx.cache.writeback_all(ctx.dev);
    }

    /// Sectors currently marked used in the free map.
    pub fn used_sectors(&self) -> usize {
        self.inner.lock().freemap.used_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockRole, MemDisk};
    use crate::param::SECTOR_SIZE;

    fn fresh_fs(sectors: u32) -> FileSys {
        FileSys::format(MemDisk::new(BlockRole::Filesys, sectors))
    }

    #[test]
    fn format_reserves_map_and_root() {
        let fs = fresh_fs(512);
        // Sector 0: free map. Sector 1: root inode.
        assert_eq!(fs.used_sectors(), 2);
        let root = fs.open(ROOT_DIR_SECTOR).unwrap();
        assert_eq!(fs.length(root), 0);
        fs.close(root);
    }

    #[test]
    fn create_write_read() {
        let fs = fresh_fs(1024);
        let sector = fs.create(0, false).unwrap();
        let f = fs.open(sector).unwrap();
        assert_eq!(fs.write_at(f, b"hello, disk", 0).unwrap(), 11);
        let mut buf = [0u8; 11];
        assert_eq!(fs.read_at(f, &mut buf, 0), 11);
        assert_eq!(&buf, b"hello, disk");
        assert_eq!(fs.length(f), 11);
        fs.close(f);
    }

    #[test]
    fn remove_frees_sectors_on_last_close() {
        let fs = fresh_fs(1024);
        let base = fs.used_sectors();
        let sector = fs.create(3 * SECTOR_SIZE, false).unwrap();
        let f = fs.open(sector).unwrap();
        let g = fs.reopen(f);
        fs.remove(f);
        fs.close(f);
        assert!(fs.used_sectors() > base, "still open elsewhere");
        fs.close(g);
        assert_eq!(fs.used_sectors(), base);
    }

    #[test]
    fn deny_write_blocks_writers() {
        let fs = fresh_fs(512);
        let sector = fs.create(16, false).unwrap();
        let f = fs.open(sector).unwrap();
        fs.deny_write(f);
        assert_eq!(fs.write_at(f, b"x", 0), Err(KernelError::WriteDenied));
        fs.allow_write(f);
        assert_eq!(fs.write_at(f, b"x", 0).unwrap(), 1);
        fs.close(f);
    }

    /// After `writeback_all`, the raw device matches what the cache says.
    #[test]
    fn writeback_all_reaches_the_device() {
        let fs = fresh_fs(512);
        let sector = fs.create(0, false).unwrap();
        let f = fs.open(sector).unwrap();
        fs.write_at(f, &[0xdb; SECTOR_SIZE], 0).unwrap();
        fs.writeback_all();

        let mut core = fs.inner.lock();
        let (ctx, itable) = core.split();
        let ino = itable.sector(f);
        let rec = ctx.cache.read_inode(ctx.dev, ino);
        let data_sector = rec.direct[0];
        let mut raw = [0u8; SECTOR_SIZE];
        ctx.dev.read_sector(data_sector, &mut raw);
        assert_eq!(raw, [0xdb; SECTOR_SIZE]);
        drop(core);
        fs.close(f);
    }

    #[test]
    fn mount_sees_formatted_state() {
        let fs = FileSys::format(MemDisk::new(BlockRole::Filesys, 256));
        let sector = fs.create(SECTOR_SIZE, false).unwrap();
        let f = fs.open(sector).unwrap();
        fs.write_at(f, &[0x42; SECTOR_SIZE], 0).unwrap();
        fs.writeback_all();
        fs.close(f);

        // Remount the same device and read the file back.
        let FsCore { dev, .. } = fs.inner.into_inner();
        let fs = FileSys::mount(dev);
        let f = fs.open(sector).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(fs.read_at(f, &mut buf, 0), SECTOR_SIZE);
        assert_eq!(buf, [0x42; SECTOR_SIZE]);
        fs.close(f);
    }
}
