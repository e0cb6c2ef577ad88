//! Compile-time parameters of the memory and storage core.

/// Size of one block-device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of one virtual-memory page in bytes.
pub const PGSIZE: usize = 4096;

/// Sectors backing one page.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// Number of slots in the buffer cache.
pub const CACHE_SIZE: usize = 64;

/// Direct sector pointers held by a disk inode.
pub const NDIRECT: usize = 5;

/// Sector numbers held by one indirect sector.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Largest number of data sectors one inode can address.
pub const MAXSECTORS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Maximum number of simultaneously open inodes.
pub const NINODE: usize = 50;

/// Sector reserved for the free-sector map.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector reserved for the root-directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Identifies a sector holding a disk inode ("INOD").
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// First user virtual address that belongs to the kernel.
/// User pages live strictly below this boundary.
pub const PHYS_BASE: usize = 0xc000_0000;
