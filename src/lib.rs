//! minos: the memory and storage core of an instructional x86 kernel.
//!
//! Three tightly coupled subsystems:
//! * demand-paged virtual memory: per-process supplemental page tables over
//!   a shared frame pool, with clock page replacement, a swap area, and
//!   memory-mapped files ([`vm`], [`frame`], [`swap`]);
//! * a fixed-size write-back buffer cache between the filesystem and the
//!   block device, caching both file data and packed inode metadata
//!   ([`bio`]);
//! * indexed on-disk inodes with direct, indirect, and double-indirect
//!   sector trees that grow on demand ([`fs`]).
//!
//! The thread scheduler, interrupt dispatch, ELF loading, the directory
//! layer, and the device drivers live outside this crate; they interact
//! through the [`kernel::Kernel`] aggregate, the [`block::BlockDevice`]
//! trait, and plain process ids.

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]
#![warn(unused_qualifications)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(trivial_numeric_casts)]
#![deny(macro_use_extern_crate)]

extern crate alloc;

pub mod addr;
pub mod bio;
pub mod bitmap;
pub mod block;
pub mod file;
pub mod frame;
pub mod fs;
pub mod kalloc;
pub mod kernel;
pub mod page;
pub mod pagedir;
pub mod param;
pub mod swap;
pub mod vm;

pub use addr::UVAddr;
pub use block::{BlockDevice, BlockRole, MemDisk};
pub use file::File;
pub use fs::FileSys;
pub use kernel::Kernel;
pub use vm::{MapId, Pid, Role};

/// Why a memory or storage operation could not complete.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KernelError {
    /// The free-sector map has no room for the request.
    NoSpace,
    /// Every swap slot is in use.
    NoSwap,
    /// No inode lives where one was expected.
    NotFound,
    /// A user access that must kill the process (exit status −1).
    BadAccess,
    /// The inode currently denies writes.
    WriteDenied,
    /// A malformed request, such as an unaligned or overlapping mapping.
    InvalidArgument,
}

pub type Result<T> = core::result::Result<T, KernelError>;
