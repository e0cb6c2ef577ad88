//! The page type.

use core::ops::{Deref, DerefMut};

use crate::param::PGSIZE;

/// One page of memory, aligned the way the MMU expects.
#[repr(align(4096))]
pub struct Page {
    inner: [u8; PGSIZE],
}

impl Page {
    pub const DEFAULT: Self = Self { inner: [0; PGSIZE] };

    /// Overwrites the whole page with zeros.
    pub fn clear(&mut self) {
        self.inner.fill(0);
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
