//! # allocator
//! The redzone manager sits between the users of the heap and the platform's
//! heap allocator. Every block requested from the allocator is enlarged by a
//! head redzone and a tail redzone:
//!
//! ```text
//! header                 user                   user + aligned
//! | aligned | head rz ... | user data (len) | pad | tail rz ... |
//! |<------- head -------->|<----- aligned ------>|<-- tail --->|
//! ```
//!
//! The first word of the head redzone holds the aligned user size, so the
//! header of a user pointer is always found exactly `head` bytes below it.
//! Freed blocks have their user region poisoned so that any later access is
//! reported as a use-after-free.
//!
//! Only the allocator can make an operation fail. A block whose shadow can't
//! be written, because it lies outside the shadow memory, is handed out
//! untracked.
use core::fmt::Debug;

use log::debug;
use thiserror::Error;

use crate::{
    GuestAddr, KASAN_SHADOW_MASK,
    config::KasanConfig,
    shadow::{GuestShadow, PoisonType, memory::ShadowMemory},
};

pub mod backend;

/// The platform's heap allocator.
///
/// # Safety
/// A successful `allocate` or `reallocate` must return the address of at
/// least `len` writable bytes, aligned to at least the head redzone size, and
/// owned by the caller until passed to `free` or `reallocate`. `reallocate`
/// must preserve the contents of the block up to the smaller of the old and
/// new lengths.
pub unsafe trait HeapAllocator: Debug {
    type Error: Debug;
    fn allocate(&mut self, len: usize) -> Result<GuestAddr, Self::Error>;
    fn reallocate(&mut self, header: GuestAddr, len: usize) -> Result<GuestAddr, Self::Error>;
    fn free(&mut self, header: GuestAddr) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize {
    /// The user length rounded up to the shadow granule
    pub aligned: usize,
    /// The length requested from the allocator including both redzones
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRedzones {
    head: usize,
    tail: usize,
}

impl HeapRedzones {
    /// The sizes are expected to be validated by `KasanConfig::validate`.
    pub const fn new(head: usize, tail: usize) -> HeapRedzones {
        HeapRedzones { head, tail }
    }

    pub const fn from_config(config: &KasanConfig) -> HeapRedzones {
        HeapRedzones::new(config.head_redzone_size, config.tail_redzone_size)
    }

    pub const fn head(&self) -> usize {
        self.head
    }

    pub const fn tail(&self) -> usize {
        self.tail
    }

    pub fn block_size<A: HeapAllocator>(&self, len: usize) -> Result<BlockSize, HeapError<A>> {
        let aligned = len
            .checked_add(KASAN_SHADOW_MASK)
            .map(|n| n & !KASAN_SHADOW_MASK)
            .ok_or(HeapError::SizeOverflow(len))?;
        let total = aligned
            .checked_add(self.head)
            .and_then(|n| n.checked_add(self.tail))
            .ok_or(HeapError::SizeOverflow(len))?;
        Ok(BlockSize { aligned, total })
    }

    pub fn header_of(&self, user: GuestAddr) -> Option<GuestAddr> {
        user.checked_sub(self.head)
    }

    pub fn user_of(&self, header: GuestAddr) -> GuestAddr {
        header + self.head
    }

    /// # Safety
    /// `header` must be the header of a live block handed out by this manager.
    pub unsafe fn aligned_size(&self, header: GuestAddr) -> usize {
        unsafe { (header as *const usize).read_unaligned() }
    }

    pub fn allocate<A: HeapAllocator, M: ShadowMemory>(
        &self,
        allocator: &mut A,
        shadow: Option<&GuestShadow<M>>,
        len: usize,
    ) -> Result<GuestAddr, HeapError<A>> {
        debug!("alloc - len: {len:#x}");
        let size = self.block_size::<A>(len)?;
        let header = allocator
            .allocate(size.total)
            .map_err(HeapError::AllocatorError)?;
        Ok(unsafe { self.on_allocated(shadow, header, len, size.aligned) })
    }

    /// # Safety
    /// `user` must be null or a pointer returned by `allocate` or `reallocate`
    /// which has not been freed since.
    pub unsafe fn free<A: HeapAllocator, M: ShadowMemory>(
        &self,
        allocator: &mut A,
        shadow: Option<&GuestShadow<M>>,
        user: GuestAddr,
    ) -> Result<(), HeapError<A>> {
        debug!("free - user: {user:#x}");
        if user == 0 {
            return Ok(());
        }
        let header = self
            .header_of(user)
            .ok_or(HeapError::InvalidAddress(user))?;
        let aligned = unsafe { self.aligned_size(header) };
        allocator
            .free(header)
            .map_err(HeapError::AllocatorError)?;
        if let Some(Err(e)) = shadow.map(|s| s.poison(user, aligned, PoisonType::AsanHeapFreed)) {
            debug!("free - user: {user:#x}, untracked: {e:?}");
        }
        Ok(())
    }

    /// The old user region is poisoned as freed before the allocator is
    /// asked to resize the block, and stays that way if the allocator fails.
    /// A size which can't be satisfied is rejected before the old block is
    /// touched.
    ///
    /// # Safety
    /// `user` must be null or a pointer returned by `allocate` or `reallocate`
    /// which has not been freed since.
    pub unsafe fn reallocate<A: HeapAllocator, M: ShadowMemory>(
        &self,
        allocator: &mut A,
        shadow: Option<&GuestShadow<M>>,
        user: GuestAddr,
        len: usize,
    ) -> Result<GuestAddr, HeapError<A>> {
        debug!("realloc - user: {user:#x}, len: {len:#x}");
        if user == 0 {
            return self.allocate(allocator, shadow, len);
        }
        let header = self
            .header_of(user)
            .ok_or(HeapError::InvalidAddress(user))?;
        let size = self.block_size::<A>(len)?;
        let old_aligned = unsafe { self.aligned_size(header) };
        if let Some(Err(e)) =
            shadow.map(|s| s.poison(user, old_aligned, PoisonType::AsanHeapFreed))
        {
            debug!("realloc - user: {user:#x}, untracked: {e:?}");
        }
        let header = allocator
            .reallocate(header, size.total)
            .map_err(HeapError::AllocatorError)?;
        Ok(unsafe { self.on_allocated(shadow, header, len, size.aligned) })
    }

    /// Writes the header and the redzones of a block the allocator has just
    /// handed out. The block is returned even if its shadow can't be written.
    unsafe fn on_allocated<M: ShadowMemory>(
        &self,
        shadow: Option<&GuestShadow<M>>,
        header: GuestAddr,
        len: usize,
        aligned: usize,
    ) -> GuestAddr {
        unsafe { (header as *mut usize).write_unaligned(aligned) };
        let user = self.user_of(header);
        debug!("alloc - header: {header:#x}, user: {user:#x}, aligned: {aligned:#x}");
        if let Some(shadow) = shadow {
            let result = shadow
                .unpoison(user, len)
                .and_then(|()| shadow.poison(header, self.head, PoisonType::AsanHeapLeftRz))
                .and_then(|()| {
                    shadow.poison(user + aligned, self.tail, PoisonType::AsanHeapRightRz)
                });
            if let Err(e) = result {
                debug!("alloc - user: {user:#x}, untracked: {e:?}");
            }
        }
        user
    }
}

impl Default for HeapRedzones {
    fn default() -> Self {
        HeapRedzones::from_config(&KasanConfig::default())
    }
}

#[derive(Error, Debug)]
pub enum HeapError<A: HeapAllocator> {
    #[error("Allocator error: {0:?}")]
    AllocatorError(A::Error),
    #[error("Size overflow: {0:#x}")]
    SizeOverflow(usize),
    #[error("Invalid address: {0:#x}")]
    InvalidAddress(GuestAddr),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NoAllocator;

    unsafe impl HeapAllocator for NoAllocator {
        type Error = ();

        fn allocate(&mut self, _len: usize) -> Result<GuestAddr, Self::Error> {
            Err(())
        }

        fn reallocate(&mut self, _header: GuestAddr, _len: usize) -> Result<GuestAddr, Self::Error> {
            Err(())
        }

        fn free(&mut self, _header: GuestAddr) -> Result<(), Self::Error> {
            Err(())
        }
    }

    #[test]
    fn test_block_size() {
        let rz = HeapRedzones::new(64, 32);
        assert_eq!(
            rz.block_size::<NoAllocator>(10).unwrap(),
            BlockSize {
                aligned: 16,
                total: 112
            }
        );
        assert_eq!(
            rz.block_size::<NoAllocator>(16).unwrap(),
            BlockSize {
                aligned: 16,
                total: 112
            }
        );
        assert_eq!(
            rz.block_size::<NoAllocator>(0).unwrap(),
            BlockSize {
                aligned: 0,
                total: 96
            }
        );
    }

    #[test]
    fn test_block_size_overflow() {
        let rz = HeapRedzones::new(64, 32);
        assert!(matches!(
            rz.block_size::<NoAllocator>(usize::MAX - 3),
            Err(HeapError::SizeOverflow(_))
        ));
        assert!(matches!(
            rz.block_size::<NoAllocator>(usize::MAX - 80),
            Err(HeapError::SizeOverflow(_))
        ));
    }

    #[test]
    fn test_header_round_trip() {
        let rz = HeapRedzones::default();
        assert_eq!(rz.header_of(rz.user_of(0x1000)), Some(0x1000));
        assert_eq!(rz.header_of(0x20), None);
    }

    #[test]
    fn test_allocator_failure() {
        let rz = HeapRedzones::default();
        let result = rz.allocate::<_, &crate::shadow::memory::RawShadowMemory>(
            &mut NoAllocator,
            None,
            10,
        );
        assert!(matches!(result, Err(HeapError::AllocatorError(()))));
    }
}
