//! # memory
//! Backing storage for the shadow map. On the target the shadow map is a
//! fixed window of RAM reserved by the platform's memory map
//! (`RawShadowMemory`). For hosted use, an `ArenaMemory` owns a single heap
//! allocation laid out like the target: real memory first, followed by the
//! shadow region describing the whole arena, including itself.
//!
//! Shadow bytes are exposed as `AtomicU8` so that they can be updated through
//! a shared reference by an interrupt handler and by foreground code alike.
//! Each byte is written individually, a range is never updated atomically.
use core::sync::atomic::AtomicU8;

use crate::GuestAddr;

pub trait ShadowMemory {
    /// Address of the first shadow byte
    fn base(&self) -> GuestAddr;
    fn bytes(&self) -> &[AtomicU8];

    fn len(&self) -> usize {
        self.bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

impl<M: ShadowMemory + ?Sized> ShadowMemory for &M {
    fn base(&self) -> GuestAddr {
        (**self).base()
    }

    fn bytes(&self) -> &[AtomicU8] {
        (**self).bytes()
    }
}

#[derive(Debug)]
pub struct RawShadowMemory {
    base: GuestAddr,
    bytes: &'static [AtomicU8],
}

impl ShadowMemory for RawShadowMemory {
    fn base(&self) -> GuestAddr {
        self.base
    }

    fn bytes(&self) -> &[AtomicU8] {
        self.bytes
    }
}

impl RawShadowMemory {
    /// # Safety
    /// `[base, base + len)` must be mapped RAM reserved for the shadow map for
    /// the remainder of the program, and must not be accessed other than
    /// through this `RawShadowMemory` and uninstrumented code.
    pub unsafe fn new(base: GuestAddr, len: usize) -> RawShadowMemory {
        let bytes = unsafe { core::slice::from_raw_parts(base as *const AtomicU8, len) };
        RawShadowMemory { base, bytes }
    }
}

#[cfg(feature = "arena")]
pub use arena::{ArenaError, ArenaMemory};

#[cfg(feature = "arena")]
mod arena {
    use alloc::alloc::{Layout, alloc_zeroed, dealloc};
    use core::{ptr::NonNull, slice::from_raw_parts, sync::atomic::AtomicU8};

    use log::debug;
    use thiserror::Error;

    use super::ShadowMemory;
    use crate::{
        GuestAddr, KASAN_SHADOW_GRANULE_SIZE, layout::MemoryLayout,
        shadow::translate::ShadowTranslator,
    };

    #[derive(Debug)]
    pub struct ArenaMemory {
        ptr: NonNull<u8>,
        len: usize,
    }

    // The arena is only ever accessed through raw addresses and atomics.
    unsafe impl Send for ArenaMemory {}
    unsafe impl Sync for ArenaMemory {}

    impl ArenaMemory {
        pub const ALIGN: usize = 4096;
        /// Smallest length for which the shadow region is itself a whole
        /// number of granules.
        pub const LEN_GRANULE: usize = KASAN_SHADOW_GRANULE_SIZE * KASAN_SHADOW_GRANULE_SIZE;

        pub fn new(len: usize) -> Result<ArenaMemory, ArenaError> {
            if len == 0 || len % Self::LEN_GRANULE != 0 {
                Err(ArenaError::InvalidLength(len))?;
            }
            let layout =
                Layout::from_size_align(len, Self::ALIGN).map_err(|_| ArenaError::InvalidLength(len))?;
            let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
                .ok_or(ArenaError::AllocationFailed(len))?;
            let arena = ArenaMemory { ptr, len };
            debug!(
                "arena - base: {:#x}, len: {:#x}, shadow: {:#x}",
                arena.start(),
                len,
                arena.shadow_start()
            );
            Ok(arena)
        }

        pub fn start(&self) -> GuestAddr {
            self.ptr.as_ptr() as GuestAddr
        }

        pub fn end(&self) -> GuestAddr {
            self.start() + self.len
        }

        /// Number of bytes at the start of the arena usable as real memory
        pub fn real_len(&self) -> usize {
            self.len - self.shadow_len()
        }

        pub fn shadow_start(&self) -> GuestAddr {
            self.start() + self.real_len()
        }

        pub fn shadow_len(&self) -> usize {
            self.len / KASAN_SHADOW_GRANULE_SIZE
        }

        pub fn translator(&self) -> ShadowTranslator {
            ShadowTranslator::new(self.shadow_offset())
        }
    }

    impl ShadowMemory for ArenaMemory {
        fn base(&self) -> GuestAddr {
            self.shadow_start()
        }

        fn bytes(&self) -> &[AtomicU8] {
            unsafe { from_raw_parts(self.shadow_start() as *const AtomicU8, self.shadow_len()) }
        }
    }

    /// The arena has no peripheral window, and everything from its end onwards
    /// is treated as lying behind the high memory boundary.
    impl MemoryLayout for ArenaMemory {
        fn shadow_start(&self) -> GuestAddr {
            ArenaMemory::shadow_start(self)
        }

        fn shadow_region_size(&self) -> usize {
            self.shadow_len()
        }

        fn shadow_offset(&self) -> GuestAddr {
            self.shadow_start()
                .wrapping_sub(self.start() >> crate::KASAN_SHADOW_SHIFT)
        }

        fn low_memory_end(&self) -> GuestAddr {
            self.end()
        }

        fn high_memory_start(&self) -> GuestAddr {
            self.end()
        }

        fn high_memory_end(&self) -> GuestAddr {
            self.end()
        }
    }

    impl Drop for ArenaMemory {
        fn drop(&mut self) {
            // `new` already validated this layout
            if let Ok(layout) = Layout::from_size_align(self.len, Self::ALIGN) {
                unsafe { dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }

    #[derive(Error, Debug, PartialEq)]
    pub enum ArenaError {
        #[error("Invalid arena length: {0:#x}")]
        InvalidLength(usize),
        #[error("Failed to allocate arena of length: {0:#x}")]
        AllocationFailed(usize),
    }
}
