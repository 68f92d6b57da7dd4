//! # layout
//! The platform's memory map, as far as the sanitizer is concerned. The
//! layout is queried exactly once during initialization and the resulting
//! `MemoryBoundaries` are immutable afterwards.
//!
//! ```text
//! 0                low_memory_end     high_memory_start      high_memory_end
//! | low memory ... |  peripherals/GPU  | high memory (heap) ... | untracked
//!        [shadow_start, shadow_start + shadow_region_size) lies in low memory
//! ```
use crate::GuestAddr;

/// Start of high memory on the original platform, which maps its peripheral
/// and GPU window directly below it.
pub const GIGABYTE: GuestAddr = 0x4000_0000;

pub trait MemoryLayout {
    fn shadow_start(&self) -> GuestAddr;
    fn shadow_region_size(&self) -> usize;

    /// The constant added to `addr >> KASAN_SHADOW_SHIFT` to find the shadow
    /// byte of `addr`. When the shadow map covers memory from address zero
    /// this is simply the start of the shadow region.
    fn shadow_offset(&self) -> GuestAddr {
        self.shadow_start()
    }

    fn low_memory_end(&self) -> GuestAddr;

    fn high_memory_start(&self) -> GuestAddr {
        GIGABYTE
    }

    fn high_memory_end(&self) -> GuestAddr;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBoundaries {
    pub shadow_start: GuestAddr,
    pub shadow_end: GuestAddr,
    pub low_memory_end: GuestAddr,
    pub high_memory_start: GuestAddr,
    pub high_memory_end: GuestAddr,
}

impl MemoryBoundaries {
    pub fn from_layout<L: MemoryLayout + ?Sized>(layout: &L) -> MemoryBoundaries {
        let shadow_start = layout.shadow_start();
        MemoryBoundaries {
            shadow_start,
            shadow_end: shadow_start.saturating_add(layout.shadow_region_size()),
            low_memory_end: layout.low_memory_end(),
            high_memory_start: layout.high_memory_start(),
            high_memory_end: layout.high_memory_end(),
        }
    }

    pub fn shadow_size(&self) -> usize {
        self.shadow_end - self.shadow_start
    }

    /// Whether the inclusive range `[start, last]` lies in a window which is
    /// never instrumented: the shadow region itself, the peripheral window
    /// between low and high memory, or anything behind the end of the high
    /// memory heap.
    pub fn is_trusted(&self, start: GuestAddr, last: GuestAddr) -> bool {
        (self.shadow_start <= start && last < self.shadow_end)
            || (self.low_memory_end <= start && last < self.high_memory_start)
            || self.high_memory_end <= last
    }
}
