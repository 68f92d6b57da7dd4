//! # shadow
//! The shadow map records, for every 8-byte granule of real memory, how much
//! of that granule may be accessed. A value of zero marks the granule as
//! fully accessible, a value `k` in `1..=7` marks only the first `k` bytes as
//! accessible, and the remaining values are magic numbers identifying the
//! kind of redzone the granule belongs to (see `PoisonType`).
//!
//! `GuestShadow` combines a `ShadowTranslator` with the `ShadowMemory` backing
//! the map and implements the poison and unpoison primitives on top of them.
//! Any shadow byte which falls outside of the backing memory is rejected with
//! an error rather than written.
use core::sync::atomic::Ordering;

use log::debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::{
    GuestAddr, KASAN_SHADOW_MASK,
    shadow::{memory::ShadowMemory, translate::ShadowTranslator},
};

pub mod memory;
pub mod translate;

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoisonType {
    AsanValid = 0x00,
    AsanStackLeftRz = 0xf1,
    AsanStackMidRz = 0xf2,
    AsanStackRightRz = 0xf3,
    AsanStackAfterReturn = 0xf5,
    AsanStackUseAfterScope = 0xf8,
    AsanGlobalRz = 0xf9,
    AsanHeapLeftRz = 0xfa,
    AsanHeapRightRz = 0xfb,
    AsanHeapFreed = 0xfd,
    AsanReserved = 0xff,
}

#[derive(Debug)]
pub struct GuestShadow<M: ShadowMemory> {
    memory: M,
    translator: ShadowTranslator,
}

impl<M: ShadowMemory> GuestShadow<M> {
    pub fn new(memory: M, translator: ShadowTranslator) -> GuestShadow<M> {
        GuestShadow { memory, translator }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn translator(&self) -> &ShadowTranslator {
        &self.translator
    }

    #[inline]
    pub fn to_shadow(&self, addr: GuestAddr) -> GuestAddr {
        self.translator.to_shadow(addr)
    }

    #[inline]
    pub fn to_real(&self, shadow: GuestAddr) -> GuestAddr {
        self.translator.to_real(shadow)
    }

    /// Reads the shadow byte at the shadow address `shadow`, returning `None`
    /// if the address is not backed by the shadow memory.
    #[inline]
    pub fn load_shadow(&self, shadow: GuestAddr) -> Option<u8> {
        let idx = shadow.checked_sub(self.memory.base())?;
        self.memory
            .bytes()
            .get(idx)
            .map(|b| b.load(Ordering::Relaxed))
    }

    pub fn store_shadow(&self, shadow: GuestAddr, value: u8) -> Result<(), ShadowError> {
        self.set_raw(shadow, 1, value)
    }

    /// Writes `value` into `len` consecutive shadow bytes starting at the
    /// shadow address `shadow`. Nothing is written unless the whole range is
    /// backed by the shadow memory.
    pub fn set_raw(&self, shadow: GuestAddr, len: usize, value: u8) -> Result<(), ShadowError> {
        if len == 0 {
            return Ok(());
        }
        let bytes = self.memory.bytes();
        let start = shadow
            .checked_sub(self.memory.base())
            .ok_or(ShadowError::InvalidShadowAddress(shadow))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or(ShadowError::InvalidShadowRange(shadow, len))?;
        bytes[start..end]
            .iter()
            .for_each(|b| b.store(value, Ordering::Relaxed));
        Ok(())
    }

    /// Fills the entire shadow memory with `value`.
    pub fn fill(&self, value: u8) {
        self.memory
            .bytes()
            .iter()
            .for_each(|b| b.store(value, Ordering::Relaxed));
    }

    /// Both `start` and `len` should be multiples of the granule size. If they
    /// are not, the shadow bytes of the partially covered granules are
    /// overwritten too.
    pub fn poison(&self, start: GuestAddr, len: usize, val: PoisonType) -> Result<(), ShadowError> {
        debug!("poison - start: {start:#x}, len: {len:#x}, poison: {val:?}");
        debug_assert!(ShadowTranslator::is_aligned(start) && ShadowTranslator::is_aligned(len));
        self.fill_range(start, len, val.into())
    }

    /// `start` must be granule aligned. The aligned prefix of `len` is marked
    /// fully accessible and, if `len` is not a multiple of the granule size,
    /// the following shadow byte records how many bytes of that granule are
    /// accessible.
    pub fn unpoison(&self, start: GuestAddr, len: usize) -> Result<(), ShadowError> {
        debug!("unpoison - start: {start:#x}, len: {len:#x}");
        debug_assert!(ShadowTranslator::is_aligned(start));
        self.fill_range(start, len & !KASAN_SHADOW_MASK, PoisonType::AsanValid.into())?;
        let partial = len & KASAN_SHADOW_MASK;
        if partial != 0 {
            let boundary = start
                .checked_add(len)
                .ok_or(ShadowError::AddressRangeOverflow(start, len))?;
            self.store_shadow(self.to_shadow(boundary), partial as u8)?;
        }
        Ok(())
    }

    fn fill_range(&self, start: GuestAddr, len: usize, value: u8) -> Result<(), ShadowError> {
        if len == 0 {
            return Ok(());
        }
        let last = start
            .checked_add(len - 1)
            .ok_or(ShadowError::AddressRangeOverflow(start, len))?;
        let shadow_start = self.to_shadow(start);
        let shadow_end = self.to_shadow(last).wrapping_add(1);
        self.set_raw(shadow_start, shadow_end.wrapping_sub(shadow_start), value)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ShadowError {
    #[error("Address overflow: {0:#x}, len: {1:#x}")]
    AddressRangeOverflow(GuestAddr, usize),
    #[error("Invalid shadow address: {0:#x}")]
    InvalidShadowAddress(GuestAddr),
    #[error("Invalid shadow range: {0:#x}, len: {1:#x}")]
    InvalidShadowRange(GuestAddr, usize),
    #[error("Shadow region of {0:#x} bytes exceeds the shadow memory of {1:#x} bytes")]
    ShadowRegionMismatch(usize, usize),
}
