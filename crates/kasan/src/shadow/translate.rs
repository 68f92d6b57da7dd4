//! # translate
//! Pure arithmetic mapping between real addresses and the addresses of the
//! shadow bytes describing them. Every granule of `KASAN_SHADOW_GRANULE_SIZE`
//! bytes of real memory is described by exactly one shadow byte located at
//! `(addr >> KASAN_SHADOW_SHIFT) + offset`.
use crate::{GuestAddr, KASAN_SHADOW_GRANULE_SIZE, KASAN_SHADOW_MASK, KASAN_SHADOW_SHIFT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowTranslator {
    offset: GuestAddr,
}

impl ShadowTranslator {
    pub const fn new(offset: GuestAddr) -> ShadowTranslator {
        ShadowTranslator { offset }
    }

    pub const fn offset(&self) -> GuestAddr {
        self.offset
    }

    #[inline]
    pub const fn to_shadow(&self, addr: GuestAddr) -> GuestAddr {
        (addr >> KASAN_SHADOW_SHIFT).wrapping_add(self.offset)
    }

    /// Returns the address of the first byte of the granule described by the
    /// shadow byte at `shadow`.
    #[inline]
    pub const fn to_real(&self, shadow: GuestAddr) -> GuestAddr {
        shadow.wrapping_sub(self.offset) << KASAN_SHADOW_SHIFT
    }

    #[inline]
    pub const fn granule_offset(addr: GuestAddr) -> usize {
        addr & KASAN_SHADOW_MASK
    }

    pub const fn align_down(addr: GuestAddr) -> GuestAddr {
        addr & !KASAN_SHADOW_MASK
    }

    /// # Panics
    /// Panics if rounding up would overflow the address space.
    pub const fn align_up(addr: GuestAddr) -> GuestAddr {
        assert!(addr <= GuestAddr::MAX - KASAN_SHADOW_MASK);
        (addr + KASAN_SHADOW_MASK) & !KASAN_SHADOW_MASK
    }

    pub const fn is_aligned(addr: GuestAddr) -> bool {
        addr % KASAN_SHADOW_GRANULE_SIZE == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFSET: GuestAddr = 0x0800_0000;

    #[test]
    fn test_to_shadow() {
        let t = ShadowTranslator::new(OFFSET);
        assert_eq!(t.to_shadow(0), OFFSET);
        assert_eq!(t.to_shadow(7), OFFSET);
        assert_eq!(t.to_shadow(8), OFFSET + 1);
        assert_eq!(t.to_shadow(0x1000), OFFSET + 0x200);
    }

    #[test]
    fn test_to_real_inverts_granule_start() {
        let t = ShadowTranslator::new(OFFSET);
        for addr in (0..0x400).step_by(KASAN_SHADOW_GRANULE_SIZE) {
            assert_eq!(t.to_real(t.to_shadow(addr)), addr);
        }
        assert_eq!(t.to_real(t.to_shadow(0x1003)), 0x1000);
    }

    #[test]
    fn test_order_preserving() {
        let t = ShadowTranslator::new(OFFSET);
        let mut prev = t.to_shadow(0);
        for addr in 1..0x200 {
            let next = t.to_shadow(addr);
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn test_wrapping_offset() {
        let t = ShadowTranslator::new(GuestAddr::MAX - 0xf);
        assert_eq!(t.to_shadow(0x100), 0x10);
        assert_eq!(t.to_real(0x10), 0x100);
    }

    #[test]
    fn test_align() {
        assert_eq!(ShadowTranslator::align_up(0), 0);
        assert_eq!(ShadowTranslator::align_up(1), 8);
        assert_eq!(ShadowTranslator::align_up(9), 16);
        assert_eq!(ShadowTranslator::align_down(15), 8);
        assert_eq!(ShadowTranslator::granule_offset(11), 3);
        assert!(ShadowTranslator::is_aligned(24));
        assert!(!ShadowTranslator::is_aligned(25));
    }

    #[test]
    #[should_panic]
    fn test_align_up_max() {
        ShadowTranslator::align_up(GuestAddr::MAX - 1);
    }
}
