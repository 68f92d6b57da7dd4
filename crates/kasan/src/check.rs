//! # check
//! The access validator. Every load and store emitted by the compiler
//! instrumentation ends up in `find_poisoned_shadow`, which scans the shadow
//! bytes covering the accessed range for the first one which forbids the
//! access. Granules whose shadow byte holds a count `k` in `1..=7` may only
//! be accessed within their first `k` bytes, and only the granule holding
//! the last byte of an access can legitimately be such a granule.
use core::fmt::{self, Display, Formatter};

use num_enum::TryFromPrimitiveError;
use thiserror::Error;

use crate::{
    GuestAddr, KASAN_SHADOW_GRANULE_SIZE,
    shadow::{GuestShadow, PoisonType, memory::ShadowMemory, translate::ShadowTranslator},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub addr: GuestAddr,
    pub size: usize,
    pub is_write: bool,
    pub pc: GuestAddr,
}

impl Access {
    pub const fn load(addr: GuestAddr, size: usize, pc: GuestAddr) -> Access {
        Access {
            addr,
            size,
            is_write: false,
            pc,
        }
    }

    pub const fn store(addr: GuestAddr, size: usize, pc: GuestAddr) -> Access {
        Access {
            addr,
            size,
            is_write: true,
            pc,
        }
    }

    /// Address of the last byte accessed, `None` for an empty access or one
    /// which wraps around the top of the address space.
    pub fn last(&self) -> Option<GuestAddr> {
        self.size
            .checked_sub(1)
            .and_then(|n| self.addr.checked_add(n))
    }

    pub fn direction(&self) -> &'static str {
        if self.is_write { "WRITE" } else { "READ" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    HeapBufferOverflow,
    HeapUseAfterFree,
    GlobalBufferOverflow,
    StackBufferOverflow,
    StackUseAfterReturn,
    StackUseAfterScope,
    ShadowAccess,
    OutOfBounds,
    Unknown(u8),
}

impl ViolationKind {
    /// Classifies a violation by the shadow byte which caught it. A partially
    /// accessible granule carries no redzone information of its own, so the
    /// shadow byte following it (`next`) is consulted instead.
    pub fn from_shadow(value: u8, next: Option<u8>) -> ViolationKind {
        match PoisonType::try_from(value) {
            Ok(PoisonType::AsanHeapLeftRz | PoisonType::AsanHeapRightRz) => {
                ViolationKind::HeapBufferOverflow
            }
            Ok(PoisonType::AsanHeapFreed) => ViolationKind::HeapUseAfterFree,
            Ok(PoisonType::AsanGlobalRz) => ViolationKind::GlobalBufferOverflow,
            Ok(
                PoisonType::AsanStackLeftRz
                | PoisonType::AsanStackMidRz
                | PoisonType::AsanStackRightRz,
            ) => ViolationKind::StackBufferOverflow,
            Ok(PoisonType::AsanStackAfterReturn) => ViolationKind::StackUseAfterReturn,
            Ok(PoisonType::AsanStackUseAfterScope) => ViolationKind::StackUseAfterScope,
            Ok(PoisonType::AsanReserved) => ViolationKind::ShadowAccess,
            Ok(PoisonType::AsanValid) => ViolationKind::Unknown(value),
            Err(TryFromPrimitiveError { number }) if Self::is_partial(number) => next
                .filter(|n| *n as usize >= KASAN_SHADOW_GRANULE_SIZE)
                .map_or(ViolationKind::OutOfBounds, |n| Self::from_shadow(n, None)),
            Err(TryFromPrimitiveError { number }) => ViolationKind::Unknown(number),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ViolationKind::HeapBufferOverflow => "heap-buffer-overflow",
            ViolationKind::HeapUseAfterFree => "heap-use-after-free",
            ViolationKind::GlobalBufferOverflow => "global-buffer-overflow",
            ViolationKind::StackBufferOverflow => "stack-buffer-overflow",
            ViolationKind::StackUseAfterReturn => "stack-use-after-return",
            ViolationKind::StackUseAfterScope => "stack-use-after-scope",
            ViolationKind::ShadowAccess => "wild-access-to-shadow-memory",
            ViolationKind::OutOfBounds => "out-of-bounds",
            ViolationKind::Unknown(_) => "unknown-crash",
        }
    }

    const fn is_partial(value: u8) -> bool {
        value != 0 && (value as usize) < KASAN_SHADOW_GRANULE_SIZE
    }
}

impl Display for ViolationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind} - {} of size {:#x} at {:#x}, shadow {shadow_addr:#x}: {shadow_value:#04x}", .access.direction(), .access.size, .access.addr)]
pub struct AccessViolation {
    pub access: Access,
    /// Address of the first shadow byte which forbids the access
    pub shadow_addr: GuestAddr,
    pub shadow_value: u8,
    pub kind: ViolationKind,
}

/// Returns the address and value of the shadow byte which forbids an access
/// of the inclusive range `[addr, last]`, or `None` if the access is allowed.
/// Shadow bytes which are not backed by the shadow memory end the scan.
pub fn find_poisoned_shadow<M: ShadowMemory>(
    shadow: &GuestShadow<M>,
    addr: GuestAddr,
    last: GuestAddr,
) -> Option<(GuestAddr, u8)> {
    let shadow_start = shadow.to_shadow(addr);
    let shadow_last = shadow.to_shadow(last);
    let count = shadow_last.wrapping_sub(shadow_start).wrapping_add(1);

    let (found, value) = (0..count)
        .map(|i| shadow_start.wrapping_add(i))
        .map_while(|s| shadow.load_shadow(s).map(|v| (s, v)))
        .find(|(_, v)| *v != 0)?;

    if found == shadow_last
        && ViolationKind::is_partial(value)
        && ShadowTranslator::granule_offset(last) < value as usize
    {
        return None;
    }
    Some((found, value))
}

/// Validates `access` against the shadow map, ignoring the memory windows
/// which are never instrumented.
pub fn validate<M: ShadowMemory>(
    shadow: &GuestShadow<M>,
    access: &Access,
) -> Result<(), AccessViolation> {
    let Some(last) = access.last() else {
        return Ok(());
    };
    let Some((shadow_addr, shadow_value)) = find_poisoned_shadow(shadow, access.addr, last)
    else {
        return Ok(());
    };
    let next = shadow.load_shadow(shadow_addr.wrapping_add(1));
    Err(AccessViolation {
        access: *access,
        shadow_addr,
        shadow_value,
        kind: ViolationKind::from_shadow(shadow_value, next),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_magic() {
        assert_eq!(
            ViolationKind::from_shadow(0xfa, None),
            ViolationKind::HeapBufferOverflow
        );
        assert_eq!(
            ViolationKind::from_shadow(0xfb, None),
            ViolationKind::HeapBufferOverflow
        );
        assert_eq!(
            ViolationKind::from_shadow(0xfd, None),
            ViolationKind::HeapUseAfterFree
        );
        assert_eq!(
            ViolationKind::from_shadow(0xf9, None),
            ViolationKind::GlobalBufferOverflow
        );
        assert_eq!(
            ViolationKind::from_shadow(0xf2, None),
            ViolationKind::StackBufferOverflow
        );
        assert_eq!(
            ViolationKind::from_shadow(0xff, None),
            ViolationKind::ShadowAccess
        );
        assert_eq!(
            ViolationKind::from_shadow(0x42, None),
            ViolationKind::Unknown(0x42)
        );
    }

    #[test]
    fn test_classify_partial_uses_next() {
        assert_eq!(
            ViolationKind::from_shadow(2, Some(0xfb)),
            ViolationKind::HeapBufferOverflow
        );
        assert_eq!(
            ViolationKind::from_shadow(1, Some(0xf9)),
            ViolationKind::GlobalBufferOverflow
        );
        assert_eq!(
            ViolationKind::from_shadow(1, Some(0)),
            ViolationKind::OutOfBounds
        );
        assert_eq!(ViolationKind::from_shadow(7, None), ViolationKind::OutOfBounds);
    }

    #[test]
    fn test_access_last() {
        assert_eq!(Access::load(0x10, 0, 0).last(), None);
        assert_eq!(Access::load(0x10, 1, 0).last(), Some(0x10));
        assert_eq!(Access::store(0x10, 8, 0).last(), Some(0x17));
        assert_eq!(Access::store(GuestAddr::MAX, 2, 0).last(), None);
    }
}
