//! # globals
//! Redzones for global variables and the stack frame tags written by the
//! compiler instrumentation.
//!
//! The compiler pads every instrumented global with a trailing redzone and
//! describes it with a `GlobalDescriptor`. Registration makes the variable
//! accessible and poisons the padding behind it. Nothing is placed in front
//! of a global, so an underflow below its start lands in whatever precedes
//! it and is only caught if that happens to be poisoned.
use core::ffi::{CStr, c_char, c_void};

use log::debug;

use crate::{
    GuestAddr,
    shadow::{GuestShadow, PoisonType, ShadowError, memory::ShadowMemory, translate::ShadowTranslator},
};

/// The global descriptor emitted by the compiler, see `__asan_global` in
/// compiler-rt.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GlobalDescriptor {
    pub start: *const c_void,
    pub size: usize,
    pub size_with_redzone: usize,
    pub name: *const c_char,
    pub module_name: *const c_char,
    pub has_dynamic_init: usize,
    pub location: *const c_void,
    pub odr_indicator: usize,
}

impl GlobalDescriptor {
    pub const fn new(start: GuestAddr, size: usize, size_with_redzone: usize) -> GlobalDescriptor {
        GlobalDescriptor {
            start: start as *const c_void,
            size,
            size_with_redzone,
            name: core::ptr::null(),
            module_name: core::ptr::null(),
            has_dynamic_init: 0,
            location: core::ptr::null(),
            odr_indicator: 0,
        }
    }

    pub fn start(&self) -> GuestAddr {
        self.start as GuestAddr
    }

    /// # Safety
    /// `name` must be null or point to a nul terminated string which lives
    /// as long as the descriptor.
    pub unsafe fn name(&self) -> Option<&CStr> {
        if self.name.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(self.name) })
        }
    }
}

pub fn register_global<M: ShadowMemory>(
    shadow: &GuestShadow<M>,
    global: &GlobalDescriptor,
) -> Result<(), ShadowError> {
    let start = global.start();
    debug!(
        "register_global - start: {start:#x}, size: {:#x}, size_with_redzone: {:#x}",
        global.size, global.size_with_redzone
    );
    shadow.unpoison(start, global.size)?;
    let aligned = global
        .size
        .checked_add(crate::KASAN_SHADOW_MASK)
        .map(ShadowTranslator::align_down)
        .ok_or(ShadowError::AddressRangeOverflow(start, global.size))?;
    let redzone = start
        .checked_add(aligned)
        .ok_or(ShadowError::AddressRangeOverflow(start, aligned))?;
    shadow.poison(
        redzone,
        global.size_with_redzone.saturating_sub(aligned),
        PoisonType::AsanGlobalRz,
    )
}

pub fn register_globals<M: ShadowMemory>(
    shadow: &GuestShadow<M>,
    globals: &[GlobalDescriptor],
) -> Result<(), ShadowError> {
    globals.iter().try_for_each(|g| register_global(shadow, g))
}

/// Writes `tag` into `len` shadow bytes starting at the shadow address
/// `shadow_addr`. The compiler emits these calls in function prologues and
/// epilogues to poison and unpoison stack redzones directly.
pub fn set_shadow_tag<M: ShadowMemory>(
    shadow: &GuestShadow<M>,
    shadow_addr: GuestAddr,
    len: usize,
    tag: PoisonType,
) -> Result<(), ShadowError> {
    shadow.set_raw(shadow_addr, len, tag.into())
}
