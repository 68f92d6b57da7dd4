//! # runtime
//! The entry points called by code compiled with
//! `-fsanitize=kernel-address`, backed by a single process-wide `Kasan`
//! context over the platform's shadow region.
//!
//! Until `initialize` has completed there is no context, so every check
//! passes and shadow writes requested by instrumented code are dropped. The
//! heap hooks still lay out redzoned blocks before initialization, so that
//! blocks allocated early can be freed later, but leave the shadow alone.
//!
//! The heap hooks take the platform allocator explicitly since the runtime
//! has no heap of its own. The caller is responsible for serializing calls
//! made with the same allocator.
use core::{
    ffi::{c_char, c_void},
    ptr::null_mut,
    slice::from_raw_parts,
    sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, trace, warn};
use paste::paste;
use spin::Once;

use crate::{
    GuestAddr,
    allocator::{HeapAllocator, HeapRedzones},
    arch::return_address,
    check::{Access, AccessViolation},
    config::KasanConfig,
    context::{Kasan, KasanError},
    globals::GlobalDescriptor,
    layout::MemoryLayout,
    shadow::{
        GuestShadow, PoisonType,
        memory::{RawShadowMemory, ShadowMemory},
        translate::ShadowTranslator,
    },
};

static KASAN: Once<Kasan<RawShadowMemory>> = Once::new();
static HEAP_USED: AtomicBool = AtomicBool::new(false);

/// Initializes the runtime with the default configuration.
///
/// # Safety
/// The shadow region described by `layout` must be RAM reserved for the
/// shadow map for the remainder of the program. No instrumented code may be
/// running concurrently on another core.
pub unsafe fn initialize<L: MemoryLayout + ?Sized>(
    layout: &L,
) -> Result<&'static Kasan<RawShadowMemory>, KasanError> {
    unsafe { initialize_with_config(layout, KasanConfig::default()) }
}

/// Initializes the runtime. Only the first successful call has any effect.
/// Heap redzones other than the defaults are rejected once the heap hooks
/// have handed out a block, since those blocks were laid out with the
/// defaults.
///
/// # Safety
/// See `initialize`.
pub unsafe fn initialize_with_config<L: MemoryLayout + ?Sized>(
    layout: &L,
    config: KasanConfig,
) -> Result<&'static Kasan<RawShadowMemory>, KasanError> {
    KASAN.try_call_once(|| {
        if HEAP_USED.load(Ordering::Acquire)
            && HeapRedzones::from_config(&config) != HeapRedzones::default()
        {
            Err(KasanError::HeapRedzonesChanged)?;
        }
        let memory =
            unsafe { RawShadowMemory::new(layout.shadow_start(), layout.shadow_region_size()) };
        let kasan = Kasan::new(memory, ShadowTranslator::new(layout.shadow_offset()), config)?;
        kasan.initialize(layout)?;
        Ok::<_, KasanError>(kasan)
    })
}

pub fn kasan() -> Option<&'static Kasan<RawShadowMemory>> {
    KASAN.get()
}

fn heap() -> (HeapRedzones, Option<&'static GuestShadow<RawShadowMemory>>) {
    match kasan() {
        Some(kasan) => (*kasan.heap(), Some(kasan.shadow())),
        None => {
            HEAP_USED.store(true, Ordering::Release);
            (HeapRedzones::default(), None)
        }
    }
}

/// Returns null if the allocator is exhausted.
pub fn allocate_hook<A: HeapAllocator>(allocator: &mut A, len: usize) -> *mut c_void {
    let (redzones, shadow) = heap();
    match redzones.allocate(allocator, shadow, len) {
        Ok(user) => user as *mut c_void,
        Err(e) => {
            debug!("allocate_hook - len: {len:#x}, error: {e:?}");
            null_mut()
        }
    }
}

/// Returns null if the allocator is exhausted, in which case the old block
/// remains allocated but poisoned as freed.
///
/// # Safety
/// `user` must be null or a live pointer returned by one of the heap hooks
/// with the same allocator.
pub unsafe fn reallocate_hook<A: HeapAllocator>(
    allocator: &mut A,
    user: *mut c_void,
    len: usize,
) -> *mut c_void {
    let (redzones, shadow) = heap();
    match unsafe { redzones.reallocate(allocator, shadow, user as GuestAddr, len) } {
        Ok(user) => user as *mut c_void,
        Err(e) => {
            debug!("reallocate_hook - user: {user:p}, len: {len:#x}, error: {e:?}");
            null_mut()
        }
    }
}

/// # Safety
/// `user` must be null or a live pointer returned by one of the heap hooks
/// with the same allocator.
pub unsafe fn free_hook<A: HeapAllocator>(allocator: &mut A, user: *mut c_void) {
    let (redzones, shadow) = heap();
    if let Err(e) = unsafe { redzones.free(allocator, shadow, user as GuestAddr) } {
        debug!("free_hook - user: {user:p}, error: {e:?}");
    }
}

#[inline(always)]
fn check_access(access: Access) {
    if let Some(kasan) = KASAN.get() {
        // Reported by the context, execution continues regardless
        let _ = kasan.check(access);
    }
}

/// Validates a copy of `n` bytes, `dst` as a write and `src` as a read.
/// Both are reported when both are invalid, the destination's violation is
/// returned.
pub fn check_copy<M: ShadowMemory>(
    kasan: &Kasan<M>,
    dst: GuestAddr,
    src: GuestAddr,
    n: usize,
    pc: GuestAddr,
) -> Result<(), AccessViolation> {
    let dst = kasan.store(dst, n, pc);
    let src = kasan.load(src, n, pc);
    dst.and(src)
}

pub fn check_fill<M: ShadowMemory>(
    kasan: &Kasan<M>,
    buf: GuestAddr,
    n: usize,
    pc: GuestAddr,
) -> Result<(), AccessViolation> {
    kasan.store(buf, n, pc)
}

fn set_shadow(addr: *mut c_void, len: usize, tag: PoisonType) {
    let Some(kasan) = KASAN.get() else {
        return;
    };
    if let Err(e) = kasan.set_shadow_tag(addr as GuestAddr, len, tag) {
        debug!("set_shadow - addr: {addr:p}, len: {len:#x}, error: {e:?}");
    }
}

macro_rules! define_load_store {
    ($($size:literal),*) => {
        paste! {
            $(
                #[unsafe(no_mangle)]
                pub extern "C" fn [<__asan_load $size _noabort>](addr: GuestAddr) {
                    check_access(Access::load(addr, $size, return_address()));
                }

                #[unsafe(no_mangle)]
                pub extern "C" fn [<__asan_store $size _noabort>](addr: GuestAddr) {
                    check_access(Access::store(addr, $size, return_address()));
                }
            )*
        }
    };
}

define_load_store!(1, 2, 4, 8, 16);

#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub extern "C" fn __asan_loadN_noabort(addr: GuestAddr, size: usize) {
    check_access(Access::load(addr, size, return_address()));
}

#[allow(non_snake_case)]
#[unsafe(no_mangle)]
pub extern "C" fn __asan_storeN_noabort(addr: GuestAddr, size: usize) {
    check_access(Access::store(addr, size, return_address()));
}

macro_rules! define_set_shadow {
    ($($byte:tt => $tag:ident),*) => {
        paste! {
            $(
                #[unsafe(no_mangle)]
                pub extern "C" fn [<__asan_set_shadow_ $byte>](addr: *mut c_void, size: usize) {
                    set_shadow(addr, size, PoisonType::$tag);
                }
            )*
        }
    };
}

define_set_shadow!(
    00 => AsanValid,
    f1 => AsanStackLeftRz,
    f2 => AsanStackMidRz,
    f3 => AsanStackRightRz,
    f5 => AsanStackAfterReturn,
    f8 => AsanStackUseAfterScope
);

/// # Safety
/// `globals` must point to `n` descriptors emitted by the compiler.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __asan_register_globals(globals: *const GlobalDescriptor, n: usize) {
    trace!("register_globals - globals: {globals:p}, n: {n:#x}");
    if globals.is_null() || n == 0 {
        return;
    }
    let Some(kasan) = KASAN.get() else {
        warn!("register_globals - not initialized, globals: {globals:p}");
        return;
    };
    let globals = unsafe { from_raw_parts(globals, n) };
    if let Err(e) = kasan.register_globals(globals) {
        debug!("register_globals - error: {e:?}");
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn __asan_unregister_globals(_globals: *const GlobalDescriptor, _n: usize) {}

#[unsafe(no_mangle)]
pub extern "C" fn __asan_handle_no_return() {}

#[unsafe(no_mangle)]
pub extern "C" fn __asan_before_dynamic_init(_module_name: *const c_char) {}

#[unsafe(no_mangle)]
pub extern "C" fn __asan_after_dynamic_init() {}

#[cfg(feature = "mem_hooks")]
mod mem_hooks {
    use core::ffi::{c_int, c_void};

    use super::{KASAN, check_copy, check_fill};
    use crate::{GuestAddr, arch::return_address};

    unsafe extern "C" {
        fn __kasan_memset(buf: *mut c_void, c: c_int, n: usize) -> *mut c_void;
        fn __kasan_memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void;
    }

    /// # Safety
    /// See man pages
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
        let pc = return_address();
        if let Some(kasan) = KASAN.get() {
            let _ = check_copy(kasan, dst as GuestAddr, src as GuestAddr, n, pc);
        }
        unsafe { __kasan_memcpy(dst, src, n) }
    }

    /// # Safety
    /// See man pages
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn memset(buf: *mut c_void, c: c_int, n: usize) -> *mut c_void {
        let pc = return_address();
        if let Some(kasan) = KASAN.get() {
            let _ = check_fill(kasan, buf as GuestAddr, n, pc);
        }
        unsafe { __kasan_memset(buf, c, n) }
    }
}
