//! # context
//! `Kasan` ties the shadow map, the heap redzone manager and the reporter
//! together. A context starts out uninitialized, in which state every access
//! check passes, since the shadow memory may still hold garbage. `initialize`
//! clears the shadow map, marks the shadow of the shadow region itself as
//! reserved and records the memory boundaries. From then on accesses are
//! validated.
//!
//! The initialized state is a `spin::Once` holding the boundaries, so
//! readers on the check path observe either nothing or the complete
//! boundaries and a fully cleared shadow map.
use log::info;
use spin::Once;
use thiserror::Error;

use crate::{
    GuestAddr,
    allocator::{HeapAllocator, HeapError, HeapRedzones},
    check::{self, Access, AccessViolation},
    config::{ConfigError, KasanConfig},
    globals::{self, GlobalDescriptor},
    layout::{MemoryBoundaries, MemoryLayout},
    report::BugReport,
    shadow::{
        GuestShadow, PoisonType, ShadowError, memory::ShadowMemory,
        translate::ShadowTranslator,
    },
};

#[derive(Debug)]
pub struct Kasan<M: ShadowMemory> {
    shadow: GuestShadow<M>,
    heap: HeapRedzones,
    config: KasanConfig,
    boundaries: Once<MemoryBoundaries>,
}

impl<M: ShadowMemory> Kasan<M> {
    pub fn new(
        memory: M,
        translator: ShadowTranslator,
        config: KasanConfig,
    ) -> Result<Kasan<M>, KasanError> {
        config.validate()?;
        Ok(Kasan {
            shadow: GuestShadow::new(memory, translator),
            heap: HeapRedzones::from_config(&config),
            config,
            boundaries: Once::new(),
        })
    }

    /// Prepares the shadow map and starts validating accesses. Only the first
    /// successful call has any effect.
    pub fn initialize<L: MemoryLayout + ?Sized>(&self, layout: &L) -> Result<(), KasanError> {
        self.boundaries
            .try_call_once(|| {
                let boundaries = MemoryBoundaries::from_layout(layout);
                let memory = self.shadow.memory();
                if boundaries.shadow_start != memory.base() {
                    Err(KasanError::ShadowBaseMismatch(
                        boundaries.shadow_start,
                        memory.base(),
                    ))?;
                }
                if boundaries.shadow_size() > memory.len() {
                    Err(ShadowError::ShadowRegionMismatch(
                        boundaries.shadow_size(),
                        memory.len(),
                    ))?;
                }
                if layout.shadow_offset() != self.shadow.translator().offset() {
                    Err(KasanError::ShadowOffsetMismatch(
                        layout.shadow_offset(),
                        self.shadow.translator().offset(),
                    ))?;
                }
                self.shadow.fill(PoisonType::AsanValid.into());
                self.shadow.poison(
                    boundaries.shadow_start,
                    ShadowTranslator::align_up(boundaries.shadow_size()),
                    PoisonType::AsanReserved,
                )?;
                info!(
                    "initialized - shadow: {:#x}-{:#x}, low end: {:#x}, high: {:#x}-{:#x}",
                    boundaries.shadow_start,
                    boundaries.shadow_end,
                    boundaries.low_memory_end,
                    boundaries.high_memory_start,
                    boundaries.high_memory_end
                );
                Ok::<_, KasanError>(boundaries)
            })
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.boundaries.is_completed()
    }

    pub fn boundaries(&self) -> Option<&MemoryBoundaries> {
        self.boundaries.get()
    }

    pub fn shadow(&self) -> &GuestShadow<M> {
        &self.shadow
    }

    pub fn heap(&self) -> &HeapRedzones {
        &self.heap
    }

    pub fn config(&self) -> &KasanConfig {
        &self.config
    }

    /// Validates an access and reports it if it is invalid. Execution is
    /// expected to continue either way.
    pub fn check(&self, access: Access) -> Result<(), AccessViolation> {
        let Some(boundaries) = self.boundaries.get() else {
            return Ok(());
        };
        // Zero sized and wrapping accesses touch no tracked memory
        let Some(last) = access.last() else {
            return Ok(());
        };
        if boundaries.is_trusted(access.addr, last) {
            return Ok(());
        }
        check::validate(&self.shadow, &access).inspect_err(|v| self.report(v))
    }

    pub fn load(&self, addr: GuestAddr, size: usize, pc: GuestAddr) -> Result<(), AccessViolation> {
        self.check(Access::load(addr, size, pc))
    }

    pub fn store(&self, addr: GuestAddr, size: usize, pc: GuestAddr) -> Result<(), AccessViolation> {
        self.check(Access::store(addr, size, pc))
    }

    pub fn report(&self, violation: &AccessViolation) {
        BugReport::new(
            &self.shadow,
            violation,
            self.config.report_rows_before,
            self.config.report_rows_after,
        )
        .log();
    }

    pub fn poison(&self, start: GuestAddr, len: usize, val: PoisonType) -> Result<(), ShadowError> {
        self.shadow.poison(start, len, val)
    }

    pub fn unpoison(&self, start: GuestAddr, len: usize) -> Result<(), ShadowError> {
        self.shadow.unpoison(start, len)
    }

    pub fn allocate<A: HeapAllocator>(
        &self,
        allocator: &mut A,
        len: usize,
    ) -> Result<GuestAddr, HeapError<A>> {
        self.heap.allocate(allocator, Some(&self.shadow), len)
    }

    /// # Safety
    /// `user` must be null or a live pointer returned by `allocate` or
    /// `reallocate` on this context with the same allocator.
    pub unsafe fn free<A: HeapAllocator>(
        &self,
        allocator: &mut A,
        user: GuestAddr,
    ) -> Result<(), HeapError<A>> {
        unsafe { self.heap.free(allocator, Some(&self.shadow), user) }
    }

    /// # Safety
    /// `user` must be null or a live pointer returned by `allocate` or
    /// `reallocate` on this context with the same allocator.
    pub unsafe fn reallocate<A: HeapAllocator>(
        &self,
        allocator: &mut A,
        user: GuestAddr,
        len: usize,
    ) -> Result<GuestAddr, HeapError<A>> {
        unsafe { self.heap.reallocate(allocator, Some(&self.shadow), user, len) }
    }

    pub fn register_globals(&self, globals: &[GlobalDescriptor]) -> Result<(), ShadowError> {
        globals::register_globals(&self.shadow, globals)
    }

    pub fn set_shadow_tag(
        &self,
        shadow_addr: GuestAddr,
        len: usize,
        tag: PoisonType,
    ) -> Result<(), ShadowError> {
        globals::set_shadow_tag(&self.shadow, shadow_addr, len, tag)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum KasanError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Shadow error: {0}")]
    ShadowError(#[from] ShadowError),
    #[error("Shadow region at {0:#x} does not match the shadow memory at {1:#x}")]
    ShadowBaseMismatch(GuestAddr, GuestAddr),
    #[error("Shadow offset {0:#x} does not match the translator offset {1:#x}")]
    ShadowOffsetMismatch(GuestAddr, GuestAddr),
    #[error("Heap redzones changed after the first allocation")]
    HeapRedzonesChanged,
}
