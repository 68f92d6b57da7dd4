//! # kasan
//!
//! `kasan` is a kernel address sanitizer runtime for freestanding targets
//! which have no operating system beneath them. Code compiled with
//! `-fsanitize=kernel-address` calls into this library before every load and
//! store, and the library validates the access against a shadow map holding
//! one byte per 8-byte granule of real memory.
//!
//! The library is split into small components which can be combined by the
//! platform:
//!
//! - `shadow` - Translation between real and shadow addresses, and the
//!   poison/unpoison primitives which write the shadow map.
//! - `check` - The access validator run on every instrumented access.
//! - `allocator` - Head and tail redzones around heap blocks handed out by
//!   the platform's heap allocator, and use-after-free poisoning.
//! - `globals` - Registration of global variable redzones and stack frame
//!   tags emitted by the compiler.
//! - `report` - The diagnostic written to the log when a violation is found.
//! - `runtime` - The C ABI entry points expected by the compiler
//!   instrumentation, backed by a single process-wide `Kasan` context.
//!
//! Violations are reported and execution continues. The target has no
//! process boundary to terminate, so the runtime never aborts.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "document-features", doc = document_features::document_features!())]

#[cfg(feature = "arena")]
extern crate alloc;

pub mod allocator;

#[cfg(feature = "abi")]
pub mod arch;

pub mod check;

pub mod config;

pub mod context;

pub mod globals;

pub mod layout;

pub mod logger;

pub mod report;

#[cfg(feature = "abi")]
pub mod runtime;

pub mod shadow;

pub use check::{Access, AccessViolation, ViolationKind};
pub use config::KasanConfig;
pub use context::{Kasan, KasanError};

pub type GuestAddr = usize;

pub const KASAN_SHADOW_SHIFT: u32 = 3;
pub const KASAN_SHADOW_GRANULE_SIZE: usize = 1 << KASAN_SHADOW_SHIFT;
pub const KASAN_SHADOW_MASK: usize = KASAN_SHADOW_GRANULE_SIZE - 1;
