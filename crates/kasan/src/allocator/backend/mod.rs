//! # backend
//! Implementations of `HeapAllocator` which the redzone manager can sit on
//! top of. Platforms normally supply their own heap; the bump backend is
//! enough for early boot and for exercising the sanitizer on a fixed region.
pub mod bump;
