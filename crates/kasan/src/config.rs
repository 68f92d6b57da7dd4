//! # config
//! Runtime configuration of a `Kasan` context. The defaults match the
//! original platform: heap blocks aligned to 64 bytes for DMA, which makes
//! the head redzone 64 bytes, a 32 byte tail redzone, and three rows of
//! shadow memory either side of the faulting byte in reports.
use typed_builder::TypedBuilder;

use crate::KASAN_SHADOW_GRANULE_SIZE;

#[derive(TypedBuilder, Debug, Clone, Copy, PartialEq, Eq)]
pub struct KasanConfig {
    /// Must equal the heap allocator's block alignment so that user pointers
    /// keep that alignment.
    #[builder(default = KasanConfig::DEFAULT_HEAD_REDZONE_SIZE)]
    pub head_redzone_size: usize,
    #[builder(default = KasanConfig::DEFAULT_TAIL_REDZONE_SIZE)]
    pub tail_redzone_size: usize,
    #[builder(default = KasanConfig::DEFAULT_REPORT_ROWS)]
    pub report_rows_before: usize,
    #[builder(default = KasanConfig::DEFAULT_REPORT_ROWS)]
    pub report_rows_after: usize,
}

impl KasanConfig {
    pub const DEFAULT_HEAD_REDZONE_SIZE: usize = 64;
    pub const DEFAULT_TAIL_REDZONE_SIZE: usize = 0x20;
    pub const DEFAULT_REPORT_ROWS: usize = 3;

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.head_redzone_size % KASAN_SHADOW_GRANULE_SIZE != 0
            || self.head_redzone_size < size_of::<usize>()
        {
            Err(ConfigError::InvalidHeadRedZoneSize(self.head_redzone_size))?;
        }
        if self.tail_redzone_size % KASAN_SHADOW_GRANULE_SIZE != 0 {
            Err(ConfigError::InvalidTailRedZoneSize(self.tail_redzone_size))?;
        }
        Ok(())
    }
}

impl Default for KasanConfig {
    fn default() -> Self {
        KasanConfig::builder().build()
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid head red_zone_size: {0}")]
    InvalidHeadRedZoneSize(usize),
    #[error("Invalid tail red_zone_size: {0}")]
    InvalidTailRedZoneSize(usize),
}
