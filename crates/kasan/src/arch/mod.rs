//! # arch
//! Reads the caller's return address, reported as the `ip` of a violation.
//! The address is only meaningful when the reading function is inlined into
//! an entry point called directly from instrumented code, before that entry
//! point has made any call of its own.
use crate::GuestAddr;

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(target_arch = "arm")]
mod arm;

#[inline(always)]
pub fn return_address() -> GuestAddr {
    #[cfg(target_arch = "aarch64")]
    {
        aarch64::link_register()
    }
    #[cfg(target_arch = "arm")]
    {
        arm::link_register()
    }
    #[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
    {
        0
    }
}
