use core::arch::asm;

use crate::GuestAddr;

#[inline(always)]
pub fn link_register() -> GuestAddr {
    let lr: GuestAddr;
    unsafe { asm!("mov {}, lr", out(reg) lr, options(nomem, nostack, preserves_flags)) };
    lr
}
