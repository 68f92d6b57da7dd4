//! # report
//! Formats a detected violation for the log. The report consists of a one
//! line summary of the access, the kind of bug inferred from the shadow
//! byte, and a hexdump of the shadow map around the faulting shadow byte
//! with that byte bracketed:
//!
//! ```text
//! ===================================================
//! Invalid memory access: address 0x4003A, size 0x1, is_write 1, ip 0x8A3C
//! heap-buffer-overflow - WRITE of size 0x1 at 0x4003a, shadow 0x...: 0x02
//! Shadow bytes around the buggy address 0x40038 (shadow 0x...):
//! 0x...: FA FA FA FA FA FA FA FA 00[02]FB FB FB FB FB FB
//! ```
//!
//! Formatting goes through `core::fmt` only. Nothing is allocated and no
//! memory other than the shadow bytes being printed is read.
use core::fmt::{self, Display, Formatter};

use log::error;

use crate::{
    GuestAddr,
    check::AccessViolation,
    shadow::{GuestShadow, memory::ShadowMemory},
};

pub const LOG_TAG: &str = "kasan";
pub const ROW_LEN: usize = 16;
const SEPARATOR: &str = "===================================================";

#[derive(Debug)]
pub struct BugReport<'a, M: ShadowMemory> {
    shadow: &'a GuestShadow<M>,
    violation: &'a AccessViolation,
    rows_before: usize,
    rows_after: usize,
}

impl<'a, M: ShadowMemory> BugReport<'a, M> {
    pub fn new(
        shadow: &'a GuestShadow<M>,
        violation: &'a AccessViolation,
        rows_before: usize,
        rows_after: usize,
    ) -> BugReport<'a, M> {
        BugReport {
            shadow,
            violation,
            rows_before,
            rows_after,
        }
    }

    /// First byte of the granule whose shadow byte caught the access
    pub fn buggy_address(&self) -> GuestAddr {
        self.shadow.to_real(self.violation.shadow_addr)
    }

    pub fn rows(&self) -> impl Iterator<Item = ShadowRow<'a, M>> + '_ {
        let aligned = self.violation.shadow_addr & !(ROW_LEN - 1);
        let bug = self.violation.shadow_addr - aligned;
        let before = (1..=self.rows_before)
            .rev()
            .map(move |i| ShadowRow::new(self.shadow, aligned.wrapping_sub(i * ROW_LEN), None));
        let after = (1..=self.rows_after)
            .map(move |i| ShadowRow::new(self.shadow, aligned.wrapping_add(i * ROW_LEN), None));
        before
            .chain(core::iter::once(ShadowRow::new(self.shadow, aligned, Some(bug))))
            .chain(after)
    }

    pub fn log(&self) {
        let access = &self.violation.access;
        error!(target: LOG_TAG, "{SEPARATOR}");
        error!(
            target: LOG_TAG,
            "Invalid memory access: address {:#X}, size {:#X}, is_write {}, ip {:#X}",
            access.addr,
            access.size,
            u8::from(access.is_write),
            access.pc
        );
        error!(target: LOG_TAG, "{}", self.violation);
        error!(
            target: LOG_TAG,
            "Shadow bytes around the buggy address {:#X} (shadow {:#X}):",
            self.buggy_address(),
            self.violation.shadow_addr
        );
        for row in self.rows() {
            error!(target: LOG_TAG, "{row}");
        }
    }
}

#[derive(Debug)]
pub struct ShadowRow<'a, M: ShadowMemory> {
    shadow: &'a GuestShadow<M>,
    start: GuestAddr,
    bug: Option<usize>,
}

impl<'a, M: ShadowMemory> ShadowRow<'a, M> {
    fn new(shadow: &'a GuestShadow<M>, start: GuestAddr, bug: Option<usize>) -> Self {
        ShadowRow { shadow, start, bug }
    }

    fn byte(&self, i: usize) -> ShadowByte {
        ShadowByte(self.shadow.load_shadow(self.start.wrapping_add(i)))
    }
}

impl<M: ShadowMemory> Display for ShadowRow<'_, M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}:", self.start)?;
        for i in 0..ROW_LEN {
            match self.bug {
                Some(bug) if i == bug => write!(f, "[{}]", self.byte(i))?,
                Some(bug) if i == bug + 1 => write!(f, "{}", self.byte(i))?,
                _ => write!(f, " {}", self.byte(i))?,
            }
        }
        Ok(())
    }
}

struct ShadowByte(Option<u8>);

impl Display for ShadowByte {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(b) => write!(f, "{b:02X}"),
            None => f.write_str("--"),
        }
    }
}
