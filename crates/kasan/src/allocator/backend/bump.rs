//! # bump
//! A bump allocator carving blocks out of a fixed region of memory. Two
//! words are stored immediately below each block:
//!
//! ```text
//! | padding | cursor before the block | len | block ... |
//! ```
//!
//! Only the most recent block can be resized in place or have its memory
//! reclaimed by `free`, which moves the cursor back to where it was before
//! the block was carved. Any other block is copied on growth and leaked on
//! free.
use core::ptr::copy_nonoverlapping;

use log::debug;
use thiserror::Error;

use crate::{GuestAddr, allocator::HeapAllocator};

const WORD: usize = size_of::<usize>();
const BLOCK_HEADER: usize = 2 * WORD;

#[derive(Debug)]
pub struct BumpBackend {
    start: GuestAddr,
    end: GuestAddr,
    cursor: GuestAddr,
    align: usize,
}

impl BumpBackend {
    /// # Safety
    /// The region `[start, start + len)` must be valid for reads and writes
    /// and must not be used by anything else for the lifetime of the backend.
    pub unsafe fn new(
        start: GuestAddr,
        len: usize,
        align: usize,
    ) -> Result<BumpBackend, BumpBackendError> {
        if !align.is_power_of_two() {
            Err(BumpBackendError::InvalidAlignment(align))?;
        }
        let end = start
            .checked_add(len)
            .ok_or(BumpBackendError::InvalidRegion(start, len))?;
        debug!("bump - start: {start:#x}, end: {end:#x}, align: {align:#x}");
        Ok(BumpBackend {
            start,
            end,
            cursor: start,
            align,
        })
    }

    /// Number of bytes between the cursor and the end of the region
    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }

    fn carve(&mut self, len: usize) -> Result<GuestAddr, BumpBackendError> {
        let block = self
            .cursor
            .checked_add(BLOCK_HEADER + self.align - 1)
            .map(|addr| addr & !(self.align - 1))
            .ok_or(BumpBackendError::OutOfMemory(len))?;
        let end = block
            .checked_add(len)
            .filter(|end| *end <= self.end)
            .ok_or(BumpBackendError::OutOfMemory(len))?;
        unsafe {
            Self::set_len(block, len);
            ((block - BLOCK_HEADER) as *mut usize).write_unaligned(self.cursor);
        }
        self.cursor = end;
        debug!("bump - carve block: {block:#x}, len: {len:#x}");
        Ok(block)
    }

    fn block_len(&self, block: GuestAddr) -> Result<usize, BumpBackendError> {
        if block < self.start + BLOCK_HEADER || block > self.cursor {
            Err(BumpBackendError::InvalidAddress(block))?;
        }
        Ok(unsafe { ((block - WORD) as *const usize).read_unaligned() })
    }

    unsafe fn set_len(block: GuestAddr, len: usize) {
        unsafe { ((block - WORD) as *mut usize).write_unaligned(len) };
    }

    unsafe fn previous_cursor(block: GuestAddr) -> GuestAddr {
        unsafe { ((block - BLOCK_HEADER) as *const usize).read_unaligned() }
    }

    fn is_last(&self, block: GuestAddr, len: usize) -> bool {
        block + len == self.cursor
    }
}

unsafe impl HeapAllocator for BumpBackend {
    type Error = BumpBackendError;

    fn allocate(&mut self, len: usize) -> Result<GuestAddr, Self::Error> {
        self.carve(len)
    }

    fn reallocate(&mut self, header: GuestAddr, len: usize) -> Result<GuestAddr, Self::Error> {
        let old_len = self.block_len(header)?;
        if self.is_last(header, old_len) {
            let end = header
                .checked_add(len)
                .filter(|end| *end <= self.end)
                .ok_or(BumpBackendError::OutOfMemory(len))?;
            unsafe { Self::set_len(header, len) };
            self.cursor = end;
            return Ok(header);
        }
        if len <= old_len {
            unsafe { Self::set_len(header, len) };
            return Ok(header);
        }
        let block = self.carve(len)?;
        unsafe { copy_nonoverlapping(header as *const u8, block as *mut u8, old_len) };
        Ok(block)
    }

    fn free(&mut self, header: GuestAddr) -> Result<(), Self::Error> {
        let len = self.block_len(header)?;
        if self.is_last(header, len) {
            self.cursor = unsafe { Self::previous_cursor(header) };
        }
        Ok(())
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum BumpBackendError {
    #[error("Invalid alignment: {0:#x}")]
    InvalidAlignment(usize),
    #[error("Invalid region - start: {0:#x}, len: {1:#x}")]
    InvalidRegion(GuestAddr, usize),
    #[error("Out of memory: {0:#x}")]
    OutOfMemory(usize),
    #[error("Invalid address: {0:#x}")]
    InvalidAddress(GuestAddr),
}
