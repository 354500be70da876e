//! Exec path type definitions
//!
//! Memory layout constants and the values handed from one loading stage to
//! the next.

use crate::mm::Protection;

use super::auxv::AuxVector;

/// Guest page size.
pub const PAGE_SIZE: u64 = 4096;

/// Round `value` up to the next page boundary, `None` on overflow.
#[inline]
pub const fn page_round_up(value: u64) -> Option<u64> {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

#[inline]
pub const fn page_align_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn page_offset(value: u64) -> u64 {
    value & (PAGE_SIZE - 1)
}

/// One fixed mapping made for a PT_LOAD segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMapping {
    /// Page-aligned guest start address.
    pub vaddr: u64,
    /// Page-rounded length.
    pub size: u64,
    pub prot: Protection,
}

impl SegmentMapping {
    pub fn end(&self) -> u64 {
        self.vaddr + self.size
    }
}

/// Result of mapping one ELF image into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    /// Constant added to every `p_vaddr` (0 for ET_EXEC).
    pub load_bias: u64,
    /// Runtime address of file offset 0: `p_vaddr - p_offset` of the first
    /// PT_LOAD, plus the bias.
    pub load_base: u64,
    /// Page-aligned end of the highest mapped segment.
    pub map_top: u64,
    /// Biased `e_entry`.
    pub entry_address: u64,
    /// Mappings in program-header order.
    pub segments: Vec<SegmentMapping>,
}

/// Where execution starts and what the auxv must report about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryDescriptor {
    /// First guest instruction: the interpreter's entry when one is loaded.
    pub entry: u64,
    /// AT_BASE value: interpreter load bias, 0 without an interpreter.
    pub base_for_aux: u64,
    pub interp_present: bool,
    /// Lowest guest address above every loaded image; initial program break.
    pub brk_base: u64,
}

/// Guest state produced by a successful exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub entry: u64,
    /// Initial RSP, pointing at argc.
    pub stack_pointer: u64,
    /// Initial program break for the heap manager.
    pub brk_base: u64,
    pub interp_present: bool,
    pub auxv: AuxVector,
}
