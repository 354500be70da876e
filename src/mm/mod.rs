//! Guest memory interface
//!
//! The loader does not own guest memory. It asks a [`GuestMemory`]
//! implementation for fixed anonymous mappings and writes segment and stack
//! contents through guest-virtual to host-virtual translation.
//!
//! - `anonymous`: heap-backed implementation used by the standalone binary and tests

mod anonymous;

pub use anonymous::{AnonymousMemory, Mapping};

use bitflags::bitflags;

use crate::process::PAGE_SIZE;

bitflags! {
    /// Mapping protection, Linux `PROT_*` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Mapping flags, Linux `MAP_*` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

/// Errors reported by a guest memory manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("mapping {start:#x}..{end:#x} overlaps an existing mapping")]
    Overlap { start: u64, end: u64 },

    #[error("mapping at {vaddr:#x} of {size:#x} bytes is not page aligned")]
    Unaligned { vaddr: u64, size: u64 },

    #[error("mapping at {vaddr:#x} of {size:#x} bytes is outside the guest address space")]
    OutOfRange { vaddr: u64, size: u64 },

    #[error("guest address {vaddr:#x} is not mapped")]
    NotMapped { vaddr: u64 },

    #[error("unsupported mapping flags {0:?}")]
    UnsupportedFlags(MapFlags),

    #[error("out of host memory for {size:#x} byte mapping")]
    NoMemory { size: u64 },
}

/// A guest address space the loader can populate.
///
/// # Safety
///
/// A pointer returned by [`translate`](GuestMemory::translate) must stay valid
/// for reads and writes from the translated address up to the end of its
/// guest page, for as long as the implementation is borrowed, and must not
/// alias memory Rust code holds references to.
pub unsafe trait GuestMemory {
    /// Create a mapping of `size` bytes at `vaddr`. Fresh anonymous mappings
    /// read as zero. Overlapping an existing mapping is an error.
    fn map(&mut self, vaddr: u64, size: u64, prot: Protection, flags: MapFlags)
        -> Result<(), MapError>;

    /// Host address backing guest address `vaddr`, if mapped.
    fn translate(&self, vaddr: u64) -> Option<*mut u8>;

    /// Copy `data` into guest memory starting at `vaddr`.
    fn write_bytes(&mut self, vaddr: u64, data: &[u8]) -> Result<(), MapError> {
        let mut done = 0usize;
        for_each_page_chunk(vaddr, data.len(), |addr, len| {
            let dst = self.translate(addr).ok_or(MapError::NotMapped { vaddr: addr })?;
            // SAFETY: `len` never crosses the page containing `addr`.
            unsafe { core::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst, len) };
            done += len;
            Ok(())
        })
    }

    /// Fill `len` bytes starting at `vaddr` with zero.
    fn zero_bytes(&mut self, vaddr: u64, len: usize) -> Result<(), MapError> {
        for_each_page_chunk(vaddr, len, |addr, len| {
            let dst = self.translate(addr).ok_or(MapError::NotMapped { vaddr: addr })?;
            // SAFETY: `len` never crosses the page containing `addr`.
            unsafe { core::ptr::write_bytes(dst, 0, len) };
            Ok(())
        })
    }

    /// Copy guest memory starting at `vaddr` into `buf`.
    fn read_bytes(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), MapError> {
        let mut done = 0usize;
        for_each_page_chunk(vaddr, buf.len(), |addr, len| {
            let src = self.translate(addr).ok_or(MapError::NotMapped { vaddr: addr })?;
            // SAFETY: `len` never crosses the page containing `addr`.
            unsafe { core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), len) };
            done += len;
            Ok(())
        })
    }

    fn read_u64(&self, vaddr: u64) -> Result<u64, MapError> {
        let mut raw = [0u8; 8];
        self.read_bytes(vaddr, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    fn write_u64(&mut self, vaddr: u64, value: u64) -> Result<(), MapError> {
        self.write_bytes(vaddr, &value.to_le_bytes())
    }

    /// NUL-terminated string at `vaddr`, without the terminator.
    fn read_cstr(&self, vaddr: u64, max_len: usize) -> Result<Vec<u8>, MapError> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        for i in 0..max_len as u64 {
            self.read_bytes(vaddr + i, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
        }
        Ok(out)
    }
}

/// Split `[vaddr, vaddr + len)` at guest page boundaries.
fn for_each_page_chunk<F>(vaddr: u64, len: usize, mut f: F) -> Result<(), MapError>
where
    F: FnMut(u64, usize) -> Result<(), MapError>,
{
    let mut addr = vaddr;
    let mut remaining = len as u64;
    while remaining > 0 {
        let page_left = PAGE_SIZE - (addr & (PAGE_SIZE - 1));
        let chunk = remaining.min(page_left);
        f(addr, chunk as usize)?;
        addr = addr
            .checked_add(chunk)
            .ok_or(MapError::OutOfRange { vaddr, size: len as u64 })?;
        remaining -= chunk;
    }
    Ok(())
}
