//! Heap-backed guest memory
//!
//! Every mapping owns one zeroed host allocation, the same way the NVM
//! physical memory model backs guest RAM with `alloc_zeroed`. Mappings never
//! merge and never replace each other: a fixed request that overlaps an
//! existing mapping fails.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;

use super::{GuestMemory, MapError, MapFlags, Protection};
use crate::process::PAGE_SIZE;

/// Exclusive end of the canonical lower half, the guest user address space.
const USER_ADDR_LIMIT: u64 = 0x0000_8000_0000_0000;

/// One guest mapping and its host backing.
pub struct Mapping {
    start: u64,
    size: u64,
    prot: Protection,
    flags: MapFlags,
    backing: NonNull<u8>,
    layout: Layout,
}

impl Mapping {
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn protection(&self) -> Protection {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end()
    }
}

impl core::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Mapping {{ {:#x}..{:#x} {}{}{} }}",
            self.start,
            self.end(),
            if self.prot.contains(Protection::READ) { 'r' } else { '-' },
            if self.prot.contains(Protection::WRITE) { 'w' } else { '-' },
            if self.prot.contains(Protection::EXEC) { 'x' } else { '-' },
        )
    }
}

// SAFETY: the backing allocation is owned exclusively by the mapping.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: allocated in `AnonymousMemory::map` with this layout.
        unsafe { dealloc(self.backing.as_ptr(), self.layout) };
    }
}

/// Guest address space backed by zeroed host heap allocations.
#[derive(Debug, Default)]
pub struct AnonymousMemory {
    /// Mappings keyed by guest start address.
    mappings: BTreeMap<u64, Mapping>,
}

impl AnonymousMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mappings in ascending address order.
    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> + '_ {
        self.mappings.values()
    }

    /// Mapping containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<&Mapping> {
        self.mappings
            .range(..=addr)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.contains(addr))
    }

    /// Drop every mapping, as when the guest address space is torn down.
    pub fn clear(&mut self) {
        self.mappings.clear();
    }
}

// SAFETY: each translated pointer lies inside a live allocation owned by the
// mapping that contains the address, which extends to at least the end of the
// page; allocations are only released by `clear`/drop, which need `&mut self`.
unsafe impl GuestMemory for AnonymousMemory {
    fn map(
        &mut self,
        vaddr: u64,
        size: u64,
        prot: Protection,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        if !flags.contains(MapFlags::FIXED | MapFlags::ANONYMOUS) {
            return Err(MapError::UnsupportedFlags(flags));
        }
        if size == 0 || vaddr & (PAGE_SIZE - 1) != 0 || size & (PAGE_SIZE - 1) != 0 {
            return Err(MapError::Unaligned { vaddr, size });
        }
        let end = vaddr
            .checked_add(size)
            .filter(|&end| end <= USER_ADDR_LIMIT)
            .ok_or(MapError::OutOfRange { vaddr, size })?;

        if let Some(existing) = self.mappings.values().find(|m| m.overlaps(vaddr, end)) {
            crate::kerror!(
                "Fixed mapping {:#x}..{:#x} overlaps {:?}",
                vaddr,
                end,
                existing
            );
            return Err(MapError::Overlap { start: vaddr, end });
        }

        let layout = usize::try_from(size)
            .ok()
            .and_then(|len| Layout::from_size_align(len, PAGE_SIZE as usize).ok())
            .ok_or(MapError::NoMemory { size })?;
        // SAFETY: layout has non-zero size.
        let backing = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(MapError::NoMemory { size })?;

        crate::kdebug!("map {:#x}..{:#x} prot={:?} flags={:?}", vaddr, end, prot, flags);
        self.mappings.insert(
            vaddr,
            Mapping {
                start: vaddr,
                size,
                prot,
                flags,
                backing,
                layout,
            },
        );
        Ok(())
    }

    fn translate(&self, vaddr: u64) -> Option<*mut u8> {
        let mapping = self.find(vaddr)?;
        let offset = (vaddr - mapping.start) as usize;
        // SAFETY: offset < mapping.size, the allocation length.
        Some(unsafe { mapping.backing.as_ptr().add(offset) })
    }
}
