//! Auxiliary vector
//!
//! Tells the guest C runtime where its program headers live, the page size,
//! its nominal entry point and, when a dynamic linker was chained, where that
//! linker was placed.

use crate::elf::ElfImage;

use super::types::{EntryDescriptor, LoadedImage, PAGE_SIZE};

// ELF auxiliary vector types
pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_BASE: u64 = 7;
pub const AT_ENTRY: u64 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxEntry {
    pub tag: u64,
    pub value: u64,
}

impl AuxEntry {
    pub const fn new(tag: u64, value: u64) -> Self {
        Self { tag, value }
    }
}

/// Auxv entries, always terminated by a single `(AT_NULL, 0)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxVector {
    entries: Vec<AuxEntry>,
}

impl AuxVector {
    /// Build a vector from entries; anything from the first AT_NULL on is
    /// replaced by the terminator.
    pub fn new(entries: impl IntoIterator<Item = AuxEntry>) -> Self {
        let mut entries: Vec<AuxEntry> = entries
            .into_iter()
            .take_while(|e| e.tag != AT_NULL)
            .collect();
        entries.push(AuxEntry::new(AT_NULL, 0));
        Self { entries }
    }

    /// All entries including the terminator.
    pub fn entries(&self) -> &[AuxEntry] {
        &self.entries
    }

    /// Entries before the terminator.
    pub fn body(&self) -> &[AuxEntry] {
        &self.entries[..self.entries.len() - 1]
    }

    pub fn get(&self, tag: u64) -> Option<u64> {
        self.body().iter().find(|e| e.tag == tag).map(|e| e.value)
    }

    /// Bytes occupied on the guest stack.
    pub fn byte_len(&self) -> usize {
        self.entries.len() * 16
    }
}

/// Assemble the auxv for the main image.
///
/// AT_PHDR and AT_ENTRY always describe the main program, never the
/// interpreter; AT_BASE is the interpreter's placement or 0.
pub fn build_auxv(
    main_image: &ElfImage<'_>,
    main_loaded: &LoadedImage,
    entry: &EntryDescriptor,
) -> AuxVector {
    AuxVector::new([
        AuxEntry::new(
            AT_PHDR,
            main_loaded
                .load_base
                .wrapping_add(main_image.program_header_offset()),
        ),
        AuxEntry::new(AT_PHENT, main_image.program_header_entry_size() as u64),
        AuxEntry::new(AT_PHNUM, main_image.program_header_count() as u64),
        AuxEntry::new(AT_PAGESZ, PAGE_SIZE),
        AuxEntry::new(AT_BASE, entry.base_for_aux),
        AuxEntry::new(
            AT_ENTRY,
            main_image
                .entry_virtual_address()
                .wrapping_add(main_loaded.load_bias),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_is_always_null_terminated() {
        let aux = AuxVector::new([AuxEntry::new(AT_PAGESZ, 4096)]);
        assert_eq!(aux.entries().len(), 2);
        assert_eq!(*aux.entries().last().unwrap(), AuxEntry::new(AT_NULL, 0));
        assert_eq!(aux.byte_len(), 32);

        let aux = AuxVector::new([
            AuxEntry::new(AT_PHNUM, 3),
            AuxEntry::new(AT_NULL, 0),
            AuxEntry::new(AT_ENTRY, 0x400078),
        ]);
        assert_eq!(aux.body(), &[AuxEntry::new(AT_PHNUM, 3)]);
        assert_eq!(aux.get(AT_ENTRY), None);
    }
}
