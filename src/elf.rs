//! ELF64 image view
//!
//! Parses and validates the ELF header and program-header table of an
//! executable held in a read-only byte buffer. Nothing here touches guest
//! state or performs I/O; the caller supplies the mapped file.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use bitflags::bitflags;

use crate::error::{ExecError, ExecResult};
use crate::safety::RawReader;

/// ELF magic number
pub const ELF_MAGIC: u32 = 0x464C457F; // 0x7F 'E' 'L' 'F'

/// `e_machine` value for x86-64.
pub const EM_X86_64: u16 = 0x3E;

/// Size of the ELF64 file header.
pub const ELF64_HEADER_SIZE: usize = 64;
/// Size of one ELF64 program header.
pub const ELF64_PHDR_SIZE: usize = 56;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

// Header field offsets
const E_TYPE: usize = 16;
const E_MACHINE: usize = 18;
const E_ENTRY: usize = 24;
const E_PHOFF: usize = 32;
const E_PHENTSIZE: usize = 54;
const E_PHNUM: usize = 56;

/// Object file types the loader accepts.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfType {
    Executable = 2,
    Shared = 3,
}

impl ElfType {
    fn from_raw(value: u16) -> Option<Self> {
        match value {
            2 => Some(ElfType::Executable),
            3 => Some(ElfType::Shared),
            _ => None,
        }
    }
}

/// Program header type
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhType {
    Null = 0,
    Load = 1,
    Dynamic = 2,
    Interp = 3,
    Note = 4,
    ShLib = 5,
    Phdr = 6,
    Tls = 7,
}

bitflags! {
    /// Program header `p_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

/// One entry of the program-header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: SegmentFlags,
    pub file_offset: u64,
    pub virtual_address: u64,
    pub file_size: u64,
    pub mem_size: u64,
}

impl ProgramHeader {
    fn read(reader: &RawReader<'_>, offset: usize) -> Option<Self> {
        Some(Self {
            p_type: reader.u32(offset).ok()?,
            flags: SegmentFlags::from_bits_truncate(reader.u32(offset + 4).ok()?),
            file_offset: reader.u64(offset + 8).ok()?,
            virtual_address: reader.u64(offset + 16).ok()?,
            file_size: reader.u64(offset + 32).ok()?,
            mem_size: reader.u64(offset + 40).ok()?,
        })
    }

    pub fn is(&self, kind: PhType) -> bool {
        self.p_type == kind as u32
    }
}

/// Validated view over an ELF64 x86-64 executable or shared object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfImage<'a> {
    data: &'a [u8],
    entry_type: ElfType,
    machine: u16,
    entry_virtual_address: u64,
    program_header_offset: u64,
    program_header_entry_size: u16,
    program_header_count: u16,
    program_headers: Vec<ProgramHeader>,
}

impl<'a> ElfImage<'a> {
    /// Parse and validate an image.
    ///
    /// Fails with [`ExecError::InvalidFormat`] on a bad magic, a non-ELF64 or
    /// big-endian file, or header tables that run past the buffer, and with
    /// [`ExecError::UnsupportedType`] when the image is not an x86-64
    /// `ET_EXEC`/`ET_DYN`.
    pub fn parse(data: &'a [u8]) -> ExecResult<Self> {
        let reader = RawReader::new(data);

        let magic = reader
            .u32(0)
            .map_err(|_| ExecError::InvalidFormat("file too small for ELF magic"))?;
        if magic != ELF_MAGIC {
            crate::kerror!("Invalid ELF magic: {:#x}", magic);
            return Err(ExecError::InvalidFormat("bad ELF magic"));
        }
        if reader.len() < ELF64_HEADER_SIZE {
            crate::kerror!("ELF data too small: {} bytes", reader.len());
            return Err(ExecError::InvalidFormat("truncated ELF header"));
        }

        macro_rules! field {
            ($method:ident, $offset:expr) => {
                reader
                    .$method($offset)
                    .map_err(|_| ExecError::InvalidFormat("truncated ELF header"))?
            };
        }

        if field!(u8, EI_CLASS) != ELFCLASS64 {
            return Err(ExecError::InvalidFormat("not an ELF64 image"));
        }
        if field!(u8, EI_DATA) != ELFDATA2LSB {
            return Err(ExecError::InvalidFormat("not a little-endian image"));
        }

        let e_type = field!(u16, E_TYPE);
        let machine = field!(u16, E_MACHINE);
        let entry_type = match ElfType::from_raw(e_type) {
            Some(t) if machine == EM_X86_64 => t,
            _ => {
                crate::kerror!(
                    "Unsupported ELF image: e_type={:#x}, e_machine={:#x}",
                    e_type,
                    machine
                );
                return Err(ExecError::UnsupportedType { e_type, machine });
            }
        };

        let entry_virtual_address = field!(u64, E_ENTRY);
        let program_header_offset = field!(u64, E_PHOFF);
        let program_header_entry_size = field!(u16, E_PHENTSIZE);
        let program_header_count = field!(u16, E_PHNUM);

        let program_headers = Self::read_program_headers(
            &reader,
            program_header_offset,
            program_header_entry_size,
            program_header_count,
        )?;

        crate::kdebug!(
            "ELF header: type={:?}, e_entry={:#x}, e_phoff={:#x}, e_phnum={}, e_phentsize={}",
            entry_type,
            entry_virtual_address,
            program_header_offset,
            program_header_count,
            program_header_entry_size
        );

        Ok(Self {
            data,
            entry_type,
            machine,
            entry_virtual_address,
            program_header_offset,
            program_header_entry_size,
            program_header_count,
            program_headers,
        })
    }

    fn read_program_headers(
        reader: &RawReader<'_>,
        phoff: u64,
        phentsize: u16,
        phnum: u16,
    ) -> ExecResult<Vec<ProgramHeader>> {
        if phnum == 0 {
            return Ok(Vec::new());
        }
        if (phentsize as usize) < ELF64_PHDR_SIZE {
            crate::kerror!("program header entry size {} too small", phentsize);
            return Err(ExecError::InvalidFormat("program header entry size too small"));
        }

        const OUT_OF_BOUNDS: ExecError =
            ExecError::InvalidFormat("program header table out of bounds");

        let base = usize::try_from(phoff).map_err(|_| OUT_OF_BOUNDS)?;
        let mut headers = Vec::with_capacity(phnum as usize);
        for index in 0..phnum as usize {
            let offset = index
                .checked_mul(phentsize as usize)
                .and_then(|delta| base.checked_add(delta))
                .ok_or(OUT_OF_BOUNDS)?;
            let ph = ProgramHeader::read(reader, offset).ok_or(OUT_OF_BOUNDS)?;

            if ph.is(PhType::Load) {
                if ph.file_size > ph.mem_size {
                    crate::kerror!(
                        "Segment {}: p_filesz={:#x} exceeds p_memsz={:#x}",
                        index,
                        ph.file_size,
                        ph.mem_size
                    );
                    return Err(ExecError::InvalidFormat(
                        "segment file size exceeds memory size",
                    ));
                }
                segment_range(reader, &ph)?;
            }
            headers.push(ph);
        }
        Ok(headers)
    }

    pub fn entry_type(&self) -> ElfType {
        self.entry_type
    }

    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// `e_entry` as stored in the file.
    pub fn entry_virtual_address(&self) -> u64 {
        self.entry_virtual_address
    }

    pub fn program_header_offset(&self) -> u64 {
        self.program_header_offset
    }

    pub fn program_header_entry_size(&self) -> u16 {
        self.program_header_entry_size
    }

    pub fn program_header_count(&self) -> u16 {
        self.program_header_count
    }

    pub fn program_headers(&self) -> impl Iterator<Item = &ProgramHeader> + '_ {
        self.program_headers.iter()
    }

    /// PT_LOAD entries in file order.
    pub fn load_segments(&self) -> impl Iterator<Item = &ProgramHeader> + '_ {
        self.program_headers.iter().filter(|ph| ph.is(PhType::Load))
    }

    /// `p_vaddr - p_offset` of the first PT_LOAD entry.
    pub fn load_base(&self) -> Option<u64> {
        self.load_segments()
            .next()
            .map(|ph| ph.virtual_address.wrapping_sub(ph.file_offset))
    }

    /// File bytes backing a segment (`p_filesz` bytes at `p_offset`).
    pub fn segment_bytes(&self, ph: &ProgramHeader) -> ExecResult<&'a [u8]> {
        segment_range(&RawReader::new(self.data), ph)
    }

    /// Path named by the first PT_INTERP entry, if any.
    ///
    /// The path is taken as raw bytes up to the NUL, like the kernel does;
    /// it need not be UTF-8.
    pub fn interpreter(&self) -> ExecResult<Option<&'a Path>> {
        let Some(ph) = self.program_headers.iter().find(|ph| ph.is(PhType::Interp)) else {
            return Ok(None);
        };

        let reader = RawReader::new(self.data);
        let offset = usize::try_from(ph.file_offset)
            .map_err(|_| ExecError::InvalidFormat("interpreter path out of bounds"))?;
        let len = usize::try_from(ph.file_size)
            .map_err(|_| ExecError::InvalidFormat("interpreter path out of bounds"))?;
        let bytes = reader
            .cstr(offset, len)
            .map_err(|_| ExecError::InvalidFormat("interpreter path out of bounds"))?;

        if bytes.is_empty() {
            return Err(ExecError::InvalidFormat("empty interpreter path"));
        }
        Ok(Some(Path::new(OsStr::from_bytes(bytes))))
    }
}

fn segment_range<'a>(reader: &RawReader<'a>, ph: &ProgramHeader) -> ExecResult<&'a [u8]> {
    const OUT_OF_BOUNDS: ExecError = ExecError::InvalidFormat("segment data out of bounds");

    let offset = usize::try_from(ph.file_offset).map_err(|_| OUT_OF_BOUNDS)?;
    let len = usize::try_from(ph.file_size).map_err(|_| OUT_OF_BOUNDS)?;
    reader.bytes(offset, len).map_err(|err| {
        crate::kerror!("segment source out of range: {}", err);
        OUT_OF_BOUNDS
    })
}
