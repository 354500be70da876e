//! Shared fixtures for the integration tests
//!
//! Synthetic ELF64 images built in memory, and a guest memory wrapper that
//! records every mapping request.

#![allow(dead_code)]

use nexa_exec::{AnonymousMemory, GuestMemory, MapError, MapFlags, Protection};

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

struct LoadSpec {
    vaddr: u64,
    flags: u32,
    data: Vec<u8>,
    mem_size: u64,
}

/// Builds a little-endian x86-64 ELF image.
///
/// Each PT_LOAD's bytes are placed at a file offset congruent to its
/// vaddr modulo the page size, the way a linker lays them out.
pub struct ElfBuilder {
    e_type: u16,
    machine: u16,
    entry: u64,
    interp: Option<String>,
    loads: Vec<LoadSpec>,
}

impl ElfBuilder {
    pub fn exec(entry: u64) -> Self {
        Self::new(ET_EXEC, entry)
    }

    pub fn shared(entry: u64) -> Self {
        Self::new(ET_DYN, entry)
    }

    fn new(e_type: u16, entry: u64) -> Self {
        Self {
            e_type,
            machine: 0x3E,
            entry,
            interp: None,
            loads: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn interp(mut self, path: &str) -> Self {
        self.interp = Some(path.to_string());
        self
    }

    /// PT_LOAD whose file bytes are `data` and memory size `mem_size`.
    pub fn load(mut self, vaddr: u64, flags: u32, data: Vec<u8>, mem_size: u64) -> Self {
        self.loads.push(LoadSpec {
            vaddr,
            flags,
            data,
            mem_size,
        });
        self
    }

    /// PT_LOAD filled with `fill`, file size equal to memory size.
    pub fn load_filled(self, vaddr: u64, flags: u32, len: usize, fill: u8) -> Self {
        self.load(vaddr, flags, vec![fill; len], len as u64)
    }

    pub fn build(&self) -> Vec<u8> {
        let phnum = self.loads.len() + self.interp.is_some() as usize;
        let tables_end = (EHDR_SIZE + phnum * PHDR_SIZE) as u64;

        let mut out = vec![0u8; EHDR_SIZE];
        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // little endian
        out[6] = 1;
        put16(&mut out, 16, self.e_type);
        put16(&mut out, 18, self.machine);
        put32(&mut out, 20, 1);
        put64(&mut out, 24, self.entry);
        put64(&mut out, 32, EHDR_SIZE as u64);
        put16(&mut out, 52, EHDR_SIZE as u16);
        put16(&mut out, 54, PHDR_SIZE as u16);
        put16(&mut out, 56, phnum as u16);

        let mut phdrs = Vec::new();
        let mut payload: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut cursor = tables_end;

        if let Some(path) = &self.interp {
            let mut bytes = path.clone().into_bytes();
            bytes.push(0);
            phdrs.push(phdr(PT_INTERP, PF_R, cursor, 0, bytes.len() as u64, bytes.len() as u64));
            cursor += bytes.len() as u64;
            payload.push((tables_end, bytes));
        }
        for load in &self.loads {
            let offset = ((cursor + 0xfff) & !0xfff) + (load.vaddr & 0xfff);
            phdrs.push(phdr(
                PT_LOAD,
                load.flags,
                offset,
                load.vaddr,
                load.data.len() as u64,
                load.mem_size,
            ));
            cursor = offset + load.data.len() as u64;
            payload.push((offset, load.data.clone()));
        }

        for ph in phdrs {
            out.extend_from_slice(&ph);
        }
        for (offset, bytes) in payload {
            out.resize(offset as usize, 0);
            out.extend_from_slice(&bytes);
        }
        out
    }
}

fn phdr(p_type: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) -> Vec<u8> {
    let mut ph = vec![0u8; PHDR_SIZE];
    put32(&mut ph, 0, p_type);
    put32(&mut ph, 4, flags);
    put64(&mut ph, 8, offset);
    put64(&mut ph, 16, vaddr);
    put64(&mut ph, 24, vaddr);
    put64(&mut ph, 32, filesz);
    put64(&mut ph, 40, memsz);
    put64(&mut ph, 48, 0x1000);
    ph
}

fn put16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// The scenario binary: one R+X PT_LOAD at 0x400000, a page long, entry
/// at 0x400078.
pub fn static_true() -> ElfBuilder {
    ElfBuilder::exec(0x400078).load_filled(0x400000, PF_R | PF_X, 0x1000, 0x90)
}

/// A small position-independent dynamic linker image.
pub fn ld_so() -> Vec<u8> {
    ElfBuilder::shared(0x80)
        .load_filled(0, PF_R | PF_X, 0x1800, 0xcc)
        .load(0x2000, PF_R | PF_W, vec![1; 0x40], 0x1000)
        .build()
}

/// Guest memory that logs each `map` call before delegating.
#[derive(Debug, Default)]
pub struct RecordingMemory {
    pub inner: AnonymousMemory,
    pub requests: Vec<(u64, u64, Protection, MapFlags)>,
}

unsafe impl GuestMemory for RecordingMemory {
    fn map(
        &mut self,
        vaddr: u64,
        size: u64,
        prot: Protection,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        self.requests.push((vaddr, size, prot, flags));
        self.inner.map(vaddr, size, prot, flags)
    }

    fn translate(&self, vaddr: u64) -> Option<*mut u8> {
        self.inner.translate(vaddr)
    }
}

/// Read a NULL-terminated pointer table and the strings it points at.
pub fn read_string_table<M: GuestMemory>(mem: &M, mut addr: u64) -> (Vec<String>, u64) {
    let mut strings = Vec::new();
    loop {
        let ptr = mem.read_u64(addr).expect("table readable");
        addr += 8;
        if ptr == 0 {
            return (strings, addr);
        }
        let bytes = mem.read_cstr(ptr, 4096).expect("string readable");
        strings.push(String::from_utf8(bytes).expect("utf-8"));
    }
}

/// Read (tag, value) pairs up to and including AT_NULL.
pub fn read_auxv<M: GuestMemory>(mem: &M, mut addr: u64) -> Vec<(u64, u64)> {
    let mut pairs = Vec::new();
    loop {
        let tag = mem.read_u64(addr).expect("auxv readable");
        let value = mem.read_u64(addr + 8).expect("auxv readable");
        pairs.push((tag, value));
        if tag == 0 {
            return pairs;
        }
        addr += 16;
    }
}
