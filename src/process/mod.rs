//! Guest process image loading
//!
//! Turns an ELF executable plus argv/envp into a populated guest address
//! space and initial vCPU state, the way a Linux `execve` would.
//!
//! ## Module Organization
//!
//! - `types`: layout constants and the values passed between stages
//! - `loader`: segment mapping, interpreter chaining and the exec entry points
//! - `auxv`: auxiliary vector construction
//! - `stack`: initial stack layout (argc, argv, envp, auxv, strings)
//! - `execution`: entry point and register setup

mod auxv;
mod execution;
mod loader;
mod stack;
mod types;

pub use auxv::{
    build_auxv, AuxEntry, AuxVector, AT_BASE, AT_ENTRY, AT_NULL, AT_PAGESZ, AT_PHDR, AT_PHENT,
    AT_PHNUM,
};
pub use execution::activate;
pub use loader::{exec_path, map_segments, resolve_and_chain, start_process};
pub use stack::{build_stack, ArgBlob};
pub use types::{
    page_align_down, page_offset, page_round_up, EntryDescriptor, ExecOutcome, LoadedImage,
    SegmentMapping, PAGE_SIZE,
};
