//! NexaOS guest exec loader
//!
//! Builds the initial process image of a Linux x86-64 guest inside a
//! hypervisor: maps the ELF segments, chains to the dynamic linker named by
//! PT_INTERP, lays out argc/argv/envp/auxv on the guest stack and points the
//! vCPU at the first instruction.
//!
//! The guest address space, vCPU register file and file source are traits
//! ([`GuestMemory`], [`VcpuRegisters`], [`FileAccess`]); the crate ships
//! in-process implementations of each.
//!
//! ```no_run
//! use nexa_exec::{exec_path, AnonymousMemory, ExecConfig, HostFiles, VcpuState};
//!
//! let mut mem = AnonymousMemory::new();
//! let mut cpu = VcpuState::new();
//! let outcome = exec_path(
//!     &mut mem,
//!     &mut cpu,
//!     &HostFiles,
//!     &ExecConfig::default(),
//!     "/bin/true".as_ref(),
//!     &["/bin/true"],
//!     &["PATH=/usr/bin"],
//! )?;
//! println!("entry {:#x}", outcome.entry);
//! # Ok::<(), nexa_exec::ExecError>(())
//! ```

#[macro_use]
pub mod logger;

pub mod config;
pub mod elf;
pub mod error;
pub mod fs;
pub mod mm;
pub mod process;
pub mod safety;
pub mod vcpu;

pub use config::ExecConfig;
pub use elf::{ElfImage, ElfType, ProgramHeader};
pub use error::{ExecError, ExecResult};
pub use fs::{FileAccess, HostFiles, MemoryFiles, OpenFile};
pub use mm::{AnonymousMemory, GuestMemory, MapError, MapFlags, Protection};
pub use process::{exec_path, start_process, ExecOutcome};
pub use vcpu::{Register, VcpuError, VcpuRegisters, VcpuState};
