//! Virtual CPU register interface
//!
//! The loader only needs to set the instruction pointer (a VM control field
//! on VT-x, the guest RIP in the VMCS) and the stack and frame pointers. The
//! surrounding hypervisor implements [`VcpuRegisters`] on top of its vCPU
//! handle; [`VcpuState`] is a plain register file for standalone use.

/// Registers the loader reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    /// Guest instruction pointer (VMCS guest RIP field).
    Rip,
    Rflags,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VcpuError {
    #[error("register {0:?} is not accessible on this vCPU")]
    Unsupported(Register),

    #[error("vCPU {id} rejected access to {register:?}: {reason}")]
    Rejected {
        id: u32,
        register: Register,
        reason: String,
    },
}

/// Register access on one guest logical CPU.
pub trait VcpuRegisters {
    fn write_register(&mut self, register: Register, value: u64) -> Result<(), VcpuError>;
    fn read_register(&self, register: Register) -> Result<u64, VcpuError>;
}

/// x86-64 general purpose registers plus RIP/RFLAGS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl Default for VcpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl VcpuState {
    /// Reset state: all registers zero except the reserved RFLAGS bit 1.
    pub const fn new() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0x2,
        }
    }

    fn slot(&mut self, register: Register) -> &mut u64 {
        match register {
            Register::Rax => &mut self.rax,
            Register::Rbx => &mut self.rbx,
            Register::Rcx => &mut self.rcx,
            Register::Rdx => &mut self.rdx,
            Register::Rsi => &mut self.rsi,
            Register::Rdi => &mut self.rdi,
            Register::Rbp => &mut self.rbp,
            Register::Rsp => &mut self.rsp,
            Register::R8 => &mut self.r8,
            Register::R9 => &mut self.r9,
            Register::R10 => &mut self.r10,
            Register::R11 => &mut self.r11,
            Register::R12 => &mut self.r12,
            Register::R13 => &mut self.r13,
            Register::R14 => &mut self.r14,
            Register::R15 => &mut self.r15,
            Register::Rip => &mut self.rip,
            Register::Rflags => &mut self.rflags,
        }
    }
}

impl VcpuRegisters for VcpuState {
    fn write_register(&mut self, register: Register, value: u64) -> Result<(), VcpuError> {
        *self.slot(register) = value;
        Ok(())
    }

    fn read_register(&self, register: Register) -> Result<u64, VcpuError> {
        Ok(match register {
            Register::Rax => self.rax,
            Register::Rbx => self.rbx,
            Register::Rcx => self.rcx,
            Register::Rdx => self.rdx,
            Register::Rsi => self.rsi,
            Register::Rdi => self.rdi,
            Register::Rbp => self.rbp,
            Register::Rsp => self.rsp,
            Register::R8 => self.r8,
            Register::R9 => self.r9,
            Register::R10 => self.r10,
            Register::R11 => self.r11,
            Register::R12 => self.r12,
            Register::R13 => self.r13,
            Register::R14 => self.r14,
            Register::R15 => self.r15,
            Register::Rip => self.rip,
            Register::Rflags => self.rflags,
        })
    }
}
