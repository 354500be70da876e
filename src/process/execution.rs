//! Entry point and initial register setup

use crate::error::ExecResult;
use crate::vcpu::{Register, VcpuRegisters};

/// Point the vCPU at the loaded image.
///
/// RIP goes to `entry`, RSP to the argc slot built by the stack builder and
/// RBP to the top of the stack region, as a freshly exec'd process sees it.
pub fn activate<V: VcpuRegisters + ?Sized>(
    vcpu: &mut V,
    entry: u64,
    stack_pointer: u64,
    stack_top: u64,
) -> ExecResult<()> {
    crate::kinfo!(
        "activate: rip={:#x} rsp={:#x} rbp={:#x}",
        entry,
        stack_pointer,
        stack_top
    );
    vcpu.write_register(Register::Rip, entry).map_err(|err| {
        crate::kerror!("failed to set guest RIP: {}", err);
        err
    })?;
    vcpu.write_register(Register::Rsp, stack_pointer)?;
    vcpu.write_register(Register::Rbp, stack_top)?;
    Ok(())
}
