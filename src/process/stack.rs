//! Initial guest stack
//!
//! Builds the startup stack a Linux x86-64 C runtime reads at its entry
//! point. From the final RSP upwards:
//!
//! ```text
//! rsp ->  argc
//!         argv[0] .. argv[argc-1], 0
//!         envp[0] .. envp[n-1], 0
//!         auxv (tag, value) pairs .. (AT_NULL, 0)
//!         [8 bytes padding when needed for 16-byte RSP alignment]
//!         argv strings, envp strings (NUL-terminated, contiguous)
//! stack_top
//! ```
//!
//! Every push lowers the guest RSP by its size rounded up to 8 bytes.

use core::ops::Range;

use crate::config::ExecConfig;
use crate::error::{ExecError, ExecResult};
use crate::mm::{GuestMemory, MapFlags, Protection};
use crate::vcpu::{Register, VcpuRegisters};

use super::auxv::AuxVector;

/// argv and envp strings packed back to back, each with its NUL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgBlob {
    bytes: Vec<u8>,
    /// Byte ranges of each argv string, terminator excluded.
    argv: Vec<Range<usize>>,
    /// Byte ranges of each envp string, terminator excluded.
    envp: Vec<Range<usize>>,
    args_len: usize,
}

impl ArgBlob {
    /// Pack `argv` then `envp`.
    ///
    /// The total size is computed and checked against `max_len` before the
    /// buffer is allocated. Strings with an interior NUL are rejected since
    /// the guest would see them truncated.
    pub fn new<A, E>(argv: &[A], envp: &[E], max_len: usize) -> ExecResult<Self>
    where
        A: AsRef<[u8]>,
        E: AsRef<[u8]>,
    {
        let strings = || {
            argv.iter()
                .map(AsRef::<[u8]>::as_ref)
                .chain(envp.iter().map(AsRef::<[u8]>::as_ref))
        };

        let mut total = 0usize;
        for s in strings() {
            if let Some(pos) = s.iter().position(|&b| b == 0) {
                return Err(ExecError::InvalidArgument(format!(
                    "string {:?} contains a NUL byte at offset {}",
                    String::from_utf8_lossy(s),
                    pos
                )));
            }
            total = total
                .checked_add(s.len() + 1)
                .ok_or(ExecError::ArgumentsTooLarge {
                    size: usize::MAX,
                    max: max_len,
                })?;
        }
        if total > max_len {
            crate::kerror!(
                "argument strings need {} bytes, limit is {}",
                total,
                max_len
            );
            return Err(ExecError::ArgumentsTooLarge {
                size: total,
                max: max_len,
            });
        }

        let mut bytes = Vec::with_capacity(total);
        let mut pack = |s: &[u8]| {
            let start = bytes.len();
            bytes.extend_from_slice(s);
            bytes.push(0);
            start..start + s.len()
        };
        let argv: Vec<_> = argv.iter().map(|s| pack(s.as_ref())).collect();
        let envp: Vec<_> = envp.iter().map(|s| pack(s.as_ref())).collect();
        let args_len = argv.last().map_or(0, |r| r.end + 1);

        Ok(Self {
            bytes,
            argv,
            envp,
            args_len,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes taken by the argv strings; envp strings start here.
    pub fn args_len(&self) -> usize {
        self.args_len
    }

    pub fn argc(&self) -> usize {
        self.argv.len()
    }

    pub fn envc(&self) -> usize {
        self.envp.len()
    }

    /// NUL-terminated string starting at `offset`.
    fn string_at(&self, offset: usize) -> &[u8] {
        let tail = &self.bytes[offset..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        &tail[..end]
    }
}

/// Pushes onto the guest stack through the vCPU's RSP.
struct GuestStackBuilder<'a, M: ?Sized, V: ?Sized> {
    mem: &'a mut M,
    vcpu: &'a mut V,
    /// Current RSP.
    cursor: u64,
    /// Lowest usable address of the stack region.
    lower_bound: u64,
}

impl<'a, M, V> GuestStackBuilder<'a, M, V>
where
    M: GuestMemory + ?Sized,
    V: VcpuRegisters + ?Sized,
{
    /// Map the stack region and point RSP/RBP at its top.
    fn new(mem: &'a mut M, vcpu: &'a mut V, config: &ExecConfig) -> ExecResult<Self> {
        let base = config.stack_base();
        mem.map(
            base,
            config.stack_size,
            Protection::READ | Protection::WRITE,
            MapFlags::PRIVATE | MapFlags::FIXED | MapFlags::ANONYMOUS,
        )?;
        vcpu.write_register(Register::Rsp, config.stack_top)?;
        vcpu.write_register(Register::Rbp, config.stack_top)?;

        crate::kdebug!("stack mapped at {:#x}..{:#x}", base, config.stack_top);

        Ok(Self {
            mem,
            vcpu,
            cursor: config.stack_top,
            lower_bound: base,
        })
    }

    /// Lower RSP by `roundup(n, 8)` and store `n` bytes of `data`, or zeros.
    fn push(&mut self, data: Option<&[u8]>, n: usize) -> ExecResult<u64> {
        let size = (n as u64)
            .checked_add(7)
            .map(|v| v & !7)
            .ok_or(ExecError::StackOverflow)?;
        let rsp = self
            .cursor
            .checked_sub(size)
            .filter(|&rsp| rsp >= self.lower_bound)
            .ok_or_else(|| {
                crate::kerror!("initial stack overflow pushing {} bytes", n);
                ExecError::StackOverflow
            })?;

        self.cursor = rsp;
        self.vcpu.write_register(Register::Rsp, rsp)?;

        match data {
            Some(bytes) => self.mem.write_bytes(rsp, &bytes[..n])?,
            None => self.mem.zero_bytes(rsp, n)?,
        }
        crate::ktrace!("push {:#x} bytes -> rsp={:#x}", n, rsp);
        Ok(rsp)
    }

    fn push_u64(&mut self, value: u64) -> ExecResult<u64> {
        self.push(Some(&value.to_le_bytes()), 8)
    }
}

/// Build the initial stack and return the resulting RSP.
///
/// Maps the configured stack region first, so it must not already be mapped.
/// An invalid `config` is rejected before anything is mapped.
pub fn build_stack<M, V, A, E>(
    mem: &mut M,
    vcpu: &mut V,
    config: &ExecConfig,
    argv: &[A],
    envp: &[E],
    aux: &AuxVector,
) -> ExecResult<u64>
where
    M: GuestMemory + ?Sized,
    V: VcpuRegisters + ?Sized,
    A: AsRef<[u8]>,
    E: AsRef<[u8]>,
{
    config.validate()?;
    let blob = ArgBlob::new(argv, envp, config.max_arg_bytes as usize)?;
    push_initial_stack(mem, vcpu, config, &blob, aux)
}

pub(crate) fn push_initial_stack<M, V>(
    mem: &mut M,
    vcpu: &mut V,
    config: &ExecConfig,
    blob: &ArgBlob,
    aux: &AuxVector,
) -> ExecResult<u64>
where
    M: GuestMemory + ?Sized,
    V: VcpuRegisters + ?Sized,
{
    let mut stack = GuestStackBuilder::new(mem, vcpu, config)?;

    let args_start = stack.push(Some(blob.bytes()), blob.len())?;
    let args_end = args_start + blob.args_len() as u64;
    let env_end = args_start + blob.len() as u64;

    // argc, both pointer tables with their terminators, and the auxv pairs
    // are all 8-byte words; pad once so the final RSP is 16-byte aligned.
    let words = 2 * aux.entries().len() + blob.envc() + blob.argc() + 3;
    if (args_start - 8 * words as u64) % 16 != 0 {
        stack.push(None, 8)?;
    }

    // AT_NULL terminator first, then the entries last to first so they read
    // in order from low to high addresses.
    stack.push(None, 16)?;
    for entry in aux.body().iter().rev() {
        stack.push_u64(entry.value)?;
        stack.push_u64(entry.tag)?;
    }

    stack.push(None, 8)?;
    let mut ptr = env_end;
    for range in blob.envp.iter().rev() {
        ptr -= range.len() as u64 + 1;
        stack.push_u64(ptr)?;
        check_round_trip(blob, ptr - args_start, range);
    }

    stack.push(None, 8)?;
    let mut ptr = args_end;
    for range in blob.argv.iter().rev() {
        ptr -= range.len() as u64 + 1;
        stack.push_u64(ptr)?;
        check_round_trip(blob, ptr - args_start, range);
    }

    let rsp = stack.push_u64(blob.argc() as u64)?;

    crate::kdebug!(
        "initial stack: rsp={:#x} argc={} envc={} auxc={} strings={:#x}..{:#x}",
        rsp,
        blob.argc(),
        blob.envc(),
        aux.body().len(),
        args_start,
        env_end
    );
    Ok(rsp)
}

/// The pointer computed walking back from the end of a table must land on
/// the string packed there walking forward. A mismatch is an arithmetic bug.
fn check_round_trip(blob: &ArgBlob, offset: u64, expected: &Range<usize>) {
    let offset = offset as usize;
    assert_eq!(
        offset, expected.start,
        "stack string pointer does not match packed offset"
    );
    assert_eq!(
        blob.string_at(offset),
        &blob.bytes[expected.clone()],
        "stack string round trip mismatch"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::AnonymousMemory;
    use crate::process::auxv::{AuxEntry, AT_ENTRY, AT_NULL, AT_PAGESZ};
    use crate::vcpu::VcpuState;

    fn small_config() -> ExecConfig {
        ExecConfig {
            stack_top: 0x7000_0000,
            stack_size: 0x10000,
            max_arg_bytes: 0x4000,
            ..ExecConfig::default()
        }
    }

    fn read_table(mem: &AnonymousMemory, mut addr: u64) -> (Vec<Vec<u8>>, u64) {
        let mut strings = Vec::new();
        loop {
            let ptr = mem.read_u64(addr).unwrap();
            addr += 8;
            if ptr == 0 {
                return (strings, addr);
            }
            strings.push(mem.read_cstr(ptr, 4096).unwrap());
        }
    }

    #[test]
    fn blob_packs_argv_then_envp() {
        let blob = ArgBlob::new(&["/bin/true", "-v"], &["PATH=/usr/bin"], 4096).unwrap();
        assert_eq!(blob.bytes(), b"/bin/true\0-v\0PATH=/usr/bin\0");
        assert_eq!(blob.args_len(), 13);
        assert_eq!(blob.argc(), 2);
        assert_eq!(blob.envc(), 1);
    }

    #[test]
    fn blob_rejects_oversized_or_nul_strings() {
        let err = ArgBlob::new(&["x".repeat(100)], &[] as &[&str], 64).unwrap_err();
        assert!(matches!(err, ExecError::ArgumentsTooLarge { size: 101, max: 64 }));

        let err = ArgBlob::new(&["a\0b"], &[] as &[&str], 64).unwrap_err();
        assert!(matches!(err, ExecError::InvalidArgument(_)));
    }

    #[test]
    fn stack_layout_round_trip() {
        let mut mem = AnonymousMemory::new();
        let mut cpu = VcpuState::new();
        let config = small_config();
        let aux = AuxVector::new([
            AuxEntry::new(AT_PAGESZ, 4096),
            AuxEntry::new(AT_ENTRY, 0x400078),
        ]);

        let argv = ["/bin/echo", "hello", "world"];
        let envp = ["PATH=/usr/bin", "HOME=/root"];
        let rsp = build_stack(&mut mem, &mut cpu, &config, &argv, &envp, &aux).unwrap();

        assert_eq!(cpu.rsp, rsp);
        assert_eq!(cpu.rbp, config.stack_top);
        assert_eq!(rsp % 16, 0);

        assert_eq!(mem.read_u64(rsp).unwrap(), 3);
        let (args, next) = read_table(&mem, rsp + 8);
        assert_eq!(args, vec![b"/bin/echo".to_vec(), b"hello".to_vec(), b"world".to_vec()]);
        let (env, next) = read_table(&mem, next);
        assert_eq!(env, vec![b"PATH=/usr/bin".to_vec(), b"HOME=/root".to_vec()]);

        let pairs: Vec<(u64, u64)> = (0..3)
            .map(|i| {
                let at = next + i * 16;
                (mem.read_u64(at).unwrap(), mem.read_u64(at + 8).unwrap())
            })
            .collect();
        assert_eq!(pairs, vec![(AT_PAGESZ, 4096), (AT_ENTRY, 0x400078), (AT_NULL, 0)]);
    }

    #[test]
    fn empty_argv_and_envp() {
        let mut mem = AnonymousMemory::new();
        let mut cpu = VcpuState::new();
        let config = small_config();
        let aux = AuxVector::new([]);

        let none: [&str; 0] = [];
        let rsp = build_stack(&mut mem, &mut cpu, &config, &none, &none, &aux).unwrap();
        assert_eq!(rsp % 16, 0);
        assert_eq!(mem.read_u64(rsp).unwrap(), 0);
        assert_eq!(mem.read_u64(rsp + 8).unwrap(), 0);
        assert_eq!(mem.read_u64(rsp + 16).unwrap(), 0);
        assert_eq!(mem.read_u64(rsp + 24).unwrap(), AT_NULL);
    }

    #[test]
    fn stack_overflow_is_reported() {
        let mut mem = AnonymousMemory::new();
        let mut cpu = VcpuState::new();
        let config = ExecConfig {
            stack_top: 0x7000_0000,
            stack_size: 0x1000,
            max_arg_bytes: 0x800,
            ..ExecConfig::default()
        };
        let argv: Vec<String> = (0..200).map(|i| format!("{}", i)).collect();
        let err = build_stack(&mut mem, &mut cpu, &config, &argv, &[] as &[&str], &AuxVector::new([]))
            .unwrap_err();
        assert!(matches!(err, ExecError::StackOverflow));
    }

    #[test]
    fn stack_larger_than_address_space_is_a_config_error() {
        let mut mem = AnonymousMemory::new();
        let mut cpu = VcpuState::new();
        let config = ExecConfig {
            stack_top: 0x1000,
            stack_size: 0x10000,
            max_arg_bytes: 0x800,
            ..ExecConfig::default()
        };
        let err = build_stack(&mut mem, &mut cpu, &config, &["a"], &["b"], &AuxVector::new([]))
            .unwrap_err();
        assert!(matches!(err, ExecError::Config(_)));
        assert_eq!(mem.mappings().count(), 0);
    }

    #[test]
    fn stack_region_must_be_free() {
        let mut mem = AnonymousMemory::new();
        let mut cpu = VcpuState::new();
        let config = small_config();
        mem.map(
            config.stack_base(),
            0x1000,
            Protection::READ,
            MapFlags::PRIVATE | MapFlags::FIXED | MapFlags::ANONYMOUS,
        )
        .unwrap();
        let err = build_stack(&mut mem, &mut cpu, &config, &["a"], &["b"], &AuxVector::new([]))
            .unwrap_err();
        assert!(matches!(err, ExecError::Map(_)));
    }
}
