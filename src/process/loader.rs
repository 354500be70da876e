//! ELF loading for process creation
//!
//! Maps the main image and, when it names one, its interpreter, then hands
//! off to the auxv and stack builders. Both images go through the same
//! [`map_segments`], differing only in load bias.

use std::path::Path;

use crate::config::ExecConfig;
use crate::elf::{ElfImage, ElfType, ProgramHeader, SegmentFlags};
use crate::error::{ExecError, ExecResult};
use crate::fs::{map_file, FileAccess};
use crate::mm::{GuestMemory, MapFlags, Protection};
use crate::vcpu::VcpuRegisters;
use crate::{kdebug, kerror, kinfo, kwarn};

use super::auxv::build_auxv;
use super::execution::activate;
use super::stack::{push_initial_stack, ArgBlob};
use super::types::{
    page_align_down, page_offset, page_round_up, EntryDescriptor, ExecOutcome, LoadedImage,
    SegmentMapping,
};

fn segment_protection(flags: SegmentFlags) -> Protection {
    let mut prot = Protection::empty();
    if flags.contains(SegmentFlags::R) {
        prot |= Protection::READ;
    }
    if flags.contains(SegmentFlags::W) {
        prot |= Protection::WRITE;
    }
    if flags.contains(SegmentFlags::X) {
        prot |= Protection::EXEC;
    }
    prot
}

/// Page-aligned mapping covering `ph` once shifted by `load_bias`, plus the
/// offset of the segment's first byte inside it.
fn segment_region(ph: &ProgramHeader, load_bias: u64) -> ExecResult<(u64, u64, u64)> {
    const OVERFLOW: ExecError = ExecError::InvalidFormat("segment address overflow");

    let biased = ph.virtual_address.checked_add(load_bias).ok_or(OVERFLOW)?;
    let vaddr = page_align_down(biased);
    let offset = page_offset(biased);
    let size = ph
        .mem_size
        .checked_add(offset)
        .and_then(page_round_up)
        .ok_or(OVERFLOW)?;
    vaddr.checked_add(size).ok_or(OVERFLOW)?;
    Ok((vaddr, offset, size))
}

/// Map every PT_LOAD segment of `image` at `p_vaddr + load_bias`.
///
/// Each segment gets its own fixed anonymous mapping with the protection
/// taken from its flags; `p_filesz` bytes are copied in and the rest of
/// `p_memsz` is zeroed.
pub fn map_segments<M>(mem: &mut M, image: &ElfImage<'_>, load_bias: u64) -> ExecResult<LoadedImage>
where
    M: GuestMemory + ?Sized,
{
    let load_base = image
        .load_base()
        .ok_or(ExecError::InvalidFormat("no loadable segments"))?
        .wrapping_add(load_bias);

    // Resolve every region before the first mapping so address errors leave
    // the guest untouched.
    let mut plan = Vec::new();
    for ph in image.load_segments() {
        if ph.mem_size == 0 {
            kwarn!(
                "Skipping empty PT_LOAD at vaddr={:#x} offset={:#x}",
                ph.virtual_address,
                ph.file_offset
            );
            continue;
        }
        plan.push((ph, segment_region(ph, load_bias)?));
    }
    if plan.is_empty() {
        kerror!("Image has no non-empty PT_LOAD segments");
        return Err(ExecError::InvalidFormat("no loadable segments"));
    }

    let mut map_top = 0u64;
    let mut segments = Vec::with_capacity(plan.len());

    for (ph, (vaddr, offset, size)) in plan {
        let prot = segment_protection(ph.flags);

        kinfo!(
            "Mapping segment: vaddr={:#x} size={:#x} prot={:?} (p_vaddr={:#x} filesz={:#x} memsz={:#x})",
            vaddr,
            size,
            prot,
            ph.virtual_address,
            ph.file_size,
            ph.mem_size
        );

        mem.map(
            vaddr,
            size,
            prot,
            MapFlags::PRIVATE | MapFlags::FIXED | MapFlags::ANONYMOUS,
        )
        .map_err(|err| {
            kerror!("Failed to map segment at {:#x}: {}", vaddr, err);
            err
        })?;

        let data = image.segment_bytes(ph)?;
        mem.write_bytes(vaddr + offset, data)?;
        if ph.mem_size > ph.file_size {
            let bss = (ph.mem_size - ph.file_size) as usize;
            mem.zero_bytes(vaddr + offset + ph.file_size, bss)?;
        }

        map_top = map_top.max(vaddr + size);
        segments.push(SegmentMapping { vaddr, size, prot });
    }

    let entry_address = image.entry_virtual_address().wrapping_add(load_bias);
    kdebug!(
        "Image mapped: bias={:#x} base={:#x} top={:#x} entry={:#x}",
        load_bias,
        load_base,
        map_top,
        entry_address
    );

    Ok(LoadedImage {
        load_bias,
        load_base,
        map_top,
        entry_address,
        segments,
    })
}

/// Decide where execution starts.
///
/// Without PT_INTERP the main image runs directly. With one, the named
/// interpreter is mapped right above the main image and entered first; any
/// failure loading it is fatal.
pub fn resolve_and_chain<M, F>(
    mem: &mut M,
    files: &F,
    main_image: &ElfImage<'_>,
    main_loaded: &LoadedImage,
) -> ExecResult<EntryDescriptor>
where
    M: GuestMemory + ?Sized,
    F: FileAccess + ?Sized,
{
    let Some(path) = main_image.interpreter()? else {
        kdebug!("No PT_INTERP, entering main image directly");
        return Ok(EntryDescriptor {
            entry: main_loaded.entry_address,
            base_for_aux: 0,
            interp_present: false,
            brk_base: main_loaded.map_top,
        });
    };

    let load_bias = main_loaded.map_top;
    kinfo!("Loading interpreter {} at {:#x}", path.display(), load_bias);

    let interp = load_interpreter(mem, files, path, load_bias).map_err(|source| {
        kerror!("Failed to load interpreter {}: {}", path.display(), source);
        ExecError::InterpLoad {
            path: path.to_path_buf(),
            source: Box::new(source),
        }
    })?;

    Ok(EntryDescriptor {
        entry: interp.entry_address,
        base_for_aux: load_bias,
        interp_present: true,
        brk_base: interp.map_top,
    })
}

fn load_interpreter<M, F>(mem: &mut M, files: &F, path: &Path, load_bias: u64) -> ExecResult<LoadedImage>
where
    M: GuestMemory + ?Sized,
    F: FileAccess + ?Sized,
{
    let mapping = map_file(files, path).map_err(|source| ExecError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    // ET_EXEC and ET_DYN interpreters alike are shifted by the bias.
    let image = ElfImage::parse(&mapping)?;
    map_segments(mem, &image, load_bias)
}

/// Create the initial guest process image from an in-memory ELF executable.
///
/// On success the guest has every segment mapped, the interpreter loaded if
/// requested, the initial stack built, and RIP/RSP/RBP pointing at the
/// first instruction. On failure the guest address space is undefined and
/// must not be resumed; only [`ExecError::is_clean`] errors leave it
/// untouched.
pub fn start_process<M, V, F, A, E>(
    mem: &mut M,
    vcpu: &mut V,
    files: &F,
    config: &ExecConfig,
    elf_bytes: &[u8],
    argv: &[A],
    envp: &[E],
) -> ExecResult<ExecOutcome>
where
    M: GuestMemory + ?Sized,
    V: VcpuRegisters + ?Sized,
    F: FileAccess + ?Sized,
    A: AsRef<[u8]>,
    E: AsRef<[u8]>,
{
    config.validate()?;

    let image = ElfImage::parse(elf_bytes).map_err(|err| {
        kerror!("Rejecting executable: {}", err);
        err
    })?;

    // Malformed PT_INTERP and argument problems are reported before the
    // guest is touched.
    if let Some(path) = image.interpreter()? {
        kdebug!("Executable requests interpreter {}", path.display());
    }
    let blob = ArgBlob::new(argv, envp, config.max_arg_bytes as usize)?;

    let load_bias = match image.entry_type() {
        ElfType::Executable => 0,
        ElfType::Shared => config.dyn_load_bias,
    };

    let loaded = map_segments(mem, &image, load_bias)?;
    let entry = resolve_and_chain(mem, files, &image, &loaded)?;
    let auxv = build_auxv(&image, &loaded, &entry);
    let stack_pointer = push_initial_stack(mem, vcpu, config, &blob, &auxv)?;
    activate(vcpu, entry.entry, stack_pointer, config.stack_top)?;

    kinfo!(
        "Process image ready: entry={:#x} rsp={:#x} brk={:#x} interp={}",
        entry.entry,
        stack_pointer,
        entry.brk_base,
        entry.interp_present
    );

    Ok(ExecOutcome {
        entry: entry.entry,
        stack_pointer,
        brk_base: entry.brk_base,
        interp_present: entry.interp_present,
        auxv,
    })
}

/// Map the executable at `path` through `files` and run [`start_process`].
///
/// A file that cannot be opened or mapped is an [`ExecError::Open`] and
/// leaves the guest untouched.
pub fn exec_path<M, V, F, A, E>(
    mem: &mut M,
    vcpu: &mut V,
    files: &F,
    config: &ExecConfig,
    path: &Path,
    argv: &[A],
    envp: &[E],
) -> ExecResult<ExecOutcome>
where
    M: GuestMemory + ?Sized,
    V: VcpuRegisters + ?Sized,
    F: FileAccess + ?Sized,
    A: AsRef<[u8]>,
    E: AsRef<[u8]>,
{
    let mapping = map_file(files, path).map_err(|source| {
        kerror!("Cannot map executable {}: {}", path.display(), source);
        ExecError::Open {
            path: path.to_path_buf(),
            source,
        }
    })?;
    kdebug!("Mapped {} ({} bytes)", path.display(), mapping.len());

    start_process(mem, vcpu, files, config, &mapping, argv, envp)
}
