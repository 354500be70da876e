//! exec through the host filesystem.

mod common;

use std::fs;

use common::*;
use nexa_exec::process::AT_BASE;
use nexa_exec::{exec_path, ExecConfig, ExecError, HostFiles, VcpuState};

#[test]
fn exec_path_loads_binary_and_interpreter_from_disk() {
    nexa_exec::logger::init_for_tests();

    let dir = tempfile::tempdir().unwrap();
    let interp_path = dir.path().join("ld-nexa.so");
    fs::write(&interp_path, ld_so()).unwrap();

    let interp = interp_path.to_str().unwrap();
    let binary = dir.path().join("hello");
    fs::write(&binary, static_true().interp(interp).build()).unwrap();

    let mut mem = RecordingMemory::default();
    let mut cpu = VcpuState::new();
    let outcome = exec_path(
        &mut mem,
        &mut cpu,
        &HostFiles,
        &ExecConfig::default(),
        &binary,
        &["hello", "world"],
        &["HOME=/root"],
    )
    .unwrap();

    assert!(outcome.interp_present);
    assert_eq!(outcome.entry, 0x401080);
    assert_eq!(outcome.auxv.get(AT_BASE), Some(0x401000));
    assert_eq!(cpu.rip, outcome.entry);

    let (argv, next) = read_string_table(&mem, outcome.stack_pointer + 8);
    assert_eq!(argv, ["hello", "world"]);
    let (envp, _) = read_string_table(&mem, next);
    assert_eq!(envp, ["HOME=/root"]);
}

#[test]
fn missing_binary_is_an_open_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut mem = RecordingMemory::default();
    let mut cpu = VcpuState::new();

    let err = exec_path(
        &mut mem,
        &mut cpu,
        &HostFiles,
        &ExecConfig::default(),
        &dir.path().join("absent"),
        &["absent"],
        &[] as &[&str],
    )
    .unwrap_err();

    assert!(matches!(err, ExecError::Open { .. }));
    assert!(err.is_clean());
    assert!(mem.requests.is_empty());
}

#[test]
fn empty_file_is_invalid_format() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut mem = RecordingMemory::default();
    let mut cpu = VcpuState::new();

    let err = exec_path(
        &mut mem,
        &mut cpu,
        &HostFiles,
        &ExecConfig::default(),
        file.path(),
        &["empty"],
        &[] as &[&str],
    )
    .unwrap_err();
    assert!(matches!(err, ExecError::InvalidFormat(_)));
    assert!(mem.requests.is_empty());
}
