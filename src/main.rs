//! nexa-exec - guest exec dry run
//!
//! Loads an ELF executable into in-process guest memory exactly as the
//! hypervisor would at exec time and prints the resulting layout.
//! Usage: nexa-exec [OPTIONS] <ELF> [ARGS...]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use nexa_exec::process::{AT_BASE, AT_ENTRY, AT_PAGESZ, AT_PHDR, AT_PHENT, AT_PHNUM};
use nexa_exec::{exec_path, logger, AnonymousMemory, ExecConfig, HostFiles, VcpuState};

struct Options {
    config: Option<PathBuf>,
    env: Vec<String>,
    inherit_env: bool,
    path: PathBuf,
    args: Vec<String>,
}

fn main() -> ExitCode {
    logger::init();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => return ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err);
            print_usage();
            return ExitCode::from(2);
        }
    };

    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

fn parse_args(args: &[String]) -> anyhow::Result<Option<Options>> {
    let mut config = None;
    let mut env = Vec::new();
    let mut inherit_env = false;

    let mut i = 1;
    while i < args.len() && args[i].starts_with('-') {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("nexa-exec {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "-c" | "--config" => {
                i += 1;
                let Some(path) = args.get(i) else {
                    bail!("{} requires a file argument", args[i - 1]);
                };
                config = Some(PathBuf::from(path));
            }
            "-e" | "--env" => {
                i += 1;
                let Some(entry) = args.get(i) else {
                    bail!("{} requires KEY=VALUE", args[i - 1]);
                };
                if !entry.contains('=') {
                    bail!("environment entry {:?} is not KEY=VALUE", entry);
                }
                env.push(entry.clone());
            }
            "-i" | "--inherit-env" => inherit_env = true,
            "--" => {
                i += 1;
                break;
            }
            other => bail!("unknown option: {}", other),
        }
        i += 1;
    }

    let Some(path) = args.get(i) else {
        bail!("missing executable path");
    };

    // argv[0] is the path as given, like a shell would pass it.
    let args = args[i..].to_vec();
    Ok(Some(Options {
        config,
        env,
        inherit_env,
        path: PathBuf::from(path),
        args,
    }))
}

fn run(options: Options) -> anyhow::Result<()> {
    let config = match &options.config {
        Some(path) => ExecConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ExecConfig::default(),
    };

    let mut envp: Vec<String> = Vec::new();
    if options.inherit_env {
        envp.extend(std::env::vars().map(|(k, v)| format!("{}={}", k, v)));
    }
    envp.extend(options.env);

    let mut mem = AnonymousMemory::new();
    let mut cpu = VcpuState::new();
    let outcome = exec_path(
        &mut mem,
        &mut cpu,
        &HostFiles,
        &config,
        &options.path,
        &options.args,
        &envp,
    )
    .with_context(|| format!("exec {}", options.path.display()))?;

    println!("Executable:   {}", options.path.display());
    println!("Entry:        {:#018x}", outcome.entry);
    println!("Stack:        {:#018x}", outcome.stack_pointer);
    println!("Program break:{:#018x}", outcome.brk_base);
    println!("Interpreter:  {}", if outcome.interp_present { "yes" } else { "no" });

    println!();
    println!("{:<20} {:<20} {}", "START", "END", "PROT");
    for mapping in mem.mappings() {
        println!(
            "{:#018x}   {:#018x}   {:?}",
            mapping.start(),
            mapping.end(),
            mapping.protection()
        );
    }

    println!();
    println!("{:<12} {}", "AUXV", "VALUE");
    for entry in outcome.auxv.body() {
        println!("{:<12} {:#x}", aux_name(entry.tag), entry.value);
    }

    Ok(())
}

fn aux_name(tag: u64) -> String {
    match tag {
        AT_PHDR => "AT_PHDR".into(),
        AT_PHENT => "AT_PHENT".into(),
        AT_PHNUM => "AT_PHNUM".into(),
        AT_PAGESZ => "AT_PAGESZ".into(),
        AT_BASE => "AT_BASE".into(),
        AT_ENTRY => "AT_ENTRY".into(),
        other => format!("AT_{}", other),
    }
}

fn print_usage() {
    println!(
        r#"nexa-exec - load a Linux x86-64 executable into guest memory

USAGE:
    nexa-exec [OPTIONS] <ELF> [ARGS...]

OPTIONS:
    -c, --config <FILE>     Loader configuration (TOML)
    -e, --env <KEY=VALUE>   Add an environment entry (repeatable)
    -i, --inherit-env       Pass the host environment to the guest
    -h, --help              Show this help
    -V, --version           Show version

ENVIRONMENT:
    RUST_LOG                Log filter (default: nexa_exec=info)"#
    );
}
