//! CLI for running Linux binaries in short-lived QEMU guests.
//!
//! Plugs into the `go test -exec` hook convention: the first positional
//! argument is the guest binary, everything after it is handed to the
//! binary inside the guest, and the guest's exit code becomes this
//! process's exit code.

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use virtrun::{RunSpec, Transport};
use virtrun_archive::Arch;

/// Exit status used for every failure that is not a guest exit code.
const EXIT_FAILURE: i32 = 255;

#[derive(Parser)]
#[command(
    name = "virtrun",
    version,
    about = "Run a Linux binary inside a transient QEMU guest",
    arg_required_else_help = true
)]
struct Cli {
    /// Kernel image to boot.
    #[arg(long)]
    kernel: PathBuf,

    /// QEMU executable (default: qemu-system-<arch>).
    #[arg(long)]
    qemu_bin: Option<String>,

    /// Machine model (default: per architecture).
    #[arg(long)]
    machine: Option<String>,

    /// CPU model (default: host with KVM, max otherwise).
    #[arg(long)]
    cpu: Option<String>,

    /// Guest memory in MiB.
    #[arg(long, value_parser = clap::value_parser!(u64).range(128..=16384))]
    memory: Option<u64>,

    /// Guest CPU count.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=16))]
    smp: Option<u64>,

    /// Console transport: isa, pci, or mmio.
    #[arg(long)]
    transport: Option<Transport>,

    /// Disable KVM acceleration.
    #[arg(long)]
    no_kvm: bool,

    /// Keep kernel output and forward hypervisor stderr.
    #[arg(long, short)]
    verbose: bool,

    /// Boot the binary itself as PID 1 instead of the init stub.
    #[arg(long)]
    standalone: bool,

    /// Leave `go test` file-output flags untouched.
    #[arg(long)]
    no_go_test_flag_rewrite: bool,

    /// Keep the initramfs archive for inspection.
    #[arg(long)]
    keep_initramfs: bool,

    /// Init binary packed as guest PID 1 (default: discovered next to
    /// this executable).
    #[arg(long)]
    init: Option<PathBuf>,

    /// Extra file packed under /data; an empty value resets the list.
    #[arg(long = "add-file", value_name = "PATH")]
    add_file: Vec<String>,

    /// Kernel module loaded at boot; an empty value resets the list.
    #[arg(long = "add-module", value_name = "PATH")]
    add_module: Vec<String>,

    /// Binary to run in the guest.
    executable: PathBuf,

    /// Arguments passed to the guest binary.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    init_args: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse_from(argv_with_env());
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("virtrun: {e:#}");
            std::process::exit(EXIT_FAILURE);
        }
    }
}

/// Prepends `VIRTRUN_ARGS` to the argument vector so explicit
/// command-line arguments win over the environment.
fn argv_with_env() -> Vec<OsString> {
    let mut argv: Vec<OsString> = env::args_os().collect();
    if let Ok(extra) = env::var("VIRTRUN_ARGS") {
        let extra: Vec<OsString> = extra.split_whitespace().map(OsString::from).collect();
        argv.splice(1..1, extra);
    }
    argv
}

/// Installs the tracing subscriber; `RUST_LOG` wins, `-verbose` raises
/// the default level.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Builds the run spec and supervises the guest.
async fn dispatch(cli: Cli) -> Result<i32> {
    let arch = arch_override()?;
    let init = if cli.standalone {
        None
    } else {
        match cli.init {
            Some(init) => Some(init),
            None => Some(find_init(resolve_arch(arch, &cli.executable)?)?),
        }
    };

    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(());
        }
    });

    let code = virtrun::run(
        RunSpec {
            kernel: cli.kernel,
            executable: cli.executable,
            init_args: cli.init_args,
            files: collect_paths(cli.add_file),
            modules: collect_paths(cli.add_module),
            init,
            standalone: cli.standalone,
            arch,
            qemu_executable: cli.qemu_bin,
            machine: cli.machine,
            cpu: cli.cpu,
            memory_mib: cli.memory,
            smp: cli.smp,
            transport: cli.transport,
            extra_args: Vec::new(),
            no_kvm: cli.no_kvm,
            verbose: cli.verbose,
            rewrite_test_flags: !cli.no_go_test_flag_rewrite,
            keep_initramfs: cli.keep_initramfs,
        },
        cancel_rx,
    )
    .await?;
    Ok(code)
}

/// Applies the repeatable-flag reset convention: an empty value drops
/// everything accumulated so far.
fn collect_paths(values: Vec<String>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for value in values {
        if value.is_empty() {
            paths.clear();
        } else {
            paths.push(PathBuf::from(value));
        }
    }
    paths
}

/// Reads the guest architecture override from `VIRTRUN_ARCH` or
/// `GOARCH`.
fn arch_override() -> Result<Option<Arch>> {
    for var in ["VIRTRUN_ARCH", "GOARCH"] {
        if let Ok(value) = env::var(var)
            && !value.is_empty()
        {
            let arch = Arch::from_str(&value)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("parsing {var}"))?;
            return Ok(Some(arch));
        }
    }
    Ok(None)
}

/// Resolves the effective guest architecture for init discovery.
fn resolve_arch(overridden: Option<Arch>, executable: &std::path::Path) -> Result<Arch> {
    if let Some(arch) = overridden {
        return Ok(arch);
    }
    virtrun_archive::read_elf_arch(executable)
        .with_context(|| format!("reading guest architecture of {}", executable.display()))
}

/// Locates the guest init binary: `VIRTRUN_INIT`, then the
/// arch-suffixed and plain names next to this executable.
fn find_init(arch: Arch) -> Result<PathBuf> {
    if let Ok(path) = env::var("VIRTRUN_INIT")
        && !path.is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    let exe = env::current_exe().context("locating the current executable")?;
    let dir = exe.parent().unwrap_or_else(|| std::path::Path::new("."));
    for candidate in [
        dir.join(format!("virtrun-init-{arch}")),
        dir.join("virtrun-init"),
    ] {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!(
        "no init binary for {arch} next to {}; build virtrun-init for the guest \
         architecture, or pass --init or --standalone",
        dir.display()
    )
}
