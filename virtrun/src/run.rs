//! Top-level glue: archive assembly, flag rewriting, and the hypervisor
//! run wired together.

use std::path::PathBuf;

use tokio::sync::oneshot;

use virtrun_archive::{Arch, InitramfsSpec, read_elf_arch};

use crate::error::{Error, Result};
use crate::qemu::{Command, Transport};
use crate::rewrite::rewrite_test_flags;

/// Everything one guest run needs.
///
/// Unset hypervisor fields fall back to per-architecture defaults; the
/// guest architecture itself defaults to what the payload's ELF header
/// declares.
#[derive(Debug, Default)]
pub struct RunSpec {
    /// Kernel image to boot.
    pub kernel: PathBuf,
    /// Guest payload binary.
    pub executable: PathBuf,
    /// Positional arguments for the payload.
    pub init_args: Vec<String>,
    /// Extra files packed under `/data`.
    pub files: Vec<PathBuf>,
    /// Kernel modules packed under `/lib/modules`.
    pub modules: Vec<PathBuf>,
    /// PID-1 stub binary; required unless `standalone` is set.
    pub init: Option<PathBuf>,
    /// Boot the payload itself as PID 1.
    pub standalone: bool,
    /// Guest architecture override.
    pub arch: Option<Arch>,
    /// Hypervisor executable override.
    pub qemu_executable: Option<String>,
    /// Machine model override.
    pub machine: Option<String>,
    /// CPU model override.
    pub cpu: Option<String>,
    /// Guest memory in MiB.
    pub memory_mib: Option<u64>,
    /// Guest CPU count.
    pub smp: Option<u64>,
    /// Console transport override.
    pub transport: Option<Transport>,
    /// Extra fixed hypervisor arguments.
    pub extra_args: Vec<String>,
    /// Disable KVM acceleration.
    pub no_kvm: bool,
    /// Verbose mode.
    pub verbose: bool,
    /// Rewrite `go test` file-output flags (on by default in the CLI).
    pub rewrite_test_flags: bool,
    /// Keep the initramfs archive instead of deleting it.
    pub keep_initramfs: bool,
}

/// Runs the payload in a transient guest and returns its exit code.
///
/// The initramfs archive is removed on every path unless
/// `keep_initramfs` was requested.
pub async fn run(spec: RunSpec, cancel: oneshot::Receiver<()>) -> Result<i32> {
    if let Err(source) = std::fs::metadata(&spec.executable) {
        return Err(Error::File {
            path: spec.executable.clone(),
            source,
        });
    }

    let arch = match spec.arch {
        Some(arch) => arch,
        None => read_elf_arch(&spec.executable)?,
    };
    tracing::debug!(%arch, executable = %spec.executable.display(), "guest architecture");

    let (init_args, consoles) = if spec.rewrite_test_flags {
        let rewritten = rewrite_test_flags(&spec.init_args);
        (rewritten.args, rewritten.consoles)
    } else {
        (spec.init_args, Vec::new())
    };

    let init = if spec.standalone {
        None
    } else {
        match spec.init {
            Some(init) => Some(init),
            None => {
                return Err(Error::Validation(
                    "an init binary is required unless running standalone".into(),
                ));
            }
        }
    };

    let archive = virtrun_archive::build(&InitramfsSpec {
        executable: spec.executable,
        files: spec.files,
        modules: spec.modules,
        init,
    })
    .await?;

    let mut builder = Command::builder()
        .arch(arch)
        .kernel(spec.kernel)
        .initramfs(&archive.path)
        .init_args(init_args)
        .extra_args(spec.extra_args)
        .consoles(consoles)
        .no_kvm(spec.no_kvm)
        .verbose(spec.verbose);
    if let Some(exe) = spec.qemu_executable {
        builder = builder.qemu_executable(exe);
    }
    if let Some(machine) = spec.machine {
        builder = builder.machine(machine);
    }
    if let Some(cpu) = spec.cpu {
        builder = builder.cpu(cpu);
    }
    if let Some(memory) = spec.memory_mib {
        builder = builder.memory_mib(memory);
    }
    if let Some(smp) = spec.smp {
        builder = builder.smp(smp);
    }
    if let Some(transport) = spec.transport {
        builder = builder.transport(transport);
    }

    let result = match builder.build() {
        Ok(command) => command.run(cancel).await,
        Err(e) => Err(e),
    };

    if spec.keep_initramfs {
        tracing::info!(path = %archive.path.display(), "initramfs kept");
    } else {
        let _ = archive.remove();
    }
    result
}
