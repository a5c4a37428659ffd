//! Hypervisor command assembly and run supervision.
//!
//! A [`Command`] is single-shot: construction validates the guest
//! configuration, [`Command::run`] launches the hypervisor, streams the
//! consoles, and turns the guest's exit-code marker into the host
//! result.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use virtrun_archive::Arch;

use crate::console::{self, HostConsole};
use crate::error::{Error, Result};
use crate::scanner::{OutputScanner, ScanOutcome};

/// Bounds for guest memory, in MiB.
pub const MEMORY_RANGE: std::ops::RangeInclusive<u64> = 128..=16384;

/// Bounds for the guest SMP count.
pub const SMP_RANGE: std::ops::RangeInclusive<u64> = 1..=16;

/// How long console workers may keep draining after the hypervisor has
/// exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Guest I/O transport for the console devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Transport {
    /// Legacy ISA serial ports (`/dev/ttySN`).
    Isa,
    /// Virtio consoles over PCI (`/dev/hvcN`).
    Pci,
    /// Virtio consoles over MMIO (`/dev/hvcN`).
    Mmio,
}

impl Transport {
    /// Returns the guest device name for console `index`.
    pub fn guest_device(self, index: usize) -> String {
        match self {
            Self::Isa => format!("ttyS{index}"),
            Self::Pci | Self::Mmio => format!("hvc{index}"),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Isa => "isa",
            Self::Pci => "pci",
            Self::Mmio => "mmio",
        })
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "isa" => Ok(Self::Isa),
            "pci" => Ok(Self::Pci),
            "mmio" => Ok(Self::Mmio),
            _ => Err(format!("unknown transport: {s}")),
        }
    }
}

/// Per-architecture hypervisor defaults.
const fn arch_defaults(arch: Arch) -> (&'static str, &'static str, Transport) {
    match arch {
        Arch::Amd64 => ("qemu-system-x86_64", "q35", Transport::Isa),
        Arch::Arm64 => ("qemu-system-aarch64", "virt", Transport::Pci),
        Arch::Riscv64 => ("qemu-system-riscv64", "virt", Transport::Mmio),
        _ => unreachable!(),
    }
}

/// Builder for a hypervisor [`Command`].
///
/// Unset fields fall back to per-architecture defaults.
#[derive(Debug, Default)]
#[must_use = "a CommandBuilder does nothing until .build() is called"]
pub struct CommandBuilder {
    /// Guest architecture; drives every default below.
    arch: Option<Arch>,
    /// Hypervisor executable name or path.
    qemu_executable: Option<String>,
    /// Kernel image path.
    kernel: PathBuf,
    /// Initramfs archive path.
    initramfs: PathBuf,
    /// Machine model.
    machine: Option<String>,
    /// CPU model.
    cpu: Option<String>,
    /// Guest memory in MiB.
    memory_mib: Option<u64>,
    /// Guest CPU count.
    smp: Option<u64>,
    /// Console transport.
    transport: Option<Transport>,
    /// Extra fixed hypervisor arguments, appended before `-append`.
    extra_args: Vec<String>,
    /// Positional arguments for the guest payload.
    init_args: Vec<String>,
    /// Disable KVM even when available.
    no_kvm: bool,
    /// Keep kernel output and forward hypervisor stderr.
    verbose: bool,
    /// Additional output consoles, guest index 1 onward.
    consoles: Vec<HostConsole>,
}

impl CommandBuilder {
    /// Sets the guest architecture.
    pub const fn arch(mut self, arch: Arch) -> Self {
        self.arch = Some(arch);
        self
    }

    /// Overrides the hypervisor executable.
    pub fn qemu_executable(mut self, exe: impl Into<String>) -> Self {
        self.qemu_executable = Some(exe.into());
        self
    }

    /// Sets the kernel image path.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.kernel = path.into();
        self
    }

    /// Sets the initramfs archive path.
    pub fn initramfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.initramfs = path.into();
        self
    }

    /// Overrides the machine model.
    pub fn machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }

    /// Overrides the CPU model.
    pub fn cpu(mut self, cpu: impl Into<String>) -> Self {
        self.cpu = Some(cpu.into());
        self
    }

    /// Sets guest memory in MiB (128–16384).
    pub const fn memory_mib(mut self, mib: u64) -> Self {
        self.memory_mib = Some(mib);
        self
    }

    /// Sets the guest CPU count (1–16).
    pub const fn smp(mut self, smp: u64) -> Self {
        self.smp = Some(smp);
        self
    }

    /// Overrides the console transport.
    pub const fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Appends extra fixed hypervisor arguments.
    pub fn extra_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    /// Sets the guest payload arguments.
    pub fn init_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.init_args.extend(args);
        self
    }

    /// Disables KVM acceleration.
    pub const fn no_kvm(mut self, no_kvm: bool) -> Self {
        self.no_kvm = no_kvm;
        self
    }

    /// Enables verbose mode: kernel log level untouched, hypervisor
    /// stderr forwarded.
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Registers additional output consoles, in guest index order.
    pub fn consoles(mut self, consoles: impl IntoIterator<Item = HostConsole>) -> Self {
        self.consoles.extend(consoles);
        self
    }

    /// Validates the configuration and returns the runnable [`Command`].
    pub fn build(self) -> Result<Command> {
        let arch = self
            .arch
            .ok_or_else(|| Error::Validation("guest architecture is required".into()))?;
        let (default_exe, default_machine, default_transport) = arch_defaults(arch);

        if self.kernel.as_os_str().is_empty() {
            return Err(Error::Validation("kernel image is required".into()));
        }
        if self.initramfs.as_os_str().is_empty() {
            return Err(Error::Validation("initramfs archive is required".into()));
        }

        let memory_mib = self.memory_mib.unwrap_or(256);
        if !MEMORY_RANGE.contains(&memory_mib) {
            return Err(Error::Validation(format!(
                "memory must be within {}..={} MiB, got {memory_mib}",
                MEMORY_RANGE.start(),
                MEMORY_RANGE.end()
            )));
        }
        let smp = self.smp.unwrap_or(1);
        if !SMP_RANGE.contains(&smp) {
            return Err(Error::Validation(format!(
                "smp must be within {}..={}, got {smp}",
                SMP_RANGE.start(),
                SMP_RANGE.end()
            )));
        }

        let machine = self.machine.unwrap_or_else(|| default_machine.to_owned());
        let transport = self.transport.unwrap_or(default_transport);
        let use_kvm = !self.no_kvm && arch.kvm_available();
        let cpu = self
            .cpu
            .unwrap_or_else(|| if use_kvm { "host" } else { "max" }.to_owned());

        check_machine_transport(&machine, transport, self.consoles.len())?;

        Ok(Command {
            qemu_executable: self
                .qemu_executable
                .unwrap_or_else(|| default_exe.to_owned()),
            kernel: self.kernel,
            initramfs: self.initramfs,
            machine,
            cpu,
            memory_mib,
            smp,
            transport,
            extra_args: self.extra_args,
            init_args: self.init_args,
            use_kvm,
            verbose: self.verbose,
            consoles: self.consoles,
        })
    }
}

/// Rejects machine/transport combinations the hypervisor cannot wire.
fn check_machine_transport(
    machine: &str,
    transport: Transport,
    additional_consoles: usize,
) -> Result<()> {
    let base = machine.split(',').next().unwrap_or(machine);
    let is_virt = base == "virt" || base.starts_with("virt-");
    match transport {
        Transport::Pci if base == "microvm" => Err(Error::Validation(
            "machine microvm does not support the pci transport".into(),
        )),
        Transport::Isa if base == "microvm" && additional_consoles > 0 => Err(Error::Validation(
            "machine microvm supports only a single isa serial console".into(),
        )),
        Transport::Isa if is_virt => Err(Error::Validation(
            "machine virt does not support the isa transport".into(),
        )),
        Transport::Mmio if base == "q35" || base == "pc" => Err(Error::Validation(format!(
            "machine {base} does not support the mmio transport"
        ))),
        _ => Ok(()),
    }
}

/// A validated, single-shot hypervisor invocation.
#[derive(Debug)]
pub struct Command {
    /// Hypervisor executable.
    qemu_executable: String,
    /// Kernel image path.
    kernel: PathBuf,
    /// Initramfs archive path.
    initramfs: PathBuf,
    /// Machine model.
    machine: String,
    /// CPU model.
    cpu: String,
    /// Guest memory in MiB.
    memory_mib: u64,
    /// Guest CPU count.
    smp: u64,
    /// Console transport.
    transport: Transport,
    /// Extra fixed hypervisor arguments.
    extra_args: Vec<String>,
    /// Guest payload arguments.
    init_args: Vec<String>,
    /// Whether `-enable-kvm` is passed.
    use_kvm: bool,
    /// Verbose mode.
    verbose: bool,
    /// Additional output consoles.
    consoles: Vec<HostConsole>,
}

impl Command {
    /// Returns a fresh [`CommandBuilder`].
    pub fn builder() -> CommandBuilder {
        CommandBuilder::default()
    }

    /// Path of the host FIFO backing additional console `index`.
    fn fifo_path(dir: &Path, index: usize) -> PathBuf {
        dir.join(format!("console{index}"))
    }

    /// Assembles the kernel command line.
    fn kernel_cmdline(&self) -> String {
        let mut parts = vec![
            format!("console={}", self.transport.guest_device(0)),
            "panic=-1".to_owned(),
        ];
        if !self.verbose {
            parts.push("loglevel=0".to_owned());
        }
        if !self.init_args.is_empty() {
            parts.push("--".to_owned());
            parts.extend(self.init_args.iter().cloned());
        }
        parts.join(" ")
    }

    /// Emits the chardev/device pairs for every console.
    fn console_args(&self, args: &mut Vec<OsString>, fifo_dir: &Path) {
        match self.transport {
            Transport::Isa => {}
            Transport::Pci => {
                args.push("-device".into());
                args.push("virtio-serial-pci".into());
            }
            Transport::Mmio => {
                args.push("-device".into());
                args.push("virtio-serial-device".into());
            }
        }
        for index in 0..=self.consoles.len() {
            args.push("-chardev".into());
            if index == 0 {
                args.push("stdio,id=c0".into());
            } else {
                let mut chardev = OsString::from(format!("pipe,id=c{index},path="));
                chardev.push(Self::fifo_path(fifo_dir, index));
                args.push(chardev);
            }
            match self.transport {
                Transport::Isa => {
                    args.push("-serial".into());
                    args.push(format!("chardev:c{index}").into());
                }
                Transport::Pci | Transport::Mmio => {
                    args.push("-device".into());
                    args.push(format!("virtconsole,chardev=c{index}").into());
                }
            }
        }
    }

    /// Builds the full hypervisor argument vector.
    fn build_args(&self, fifo_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        args.push("-kernel".into());
        args.push(self.kernel.clone().into());
        args.push("-initrd".into());
        args.push(self.initramfs.clone().into());
        args.push("-machine".into());
        args.push(self.machine.clone().into());
        args.push("-cpu".into());
        args.push(self.cpu.clone().into());
        args.push("-smp".into());
        args.push(self.smp.to_string().into());
        args.push("-m".into());
        args.push(self.memory_mib.to_string().into());
        for fixed in [
            "-display",
            "none",
            "-monitor",
            "none",
            "-no-reboot",
            "-nodefaults",
            "-no-user-config",
        ] {
            args.push(fixed.into());
        }
        if self.use_kvm {
            args.push("-enable-kvm".into());
        }
        self.console_args(&mut args, fifo_dir);
        for extra in &self.extra_args {
            args.push(extra.clone().into());
        }
        args.push("-append".into());
        args.push(self.kernel_cmdline().into());
        args
    }

    /// Launches the hypervisor and supervises the run to completion.
    ///
    /// Returns the guest's exit code as soon as the marker has been
    /// parsed and every console has drained. `cancel` terminates the
    /// hypervisor early; a cancelled run still drains its consoles and
    /// still honors an exit marker that already arrived.
    pub async fn run(self, cancel: oneshot::Receiver<()>) -> Result<i32> {
        for path in [&self.kernel, &self.initramfs] {
            if let Err(source) = std::fs::metadata(path) {
                return Err(Error::File {
                    path: path.clone(),
                    source,
                });
            }
        }

        let fifo_dir = tempfile::tempdir()?;
        let mut receivers = Vec::with_capacity(self.consoles.len());
        let mut write_guards = Vec::with_capacity(self.consoles.len());
        for index in 1..=self.consoles.len() {
            let path = Self::fifo_path(fifo_dir.path(), index);
            nix::unistd::mkfifo(
                &path,
                nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR,
            )
            .map_err(|e| Error::Io(e.into()))?;
            receivers.push(pipe::OpenOptions::new().open_receiver(&path)?);
            // Holding a write end keeps the reader from seeing EOF until
            // the hypervisor has exited and this guard is dropped.
            write_guards.push(pipe::OpenOptions::new().open_sender(&path)?);
        }

        let args = self.build_args(fifo_dir.path());
        tracing::debug!(qemu = %self.qemu_executable, ?args, "starting hypervisor");

        let mut child = tokio::process::Command::new(&self.qemu_executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                qemu: self.qemu_executable.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Io(std::io::Error::other("hypervisor stdout not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            Error::Io(std::io::Error::other("hypervisor stderr not captured"))
        })?;

        let scan_task = tokio::spawn(scan_stdout(stdout));
        let stderr_task = tokio::spawn(relay_stderr(stderr, self.verbose));
        let console_tasks: Vec<(HostConsole, JoinHandle<std::io::Result<u64>>)> = self
            .consoles
            .iter()
            .cloned()
            .zip(receivers)
            .map(|(console, rx)| {
                let dest = console.host_path.clone();
                (
                    console,
                    tokio::spawn(async move { console::pump(rx, &dest).await }),
                )
            })
            .collect();

        // A dropped sender must not read as cancellation.
        let cancel = async move {
            if cancel.await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::pin!(cancel);

        let mut cancelled = false;
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                tracing::debug!(?status, "hypervisor exited");
            }
            () = &mut cancel => {
                cancelled = true;
            }
        }
        if cancelled {
            tracing::debug!("cancellation requested, killing hypervisor");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        // Release the host's write ends so console readers reach EOF.
        drop(write_guards);

        let scan = join_worker(scan_task).await?;
        let stderr_buf = join_worker(stderr_task).await?;
        let mut console_bytes = Vec::with_capacity(console_tasks.len());
        for (console, mut task) in console_tasks {
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
                Err(_) => {
                    task.abort();
                    return Err(Error::PipeWaitTimeout {
                        path: console.host_path,
                    });
                }
                Ok(Err(join)) => return Err(Error::Io(std::io::Error::other(join))),
                Ok(Ok(Err(source))) => {
                    return Err(Error::Pipe {
                        path: console.host_path,
                        source,
                    });
                }
                Ok(Ok(Ok(bytes))) => console_bytes.push((console, bytes)),
            }
        }

        evaluate(scan, &console_bytes, cancelled, &stderr_buf)
    }
}

/// Joins one supervised worker with the drain deadline applied.
async fn join_worker<T>(mut task: JoinHandle<std::io::Result<T>>) -> Result<T> {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Err(_) => {
            task.abort();
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "hypervisor output stream did not drain before the deadline",
            )))
        }
        Ok(Err(join)) => Err(Error::Io(std::io::Error::other(join))),
        Ok(Ok(res)) => res.map_err(Error::Io),
    }
}

/// Turns the scan findings and console accounting into the final result.
fn evaluate(
    scan: ScanOutcome,
    consoles: &[(HostConsole, u64)],
    cancelled: bool,
    stderr: &[u8],
) -> Result<i32> {
    if scan.panic {
        return Err(Error::GuestPanic);
    }
    if scan.oom {
        return Err(Error::GuestOom);
    }
    match scan.exit_code {
        Some(code) => {
            if code == 0
                && let Some((console, _)) = consoles
                    .iter()
                    .find(|(console, bytes)| console.must_produce && *bytes == 0)
            {
                return Err(Error::NoOutput {
                    path: console.host_path.clone(),
                });
            }
            Ok(code)
        }
        None if cancelled => Err(Error::Cancelled),
        None => Err(Error::NoExitCode {
            detail: String::from_utf8_lossy(stderr).into_owned(),
        }),
    }
}

/// Scans hypervisor stdout, forwarding guest output to the host's
/// stdout while watching for the exit and fatal markers.
async fn scan_stdout<R>(stream: R) -> std::io::Result<ScanOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut scanner = OutputScanner::new();
    let mut host_stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        if !scanner.scan_line(&line) {
            host_stdout.write_all(line.as_bytes()).await?;
            host_stdout.write_all(b"\n").await?;
        }
    }
    host_stdout.flush().await?;
    Ok(scanner.outcome())
}

/// Relays hypervisor stderr: forwarded verbatim in verbose mode,
/// captured for error reporting otherwise.
async fn relay_stderr<R>(mut stream: R, forward: bool) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    if forward {
        let mut host_stderr = tokio::io::stderr();
        tokio::io::copy(&mut stream, &mut host_stderr).await?;
        host_stderr.flush().await?;
        Ok(Vec::new())
    } else {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}
