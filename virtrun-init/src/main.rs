//! virtrun guest init — runs inside a transient guest as PID 1.
//!
//! Mounts the standard virtual file systems, brings up loopback, loads
//! any packed kernel modules, executes `/main`, prints the exit-code
//! marker on the console, and powers the machine off.
#![allow(unsafe_code, clippy::print_stderr, clippy::print_stdout)]

#[cfg(target_os = "linux")]
mod bridge;
#[cfg(target_os = "linux")]
mod modules;
#[cfg(target_os = "linux")]
mod mounts;
#[cfg(target_os = "linux")]
mod net;

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("virtrun-init only runs inside a Linux guest");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() {
    init::run()
}

#[cfg(target_os = "linux")]
mod init {
    use std::io::Write as _;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::process::Command;

    use crate::{bridge, modules, mounts, net};

    /// The payload binary packed next to this init.
    const MAIN: &str = "/main";

    /// Directory holding load-order prefixed kernel modules.
    const MODULE_DIR: &str = "/lib/modules";

    /// Marker line parsed by the host supervisor.
    const EXIT_CODE_MARKER: &str = "VIRTRUN_EXIT_CODE: ";

    /// Entry point for PID 1.
    pub(crate) fn run() -> ! {
        if std::process::id() != 1 {
            eprintln!("virtrun-init: must run as PID 1");
            std::process::exit(127);
        }

        mounts::mount_all();
        mounts::create_dev_symlinks();
        if let Err(e) = net::setup_loopback() {
            eprintln!("virtrun-init: loopback setup failed: {e}");
        }
        if let Err(e) = modules::load_all(Path::new(MODULE_DIR)) {
            eprintln!("virtrun-init: module loading failed: {e}");
            power_off();
        }

        let args: Vec<String> = std::env::args().skip(1).collect();
        let bridges = bridge::start_all(&args);

        let code = run_payload(&args);

        for b in bridges {
            b.finish();
        }

        println!("{EXIT_CODE_MARKER}{code}");
        let _ = std::io::stdout().flush();

        power_off();
    }

    /// Executes the payload and returns its exit code; death by signal
    /// maps to the conventional `128 + signo`.
    fn run_payload(args: &[String]) -> i32 {
        let status = Command::new(MAIN)
            .args(args)
            .env_clear()
            .env("PATH", "/data")
            .status();
        match status {
            Ok(status) => status
                .code()
                .or_else(|| status.signal().map(|sig| 128 + sig))
                .unwrap_or(1),
            Err(e) => {
                eprintln!("virtrun-init: failed to execute {MAIN}: {e}");
                127
            }
        }
    }

    /// Flushes block state and powers the machine off. Never returns.
    fn power_off() -> ! {
        unsafe {
            libc::sync();
        }
        let _ = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF);
        // The reboot syscall only returns on failure; there is nothing
        // sane left to do but park.
        loop {
            std::thread::sleep(std::time::Duration::from_secs(3600));
        }
    }
}
