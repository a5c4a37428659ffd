//! Transient hardware-virtualized execution of Linux binaries.
//!
//! `virtrun` boots a short-lived QEMU guest around a single executable
//! (typically a cross-compiled test binary), streams its console output
//! back to the host, and reports the binary's exit code as if it had
//! run locally. The crate plugs into build toolchains through the
//! `-exec` hook convention.
//!
//! # Quick start
//!
//! ```no_run
//! use virtrun::RunSpec;
//!
//! # async fn demo() -> virtrun::Result<()> {
//! let (_cancel, cancel_rx) = tokio::sync::oneshot::channel();
//! let code = virtrun::run(
//!     RunSpec {
//!         kernel: "/path/to/vmlinuz".into(),
//!         executable: "/path/to/test-binary".into(),
//!         standalone: true,
//!         ..RunSpec::default()
//!     },
//!     cancel_rx,
//! )
//! .await?;
//! std::process::exit(code);
//! # }
//! ```

mod console;
mod error;
mod qemu;
mod rewrite;
mod run;
mod scanner;

pub use console::{GUEST_CONSOLE_PREFIX, HostConsole, guest_path};
pub use error::{Error, Result};
pub use qemu::{Command, CommandBuilder, MEMORY_RANGE, SMP_RANGE, Transport};
pub use rewrite::{Rewrite, rewrite_test_flags};
pub use run::{RunSpec, run};
pub use scanner::{EXIT_CODE_MARKER, OutputScanner, ScanOutcome};
pub use virtrun_archive::Arch;
