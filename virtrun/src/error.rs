//! Error types for hypervisor runs.

use std::io;
use std::path::PathBuf;

/// Alias for `Result<T, virtrun::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while configuring and supervising a guest run.
///
/// A guest that exits with a non-zero code is not an error; the code is
/// returned from [`crate::Command::run`] and becomes the host's exit
/// status.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invariants violated at command construction.
    #[error("{0}")]
    Validation(String),

    /// An input file is missing or unreadable.
    #[error("{}: {source}", .path.display())]
    File {
        /// The offending input path.
        path: PathBuf,
        /// Underlying I/O failure.
        source: io::Error,
    },

    /// Initramfs assembly or dependency resolution failed.
    #[error(transparent)]
    Archive(#[from] virtrun_archive::Error),

    /// The hypervisor process could not be started.
    #[error("failed to start {qemu}: {source}")]
    Spawn {
        /// Hypervisor executable name.
        qemu: String,
        /// Underlying spawn failure.
        source: io::Error,
    },

    /// A kernel panic marker was seen on the guest console.
    #[error("guest system panicked")]
    GuestPanic,

    /// An out-of-memory kill marker was seen on the guest console.
    #[error("guest system ran out of memory")]
    GuestOom,

    /// The hypervisor exited without an exit-code marker on the console.
    #[error("guest did not print an exit code{}", fmt_detail(.detail))]
    NoExitCode {
        /// Captured hypervisor stderr, when not forwarded.
        detail: String,
    },

    /// A mandatory console produced no output.
    #[error("{}: console output file received no data", .path.display())]
    NoOutput {
        /// Host path registered for the console.
        path: PathBuf,
    },

    /// A console worker failed while decoding or writing output.
    #[error("{}: console worker failed: {source}", .path.display())]
    Pipe {
        /// Host path registered for the console.
        path: PathBuf,
        /// Underlying failure.
        source: io::Error,
    },

    /// A console worker did not drain within the shutdown deadline.
    #[error("{}: console did not drain before the deadline", .path.display())]
    PipeWaitTimeout {
        /// Host path registered for the console.
        path: PathBuf,
    },

    /// The caller cancelled the run before an exit code was seen.
    #[error("run cancelled")]
    Cancelled,

    /// Any other I/O error during the run.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Formats the optional stderr detail appended to [`Error::NoExitCode`].
fn fmt_detail(detail: &str) -> String {
    let trimmed = detail.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}
