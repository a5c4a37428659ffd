//! Host-side console plumbing for guest output channels.
//!
//! Each additional guest console travels over a text-mode serial
//! device, so the guest side emits base64 lines and the host side
//! decodes them back into the registered output file. The stream stays
//! line-oriented end to end; one encoded line decodes independently of
//! its neighbors.

use std::io;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};

/// Guest path prefix the flag rewriter substitutes for host output
/// files; `/dev/virtrun1` maps to additional console 1.
pub const GUEST_CONSOLE_PREFIX: &str = "/dev/virtrun";

/// One additional guest console and where its output lands on the host.
#[derive(Debug, Clone)]
pub struct HostConsole {
    /// Host file receiving the decoded console bytes.
    pub host_path: PathBuf,
    /// Whether a run that exits cleanly must have produced output here.
    pub must_produce: bool,
}

impl HostConsole {
    /// Creates a console backed by `host_path`.
    pub fn new(host_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            must_produce: false,
        }
    }
}

/// Returns the guest device path for additional console `index`.
pub fn guest_path(index: usize) -> String {
    format!("{GUEST_CONSOLE_PREFIX}{index}")
}

/// Decodes a base64-lined stream into `dest`, returning the number of
/// decoded bytes written.
///
/// Runs until the stream reaches EOF, which the supervisor arranges by
/// closing the pipe's write side once the hypervisor has exited.
pub(crate) async fn pump<R>(stream: R, dest: &Path) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut file = tokio::fs::File::create(dest).await?;
    let mut lines = BufReader::new(stream).lines();
    let mut written: u64 = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let decoded = BASE64.decode(line).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("console stream is not valid base64: {e}"),
            )
        })?;
        file.write_all(&decoded).await?;
        written += decoded.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
