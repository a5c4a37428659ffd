//! Guest-side console bridges.
//!
//! The host rewrites file-output flags to synthetic `/dev/virtrunN`
//! paths. For each such path this module creates a FIFO and a thread
//! that encodes whatever the payload writes into base64 lines on the
//! matching serial console, keeping binary data clear of the text-mode
//! device. The host decodes the lines back into the original file.

use std::collections::BTreeSet;
use std::io::{Read as _, Write as _};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Path prefix the host flag rewriter substitutes.
const GUEST_CONSOLE_PREFIX: &str = "/dev/virtrun";

/// Bytes encoded per base64 line.
const CHUNK: usize = 3072;

/// Poll interval while the FIFO has no writer or no data.
const IDLE: Duration = Duration::from_millis(10);

/// A running console bridge.
pub struct Bridge {
    /// Signals the encoder thread that the payload has exited.
    shutdown: Arc<AtomicBool>,
    /// The encoder thread.
    handle: std::thread::JoinHandle<()>,
}

impl Bridge {
    /// Flags shutdown and waits for the encoder to drain the FIFO.
    pub fn finish(self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.handle.join();
    }
}

/// Extracts the console indexes referenced by the payload arguments.
fn console_indexes(args: &[String]) -> BTreeSet<usize> {
    let mut indexes = BTreeSet::new();
    for arg in args {
        if let Some(at) = arg.find(GUEST_CONSOLE_PREFIX) {
            let digits: String = arg[at + GUEST_CONSOLE_PREFIX.len()..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            if let Ok(index) = digits.parse::<usize>()
                && index > 0
            {
                indexes.insert(index);
            }
        }
    }
    indexes
}

/// Picks the console device for `index`: the virtio console when the
/// transport provides one, the ISA serial port otherwise.
fn console_device(index: usize) -> Option<PathBuf> {
    for candidate in [format!("/dev/hvc{index}"), format!("/dev/ttyS{index}")] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Creates a FIFO and encoder thread for every console the payload
/// arguments reference. Must run before the payload starts.
pub fn start_all(args: &[String]) -> Vec<Bridge> {
    let mut bridges = Vec::new();
    for index in console_indexes(args) {
        let fifo = PathBuf::from(format!("{GUEST_CONSOLE_PREFIX}{index}"));
        if let Err(e) = nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::from_bits_truncate(0o666))
        {
            eprintln!("virtrun-init: mkfifo {}: {e}", fifo.display());
            continue;
        }
        let Some(device) = console_device(index) else {
            eprintln!("virtrun-init: no console device for index {index}");
            continue;
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            if let Err(e) = encode_stream(&fifo, &device, &flag) {
                eprintln!("virtrun-init: console bridge {}: {e}", device.display());
            }
        });
        bridges.push(Bridge { shutdown, handle });
    }
    bridges
}

/// Pumps FIFO bytes onto the console device as base64 lines until the
/// payload has exited and the FIFO is drained.
fn encode_stream(fifo: &Path, device: &Path, shutdown: &AtomicBool) -> std::io::Result<()> {
    // Non-blocking read side: opens immediately, and a payload that
    // never writes cannot wedge the bridge.
    let mut reader = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo)?;
    let mut console = std::fs::OpenOptions::new().write(true).open(device)?;

    let mut buf = [0u8; CHUNK];
    loop {
        match reader.read(&mut buf) {
            // No writer connected (yet, or anymore).
            Ok(0) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                std::thread::sleep(IDLE);
            }
            Ok(n) => {
                let mut line = BASE64.encode(&buf[..n]).into_bytes();
                line.push(b'\n');
                console.write_all(&line)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if shutdown.load(Ordering::Acquire) {
                    // The payload is gone; one more poll pass catches
                    // bytes still in flight.
                    std::thread::sleep(IDLE);
                    match reader.read(&mut buf) {
                        Ok(n) if n > 0 => {
                            let mut line = BASE64.encode(&buf[..n]).into_bytes();
                            line.push(b'\n');
                            console.write_all(&line)?;
                            continue;
                        }
                        _ => break,
                    }
                }
                std::thread::sleep(IDLE);
            }
            Err(e) => return Err(e),
        }
    }
    console.flush()
}
