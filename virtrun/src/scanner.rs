//! Guest console scanning: the exit-code marker and fatal-condition
//! detection.
//!
//! The guest init prints a single `VIRTRUN_EXIT_CODE: <code>` line just
//! before powering off. Everything else on the stdout console is either
//! payload output or kernel noise; two kernel patterns are fatal and
//! short-circuit the exit code.

use std::sync::LazyLock;

use regex::Regex;

/// Prefix of the exit-code marker line emitted by the guest init.
pub const EXIT_CODE_MARKER: &str = "VIRTRUN_EXIT_CODE: ";

/// Kernel panic line, prefixed with the bracketed kernel timestamp.
static PANIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[[0-9. ]+\] Kernel panic - not syncing: ").expect("panic pattern compiles")
});

/// Out-of-memory kill line.
static OOM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Out of memory: Killed process").expect("oom pattern compiles"));

/// Accumulated findings from the stdout console stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanOutcome {
    /// Parsed exit-code marker value, first match wins.
    pub exit_code: Option<i32>,
    /// A kernel panic line was seen.
    pub panic: bool,
    /// An OOM kill line was seen.
    pub oom: bool,
}

/// Line-by-line scanner over the guest stdout console.
#[derive(Debug, Default)]
pub struct OutputScanner {
    /// Findings so far.
    outcome: ScanOutcome,
}

impl OutputScanner {
    /// Creates an empty scanner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one console line.
    ///
    /// Returns `true` when the line was the exit-code marker, so callers
    /// can keep it out of the forwarded payload output.
    pub fn scan_line(&mut self, line: &str) -> bool {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix(EXIT_CODE_MARKER) {
            if self.outcome.exit_code.is_none()
                && let Ok(code) = rest.trim().parse::<i32>()
            {
                self.outcome.exit_code = Some(code);
            }
            return true;
        }
        if PANIC_RE.is_match(line) {
            self.outcome.panic = true;
        }
        if OOM_RE.is_match(line) {
            self.outcome.oom = true;
        }
        false
    }

    /// Returns the findings.
    pub const fn outcome(&self) -> ScanOutcome {
        self.outcome
    }
}
