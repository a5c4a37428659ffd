//! Shared-library enumeration by way of the platform dynamic linker.
//!
//! `ldd` is spawned per executable with a hard deadline; its glibc-style
//! output is parsed into a deduplicated, deterministically ordered
//! collection of library paths and their source directories.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::elf::{has_interpreter, read_elf_arch};
use crate::error::{Error, Result};

/// Deadline for a single `ldd` invocation.
const LDD_TIMEOUT: Duration = Duration::from_secs(5);

/// Output phrases identifying a statically linked input; those are
/// skipped rather than treated as failures.
const STATIC_MARKERS: &[&str] = &["statically linked", "not a dynamic executable"];

/// Resolved dynamic dependencies of one or more executables.
///
/// Iteration over both sets yields lexicographic order, so archive
/// layouts derived from a collection are reproducible.
#[derive(Debug, Default)]
pub struct LibCollection {
    /// Absolute paths of the libraries themselves.
    libs: BTreeSet<PathBuf>,
    /// Directories the libraries were found in, including canonicalized
    /// forms when they differ.
    search_paths: BTreeSet<PathBuf>,
}

impl LibCollection {
    /// Iterates the library paths in lexicographic order.
    pub fn libs(&self) -> impl Iterator<Item = &Path> {
        self.libs.iter().map(PathBuf::as_path)
    }

    /// Iterates the library source directories in lexicographic order.
    pub fn search_paths(&self) -> impl Iterator<Item = &Path> {
        self.search_paths.iter().map(PathBuf::as_path)
    }

    /// Returns `true` when no libraries were collected.
    pub fn is_empty(&self) -> bool {
        self.libs.is_empty()
    }

    /// Records one library and its directory forms.
    pub(crate) fn add(&mut self, lib: PathBuf) {
        if let Some(dir) = lib.parent().filter(|d| !d.as_os_str().is_empty()) {
            self.search_paths.insert(dir.to_path_buf());
            // The canonical directory keeps lookups working when the
            // reported path goes through host symlinks (/lib -> usr/lib).
            if let Ok(canonical) = dir.canonicalize()
                && canonical != dir
            {
                self.search_paths.insert(canonical);
            }
        }
        self.libs.insert(lib);
    }
}

/// Collects the dynamic dependencies of every executable in `paths`.
///
/// Non-ELF inputs and statically linked binaries contribute nothing;
/// any other `ldd` failure surfaces as [`Error::LddExec`].
pub async fn collect_libs(paths: &[PathBuf]) -> Result<LibCollection> {
    let mut collection = LibCollection::default();
    for path in paths {
        match read_elf_arch(path) {
            Ok(_) => {}
            Err(Error::NotElf { .. }) => continue,
            Err(e) => return Err(e),
        }
        if !has_interpreter(path)? {
            tracing::debug!(path = %path.display(), "no interpreter, statically linked");
            continue;
        }
        for lib in ldd_libs(path).await? {
            collection.add(lib);
        }
    }
    Ok(collection)
}

/// Runs `ldd` on one executable and parses its output.
async fn ldd_libs(path: &Path) -> Result<Vec<PathBuf>> {
    let output = tokio::time::timeout(
        LDD_TIMEOUT,
        Command::new("ldd")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| Error::LddExec {
        path: path.to_path_buf(),
        detail: format!("timed out after {}s", LDD_TIMEOUT.as_secs()),
    })?
    .map_err(|e| Error::LddExec {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if STATIC_MARKERS
        .iter()
        .any(|m| stdout.contains(m) || stderr.contains(m))
    {
        tracing::debug!(path = %path.display(), "statically linked, no libraries to pack");
        return Ok(Vec::new());
    }
    if !output.status.success() {
        return Err(Error::LddExec {
            path: path.to_path_buf(),
            detail: stderr.trim().to_owned(),
        });
    }

    Ok(stdout.lines().filter_map(parse_line).collect())
}

/// Parses one `ldd` output line into a library path.
///
/// Two glibc shapes exist: `name => path (0xADDR)` for resolved
/// lookups, and `name (0xADDR)` for the VDSO (discarded) or an already
/// absolute name (kept).
fn parse_line(line: &str) -> Option<PathBuf> {
    let line = line.trim();
    if let Some((name, rest)) = line.split_once(" => ") {
        let name = name.trim();
        if name.starts_with('/') {
            return Some(PathBuf::from(name));
        }
        let path = rest.split(" (").next().unwrap_or("").trim();
        if path.starts_with('/') {
            return Some(PathBuf::from(path));
        }
        // "not found" and friends.
        return None;
    }
    let name = line.split(" (").next().unwrap_or("").trim();
    if name.starts_with('/') {
        return Some(PathBuf::from(name));
    }
    None
}
