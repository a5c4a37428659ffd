//! Error types for archive assembly and binary introspection.

use std::io;
use std::path::PathBuf;

/// Alias for `Result<T, virtrun_archive::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while building an initramfs archive or inspecting
/// guest binaries.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An entry with the same name already exists in the file tree.
    #[error("{path}: file exists")]
    FileExist {
        /// Path of the conflicting entry.
        path: String,
    },

    /// A path component resolved to something other than a directory.
    #[error("{path}: not a directory")]
    NotDir {
        /// Path whose parent chain is broken.
        path: String,
    },

    /// The requested entry does not exist.
    #[error("{path}: no such file or directory")]
    NotFound {
        /// Path that failed to resolve.
        path: String,
    },

    /// Symlink resolution exceeded the depth budget.
    #[error("{path}: too many levels of symbolic links")]
    SymlinkTooDeep {
        /// Path whose resolution looped or chained too deeply.
        path: String,
    },

    /// `read_link` was called on an entry that is not a symlink.
    #[error("{path}: invalid argument, not a symlink")]
    NotSymlink {
        /// Path of the non-symlink entry.
        path: String,
    },

    /// An archive file entry is backed by something other than a regular
    /// file (directory, device, socket).
    #[error("{}: source is not a regular file", .path.display())]
    NotRegular {
        /// Host path of the offending source.
        path: PathBuf,
    },

    /// The input file does not start with the ELF magic.
    #[error("{}: not an ELF file", .path.display())]
    NotElf {
        /// Host path of the inspected file.
        path: PathBuf,
    },

    /// The ELF OS ABI is neither `NONE` nor `LINUX`.
    #[error("{}: unsupported ELF OS ABI {abi}", .path.display())]
    OsAbiNotSupported {
        /// Host path of the inspected file.
        path: PathBuf,
        /// Raw `EI_OSABI` byte.
        abi: u8,
    },

    /// The ELF machine type maps to no supported guest architecture.
    #[error("{}: unsupported ELF machine type {machine:#x}", .path.display())]
    MachineNotSupported {
        /// Host path of the inspected file.
        path: PathBuf,
        /// Raw `e_machine` value.
        machine: u16,
    },

    /// The dynamic linker introspection command failed or timed out.
    #[error("ldd {}: {detail}", .path.display())]
    LddExec {
        /// Executable that was being resolved.
        path: PathBuf,
        /// Captured stderr or a timeout description.
        detail: String,
    },

    /// An I/O error from reading sources or writing the archive.
    #[error(transparent)]
    Io(#[from] io::Error),
}
