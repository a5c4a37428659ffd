//! Initramfs archive construction for virtrun guests.
//!
//! The crate turns a guest payload plus auxiliary files into an
//! uncompressed CPIO `newc` archive suitable as a Linux initrd:
//! an in-memory [`VirtFs`] tree is assembled, the payload's shared
//! libraries are resolved through the platform dynamic linker, and the
//! result is serialized by a streaming [`CpioWriter`].
//!
//! # Quick start
//!
//! ```no_run
//! use virtrun_archive::InitramfsSpec;
//!
//! # async fn demo() -> virtrun_archive::Result<()> {
//! let archive = virtrun_archive::build(&InitramfsSpec {
//!     executable: "/path/to/test-binary".into(),
//!     ..InitramfsSpec::default()
//! })
//! .await?;
//! println!("{}", archive.path.display());
//! # Ok(())
//! # }
//! ```

mod cpio;
mod elf;
mod error;
mod fstree;
mod initramfs;
mod ldd;

pub use cpio::CpioWriter;
pub use elf::{Arch, has_interpreter, read_elf_arch};
pub use error::{Error, Result};
pub use fstree::{FileKind, Node, Opener, SYMLINK_BUDGET, VirtFs, host_opener};
pub use initramfs::{Archive, InitramfsSpec, build, build_fs, write_archive};
pub use ldd::{LibCollection, collect_libs};
