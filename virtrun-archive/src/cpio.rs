//! Streaming CPIO writer in the `newc` variant the kernel unpacks as an
//! initramfs image.
//!
//! Each entry is a 110-byte ASCII-hex header, the NUL-terminated entry
//! name padded to 4 bytes, then the body padded to 4 bytes. The archive
//! ends with the `TRAILER!!!` terminator entry.

use std::io::{self, Write};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::fstree::{Node, VirtFs};

/// Magic identifying the `newc` header format.
const MAGIC: &[u8; 6] = b"070701";

/// Terminator entry name.
const TRAILER: &str = "TRAILER!!!";

/// Mode bits emitted for directories.
const MODE_DIR: u32 = 0o040_755;

/// Mode bits emitted for symlinks.
const MODE_SYMLINK: u32 = 0o120_755;

/// Mode bits emitted for regular files.
const MODE_FILE: u32 = 0o100_755;

/// Streaming `newc` writer.
///
/// Entries are written in the order the caller supplies them;
/// [`CpioWriter::add_fs`] walks a [`VirtFs`] in its deterministic order.
/// [`CpioWriter::finish`] appends the terminator and is idempotent.
#[derive(Debug)]
pub struct CpioWriter<W: Write> {
    /// Underlying byte sink.
    inner: W,
    /// Next inode number handed out; inodes only need to be unique.
    next_ino: u32,
    /// Whether the trailer has been written.
    finished: bool,
}

impl<W: Write> CpioWriter<W> {
    /// Creates a writer over `inner`.
    pub const fn new(inner: W) -> Self {
        Self {
            inner,
            next_ino: 1,
            finished: false,
        }
    }

    /// Writes one header plus the NUL-terminated, 4-byte padded name.
    fn header(&mut self, name: &str, ino: u32, mode: u32, nlink: u32, filesize: u64) -> Result<()> {
        let namesize = name.len() + 1;
        let filesize = u32::try_from(filesize).map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{name}: file exceeds the 4 GiB newc size field"),
            ))
        })?;

        let mut hdr = Vec::with_capacity(110 + namesize);
        hdr.extend_from_slice(MAGIC);
        for field in [
            ino,
            mode,
            0, // uid
            0, // gid
            nlink,
            0, // mtime
            filesize,
            0, // devmajor
            0, // devminor
            0, // rdevmajor
            0, // rdevminor
            u32::try_from(namesize).unwrap_or(u32::MAX),
            0, // check
        ] {
            hdr.extend_from_slice(format!("{field:08x}").as_bytes());
        }
        hdr.extend_from_slice(name.as_bytes());
        hdr.push(0);
        self.inner.write_all(&hdr)?;
        self.pad(110 + namesize)?;
        Ok(())
    }

    /// Writes NUL padding to align `written` up to 4 bytes.
    fn pad(&mut self, written: usize) -> Result<()> {
        let rem = written % 4;
        if rem != 0 {
            self.inner.write_all(&[0u8; 4][..4 - rem])?;
        }
        Ok(())
    }

    /// Claims the next inode number.
    fn ino(&mut self) -> u32 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// Appends a directory entry.
    pub fn directory(&mut self, name: &str) -> Result<()> {
        let ino = self.ino();
        self.header(name, ino, MODE_DIR, 2, 0)
    }

    /// Appends a symlink entry; the body is the literal target string.
    pub fn symlink(&mut self, name: &str, target: &str) -> Result<()> {
        let ino = self.ino();
        self.header(name, ino, MODE_SYMLINK, 1, target.len() as u64)?;
        self.inner.write_all(target.as_bytes())?;
        self.pad(target.len())
    }

    /// Appends a regular file entry streamed from `source`.
    ///
    /// The declared size is taken from the source metadata, which must
    /// describe a regular file.
    pub fn file(&mut self, name: &str, source: &mut std::fs::File) -> Result<()> {
        let meta = source.metadata()?;
        if !meta.file_type().is_file() {
            return Err(Error::NotRegular {
                path: PathBuf::from(name),
            });
        }
        let size = meta.len();
        let ino = self.ino();
        self.header(name, ino, MODE_FILE, 1, size)?;
        let copied = io::copy(source, &mut self.inner)?;
        if copied != size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{name}: source changed size during archiving"),
            )));
        }
        self.pad(usize::try_from(size % 4).unwrap_or(0))
    }

    /// Walks `fs` in deterministic order and appends every node.
    ///
    /// Regular entries invoke their opener here; each source file is
    /// closed as soon as its content has been drained.
    pub fn add_fs(&mut self, fs: &VirtFs) -> Result<()> {
        fs.visit(&mut |path, node| match node {
            Node::Directory(_) => self.directory(path),
            Node::Symlink(target) => self.symlink(path, target),
            Node::File(opener) => {
                let mut source = opener()?;
                self.file(path, &mut source)
            }
        })
    }

    /// Writes the terminator entry and flushes. Safe to call twice.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.header(TRAILER, 0, 0, 1, 0)?;
        self.inner.flush()?;
        self.finished = true;
        Ok(())
    }
}

/// Minimal `newc` reader used to verify writer output in tests.
#[cfg(test)]
pub(crate) mod reader {
    use super::{MAGIC, TRAILER};

    /// A parsed archive entry.
    #[derive(Debug, PartialEq, Eq)]
    pub struct Entry {
        /// Entry name.
        pub name: String,
        /// Raw mode field.
        pub mode: u32,
        /// Body bytes.
        pub body: Vec<u8>,
    }

    /// Reads one 8-char ASCII-hex field.
    fn hex(data: &[u8], at: usize) -> u32 {
        let s = std::str::from_utf8(&data[at..at + 8]).expect("hex field");
        u32::from_str_radix(s, 16).expect("hex field")
    }

    /// Parses every entry up to the trailer.
    pub fn parse(data: &[u8]) -> Vec<Entry> {
        let mut entries = Vec::new();
        let mut at = 0;
        loop {
            assert_eq!(&data[at..at + 6], MAGIC, "bad magic at {at}");
            let mode = hex(data, at + 6 + 8);
            let filesize = hex(data, at + 6 + 6 * 8) as usize;
            let namesize = hex(data, at + 6 + 11 * 8) as usize;
            let name_start = at + 110;
            let name = std::str::from_utf8(&data[name_start..name_start + namesize - 1])
                .expect("entry name")
                .to_owned();
            let mut body_start = name_start + namesize;
            body_start += (4 - (110 + namesize) % 4) % 4;
            let body = data[body_start..body_start + filesize].to_vec();
            at = body_start + filesize;
            at += (4 - filesize % 4) % 4;
            if name == TRAILER {
                return entries;
            }
            entries.push(Entry { name, mode, body });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::fstree::host_opener;

    fn temp_file(content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, path)
    }

    #[test]
    fn roundtrip_reproduces_entries_in_order() {
        let (_guard, path) = temp_file(b"payload bytes");
        let mut fs = VirtFs::new();
        fs.mkdir("lib").unwrap();
        fs.add("lib/libx.so", host_opener(path.clone())).unwrap();
        fs.mkdir("data").unwrap();
        fs.symlink("/lib", "usr-lib").unwrap();
        fs.add("init", host_opener(path)).unwrap();

        let mut out = Vec::new();
        let mut w = CpioWriter::new(&mut out);
        w.add_fs(&fs).unwrap();
        w.finish().unwrap();

        let entries = reader::parse(&out);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["data", "init", "lib", "lib/libx.so", "usr-lib"]);

        assert_eq!(entries[0].mode, MODE_DIR);
        assert_eq!(entries[1].mode, MODE_FILE);
        assert_eq!(entries[1].body, b"payload bytes");
        assert_eq!(entries[3].body, b"payload bytes");
        assert_eq!(entries[4].mode, MODE_SYMLINK);
        assert_eq!(entries[4].body, b"/lib");
    }

    #[test]
    fn bodies_and_names_are_padded_to_four_bytes() {
        let (_guard, path) = temp_file(b"abcde");
        let mut fs = VirtFs::new();
        fs.add("a", host_opener(path)).unwrap();

        let mut out = Vec::new();
        let mut w = CpioWriter::new(&mut out);
        w.add_fs(&fs).unwrap();
        w.finish().unwrap();

        assert_eq!(out.len() % 4, 0);
        let entries = reader::parse(&out);
        assert_eq!(entries[0].body, b"abcde");
    }

    #[test]
    fn non_regular_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = VirtFs::new();
        fs.add("entry", host_opener(dir.path().to_path_buf()))
            .unwrap();

        let mut out = Vec::new();
        let mut w = CpioWriter::new(&mut out);
        assert!(matches!(
            w.add_fs(&fs),
            Err(Error::NotRegular { .. }) | Err(Error::Io(_))
        ));
    }

    #[test]
    fn finish_is_idempotent() {
        let mut out = Vec::new();
        let mut w = CpioWriter::new(&mut out);
        w.finish().unwrap();
        w.finish().unwrap();
        assert_eq!(reader::parse(&out).len(), 0);
        // Exactly one trailer entry was emitted.
        assert_eq!(out.windows(TRAILER.len()).filter(|win| *win == TRAILER.as_bytes()).count(), 1);
    }

    #[test]
    fn symlink_body_is_not_nul_terminated() {
        let mut fs = VirtFs::new();
        fs.symlink("abc", "l").unwrap();
        let mut out = Vec::new();
        let mut w = CpioWriter::new(&mut out);
        w.add_fs(&fs).unwrap();
        w.finish().unwrap();
        let entries = reader::parse(&out);
        assert_eq!(entries[0].body, b"abc");
    }
}
