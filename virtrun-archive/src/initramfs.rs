//! Canonical initramfs layout assembly.
//!
//! Combines the file tree, the CPIO writer, and the library resolver
//! into the archive the guest kernel unpacks:
//!
//! ```text
//! /init               main executable, or the supplied init stub
//! /main               main executable (only when an init stub is used)
//! /data/<name>        extra files
//! /lib/<name>         resolved shared libraries
//! /lib/modules/...    kernel modules, load-order prefixed
//! /run /tmp           empty scratch directories
//! /<orig dir>         symlink onto /lib per library source directory
//! ```

use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use crate::cpio::CpioWriter;
use crate::error::{Error, Result};
use crate::fstree::{VirtFs, host_opener};
use crate::ldd::{LibCollection, collect_libs};

/// Inputs for one initramfs build.
#[derive(Debug, Default)]
pub struct InitramfsSpec {
    /// The guest payload binary.
    pub executable: PathBuf,
    /// Extra files placed under `/data` by basename.
    pub files: Vec<PathBuf>,
    /// Kernel module files placed under `/lib/modules` in list order.
    pub modules: Vec<PathBuf>,
    /// PID-1 stub; when absent, the payload itself boots as `/init`.
    pub init: Option<PathBuf>,
}

/// A written archive file, owned by the caller until removed.
#[derive(Debug)]
pub struct Archive {
    /// Location of the archive in the temp directory.
    pub path: PathBuf,
}

impl Archive {
    /// Deletes the archive file.
    pub fn remove(self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

/// Returns the final path component as a string.
fn basename(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: path has no file name", path.display()),
            ))
        })
}

/// Builds the in-memory tree for `spec` with the already resolved
/// library collection.
pub fn build_fs(spec: &InitramfsSpec, libs: &LibCollection) -> Result<VirtFs> {
    let mut fs = VirtFs::new();

    match &spec.init {
        Some(init) => {
            fs.add("init", host_opener(init.clone()))?;
            fs.add("main", host_opener(spec.executable.clone()))?;
        }
        None => fs.add("init", host_opener(spec.executable.clone()))?,
    }

    fs.mkdir("data")?;
    for file in &spec.files {
        fs.add(&format!("data/{}", basename(file)?), host_opener(file.clone()))?;
    }

    fs.mkdir("lib")?;
    fs.mkdir("lib/modules")?;
    for (idx, module) in spec.modules.iter().enumerate() {
        // The numeric prefix makes lexicographic order the load order.
        fs.add(
            &format!("lib/modules/{idx:04}-{}", basename(module)?),
            host_opener(module.clone()),
        )?;
    }

    fs.mkdir("run")?;
    fs.mkdir("tmp")?;

    for lib in libs.libs() {
        match fs.add(&format!("lib/{}", basename(lib)?), host_opener(lib.to_path_buf())) {
            // Same basename from two directories; the first one wins.
            Ok(()) | Err(Error::FileExist { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    for dir in libs.search_paths() {
        link_dir_to_lib(&mut fs, dir)?;
    }

    Ok(fs)
}

/// Adds a symlink from a library's original directory onto `/lib`, so
/// dynamic lookups through the original search path keep working.
fn link_dir_to_lib(fs: &mut VirtFs, dir: &Path) -> Result<()> {
    let rel: PathBuf = dir.components().skip(1).collect();
    let rel = rel.to_string_lossy().into_owned();
    if rel.is_empty() || rel == "lib" {
        return Ok(());
    }
    if let Some((parent, _)) = rel.rsplit_once('/') {
        fs.mkdir_all(parent)?;
    }
    match fs.symlink("/lib", &rel) {
        // Several libraries from one directory, or a directory that
        // already exists in the layout.
        Ok(()) | Err(Error::FileExist { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Serializes `fs` to a fresh archive file in the temp directory.
pub fn write_archive(fs: &VirtFs) -> Result<Archive> {
    let file = tempfile::Builder::new()
        .prefix("virtrun-")
        .suffix(".cpio")
        .tempfile()?;
    let (file, path) = file.keep().map_err(|e| Error::Io(e.error))?;

    let mut writer = CpioWriter::new(BufWriter::new(file));
    let written = writer.add_fs(fs).and_then(|()| writer.finish());
    if let Err(e) = written {
        let _ = std::fs::remove_file(&path);
        return Err(e);
    }
    tracing::debug!(path = %path.display(), "initramfs archive written");
    Ok(Archive { path })
}

/// Resolves the payload's libraries, assembles the tree, and writes the
/// archive file.
pub async fn build(spec: &InitramfsSpec) -> Result<Archive> {
    let libs = collect_libs(std::slice::from_ref(&spec.executable)).await?;
    let fs = build_fs(spec, &libs)?;
    write_archive(&fs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fstree::FileKind;

    fn spec_with(init: Option<PathBuf>) -> InitramfsSpec {
        InitramfsSpec {
            executable: PathBuf::from("/host/bin/payload"),
            files: vec![PathBuf::from("/host/data/input.txt")],
            modules: vec![
                PathBuf::from("/host/mods/first.ko"),
                PathBuf::from("/host/mods/second.ko"),
            ],
            init,
        }
    }

    fn libs() -> LibCollection {
        let mut c = LibCollection::default();
        c.add(PathBuf::from("/usr/lib/x86_64-linux-gnu/libfunc1.so"));
        c.add(PathBuf::from("/usr/lib/x86_64-linux-gnu/libfunc2.so"));
        c.add(PathBuf::from("/lib64/ld-linux-x86-64.so.2"));
        c
    }

    #[test]
    fn payload_becomes_init_without_a_stub() {
        let fs = build_fs(&spec_with(None), &LibCollection::default()).unwrap();
        assert_eq!(fs.lstat("init").unwrap(), FileKind::File);
        assert!(fs.lstat("main").is_err());
    }

    #[test]
    fn stub_init_moves_payload_to_main() {
        let fs = build_fs(&spec_with(Some(PathBuf::from("/host/init-stub"))), &libs()).unwrap();
        assert_eq!(fs.lstat("init").unwrap(), FileKind::File);
        assert_eq!(fs.lstat("main").unwrap(), FileKind::File);
    }

    #[test]
    fn canonical_layout_is_present() {
        let fs = build_fs(&spec_with(None), &libs()).unwrap();
        for dir in ["data", "lib", "lib/modules", "run", "tmp"] {
            assert_eq!(fs.lstat(dir).unwrap(), FileKind::Directory, "{dir}");
        }
        assert_eq!(fs.lstat("data/input.txt").unwrap(), FileKind::File);
        assert_eq!(fs.lstat("lib/modules/0000-first.ko").unwrap(), FileKind::File);
        assert_eq!(fs.lstat("lib/modules/0001-second.ko").unwrap(), FileKind::File);
    }

    #[test]
    fn libraries_land_flat_with_directory_symlinks() {
        let fs = build_fs(&spec_with(None), &libs()).unwrap();
        assert_eq!(fs.lstat("lib/libfunc1.so").unwrap(), FileKind::File);
        assert_eq!(fs.lstat("lib/libfunc2.so").unwrap(), FileKind::File);
        assert_eq!(fs.lstat("lib/ld-linux-x86-64.so.2").unwrap(), FileKind::File);

        assert_eq!(fs.read_link("usr/lib/x86_64-linux-gnu").unwrap(), "/lib");
        assert_eq!(fs.read_link("lib64").unwrap(), "/lib");
        // Lookups through the original search path reach the library.
        assert_eq!(
            fs.lstat("usr/lib/x86_64-linux-gnu/libfunc1.so").unwrap(),
            FileKind::File
        );
    }

    #[test]
    fn lib_itself_is_not_symlinked() {
        let mut c = LibCollection::default();
        c.add(PathBuf::from("/lib/libonly.so"));
        let fs = build_fs(&spec_with(None), &c).unwrap();
        assert_eq!(fs.lstat("lib").unwrap(), FileKind::Directory);
        assert_eq!(fs.lstat("lib/libonly.so").unwrap(), FileKind::File);
    }

    #[test]
    fn duplicate_basenames_are_tolerated() {
        let mut c = LibCollection::default();
        c.add(PathBuf::from("/a/libdup.so"));
        c.add(PathBuf::from("/b/libdup.so"));
        let fs = build_fs(&spec_with(None), &c).unwrap();
        assert_eq!(fs.lstat("lib/libdup.so").unwrap(), FileKind::File);
        assert_eq!(fs.read_link("a").unwrap(), "/lib");
        assert_eq!(fs.read_link("b").unwrap(), "/lib");
    }

    #[tokio::test]
    async fn archive_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("payload");
        std::fs::write(&payload, b"not-an-elf").unwrap();

        let spec = InitramfsSpec {
            executable: payload,
            ..InitramfsSpec::default()
        };
        let archive = build(&spec).await.unwrap();
        let meta = std::fs::metadata(&archive.path).unwrap();
        assert!(meta.len() > 0);
        let path = archive.path.clone();
        archive.remove().unwrap();
        assert!(!path.exists());
    }
}
