//! Kernel module loading from the packed `/lib/modules` directory.

use std::io;
use std::path::Path;

use nix::kmod::ModuleInitFlags;

/// Loads every regular file under `dir` in lexicographic order.
///
/// File names carry a four-digit load-order prefix, so sorting by name
/// reproduces the order the modules were packed in. The directory is
/// flat; nothing recurses.
pub fn load_all(dir: &Path) -> io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        let file = std::fs::File::open(&path)?;
        nix::kmod::finit_module(&file, c"", ModuleInitFlags::empty()).map_err(|e| {
            io::Error::new(
                io::Error::from(e).kind(),
                format!("{}: {e}", path.display()),
            )
        })?;
        eprintln!("virtrun-init: loaded module {}", path.display());
    }
    Ok(())
}
