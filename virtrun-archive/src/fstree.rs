//! In-memory file tree that an initramfs archive is assembled from.
//!
//! The tree holds directories, lazily-opened regular files, and symlinks.
//! Nothing is read from the host until the tree is serialized, so an
//! archive layout can be composed and validated cheaply.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Maximum number of symlink hops a single path resolution may take.
pub const SYMLINK_BUDGET: usize = 10;

/// Thunk that opens the host file backing a regular entry.
///
/// Invoked once, at serialization time.
pub type Opener = Box<dyn Fn() -> io::Result<fs::File> + Send + Sync>;

/// Returns an [`Opener`] for a plain host path.
pub fn host_opener(path: PathBuf) -> Opener {
    Box::new(move || {
        fs::File::open(&path)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
    })
}

/// A single node in the tree.
pub enum Node {
    /// Directory with uniquely named children.
    Directory(BTreeMap<String, Node>),
    /// Regular file, content supplied on demand by the opener.
    File(Opener),
    /// Symlink carrying its literal target string.
    Symlink(String),
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(children) => f.debug_tuple("Directory").field(&children.len()).finish(),
            Self::File(_) => f.write_str("File(..)"),
            Self::Symlink(target) => f.debug_tuple("Symlink").field(target).finish(),
        }
    }
}

/// Kind of a node, as reported by [`VirtFs::lstat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FileKind {
    /// Directory.
    Directory,
    /// Regular file.
    File,
    /// Symlink.
    Symlink,
}

impl Node {
    /// Returns the kind of this node.
    pub const fn kind(&self) -> FileKind {
        match self {
            Self::Directory(_) => FileKind::Directory,
            Self::File(_) => FileKind::File,
            Self::Symlink(_) => FileKind::Symlink,
        }
    }
}

/// Splits a path into cleaned components.
///
/// Leading slashes, empty components, and `.` are dropped; `..` pops the
/// previous component (never escaping the root).
fn clean(path: &str) -> Vec<&str> {
    let mut comps = Vec::new();
    for c in path.split('/') {
        match c {
            "" | "." => {}
            ".." => {
                comps.pop();
            }
            other => comps.push(other),
        }
    }
    comps
}

/// In-memory file tree with a single root directory.
///
/// The root is always a directory and is never a symlink. Intermediate
/// symlinks are resolved against the root with a fixed depth budget;
/// terminal symlinks are returned as-is (`lstat` semantics).
#[derive(Debug, Default)]
pub struct VirtFs {
    /// Children of the root directory.
    root: BTreeMap<String, Node>,
}

impl VirtFs {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the child `name` of the directory at `dir` (canonical,
    /// symlink-free components).
    fn child<'fs>(&'fs self, dir: &[String], name: &str) -> Option<&'fs Node> {
        let mut cur = &self.root;
        for c in dir {
            match cur.get(c) {
                Some(Node::Directory(children)) => cur = children,
                _ => return None,
            }
        }
        cur.get(name)
    }

    /// Resolves `comps`, following intermediate symlinks against the root.
    ///
    /// When `follow_terminal` is set, a terminal symlink is resolved too
    /// (used for directory resolution on insert paths). Returns the
    /// canonical, symlink-free component vector.
    fn resolve(&self, path: &str, comps: &[&str], follow_terminal: bool) -> Result<Vec<String>> {
        let mut resolved: Vec<String> = Vec::new();
        let mut pending: Vec<String> = comps.iter().rev().map(|c| (*c).to_owned()).collect();
        let mut budget = SYMLINK_BUDGET;

        while let Some(name) = pending.pop() {
            let terminal = pending.is_empty();
            let node = self.child(&resolved, &name).ok_or_else(|| Error::NotFound {
                path: path.to_owned(),
            })?;
            match node {
                Node::Symlink(target) if !terminal || follow_terminal => {
                    if budget == 0 {
                        return Err(Error::SymlinkTooDeep {
                            path: path.to_owned(),
                        });
                    }
                    budget -= 1;
                    // Targets are interpreted against the root.
                    resolved.clear();
                    for c in clean(target).into_iter().rev() {
                        pending.push(c.to_owned());
                    }
                }
                Node::Directory(_) => resolved.push(name),
                _ if terminal => resolved.push(name),
                _ => {
                    return Err(Error::NotDir {
                        path: path.to_owned(),
                    });
                }
            }
        }
        Ok(resolved)
    }

    /// Resolves `path` to a canonical directory, following terminal
    /// symlinks. Fails with [`Error::NotDir`] if the result is not a
    /// directory.
    fn resolve_dir(&self, path: &str, comps: &[&str]) -> Result<Vec<String>> {
        let resolved = self.resolve(path, comps, true)?;
        let mut cur = &self.root;
        for c in &resolved {
            match cur.get(c) {
                Some(Node::Directory(children)) => cur = children,
                _ => {
                    return Err(Error::NotDir {
                        path: path.to_owned(),
                    });
                }
            }
        }
        Ok(resolved)
    }

    /// Descends to the directory at canonical `dir` for mutation.
    fn dir_mut(&mut self, dir: &[String]) -> &mut BTreeMap<String, Node> {
        let mut cur = &mut self.root;
        for c in dir {
            match cur.get_mut(c) {
                Some(Node::Directory(children)) => cur = children,
                // resolve_dir has already proven the chain.
                _ => unreachable!("canonical path no longer resolves"),
            }
        }
        cur
    }

    /// Inserts `node` at `path`, failing on duplicates and broken parents.
    fn insert(&mut self, path: &str, node: Node) -> Result<()> {
        let comps = clean(path);
        let Some((name, parent)) = comps.split_last() else {
            return Err(Error::FileExist {
                path: path.to_owned(),
            });
        };
        let dir = self.resolve_dir(path, parent)?;
        let children = self.dir_mut(&dir);
        if children.contains_key(*name) {
            return Err(Error::FileExist {
                path: path.to_owned(),
            });
        }
        children.insert((*name).to_owned(), node);
        Ok(())
    }

    /// Creates a single directory. The parent must already exist.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.insert(path, Node::Directory(BTreeMap::new()))
    }

    /// Creates all missing directories along `path`.
    ///
    /// Succeeds if the target already exists as a directory (possibly via
    /// a symlink); fails with [`Error::NotDir`] if any component exists as
    /// something else.
    pub fn mkdir_all(&mut self, path: &str) -> Result<()> {
        let comps = clean(path);
        for depth in 1..=comps.len() {
            let prefix = comps[..depth].join("/");
            match self.resolve_dir(&prefix, &comps[..depth]) {
                Ok(_) => {}
                Err(Error::NotFound { .. }) => self.mkdir(&prefix)?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Creates a regular file whose content is produced by `opener` at
    /// serialization time.
    pub fn add(&mut self, path: &str, opener: Opener) -> Result<()> {
        self.insert(path, Node::File(opener))
    }

    /// Creates a symlink at `path` with the literal `target` string.
    pub fn symlink(&mut self, target: &str, path: &str) -> Result<()> {
        self.insert(path, Node::Symlink(target.to_owned()))
    }

    /// Returns the node at `path`.
    ///
    /// Intermediate symlinks are followed; a terminal symlink is returned
    /// directly rather than resolved.
    pub fn open(&self, path: &str) -> Result<&Node> {
        let comps = clean(path);
        let resolved = self.resolve(path, &comps, false)?;
        let Some((name, dir)) = resolved.split_last() else {
            // The empty path is the root directory; hand back a stable
            // view through lstat-style kind instead.
            return Err(Error::NotFound {
                path: path.to_owned(),
            });
        };
        self.child(dir, name).ok_or_else(|| Error::NotFound {
            path: path.to_owned(),
        })
    }

    /// Returns the literal target of the symlink at `path`.
    pub fn read_link(&self, path: &str) -> Result<&str> {
        match self.open(path)? {
            Node::Symlink(target) => Ok(target),
            _ => Err(Error::NotSymlink {
                path: path.to_owned(),
            }),
        }
    }

    /// Returns the kind of the node at `path` without following a
    /// terminal symlink.
    pub fn lstat(&self, path: &str) -> Result<FileKind> {
        if clean(path).is_empty() {
            return Ok(FileKind::Directory);
        }
        Ok(self.open(path)?.kind())
    }

    /// Visits every node depth-first, parents before children, siblings
    /// in lexicographic order. Paths are relative to the root, without a
    /// leading slash.
    pub fn visit<F>(&self, f: &mut F) -> Result<()>
    where
        F: FnMut(&str, &Node) -> Result<()>,
    {
        fn walk<F>(prefix: &str, children: &BTreeMap<String, Node>, f: &mut F) -> Result<()>
        where
            F: FnMut(&str, &Node) -> Result<()>,
        {
            for (name, node) in children {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                f(&path, node)?;
                if let Node::Directory(grandchildren) = node {
                    walk(&path, grandchildren, f)?;
                }
            }
            Ok(())
        }
        walk("", &self.root, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_opener() -> Opener {
        host_opener(PathBuf::from("/dev/null"))
    }

    #[test]
    fn added_paths_are_discoverable() {
        let mut fs = VirtFs::new();
        fs.mkdir_all("a/b/c").unwrap();
        fs.add("a/b/c/file", empty_opener()).unwrap();
        fs.symlink("/a/b", "a/link").unwrap();

        assert_eq!(fs.lstat("a").unwrap(), FileKind::Directory);
        assert_eq!(fs.lstat("a/b/c/file").unwrap(), FileKind::File);
        assert_eq!(fs.lstat("a/link").unwrap(), FileKind::Symlink);
        assert!(matches!(fs.open("a/b/c/file").unwrap(), Node::File(_)));
    }

    #[test]
    fn duplicate_add_fails_across_kinds() {
        let mut fs = VirtFs::new();
        fs.mkdir("dir").unwrap();
        assert!(matches!(
            fs.add("dir", empty_opener()),
            Err(Error::FileExist { .. })
        ));
        assert!(matches!(
            fs.symlink("/x", "dir"),
            Err(Error::FileExist { .. })
        ));
        assert!(matches!(fs.mkdir("dir"), Err(Error::FileExist { .. })));
    }

    #[test]
    fn parent_must_be_directory() {
        let mut fs = VirtFs::new();
        fs.add("file", empty_opener()).unwrap();
        assert!(matches!(
            fs.add("file/child", empty_opener()),
            Err(Error::NotDir { .. })
        ));
        assert!(matches!(
            fs.mkdir_all("file/deep/dir"),
            Err(Error::NotDir { .. })
        ));
    }

    #[test]
    fn missing_parent_fails() {
        let mut fs = VirtFs::new();
        assert!(matches!(
            fs.add("no/such/file", empty_opener()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn read_link_returns_literal_target() {
        let mut fs = VirtFs::new();
        fs.symlink("/lib", "usr-lib").unwrap();
        assert_eq!(fs.read_link("usr-lib").unwrap(), "/lib");
        fs.mkdir("dir").unwrap();
        assert!(matches!(
            fs.read_link("dir"),
            Err(Error::NotSymlink { .. })
        ));
    }

    #[test]
    fn intermediate_symlinks_resolve_against_root() {
        let mut fs = VirtFs::new();
        fs.mkdir("lib").unwrap();
        fs.add("lib/libc.so", empty_opener()).unwrap();
        fs.mkdir("usr").unwrap();
        fs.symlink("/lib", "usr/lib").unwrap();

        assert!(matches!(fs.open("usr/lib/libc.so").unwrap(), Node::File(_)));
        // Inserting through the symlink lands in the real directory.
        fs.add("usr/lib/libm.so", empty_opener()).unwrap();
        assert!(matches!(fs.open("lib/libm.so").unwrap(), Node::File(_)));
    }

    #[test]
    fn symlink_chain_exceeding_budget_fails() {
        let mut fs = VirtFs::new();
        fs.mkdir("real").unwrap();
        fs.add("real/file", empty_opener()).unwrap();
        fs.symlink("/real", "link0").unwrap();
        for i in 1..=SYMLINK_BUDGET {
            fs.symlink(&format!("/link{}", i - 1), &format!("link{i}"))
                .unwrap();
        }

        // Budget hops from the deepest link exceed the budget.
        let deepest = format!("link{SYMLINK_BUDGET}/file");
        assert!(matches!(
            fs.open(&deepest),
            Err(Error::SymlinkTooDeep { .. })
        ));
        // A shallow chain still resolves.
        assert!(fs.open("link0/file").is_ok());
    }

    #[test]
    fn symlink_cycle_fails() {
        let mut fs = VirtFs::new();
        fs.symlink("/b", "a").unwrap();
        fs.symlink("/a", "b").unwrap();
        assert!(matches!(
            fs.open("a/whatever"),
            Err(Error::SymlinkTooDeep { .. })
        ));
    }

    #[test]
    fn mkdir_all_tolerates_existing_directories() {
        let mut fs = VirtFs::new();
        fs.mkdir_all("a/b").unwrap();
        fs.mkdir_all("a/b/c").unwrap();
        fs.mkdir_all("a/b").unwrap();
        assert_eq!(fs.lstat("a/b/c").unwrap(), FileKind::Directory);
    }

    #[test]
    fn paths_are_cleaned_before_lookup() {
        let mut fs = VirtFs::new();
        fs.mkdir_all("/a/b").unwrap();
        assert_eq!(fs.lstat("a/./b/../b").unwrap(), FileKind::Directory);
        assert_eq!(fs.lstat("//a//b//").unwrap(), FileKind::Directory);
    }

    #[test]
    fn visit_is_deterministic_and_sorted() {
        let mut fs = VirtFs::new();
        fs.mkdir("z").unwrap();
        fs.mkdir("a").unwrap();
        fs.add("a/y", empty_opener()).unwrap();
        fs.add("a/x", empty_opener()).unwrap();
        fs.symlink("/a", "m").unwrap();

        let mut seen = Vec::new();
        fs.visit(&mut |path, _| {
            seen.push(path.to_owned());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["a", "a/x", "a/y", "m", "z"]);
    }
}
