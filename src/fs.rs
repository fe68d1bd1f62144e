//! Read-only filesystem access used by workspace discovery.
//!
//! Discovery and lockfile detection never touch `std::fs` directly. They go
//! through [`WorkspaceFs`], so the same code runs against the real disk
//! ([`DiskFs`]) and against in-memory trees in tests.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Opaque handle to a file or directory known to a [`WorkspaceFs`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entry(PathBuf);

impl Entry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Final path component, or an empty string for roots.
    pub fn name(&self) -> &str {
        self.0
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("")
    }
}

/// Abstract read-only tree.
pub trait WorkspaceFs: Send + Sync {
    /// Looks up a direct child (file or directory) by name.
    fn find_child(&self, dir: &Entry, name: &str) -> Option<Entry>;
    /// Resolves a `/`-separated path relative to `dir`.
    fn find_relative(&self, dir: &Entry, relative: &str) -> Option<Entry>;
    /// Lists the direct children of `dir`, sorted by name.
    fn children(&self, dir: &Entry) -> io::Result<Vec<Entry>>;
    fn read_to_string(&self, file: &Entry) -> io::Result<String>;
    fn is_dir(&self, entry: &Entry) -> bool;
}

/// Joins a `/`-separated relative path onto `base` lexically.
///
/// Empty and `.` segments are ignored and `..` pops one component, so
/// `./packages//web/` and `packages/web` resolve to the same place.
pub fn join_relative(base: &Path, relative: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if !path.pop() {
                    path.push(Component::ParentDir.as_os_str());
                }
            }
            other => path.push(other),
        }
    }
    path
}

/// [`WorkspaceFs`] backed by the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFs;

impl WorkspaceFs for DiskFs {
    fn find_child(&self, dir: &Entry, name: &str) -> Option<Entry> {
        let path = dir.path().join(name);
        path.exists().then(|| Entry::new(path))
    }

    fn find_relative(&self, dir: &Entry, relative: &str) -> Option<Entry> {
        let path = join_relative(dir.path(), relative);
        path.exists().then(|| Entry::new(path))
    }

    fn children(&self, dir: &Entry) -> io::Result<Vec<Entry>> {
        let mut entries = std::fs::read_dir(dir.path())?
            .map(|entry| entry.map(|entry| Entry::new(entry.path())))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    fn read_to_string(&self, file: &Entry) -> io::Result<String> {
        std::fs::read_to_string(file.path())
    }

    fn is_dir(&self, entry: &Entry) -> bool {
        entry.path().is_dir()
    }
}

#[cfg(test)]
pub use memory::MemoryFs;

#[cfg(test)]
mod memory {
    use std::collections::BTreeMap;
    use std::io;
    use std::path::{Path, PathBuf};

    use super::{join_relative, Entry, WorkspaceFs};

    #[derive(Debug, Clone)]
    enum Node {
        Dir,
        File(String),
        Unreadable,
        /// A directory whose listing fails.
        Sealed,
    }

    /// In-memory tree for discovery tests.
    #[derive(Debug, Clone)]
    pub struct MemoryFs {
        root: PathBuf,
        nodes: BTreeMap<PathBuf, Node>,
    }

    impl MemoryFs {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            let root = root.into();
            let mut nodes = BTreeMap::new();
            nodes.insert(root.clone(), Node::Dir);
            Self { root, nodes }
        }

        pub fn root(&self) -> Entry {
            Entry::new(self.root.clone())
        }

        pub fn dir(mut self, relative: &str) -> Self {
            let path = join_relative(&self.root, relative);
            self.ensure_dirs(&path);
            self
        }

        pub fn file(self, relative: &str, contents: &str) -> Self {
            self.insert(relative, Node::File(contents.to_string()))
        }

        pub fn unreadable(self, relative: &str) -> Self {
            self.insert(relative, Node::Unreadable)
        }

        pub fn sealed(self, relative: &str) -> Self {
            self.insert(relative, Node::Sealed)
        }

        fn insert(mut self, relative: &str, node: Node) -> Self {
            let path = join_relative(&self.root, relative);
            if let Some(parent) = path.parent() {
                self.ensure_dirs(parent);
            }
            self.nodes.insert(path, node);
            self
        }

        fn ensure_dirs(&mut self, path: &Path) {
            for ancestor in path.ancestors() {
                if !ancestor.starts_with(&self.root) {
                    break;
                }
                self.nodes
                    .entry(ancestor.to_path_buf())
                    .or_insert(Node::Dir);
            }
        }
    }

    impl WorkspaceFs for MemoryFs {
        fn find_child(&self, dir: &Entry, name: &str) -> Option<Entry> {
            let path = dir.path().join(name);
            self.nodes.contains_key(&path).then(|| Entry::new(path))
        }

        fn find_relative(&self, dir: &Entry, relative: &str) -> Option<Entry> {
            let path = join_relative(dir.path(), relative);
            self.nodes.contains_key(&path).then(|| Entry::new(path))
        }

        fn children(&self, dir: &Entry) -> io::Result<Vec<Entry>> {
            match self.nodes.get(dir.path()) {
                Some(Node::Dir) => Ok(self
                    .nodes
                    .keys()
                    .filter(|path| path.parent() == Some(dir.path()))
                    .map(|path| Entry::new(path.clone()))
                    .collect()),
                Some(Node::Sealed) => Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} cannot be listed", dir.path().display()),
                )),
                Some(_) => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is not a directory", dir.path().display()),
                )),
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} does not exist", dir.path().display()),
                )),
            }
        }

        fn read_to_string(&self, file: &Entry) -> io::Result<String> {
            match self.nodes.get(file.path()) {
                Some(Node::File(contents)) => Ok(contents.clone()),
                Some(Node::Unreadable) => Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} is not readable", file.path().display()),
                )),
                Some(Node::Dir | Node::Sealed) => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is a directory", file.path().display()),
                )),
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} does not exist", file.path().display()),
                )),
            }
        }

        fn is_dir(&self, entry: &Entry) -> bool {
            matches!(self.nodes.get(entry.path()), Some(Node::Dir | Node::Sealed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_relative_normalizes_segments() {
        let base = Path::new("/repo");
        assert_eq!(join_relative(base, "./packages//web/"), PathBuf::from("/repo/packages/web"));
        assert_eq!(join_relative(base, "apps/../libs/ui"), PathBuf::from("/repo/libs/ui"));
        assert_eq!(join_relative(base, "."), PathBuf::from("/repo"));
    }

    #[test]
    fn disk_children_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zeta", "alpha", "mid"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("beta.txt"), "x").unwrap();

        let root = Entry::new(dir.path());
        let names = DiskFs
            .children(&root)
            .unwrap()
            .iter()
            .map(|entry| entry.name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["alpha", "beta.txt", "mid", "zeta"]);
        assert!(DiskFs.is_dir(&DiskFs.find_child(&root, "mid").unwrap()));
        assert!(!DiskFs.is_dir(&DiskFs.find_child(&root, "beta.txt").unwrap()));
        assert!(DiskFs.find_relative(&root, "./mid/").is_some());
        assert!(DiskFs.find_child(&root, "missing").is_none());
    }

    #[test]
    fn memory_fs_lists_only_direct_children() {
        let fs = MemoryFs::new("/repo")
            .file("packages/a/package.json", "{}")
            .dir("packages/b");
        let packages = fs.find_relative(&fs.root(), "packages").unwrap();
        let names = fs
            .children(&packages)
            .unwrap()
            .iter()
            .map(|entry| entry.name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "b"]);
        assert!(fs.children(&Entry::new("/repo/missing")).is_err());
    }
}
