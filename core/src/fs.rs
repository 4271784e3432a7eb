//! The filesystem seam between the classifier and whatever is actually
//! backing the paths: the real OS for production, an in-memory tree for
//! tests and for hook-layer development.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::canonical::CanonicalPath;

/// Reparse-point flavors the resolver distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    FileSymlink,
    DirectorySymlink,
    Junction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsNodeKind {
    File,
    Directory,
    ReparsePoint {
        /// Raw link target as stored; may be relative to the link's parent.
        target: String,
        kind: LinkKind,
    },
}

/// Minimal view of the filesystem the resolver and classifier need. The
/// trait is object-safe so hook layers can hand in whatever they sit on.
pub trait FileSystem: Send + Sync {
    /// What lives at `path`, or `None` if nothing does. Must not follow a
    /// reparse point at the final segment.
    fn node_kind(&self, path: &CanonicalPath) -> Option<FsNodeKind>;
}

/// Production implementation over the host filesystem.
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn node_kind(&self, path: &CanonicalPath) -> Option<FsNodeKind> {
        let native = PathBuf::from(path.to_string());
        let meta = std::fs::symlink_metadata(&native).ok()?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&native).ok()?;
            // Whether the link points at a directory decides how rename
            // and delete treat it; a broken link counts as a file symlink.
            let kind = match std::fs::metadata(&native) {
                Ok(m) if m.is_dir() => LinkKind::DirectorySymlink,
                _ => LinkKind::FileSymlink,
            };
            return Some(FsNodeKind::ReparsePoint {
                target: target.to_string_lossy().into_owned(),
                kind,
            });
        }
        if meta.is_dir() {
            Some(FsNodeKind::Directory)
        } else {
            Some(FsNodeKind::File)
        }
    }
}

/// In-memory filesystem used by the test suites and by hook-layer
/// development builds. Paths are keyed by canonical text.
#[derive(Default)]
pub struct MemFileSystem {
    nodes: Mutex<HashMap<String, FsNodeKind>>,
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: &str) {
        self.insert_parents(path);
        self.insert(path, FsNodeKind::File);
    }

    pub fn add_dir(&self, path: &str) {
        self.insert_parents(path);
        self.insert(path, FsNodeKind::Directory);
    }

    pub fn add_link(&self, path: &str, target: &str, kind: LinkKind) {
        self.insert_parents(path);
        self.insert(
            path,
            FsNodeKind::ReparsePoint {
                target: target.to_string(),
                kind,
            },
        );
    }

    pub fn remove(&self, path: &str) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.remove(path);
        }
    }

    fn insert(&self, path: &str, kind: FsNodeKind) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.insert(path.to_string(), kind);
        }
    }

    fn insert_parents(&self, path: &str) {
        let Some(mut current) = CanonicalPath::from_canonical(path) else {
            return;
        };
        if let Ok(mut nodes) = self.nodes.lock() {
            while let Some(parent) = current.parent() {
                nodes
                    .entry(parent.to_string())
                    .or_insert(FsNodeKind::Directory);
                current = parent;
            }
        }
    }
}

impl FileSystem for MemFileSystem {
    fn node_kind(&self, path: &CanonicalPath) -> Option<FsNodeKind> {
        if path.is_root() {
            return Some(FsNodeKind::Directory);
        }
        self.nodes
            .lock()
            .ok()
            .and_then(|nodes| nodes.get(&path.to_string()).cloned())
    }
}
