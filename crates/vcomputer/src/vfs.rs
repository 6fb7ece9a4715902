use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::sync::lock_or_recover;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("/{0}: no such file")]
    NotFound(String),
    #[error("/{0}: file exists")]
    AlreadyExists(String),
    #[error("/{0}: not a directory")]
    NotADirectory(String),
    #[error("/{0}: is a directory")]
    IsADirectory(String),
    #[error("can't copy or move /{from} inside itself")]
    IntoItself { from: String, to: String },
}

/// Filesystem a computer's scripts and uploads see. Paths are `/`-separated
/// and relative to the computer's root.
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    fn is_dir(&self, path: &str) -> bool;

    fn read(&self, path: &str) -> Result<Vec<u8>, FsError>;

    /// Creates or replaces a file, creating missing parent directories.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), FsError>;

    fn make_dir(&self, path: &str) -> Result<(), FsError>;

    fn list(&self, path: &str) -> Result<Vec<String>, FsError>;

    fn delete(&self, path: &str) -> Result<(), FsError>;

    /// Fails if `to` exists, `from` is missing, or `to` is inside `from`.
    fn copy(&self, from: &str, to: &str) -> Result<(), FsError>;

    /// Same preconditions as [`FileSystem::copy`].
    fn move_to(&self, from: &str, to: &str) -> Result<(), FsError>;

    fn combine(&self, path: &str, child: &str) -> String {
        combine_paths(path, child)
    }
}

/// Joins two paths and normalises the result: `.` segments vanish, `..`
/// pops a segment and never climbs above the root.
pub fn combine_paths(path: &str, child: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']).chain(child.split(['/', '\\'])) {
        match segment.trim() {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    segments.join("/")
}

fn normalise(path: &str) -> String {
    combine_paths(path, "")
}

fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(""))
}

fn is_within(path: &str, ancestor: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// In-memory [`FileSystem`]. The root directory always exists.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    nodes: Mutex<BTreeMap<String, Node>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Node>> {
        lock_or_recover(&self.nodes, "memory_fs")
    }
}

fn node_exists(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
    path.is_empty() || nodes.contains_key(path)
}

fn ensure_dirs(nodes: &mut BTreeMap<String, Node>, path: &str) -> Result<(), FsError> {
    if path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = parent_of(path) {
        ensure_dirs(nodes, parent)?;
    }
    match nodes.get(path) {
        Some(Node::Dir) => Ok(()),
        Some(Node::File(_)) => Err(FsError::NotADirectory(path.to_string())),
        None => {
            nodes.insert(path.to_string(), Node::Dir);
            Ok(())
        }
    }
}

/// Every entry at or below `root`, as (relative suffix, node).
fn subtree(nodes: &BTreeMap<String, Node>, root: &str) -> Vec<(String, Node)> {
    nodes
        .iter()
        .filter(|(path, _)| is_within(path, root))
        .map(|(path, node)| (path[root.len()..].to_string(), node.clone()))
        .collect()
}

fn check_transfer(
    nodes: &BTreeMap<String, Node>,
    from: &str,
    to: &str,
) -> Result<(), FsError> {
    if !node_exists(nodes, from) {
        return Err(FsError::NotFound(from.to_string()));
    }
    if node_exists(nodes, to) {
        return Err(FsError::AlreadyExists(to.to_string()));
    }
    if is_within(to, from) {
        return Err(FsError::IntoItself {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

impl FileSystem for MemoryFileSystem {
    fn exists(&self, path: &str) -> bool {
        node_exists(&self.lock(), &normalise(path))
    }

    fn is_dir(&self, path: &str) -> bool {
        let path = normalise(path);
        path.is_empty() || matches!(self.lock().get(&path), Some(Node::Dir))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let path = normalise(path);
        match self.lock().get(&path) {
            Some(Node::File(bytes)) => Ok(bytes.clone()),
            Some(Node::Dir) => Err(FsError::IsADirectory(path)),
            None if path.is_empty() => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), FsError> {
        let path = normalise(path);
        let mut nodes = self.lock();
        if path.is_empty() || matches!(nodes.get(&path), Some(Node::Dir)) {
            return Err(FsError::IsADirectory(path));
        }
        if let Some(parent) = parent_of(&path) {
            ensure_dirs(&mut nodes, parent)?;
        }
        nodes.insert(path, Node::File(bytes.to_vec()));
        Ok(())
    }

    fn make_dir(&self, path: &str) -> Result<(), FsError> {
        ensure_dirs(&mut self.lock(), &normalise(path))
    }

    fn list(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = normalise(path);
        let nodes = self.lock();
        match nodes.get(&path) {
            Some(Node::File(_)) => return Err(FsError::NotADirectory(path)),
            None if !path.is_empty() => return Err(FsError::NotFound(path)),
            _ => {}
        }
        let children = nodes
            .keys()
            .filter(|candidate| parent_of(candidate) == Some(path.as_str()))
            .map(|candidate| candidate.rsplit('/').next().unwrap_or(candidate).to_string())
            .collect();
        Ok(children)
    }

    fn delete(&self, path: &str) -> Result<(), FsError> {
        let path = normalise(path);
        let mut nodes = self.lock();
        if !node_exists(&nodes, &path) {
            return Err(FsError::NotFound(path));
        }
        nodes.retain(|candidate, _| !is_within(candidate, &path));
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), FsError> {
        let (from, to) = (normalise(from), normalise(to));
        let mut nodes = self.lock();
        check_transfer(&nodes, &from, &to)?;
        if let Some(parent) = parent_of(&to) {
            ensure_dirs(&mut nodes, parent)?;
        }
        for (suffix, node) in subtree(&nodes, &from) {
            nodes.insert(format!("{to}{suffix}"), node);
        }
        Ok(())
    }

    fn move_to(&self, from: &str, to: &str) -> Result<(), FsError> {
        let (from, to) = (normalise(from), normalise(to));
        let mut nodes = self.lock();
        check_transfer(&nodes, &from, &to)?;
        if let Some(parent) = parent_of(&to) {
            ensure_dirs(&mut nodes, parent)?;
        }
        let moved = subtree(&nodes, &from);
        nodes.retain(|candidate, _| !is_within(candidate, &from));
        for (suffix, node) in moved {
            nodes.insert(format!("{to}{suffix}"), node);
        }
        Ok(())
    }
}
