//! The virtual filesystem tree shared by every archive translator: a
//! rooted tree of directories and files, addressed by `/`-separated paths
//! resolved relative to a current working directory.
//!
//! Concurrency model: the tree shape (parent/child links, name and order
//! indices, current working directory) lives behind a single
//! [`std::sync::RwLock`] — tree mutations are bounded and never block on
//! I/O. Each file node's data state and format-specific metadata have
//! their own `RwLock`, taken only while a specific entry's content or
//! metadata is being read or mutated, so one slow open doesn't stall
//! unrelated tree walks. No lock is ever held across an I/O call to the
//! backing archive file; translators copy out what they need first.

pub mod node;
pub mod path;

use std::sync::{Arc, RwLock};

use node::{DirData, Node, NodeId, NodeKind, PathProcessMode};

use crate::error::{Error, Result};
use crate::presence::FileDataPresence;

/// Where a file's content currently lives, transitioning strictly forward
/// (never backward) over the node's lifetime until it is deleted:
/// `Archived` (content only exists inside the backing archive, not yet
/// read out) -> `PresentCompressed` (materialized but the bytes in the
/// sink are still in their on-disk compressed form — used transiently
/// while copying an entry between two archives of the same format without
/// paying to decompress/recompress) -> `Present` (materialized, fully
/// decompressed, ready for arbitrary reads and writes).
pub enum DataState {
    Archived,
    PresentCompressed(FileDataPresence),
    Present(FileDataPresence),
}

impl std::fmt::Debug for DataState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataState::Archived => "Archived",
            DataState::PresentCompressed(_) => "PresentCompressed",
            DataState::Present(_) => "Present",
        };
        f.write_str(s)
    }
}

struct Arena<M> {
    nodes: Vec<Option<Node<M>>>,
    free: Vec<u32>,
    cwd: NodeId,
}

impl<M> Arena<M> {
    fn get(&self, id: NodeId) -> Result<&Node<M>> {
        self.nodes
            .get(id.0 as usize)
            .and_then(|n| n.as_ref())
            .ok_or(Error::InvariantViolation("dangling node id"))
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut Node<M>> {
        self.nodes
            .get_mut(id.0 as usize)
            .and_then(|n| n.as_mut())
            .ok_or(Error::InvariantViolation("dangling node id"))
    }

    fn dir_mut(&mut self, id: NodeId) -> Result<&mut DirData> {
        match &mut self.get_mut(id)?.kind {
            NodeKind::Directory(d) => Ok(d),
            NodeKind::File { .. } => Err(Error::InvariantViolation("expected a directory")),
        }
    }

    fn dir(&self, id: NodeId) -> Result<&DirData> {
        match &self.get(id)?.kind {
            NodeKind::Directory(d) => Ok(d),
            NodeKind::File { .. } => Err(Error::InvariantViolation("expected a directory")),
        }
    }

    fn alloc(&mut self, node: Node<M>) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(node);
            NodeId(idx)
        } else {
            self.nodes.push(Some(node));
            NodeId((self.nodes.len() - 1) as u32)
        }
    }

    /// Is `ancestor` equal to or a directory-ancestor of `node`? Used to
    /// refuse renames/moves that would uproot a directory into its own
    /// subtree.
    fn is_ancestor_of(&self, ancestor: NodeId, node: NodeId) -> Result<bool> {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if id == ancestor {
                return Ok(true);
            }
            cur = self.get(id)?.parent;
        }
        Ok(false)
    }

    fn full_path(&self, mut id: NodeId) -> Result<String> {
        let mut parts = Vec::new();
        loop {
            let node = self.get(id)?;
            match node.parent {
                None => break,
                Some(parent) => {
                    parts.push(node.name.clone());
                    id = parent;
                }
            }
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }
}

/// The tree itself, generic over the format-specific per-file metadata
/// type `M` (e.g. ZIP's directory-header fields, or IMG's block/resource
/// fields).
pub struct VirtualFs<M> {
    arena: RwLock<Arena<M>>,
}

impl<M: Default> VirtualFs<M> {
    pub fn new() -> Arc<Self> {
        let root = Node {
            name: String::new(),
            parent: None,
            kind: NodeKind::Directory(DirData::new()),
        };
        Arc::new(Self {
            arena: RwLock::new(Arena {
                nodes: vec![Some(root)],
                free: Vec::new(),
                cwd: NodeId::ROOT,
            }),
        })
    }
}

impl<M> VirtualFs<M> {
    /// Resolves `path` (relative to the current working directory unless
    /// it starts with `/`) to a node id.
    pub fn resolve(&self, path: &str, mode: PathProcessMode) -> Result<NodeId> {
        let arena = self.arena.read().unwrap();
        self.resolve_locked(&arena, path, mode)
    }

    fn resolve_locked(&self, arena: &Arena<M>, path: &str, mode: PathProcessMode) -> Result<NodeId> {
        let comps = path::components(path);
        let mut cur = if comps.first() == Some(&path::Component::RootAnchor) {
            NodeId::ROOT
        } else {
            arena.cwd
        };
        let mut iter = comps.into_iter().peekable();
        if iter.peek() == Some(&path::Component::RootAnchor) {
            iter.next();
        }
        while let Some(comp) = iter.next() {
            let is_last = iter.peek().is_none();
            match comp {
                path::Component::RootAnchor => cur = NodeId::ROOT,
                path::Component::CurDir => {}
                path::Component::ParentDir => {
                    cur = arena.get(cur)?.parent.unwrap_or(NodeId::ROOT);
                }
                path::Component::Named(name) => {
                    let dir = arena.dir(cur)?;
                    let next = *dir
                        .by_name
                        .get(name)
                        .ok_or(Error::InvariantViolation("path component not found"))?;
                    if !is_last || mode == PathProcessMode::Distinguished {
                        if !arena.get(next)?.is_directory() {
                            return Err(Error::InvariantViolation("path component is not a directory"));
                        }
                    }
                    cur = next;
                }
            }
        }
        Ok(cur)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path, PathProcessMode::AmbivalentFile).is_ok()
    }

    pub fn is_directory(&self, path: &str) -> Result<bool> {
        let id = self.resolve(path, PathProcessMode::AmbivalentFile)?;
        let arena = self.arena.read().unwrap();
        Ok(arena.get(id)?.is_directory())
    }

    pub fn create_dir(&self, path: &str) -> Result<NodeId>
    where
        M: Default,
    {
        let (parent_path, name) = path::split_parent(path);
        let mut arena = self.arena.write().unwrap();
        let parent_path = if parent_path.is_empty() { "." } else { &parent_path };
        let parent = self.resolve_locked(&arena, parent_path, PathProcessMode::Distinguished)?;
        if arena.dir(parent)?.by_name.contains_key(&name) {
            return Err(Error::InvariantViolation("a node with that name already exists"));
        }
        let id = arena.alloc(Node {
            name: name.clone(),
            parent: Some(parent),
            kind: NodeKind::Directory(DirData::new()),
        });
        arena.dir_mut(parent)?.insert(name, id);
        Ok(id)
    }

    /// Creates (or returns, if it already exists as a file) the node for
    /// `path`, used by translators when materializing a fresh file entry.
    pub fn create_file(&self, path: &str, meta: M) -> Result<NodeId>
    where
        M: Default,
    {
        let (parent_path, name) = path::split_parent(path);
        let mut arena = self.arena.write().unwrap();
        let parent_path = if parent_path.is_empty() { "." } else { &parent_path };
        let parent = self.resolve_locked(&arena, &parent_path, PathProcessMode::Distinguished)?;
        if let Some(&existing) = arena.dir(parent)?.by_name.get(&name) {
            return Ok(existing);
        }
        let id = arena.alloc(Node {
            name: name.clone(),
            parent: Some(parent),
            kind: NodeKind::File {
                data_state: RwLock::new(DataState::Archived),
                meta: RwLock::new(meta),
                lock_count: std::sync::atomic::AtomicU32::new(0),
            },
        });
        arena.dir_mut(parent)?.insert(name, id);
        Ok(id)
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        let mut arena = self.arena.write().unwrap();
        let id = self.resolve_locked(&arena, path, PathProcessMode::AmbivalentFile)?;
        if id == NodeId::ROOT {
            return Err(Error::InvariantViolation("cannot delete the root directory"));
        }
        {
            let node = arena.get(id)?;
            if let NodeKind::File { lock_count, .. } = &node.kind {
                if lock_count.load(std::sync::atomic::Ordering::Acquire) > 0 {
                    return Err(Error::InvariantViolation("cannot delete a locked file"));
                }
            }
            if let NodeKind::Directory(d) = &node.kind {
                if !d.order.is_empty() {
                    return Err(Error::InvariantViolation("cannot delete a non-empty directory"));
                }
            }
        }
        let parent = arena.get(id)?.parent;
        let name = arena.get(id)?.name.clone();
        if let Some(parent) = parent {
            arena.dir_mut(parent)?.remove(&name);
        }
        arena.nodes[id.0 as usize] = None;
        arena.free.push(id.0);
        Ok(())
    }

    /// Renames/moves a node, refusing moves that would place a directory
    /// inside its own subtree (the anti-uproot check) or that target a
    /// locked node.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut arena = self.arena.write().unwrap();
        let id = self.resolve_locked(&arena, from, PathProcessMode::AmbivalentFile)?;
        if let NodeKind::File { lock_count, .. } = &arena.get(id)?.kind {
            if lock_count.load(std::sync::atomic::Ordering::Acquire) > 0 {
                return Err(Error::InvariantViolation("cannot rename a locked file"));
            }
        }
        let (to_parent_path, to_name) = path::split_parent(to);
        let to_parent_path = if to_parent_path.is_empty() { "." } else { &to_parent_path };
        let new_parent = self.resolve_locked(&arena, to_parent_path, PathProcessMode::Distinguished)?;

        if arena.is_ancestor_of(id, new_parent)? {
            return Err(Error::InvariantViolation("rename would move a directory into its own subtree"));
        }
        if arena.dir(new_parent)?.by_name.contains_key(&to_name) {
            return Err(Error::InvariantViolation("destination already exists"));
        }

        let old_parent = arena.get(id)?.parent;
        let old_name = arena.get(id)?.name.clone();
        if let Some(old_parent) = old_parent {
            arena.dir_mut(old_parent)?.remove(&old_name);
        }
        arena.dir_mut(new_parent)?.insert(to_name.clone(), id);
        let node = arena.get_mut(id)?;
        node.parent = Some(new_parent);
        node.name = to_name;
        Ok(())
    }

    pub fn change_directory(&self, path: &str) -> Result<()> {
        let mut arena = self.arena.write().unwrap();
        let id = self.resolve_locked(&arena, path, PathProcessMode::Distinguished)?;
        if !arena.get(id)?.is_directory() {
            return Err(Error::InvariantViolation("not a directory"));
        }
        arena.cwd = id;
        Ok(())
    }

    pub fn full_path(&self, id: NodeId) -> Result<String> {
        let arena = self.arena.read().unwrap();
        arena.full_path(id)
    }

    /// Lists the name-sorted entries of a directory, optionally filtered
    /// by a shell-style wildcard pattern.
    pub fn scan_directory(&self, path: &str, pattern: Option<&str>) -> Result<Vec<String>> {
        let arena = self.arena.read().unwrap();
        let id = self.resolve_locked(&arena, path, PathProcessMode::Distinguished)?;
        let dir = arena.dir(id)?;
        Ok(dir
            .by_name
            .keys()
            .filter(|name| pattern.map(|p| crate::wildcard::matches(p, name)).unwrap_or(true))
            .cloned()
            .collect())
    }

    /// Lists a directory's entries in their on-disk serialization order,
    /// used by translators when rebuilding an archive on save so entries
    /// that weren't touched keep a stable position.
    pub fn begin_directory_listing(&self, path: &str) -> Result<Vec<NodeId>> {
        let arena = self.arena.read().unwrap();
        let id = self.resolve_locked(&arena, path, PathProcessMode::Distinguished)?;
        Ok(arena.dir(id)?.order.clone())
    }

    pub fn node_name(&self, id: NodeId) -> Result<String> {
        let arena = self.arena.read().unwrap();
        Ok(arena.get(id)?.name.clone())
    }

    /// Walks the whole tree depth-first, yielding `(full_path, id)` for
    /// every file node in each directory's on-disk serialization order;
    /// used by `save` procedures that need to visit every entry, in the
    /// order the archive's own directory/footer records it, regardless of
    /// directory structure.
    pub fn walk_files(&self) -> Result<Vec<(String, NodeId)>> {
        let arena = self.arena.read().unwrap();
        let mut out = Vec::new();
        let mut stack = vec![NodeId::ROOT];
        while let Some(id) = stack.pop() {
            let node = arena.get(id)?;
            match &node.kind {
                NodeKind::Directory(d) => {
                    // pushed in reverse so popping the stack yields children
                    // in `order`, not reversed: a LIFO stack would otherwise
                    // flip each directory's serialization order.
                    for &child in d.order.iter().rev() {
                        stack.push(child);
                    }
                }
                NodeKind::File { .. } => {
                    out.push((arena.full_path(id)?, id));
                }
            }
        }
        Ok(out)
    }

    pub fn lock(&self, id: NodeId) -> Result<()> {
        let arena = self.arena.read().unwrap();
        match &arena.get(id)?.kind {
            NodeKind::File { lock_count, .. } => {
                lock_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                Ok(())
            }
            NodeKind::Directory(_) => Err(Error::InvariantViolation("cannot lock a directory")),
        }
    }

    pub fn unlock(&self, id: NodeId) -> Result<()> {
        let arena = self.arena.read().unwrap();
        match &arena.get(id)?.kind {
            NodeKind::File { lock_count, .. } => {
                lock_count.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                Ok(())
            }
            NodeKind::Directory(_) => Err(Error::InvariantViolation("cannot unlock a directory")),
        }
    }

    /// Runs `f` with read access to a file node's metadata.
    pub fn with_meta<R>(&self, id: NodeId, f: impl FnOnce(&M) -> R) -> Result<R> {
        let arena = self.arena.read().unwrap();
        match &arena.get(id)?.kind {
            NodeKind::File { meta, .. } => Ok(f(&meta.read().unwrap())),
            NodeKind::Directory(_) => Err(Error::InvariantViolation("expected a file")),
        }
    }

    pub fn with_meta_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut M) -> R) -> Result<R> {
        let arena = self.arena.read().unwrap();
        match &arena.get(id)?.kind {
            NodeKind::File { meta, .. } => Ok(f(&mut meta.write().unwrap())),
            NodeKind::Directory(_) => Err(Error::InvariantViolation("expected a file")),
        }
    }

    /// Materializes a file's content if it is still `Archived`, via the
    /// caller-supplied decompression closure, then runs `f` with exclusive
    /// access to the resulting sink. The data-state lock is held only for
    /// the duration of `f`; the archive file itself is never touched while
    /// it's held.
    pub fn with_data_mut<R>(
        &self,
        id: NodeId,
        materialize: impl FnOnce() -> Result<FileDataPresence>,
        f: impl FnOnce(&mut FileDataPresence) -> Result<R>,
    ) -> Result<R> {
        let arena = self.arena.read().unwrap();
        let NodeKind::File { data_state, .. } = &arena.get(id)?.kind else {
            return Err(Error::InvariantViolation("expected a file"));
        };
        let mut guard = data_state.write().unwrap();
        if matches!(*guard, DataState::Archived) {
            *guard = DataState::Present(materialize()?);
        }
        match &mut *guard {
            DataState::Present(p) | DataState::PresentCompressed(p) => f(p),
            DataState::Archived => unreachable!("just materialized above"),
        }
    }

    /// Checks a file's data sink out of the tree, materializing it first if
    /// it is still `Archived`. The node is left with a transient
    /// `Archived` marker until [`VirtualFs::put_data`] restores it or a
    /// fresh sink is created; callers are expected to hold the node's lock
    /// (via [`VirtualFs::lock`]) for the duration so no other caller can
    /// observe or race the gap.
    pub fn take_data(
        &self,
        id: NodeId,
        materialize: impl FnOnce() -> Result<FileDataPresence>,
    ) -> Result<FileDataPresence> {
        let arena = self.arena.read().unwrap();
        let NodeKind::File { data_state, .. } = &arena.get(id)?.kind else {
            return Err(Error::InvariantViolation("expected a file"));
        };
        let mut guard = data_state.write().unwrap();
        let taken = std::mem::replace(&mut *guard, DataState::Archived);
        match taken {
            DataState::Archived => materialize(),
            DataState::Present(p) | DataState::PresentCompressed(p) => Ok(p),
        }
    }

    /// Restores a sink checked out via [`VirtualFs::take_data`].
    pub fn put_data(&self, id: NodeId, presence: FileDataPresence) -> Result<()> {
        let arena = self.arena.read().unwrap();
        let NodeKind::File { data_state, .. } = &arena.get(id)?.kind else {
            return Err(Error::InvariantViolation("expected a file"));
        };
        *data_state.write().unwrap() = DataState::Present(presence);
        Ok(())
    }

    pub fn is_archived(&self, id: NodeId) -> Result<bool> {
        let arena = self.arena.read().unwrap();
        match &arena.get(id)?.kind {
            NodeKind::File { data_state, .. } => Ok(matches!(*data_state.read().unwrap(), DataState::Archived)),
            NodeKind::Directory(_) => Ok(false),
        }
    }
}

pub use node::PathProcessMode;
