//! Arena-backed tree node type shared by every [`crate::vfs::VirtualFs`].
//!
//! Children are owned by their parent directory; a child only holds a
//! non-owning index back to its parent, so renames/moves never require
//! cloning subtrees — only index bookkeeping. Two indices are kept per
//! directory: a name-sorted index for fast lookup and listing, and a
//! serialization-order index that records the order entries were loaded
//! in (or appended in, for freshly created ones) so translators can
//! reproduce a stable on-disk layout across a load/modify/save cycle.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU32;
use std::sync::RwLock;

/// Index into a [`crate::vfs::VirtualFs`] arena. `ROOT` always refers to
/// the filesystem's root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

/// Whether a path component must resolve to a directory, or may resolve to
/// either a directory or a plain file depending on what's actually there.
///
/// `DISTINGUISHED` is used for intermediate path components (`a` in
/// `a/b/c`), which must always be directories. `AMBIVALENT_FILE` is used
/// for the final component of operations like `exists`/`query_stats` that
/// accept either kind of node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathProcessMode {
    Distinguished,
    AmbivalentFile,
}

#[derive(Debug)]
pub struct DirData {
    pub by_name: BTreeMap<String, NodeId>,
    pub order: Vec<NodeId>,
}

impl DirData {
    pub fn new() -> Self {
        Self {
            by_name: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn insert(&mut self, name: String, id: NodeId) {
        self.by_name.insert(name, id);
        self.order.push(id);
    }

    pub fn remove(&mut self, name: &str) -> Option<NodeId> {
        let id = self.by_name.remove(name)?;
        self.order.retain(|&x| x != id);
        Some(id)
    }
}

impl Default for DirData {
    fn default() -> Self {
        Self::new()
    }
}

pub enum NodeKind<M> {
    Directory(DirData),
    File {
        data_state: RwLock<crate::vfs::DataState>,
        meta: RwLock<M>,
        /// Number of outstanding open stream handles; deletes and renames
        /// of a locked node are refused until it drops to zero.
        lock_count: AtomicU32,
    },
}

impl<M: std::fmt::Debug> std::fmt::Debug for NodeKind<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Directory(d) => f.debug_tuple("Directory").field(d).finish(),
            NodeKind::File { lock_count, .. } => f
                .debug_struct("File")
                .field("lock_count", lock_count)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
pub struct Node<M> {
    pub name: String,
    pub parent: Option<NodeId>,
    pub kind: NodeKind<M>,
}

impl<M> Node<M> {
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn lock_count(&self) -> u32 {
        match &self.kind {
            NodeKind::File { lock_count, .. } => lock_count.load(std::sync::atomic::Ordering::Acquire),
            NodeKind::Directory(_) => 0,
        }
    }
}
