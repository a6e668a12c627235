//! Synthetic filesystem tree: directories and typed leaves.
//!
//! Every file that appears in a served namespace is an in-process
//! object implementing [`FileNode`]. Directories are ordered
//! collections of nodes that may gain and lose children at runtime.
//! Leaves override only the hooks they care about; the defaults
//! answer reads and writes with a permission error.
//!
//! Per-fid scratch (write buffers, reader cursors) is keyed by a
//! process-global 64-bit fid key handed out by [`alloc_fid_key`],
//! because the raw 32-bit protocol fid is only unique within a single
//! connection while leaves are shared by all of them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::string as errstr;
use crate::fcall::{Qid, QidType, Stat, dm};
use crate::res;
use crate::utils::Result;
use crate::wire;

mod commit;
mod ctl;
mod file;
mod gate;
mod queue;
mod stream;

pub use commit::{Commit, CommitFile};
pub use ctl::{CtlFile, CtlHandler};
pub use file::{StaticFile, WriteBuffer};
pub use gate::GateFile;
pub use queue::QueueFile;
pub use stream::StreamFile;

/// Owner name reported in synthesized stats.
pub const OWNER: &str = "synth";

static NEXT_QID_PATH: AtomicU64 = AtomicU64::new(1);
static NEXT_FID_KEY: AtomicU64 = AtomicU64::new(1);

/// Allocate a qid path unique for the lifetime of the process.
pub fn alloc_qid_path() -> u64 {
    NEXT_QID_PATH.fetch_add(1, Ordering::Relaxed)
}

/// Qid for a new synthetic file.
pub fn file_qid() -> Qid {
    Qid {
        typ: QidType::FILE,
        version: 0,
        path: alloc_qid_path(),
    }
}

/// Qid for a new synthetic directory.
pub fn dir_qid() -> Qid {
    Qid {
        typ: QidType::DIR,
        version: 0,
        path: alloc_qid_path(),
    }
}

/// Allocate the process-global key identifying one fid object.
pub fn alloc_fid_key() -> u64 {
    NEXT_FID_KEY.fetch_add(1, Ordering::Relaxed)
}

// Poison-tolerant lock: leaf state stays usable even if a holder
// panicked mid-update.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build the stat of a synthetic file.
pub fn file_stat(name: &str, qid: Qid, mode: u32, length: u64) -> Stat {
    let now = wire::now_sec();
    Stat {
        typ: 0,
        dev: 0,
        qid,
        mode,
        atime: now,
        mtime: now,
        length,
        name: name.to_owned(),
        uid: OWNER.to_owned(),
        gid: OWNER.to_owned(),
        muid: String::new(),
    }
}

/// A synthetic leaf.
///
/// Implementors provide whatever subset of the hooks their semantics
/// need. `fid` arguments are the keys from [`alloc_fid_key`].
#[async_trait]
pub trait FileNode: Send + Sync {
    fn name(&self) -> &str;

    fn qid(&self) -> Qid;

    /// Permission bits reported in stat.
    fn mode(&self) -> u32 {
        0o666
    }

    /// Bytes a read from offset 0 would currently return.
    ///
    /// Control files conventionally report 0 regardless.
    fn length(&self) -> u64 {
        0
    }

    /// Whether Tremove is honored for this node.
    fn removable(&self) -> bool {
        false
    }

    async fn open(&self, _fid: u64, _mode: u8) -> Result<()> {
        Ok(())
    }

    async fn read(&self, _fid: u64, _offset: u64, _count: u32) -> Result<Vec<u8>> {
        res!(errstr::PERM)
    }

    async fn write(&self, _fid: u64, _offset: u64, _data: &[u8]) -> Result<u32> {
        res!(errstr::PERM)
    }

    /// Fid released. Errors are logged by the server but never reach
    /// the client; Rclunk always succeeds.
    async fn clunk(&self, _fid: u64) -> Result<()> {
        Ok(())
    }

    /// Length-only wstat lands here.
    async fn truncate(&self, _len: u64) -> Result<()> {
        Ok(())
    }

    fn stat(&self) -> Stat {
        file_stat(self.name(), self.qid(), self.mode(), self.length())
    }
}

/// One entry in the tree.
#[derive(Clone)]
pub enum Node {
    Dir(Arc<DirNode>),
    File(Arc<dyn FileNode>),
}

impl Node {
    pub fn qid(&self) -> Qid {
        match self {
            Node::Dir(d) => d.qid(),
            Node::File(f) => f.qid(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Node::Dir(d) => d.name().to_owned(),
            Node::File(f) => f.name().to_owned(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }

    pub fn stat(&self) -> Stat {
        match self {
            Node::Dir(d) => d.stat(),
            Node::File(f) => f.stat(),
        }
    }
}

/// Ordered directory of synthetic nodes.
///
/// Children keep insertion order and may be added or removed while
/// directory reads are in progress; an in-flight enumeration sees
/// either the pre- or post-modification listing.
pub struct DirNode {
    name: String,
    qid: Qid,
    removable: bool,
    children: Mutex<Vec<Node>>,
}

impl DirNode {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(DirNode {
            name: name.into(),
            qid: dir_qid(),
            removable: false,
            children: Mutex::new(Vec::new()),
        })
    }

    /// A directory that honors Tremove.
    pub fn removable(name: impl Into<String>) -> Arc<Self> {
        Arc::new(DirNode {
            name: name.into(),
            qid: dir_qid(),
            removable: true,
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qid(&self) -> Qid {
        self.qid
    }

    pub fn is_removable(&self) -> bool {
        self.removable
    }

    /// Add a child, keeping names unique within the directory.
    pub fn add(&self, node: Node) -> Result<()> {
        let mut children = lock(&self.children);
        if children.iter().any(|c| c.name() == node.name()) {
            return res!(errstr::FILE_EXISTS);
        }
        children.push(node);
        Ok(())
    }

    pub fn add_dir(&self, dir: Arc<DirNode>) -> Result<()> {
        self.add(Node::Dir(dir))
    }

    pub fn add_file(&self, file: Arc<dyn FileNode>) -> Result<()> {
        self.add(Node::File(file))
    }

    /// Remove a child by name. Returns whether anything was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut children = lock(&self.children);
        let before = children.len();
        children.retain(|c| c.name() != name);
        children.len() != before
    }

    pub fn child(&self, name: &str) -> Option<Node> {
        lock(&self.children).iter().find(|c| c.name() == name).cloned()
    }

    /// Child at the enumeration cursor position, if still present.
    pub fn entry_at(&self, index: usize) -> Option<Node> {
        lock(&self.children).get(index).cloned()
    }

    /// Snapshot of the listing in insertion order.
    pub fn entries(&self) -> Vec<Node> {
        lock(&self.children).clone()
    }

    pub fn stat(&self) -> Stat {
        file_stat(&self.name, self.qid, dm::DIR | 0o777, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_children_keep_insertion_order() {
        let dir = DirNode::new("root");
        dir.add_file(StaticFile::new("b", b"1".to_vec())).unwrap();
        dir.add_file(StaticFile::new("a", b"2".to_vec())).unwrap();
        dir.add_dir(DirNode::new("c")).unwrap();

        let names: Vec<String> = dir.entries().iter().map(|n| n.name()).collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn dir_rejects_duplicate_names() {
        let dir = DirNode::new("root");
        dir.add_file(StaticFile::new("x", vec![])).unwrap();
        assert!(dir.add_file(StaticFile::new("x", vec![])).is_err());
    }

    #[test]
    fn dir_remove_and_lookup() {
        let dir = DirNode::new("root");
        dir.add_file(StaticFile::new("x", vec![])).unwrap();

        assert!(dir.child("x").is_some());
        assert!(dir.remove("x"));
        assert!(dir.child("x").is_none());
        assert!(!dir.remove("x"));
    }

    #[test]
    fn dir_stat_is_directory() {
        let dir = DirNode::new("root");
        let stat = dir.stat();
        assert!(stat.qid.typ.contains(QidType::DIR));
        assert_eq!(stat.mode, dm::DIR | 0o777);
        assert_eq!(stat.length, 0);
    }
}
