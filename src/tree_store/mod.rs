//! TreeStore: the layer that turns a real backend (local filesystem or
//! remote object store) into the engine's uniform [`Node`] shape, and
//! executes write ops against it.
//!
//! Split into `local`/`remote` the way `backend.rs`/`backend/fs.rs` split a
//! trait from its one concrete implementation.

pub mod local;
pub mod remote;

pub use local::LocalTreeStore;
pub use remote::RemoteTreeStore;

use anyhow::Result;

use crate::node::{Node, UserOp};
use crate::uid::Uid;

/// Symlinks (local) and multi-parent chains (remote) both need a bound so a
/// cycle can't spin the scanner forever.
pub const MAX_FS_LINK_DEPTH: u32 = 40;

/// Shared surface `CacheManager` drives both tree stores through.
pub trait TreeStore {
    fn device_uid(&self) -> Uid;

    /// Full rescan of the subtree this store owns: reconciles the on-disk
    /// index and in-memory tree against the backend's current state and
    /// returns the UIDs that no longer exist.
    fn rescan(&self) -> Result<Vec<Uid>>;

    fn get_node(&self, uid: Uid) -> Option<Node>;

    fn get_children(&self, uid: Uid) -> Vec<Node>;

    /// Executes one write op's backend-side effect and updates the
    /// in-memory tree / on-disk index / signal bus to match, in that order
    /// (memory -> disk -> signal), per the write-op execution protocol.
    fn execute_write(&self, op: &UserOp) -> Result<()>;

    /// Applies a node upsert reported back by a `CommandResult` - used by
    /// the Cache Manager to land cache-side effects an executor reports
    /// beyond whatever `execute_write` already applied directly.
    fn apply_upsert(&self, node: Node) -> Result<()>;

    /// Applies a node removal (and whatever it cascades to) reported back
    /// by a `CommandResult`.
    fn apply_remove(&self, uid: Uid) -> Result<()>;
}
