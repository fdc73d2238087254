//! Arena slot type for one queued operation.
//!
//! Grounded in `op_graph.py`'s `OpGraphNode` (an OGN): a queued `UserOp`
//! plus the graph edges needed to know when it's safe to run. Arena-indexed
//! (`Vec<Option<OpGraphNode>>`) rather than `Rc`-linked, per Design Note §9 -
//! no reference cycles to worry about, and a completed or rolled-back OGN
//! just leaves a hole.

use crate::node::UserOp;
use crate::uid::Uid;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OgnId(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OgnStatus {
    /// Queued, waiting on its parents (see [`OpGraphNode::parents`]).
    Pending,
    /// Handed to the executor, not yet completed.
    Executing,
    /// Can't run because some OGN it depends on - directly or
    /// transitively - failed.
    Blocked,
    Completed,
    Failed,
}

/// Which side of a binary (`CP`/`MV`/`START_DIR_*`) op this OGN stands for.
/// Unary ops (`MKDIR`, `RM`, `FINISH_DIR_*`) use `Single`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OgnRole {
    Single,
    /// The node being read from/removed from its current location.
    Src,
    /// The not-yet-existing node being created at the destination.
    Dst,
}

/// One queued op and the edges that make up the Op Graph around it.
pub struct OpGraphNode {
    pub id: OgnId,
    pub op: UserOp,
    pub role: OgnRole,
    pub status: OgnStatus,
    /// The node (by UID) this OGN is queued against - the key into
    /// `OpGraph`'s per-node FIFO queues.
    pub target_uid: Uid,
    /// Every OGN that must be `Completed` before this one is ready. Always
    /// includes this target's own queue predecessor, if any, plus whatever
    /// cross-node dependencies the `RM`/non-`RM`/`FINISH_DIR` insertion
    /// rules added.
    pub parents: Vec<OgnId>,
    /// Reverse edges of `parents` - every OGN that names this one as a
    /// parent. Walked to propagate `Blocked` when this OGN fails.
    pub children: Vec<OgnId>,
    /// For a binary op's two OGNs (src-side, dst-side): the other half.
    /// Both must be independently ready before the op as a whole can be
    /// dispatched, and both transition status together.
    pub sibling: Option<OgnId>,
    /// Batch this OGN was inserted as part of, for group rollback.
    pub batch_id: u64,
}

impl OpGraphNode {
    pub fn is_rm(&self) -> bool {
        self.op.is_rm()
    }

    pub fn is_finish_dir(&self) -> bool {
        self.op.is_finish_dir()
    }
}
