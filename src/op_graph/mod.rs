//! The Op Graph: a DAG of queued [`UserOp`]s, ordered per target node (an
//! op against a given node never runs out of order relative to an earlier
//! op against the same node) with a handful of cross-node insertion rules
//! for `RM`, non-`RM` inserts, and `FINISH_DIR`.
//!
//! Grounded line-for-line in
//! `examples/original_source/outlet/be/exec/user_op/op_graph.py`:
//! `insert_ogn`/`insert_batch_graph` (insertion + transactional rollback),
//! `get_next_op`/`get_next_op_nowait` (readiness-based dequeue),
//! `pop_completed_op` (completion), `fail_op`/`retry_failed_op`
//! (transitive blocking and reset), and the icon-change bookkeeping
//! (`_increment_icon_update_counts`/`_decrement_icon_update_counts`/
//! `get_icon_for_node`/`pop_ancestor_icon_changes`).

pub mod node;

use std::collections::{HashSet, VecDeque};

use anyhow::{Result, bail};
use rustc_hash::FxHashMap;

use crate::error::EngineError;
use crate::node::UserOp;
use crate::uid::Uid;

pub use node::{OgnId, OgnRole, OgnStatus, OpGraphNode};

/// One op to insert into the graph, with everything insertion needs to
/// compute its graph edges. The Cache Manager builds these - only it knows
/// tree structure, so the Op Graph stays tree-agnostic and just wires up
/// the OGNs it's told about.
pub struct OpInsertItem {
    pub op: UserOp,
    /// Target uid for a unary op's one OGN, or a binary op's src-side OGN
    /// (the existing node the op reads from / removes).
    pub src_target: Uid,
    /// Target-parent uids whose queue tail the src-side OGN links under if
    /// it's a brand-new target (insertion rule 3a) - empty for ops like
    /// `RM` and `CP`/`MV`'s src side that aren't "inserting into" a
    /// directory.
    pub src_parent_targets: Vec<Uid>,
    /// For a binary op: the dst-side OGN's own target uid (the
    /// not-yet-existing node about to be created there).
    pub dst_target: Option<Uid>,
    /// Parent directory uid(s) the dst-side OGN links under.
    pub dst_parent_targets: Vec<Uid>,
    /// Full ancestor chain for icon bookkeeping.
    pub ancestor_uids: Vec<Uid>,
    /// `RM` only: queue-tail OGN of each direct child, adopted as parents
    /// of the new `RM` OGN (rule 1b) so the parent can't run before every
    /// child is gone.
    pub child_removal_tails: Vec<OgnId>,
    /// `FINISH_DIR_*` only: extra parents beyond the normal target-queue
    /// chain - the leaf OGNs reachable from the matching `START_DIR_*`
    /// within this batch (rule 2).
    pub extra_parents: Vec<OgnId>,
}

impl OpInsertItem {
    pub fn unary(op: UserOp, target: Uid, parent_targets: Vec<Uid>, ancestor_uids: Vec<Uid>) -> Self {
        Self {
            op,
            src_target: target,
            src_parent_targets: parent_targets,
            dst_target: None,
            dst_parent_targets: Vec::new(),
            ancestor_uids,
            child_removal_tails: Vec::new(),
            extra_parents: Vec::new(),
        }
    }

    pub fn rm(op: UserOp, target: Uid, ancestor_uids: Vec<Uid>, child_removal_tails: Vec<OgnId>) -> Self {
        Self {
            op,
            src_target: target,
            src_parent_targets: Vec::new(),
            dst_target: None,
            dst_parent_targets: Vec::new(),
            ancestor_uids,
            child_removal_tails,
            extra_parents: Vec::new(),
        }
    }

    pub fn binary(
        op: UserOp,
        src_target: Uid,
        dst_target: Uid,
        dst_parent_targets: Vec<Uid>,
        ancestor_uids: Vec<Uid>,
    ) -> Self {
        Self {
            op,
            src_target,
            src_parent_targets: Vec::new(),
            dst_target: Some(dst_target),
            dst_parent_targets,
            ancestor_uids,
            child_removal_tails: Vec::new(),
            extra_parents: Vec::new(),
        }
    }

    pub fn finish_dir(op: UserOp, target: Uid, ancestor_uids: Vec<Uid>, extra_parents: Vec<OgnId>) -> Self {
        Self {
            op,
            src_target: target,
            src_parent_targets: Vec::new(),
            dst_target: None,
            dst_parent_targets: Vec::new(),
            ancestor_uids,
            child_removal_tails: Vec::new(),
            extra_parents,
        }
    }
}

/// Arena-allocated DAG of queued ops. No external crate needed - the arena
/// is a plain `Vec`, edges are `OgnId` indices, per Design Note §9.
pub struct OpGraph {
    arena: Vec<Option<OpGraphNode>>,
    /// FIFO of OGNs queued against each target node, oldest first.
    node_queues: FxHashMap<Uid, VecDeque<OgnId>>,
    next_batch_id: u64,
    /// Per-ancestor-uid count of descendant OGNs that are pending,
    /// executing, or blocked - used to decide whether an ancestor's icon
    /// should show a "sync in progress" badge.
    icon_change_counts: FxHashMap<Uid, i64>,
    /// Ancestor uids whose icon-change count changed since the last
    /// `pop_ancestor_icon_changes` call.
    dirty_icon_ancestors: HashSet<Uid>,
}

impl OpGraph {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            node_queues: FxHashMap::default(),
            next_batch_id: 0,
            icon_change_counts: FxHashMap::default(),
            dirty_icon_ancestors: HashSet::new(),
        }
    }

    fn alloc(&mut self, node: OpGraphNode) -> OgnId {
        let id = OgnId(self.arena.len() as u32);
        self.arena.push(Some(node));
        id
    }

    fn get(&self, id: OgnId) -> Option<&OpGraphNode> {
        self.arena.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    fn get_mut(&mut self, id: OgnId) -> Option<&mut OpGraphNode> {
        self.arena.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    /// Ready on its own terms: pending, and every parent either freed
    /// (completed and reaped) or still present but itself `Completed`.
    fn is_ready_single(&self, id: OgnId) -> bool {
        let Some(node) = self.get(id) else {
            return false;
        };
        if node.status != OgnStatus::Pending {
            return false;
        }
        node.parents
            .iter()
            .all(|p| self.get(*p).map(|n| n.status == OgnStatus::Completed).unwrap_or(true))
    }

    /// Ready as a whole op: for a binary op, both the src-side and dst-side
    /// OGN must independently be ready before either can be dispatched.
    fn is_op_ready(&self, id: OgnId) -> bool {
        if !self.is_ready_single(id) {
            return false;
        }
        match self.get(id).and_then(|n| n.sibling) {
            Some(sibling) => self.is_ready_single(sibling),
            None => true,
        }
    }

    /// Exposed for tests and callers that just want a readiness check
    /// without dequeuing.
    pub fn is_ready(&self, id: OgnId) -> bool {
        self.is_op_ready(id)
    }

    fn mark_executing(&mut self, id: OgnId) {
        let sibling = self.get(id).and_then(|n| n.sibling);
        if let Some(n) = self.get_mut(id) {
            n.status = OgnStatus::Executing;
        }
        if let Some(sibling) = sibling {
            if let Some(n) = self.get_mut(sibling) {
                n.status = OgnStatus::Executing;
            }
        }
    }

    fn increment_icon_ancestors(&mut self, ancestors: &[Uid]) {
        for uid in ancestors {
            *self.icon_change_counts.entry(*uid).or_insert(0) += 1;
            self.dirty_icon_ancestors.insert(*uid);
        }
    }

    fn decrement_icon_ancestors(&mut self, ancestors: &[Uid]) {
        for uid in ancestors {
            if let Some(count) = self.icon_change_counts.get_mut(uid) {
                *count -= 1;
                if *count <= 0 {
                    self.icon_change_counts.remove(uid);
                }
            }
            self.dirty_icon_ancestors.insert(*uid);
        }
    }

    /// True if `uid` has any descendant op in flight - the UI badges this
    /// node's icon to show a sync is underway somewhere beneath it.
    pub fn get_icon_for_node(&self, uid: Uid) -> bool {
        self.icon_change_counts.get(&uid).copied().unwrap_or(0) > 0
    }

    /// Drains and returns the ancestor uids whose icon-change state moved
    /// since the last call, so a signal can be published for exactly the
    /// ancestors that need re-rendering.
    pub fn pop_ancestor_icon_changes(&mut self) -> Vec<Uid> {
        self.dirty_icon_ancestors.drain().collect()
    }

    fn link_parents(&mut self, id: OgnId, parents: Vec<OgnId>) {
        for p in &parents {
            if let Some(pn) = self.get_mut(*p) {
                pn.children.push(id);
            }
        }
        if let Some(n) = self.get_mut(id) {
            n.parents = parents;
        }
    }

    /// Allocates one physical OGN and wires up its `parents` per the
    /// insertion rules:
    ///
    /// - `RM` (rule 1): parents are the child-removal tails if any were
    ///   given (rule 1b - can't remove a directory before every child
    ///   already queued against it is itself a `RM`), else this target's
    ///   own queue tail (rule 1c/1d), else none.
    /// - Everything else (rule 3): parents are this target's own queue
    ///   tail if it already has one (3b - same-node ordering wins), else
    ///   the queue tail of each parent-target uid (3a - can't insert into
    ///   a directory queued for removal, and waits for whatever's ahead of
    ///   it in that directory).
    /// - `extra_parents` (rule 2, `FINISH_DIR`) are unioned in regardless.
    fn insert_ogn(
        &mut self,
        op: UserOp,
        role: OgnRole,
        target_uid: Uid,
        parent_target_uids: &[Uid],
        child_removal_tails: &[OgnId],
        extra_parents: &[OgnId],
        batch_id: u64,
    ) -> Result<OgnId> {
        let is_rm = op.is_rm();
        let own_tail = self.queue_tail_for(target_uid);

        if is_rm {
            if let Some(tail) = own_tail {
                if self.get(tail).map(|n| n.is_rm()).unwrap_or(false) {
                    bail!(EngineError::InvalidInsertOpGraph {
                        reason: "node is already queued for removal".to_string(),
                    });
                }
            }
            for tail in child_removal_tails {
                if !self.get(*tail).map(|n| n.is_rm()).unwrap_or(false) {
                    bail!(EngineError::InvalidInsertOpGraph {
                        reason: "a RM's adopted child op must itself be a RM".to_string(),
                    });
                }
            }
        } else if own_tail.is_none() {
            for p in parent_target_uids {
                if let Some(tail) = self.queue_tail_for(*p) {
                    if self.get(tail).map(|n| n.is_rm()).unwrap_or(false) {
                        bail!(EngineError::InvalidInsertOpGraph {
                            reason: "cannot insert into a directory queued for removal".to_string(),
                        });
                    }
                }
            }
        }

        let mut parents: Vec<OgnId> = if is_rm {
            if !child_removal_tails.is_empty() {
                child_removal_tails.to_vec()
            } else if let Some(tail) = own_tail {
                vec![tail]
            } else {
                Vec::new()
            }
        } else if let Some(tail) = own_tail {
            vec![tail]
        } else {
            parent_target_uids.iter().filter_map(|p| self.queue_tail_for(*p)).collect()
        };
        for p in extra_parents {
            if !parents.contains(p) {
                parents.push(*p);
            }
        }

        let id = self.alloc(OpGraphNode {
            id: OgnId(0), // patched below
            op,
            role,
            status: OgnStatus::Pending,
            target_uid,
            parents: Vec::new(),
            children: Vec::new(),
            sibling: None,
            batch_id,
        });
        if let Some(slot) = self.arena.get_mut(id.0 as usize).and_then(|s| s.as_mut()) {
            slot.id = id;
        }
        self.link_parents(id, parents);

        self.node_queues.entry(target_uid).or_default().push_back(id);
        Ok(id)
    }

    /// Inserts one logical op, which is one OGN (`role = Single`) unless
    /// `item.dst_target` is set, in which case it's two (`Src`/`Dst`)
    /// linked as siblings. Returns the src-side/single OGN id, which is
    /// what callers use to refer to "the op" from here on.
    fn insert_item(&mut self, item: OpInsertItem, batch_id: u64) -> Result<OgnId> {
        let OpInsertItem {
            op,
            src_target,
            src_parent_targets,
            dst_target,
            dst_parent_targets,
            ancestor_uids,
            child_removal_tails,
            extra_parents,
        } = item;

        let src_role = if dst_target.is_some() { OgnRole::Src } else { OgnRole::Single };
        let src_id = self.insert_ogn(
            op.clone(),
            src_role,
            src_target,
            &src_parent_targets,
            &child_removal_tails,
            &extra_parents,
            batch_id,
        )?;

        if let Some(dst_target) = dst_target {
            let dst_id = match self.insert_ogn(op, OgnRole::Dst, dst_target, &dst_parent_targets, &[], &[], batch_id) {
                Ok(id) => id,
                Err(e) => {
                    self.uninsert_ogn(src_id);
                    return Err(e);
                }
            };
            if let Some(n) = self.get_mut(src_id) {
                n.sibling = Some(dst_id);
            }
            if let Some(n) = self.get_mut(dst_id) {
                n.sibling = Some(src_id);
            }
        }

        self.increment_icon_ancestors(&ancestor_uids);
        Ok(src_id)
    }

    /// Batch-inserts every item in `items`. All-or-nothing: if any single
    /// insert fails, every OGN allocated so far in this call is torn back
    /// out (mirrors `insert_batch_graph`'s BFS-insert-with-rollback against
    /// `UnsuccessfulBatchInsertError`).
    pub fn insert_batch(&mut self, items: Vec<OpInsertItem>) -> Result<Vec<OgnId>> {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let mut inserted = Vec::new();
        for item in items {
            match self.insert_item(item, batch_id) {
                Ok(id) => inserted.push(id),
                Err(e) => {
                    for id in inserted {
                        self.uninsert_ogn_with_sibling(id);
                    }
                    return Err(EngineError::UnsuccessfulBatchInsert {
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(inserted)
    }

    /// Tears a single just-inserted OGN back out of its node queue, arena
    /// slot, and any parent's `children` edge, for batch rollback.
    fn uninsert_ogn(&mut self, id: OgnId) {
        if let Some(node) = self.arena.get_mut(id.0 as usize).and_then(|s| s.take()) {
            if let Some(queue) = self.node_queues.get_mut(&node.target_uid) {
                queue.retain(|qid| *qid != id);
            }
            for p in &node.parents {
                if let Some(pn) = self.get_mut(*p) {
                    pn.children.retain(|c| *c != id);
                }
            }
        }
    }

    fn uninsert_ogn_with_sibling(&mut self, id: OgnId) {
        let sibling = self.get(id).and_then(|n| n.sibling);
        self.uninsert_ogn(id);
        if let Some(sibling) = sibling {
            self.uninsert_ogn(sibling);
        }
    }

    /// Returns the next ready OGN for `target_uid` without blocking,
    /// marking it (and its sibling, if any) `Executing`.
    pub fn get_next_op_nowait(&mut self, target_uid: Uid) -> Option<OgnId> {
        let candidate = self.node_queues.get(&target_uid).and_then(|q| q.front().copied())?;
        if self.is_op_ready(candidate) {
            self.mark_executing(candidate);
            Some(candidate)
        } else {
            None
        }
    }

    /// Returns the next ready OGN across the whole graph, in insertion
    /// order, or `None` if nothing is currently ready. Only ever returns a
    /// `Single`/`Src` OGN - a binary op's `Dst` half is bookkeeping, not a
    /// separately-dispatched command.
    pub fn get_next_op(&mut self) -> Option<OgnId> {
        let ready = self
            .arena
            .iter()
            .flatten()
            .find(|n| n.role != OgnRole::Dst && self.is_op_ready(n.id))
            .map(|n| n.id)?;
        self.mark_executing(ready);
        Some(ready)
    }

    pub fn op_for(&self, id: OgnId) -> Option<&UserOp> {
        self.get(id).map(|n| &n.op)
    }

    /// Marks `id` (and its sibling, if any) `Completed`, removes both from
    /// their node queues, and frees their arena slots - nothing downstream
    /// needs the slot kept around, since a missing parent is already
    /// treated as "done" by [`Self::is_ready_single`]. Decrements the icon
    /// count for `ancestor_uids`.
    pub fn pop_completed_op(&mut self, id: OgnId, ancestor_uids: &[Uid]) -> Result<()> {
        let sibling = self.get(id).and_then(|n| n.sibling);
        self.complete_single(id)?;
        if let Some(sibling) = sibling {
            self.complete_single(sibling)?;
        }
        self.decrement_icon_ancestors(ancestor_uids);
        Ok(())
    }

    fn complete_single(&mut self, id: OgnId) -> Result<()> {
        let target_uid = {
            let node = self
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("no such OGN: {}", id.0))?;
            node.status = OgnStatus::Completed;
            node.target_uid
        };
        if let Some(queue) = self.node_queues.get_mut(&target_uid) {
            queue.retain(|qid| *qid != id);
        }
        if let Some(slot) = self.arena.get_mut(id.0 as usize) {
            *slot = None;
        }
        Ok(())
    }

    /// Marks `id` (and its sibling, if any) `Failed`, then walks every OGN
    /// transitively reachable via `children` edges - not just later
    /// entries in the same target's queue - marking each one still
    /// `Pending`/`Executing` as `Blocked`.
    pub fn fail_op(&mut self, id: OgnId, ancestor_uids: &[Uid]) -> Result<()> {
        let sibling = self.get(id).and_then(|n| n.sibling);
        self.mark_failed(id)?;
        if let Some(sibling) = sibling {
            self.mark_failed(sibling)?;
        }

        let mut frontier: Vec<OgnId> = Vec::new();
        if let Some(n) = self.get(id) {
            frontier.extend(n.children.iter().copied());
        }
        if let Some(sibling) = sibling {
            if let Some(n) = self.get(sibling) {
                frontier.extend(n.children.iter().copied());
            }
        }
        let mut visited = HashSet::new();
        while let Some(next) = frontier.pop() {
            if !visited.insert(next) {
                continue;
            }
            let children = match self.get_mut(next) {
                Some(n) => {
                    if n.status == OgnStatus::Pending || n.status == OgnStatus::Executing {
                        n.status = OgnStatus::Blocked;
                    }
                    n.children.clone()
                }
                None => Vec::new(),
            };
            frontier.extend(children);
        }

        self.decrement_icon_ancestors(ancestor_uids);
        Ok(())
    }

    fn mark_failed(&mut self, id: OgnId) -> Result<()> {
        let node = self
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no such OGN: {}", id.0))?;
        node.status = OgnStatus::Failed;
        Ok(())
    }

    /// Resets a `Failed` OGN (and its sibling) back to `Pending`, then
    /// walks its `Blocked` descendants resetting each one too, unless some
    /// *other* still-`Failed` ancestor also blocks it. Can also be called
    /// on a `Blocked` OGN directly, in which case it walks upstream via
    /// `parents` to find every `Failed` ancestor and resets each in turn.
    pub fn retry_failed_op(&mut self, id: OgnId, ancestor_uids: &[Uid]) -> Result<()> {
        let status = self
            .get(id)
            .map(|n| n.status)
            .ok_or_else(|| anyhow::anyhow!("no such OGN: {}", id.0))?;
        match status {
            OgnStatus::Failed => self.reset_failed_and_descendants(id, ancestor_uids),
            OgnStatus::Blocked => {
                let failed_ancestors = self.failed_ancestors_of(id);
                if failed_ancestors.is_empty() {
                    bail!(EngineError::InvalidInsertOpGraph {
                        reason: "retry_failed_op called on a blocked OGN with no failed ancestor".to_string(),
                    });
                }
                for ancestor in failed_ancestors {
                    self.reset_failed_and_descendants(ancestor, ancestor_uids)?;
                }
                Ok(())
            }
            _ => bail!(EngineError::InvalidInsertOpGraph {
                reason: "retry_failed_op called on a non-failed, non-blocked OGN".to_string(),
            }),
        }
    }

    fn failed_ancestors_of(&self, id: OgnId) -> Vec<OgnId> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut frontier: Vec<OgnId> = self.get(id).map(|n| n.parents.clone()).unwrap_or_default();
        while let Some(next) = frontier.pop() {
            if !visited.insert(next) {
                continue;
            }
            match self.get(next) {
                Some(n) if n.status == OgnStatus::Failed => out.push(next),
                Some(n) => frontier.extend(n.parents.iter().copied()),
                None => {}
            }
        }
        out
    }

    fn reset_failed_and_descendants(&mut self, id: OgnId, ancestor_uids: &[Uid]) -> Result<()> {
        let sibling = self.get(id).and_then(|n| n.sibling);
        if let Some(n) = self.get_mut(id) {
            n.status = OgnStatus::Pending;
        }
        if let Some(sibling) = sibling {
            if let Some(n) = self.get_mut(sibling) {
                n.status = OgnStatus::Pending;
            }
        }

        let mut frontier: Vec<OgnId> = Vec::new();
        if let Some(n) = self.get(id) {
            frontier.extend(n.children.iter().copied());
        }
        if let Some(sibling) = sibling {
            if let Some(n) = self.get(sibling) {
                frontier.extend(n.children.iter().copied());
            }
        }
        let mut visited = HashSet::new();
        while let Some(next) = frontier.pop() {
            if !visited.insert(next) {
                continue;
            }
            let (should_reset, children) = match self.get(next) {
                Some(n) if n.status == OgnStatus::Blocked => {
                    (!self.has_other_failed_parent(next, id), n.children.clone())
                }
                Some(n) => (false, n.children.clone()),
                None => (false, Vec::new()),
            };
            if should_reset {
                if let Some(n) = self.get_mut(next) {
                    n.status = OgnStatus::Pending;
                }
            }
            frontier.extend(children);
        }

        self.increment_icon_ancestors(ancestor_uids);
        Ok(())
    }

    fn has_other_failed_parent(&self, id: OgnId, excluding: OgnId) -> bool {
        self.get(id)
            .map(|n| {
                n.parents.iter().any(|p| {
                    *p != excluding && self.get(*p).map(|pn| pn.status == OgnStatus::Failed).unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    pub fn retry_all_failed_ops(&mut self, ancestor_lookup: impl Fn(Uid) -> Vec<Uid>) -> Result<usize> {
        let failed: Vec<(OgnId, Uid)> = self
            .arena
            .iter()
            .flatten()
            .filter(|n| n.status == OgnStatus::Failed && n.role != OgnRole::Dst)
            .map(|n| (n.id, n.target_uid))
            .collect();
        let count = failed.len();
        for (id, target_uid) in failed {
            let ancestors = ancestor_lookup(target_uid);
            self.retry_failed_op(id, &ancestors)?;
        }
        Ok(count)
    }

    /// The queue-tail OGN currently queued against `uid`, if any - what a
    /// caller building an `RM`/non-`RM`/`FINISH_DIR` insertion consults to
    /// compute `child_removal_tails`/`*_parent_targets`/`extra_parents`.
    pub fn queue_tail_for(&self, uid: Uid) -> Option<OgnId> {
        self.node_queues.get(&uid).and_then(|q| q.back().copied())
    }

    /// The batch `id` was inserted as part of - `None` once `id`'s arena
    /// slot has been freed (already completed), so a caller that wants this
    /// must read it before popping the op.
    pub fn batch_id_for(&self, id: OgnId) -> Option<u64> {
        self.get(id).map(|n| n.batch_id)
    }

    pub fn len(&self) -> usize {
        self.arena.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OpGraph {
    fn default() -> Self {
        Self::new()
    }
}
