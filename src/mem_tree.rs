//! In-memory parent-indexed tree: the live, queryable mirror of a cache's
//! on-disk index. Shaped like `tree::Tree`/`tree::Forest` (map of path/uid to
//! node, indexed for fast traversal) but mutable and keyed by UID rather than
//! frozen and keyed by path.

use std::cell::RefCell;
use std::collections::HashMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::node::Node;
use crate::uid::Uid;

/// Result of [`MemTree::remove_subtree`]: the UIDs actually deleted, and the
/// UIDs of children that survived (because some other parent outside the
/// removed subtree still references them) and may need relinking.
#[derive(Debug, Clone, Default)]
pub struct RemoveOutcome {
    pub removed: Vec<Uid>,
    pub orphans: Vec<Uid>,
}

#[derive(Debug, Clone, Default)]
pub struct DirStats {
    pub file_count: u64,
    pub dir_count: u64,
    pub total_size_bytes: u64,
}

/// In-memory tree for one device's cache. `nodes` is the source of truth;
/// `children_by_parent` is a derived index kept in lockstep so
/// `get_child_list_for_spid` doesn't need a linear scan.
pub struct MemTree {
    nodes: FxHashMap<Uid, Node>,
    children_by_parent: FxHashMap<Uid, Vec<Uid>>,
    /// Memoized `generate_dir_stats` results, invalidated wholesale on any
    /// mutation - mirrors `tree::Cache`'s per-tree memoization, just without
    /// the generation counter since this tree mutates far less often than a
    /// backup repo's frozen trees are read.
    dir_stats_cache: RefCell<HashMap<Uid, DirStats>>,
}

impl MemTree {
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            children_by_parent: FxHashMap::default(),
            dir_stats_cache: RefCell::new(HashMap::new()),
        }
    }

    fn invalidate_stats(&self) {
        self.dir_stats_cache.borrow_mut().clear();
    }

    pub fn get_node_for_uid(&self, uid: Uid) -> Option<&Node> {
        self.nodes.get(&uid)
    }

    pub fn get_parent_list(&self, uid: Uid) -> Vec<Uid> {
        self.nodes
            .get(&uid)
            .map(|n| n.header().parent_uids.clone())
            .unwrap_or_default()
    }

    pub fn get_child_list_for_uid(&self, parent_uid: Uid) -> Vec<&Node> {
        self.children_by_parent
            .get(&parent_uid)
            .map(|uids| uids.iter().filter_map(|u| self.nodes.get(u)).collect())
            .unwrap_or_default()
    }

    fn insert_one(&mut self, node: Node) {
        let uid = node.uid();
        for parent in &node.header().parent_uids {
            let list = self.children_by_parent.entry(*parent).or_default();
            if !list.contains(&uid) {
                list.push(uid);
            }
        }
        self.nodes.insert(uid, node);
    }

    pub fn upsert(&mut self, node: Node) {
        // Drop stale child-index entries for parents this node no longer
        // has before re-adding it under its current parents.
        if let Some(old) = self.nodes.get(&node.uid()) {
            for old_parent in old.header().parent_uids.clone() {
                if let Some(list) = self.children_by_parent.get_mut(&old_parent) {
                    list.retain(|u| *u != node.uid());
                }
            }
        }
        self.insert_one(node);
        self.invalidate_stats();
    }

    /// Removes `uid` and everything beneath it. Returns both the UIDs
    /// actually deleted and the UIDs of any children that had *other*
    /// parents outside this subtree (so the caller - `TreeStore` - can
    /// decide whether those orphans need relinking elsewhere rather than
    /// silently vanishing).
    pub fn remove_subtree(&mut self, uid: Uid) -> RemoveOutcome {
        let mut orphans = Vec::new();
        let mut stack = vec![uid];
        let mut visited = FxHashSet::default();
        while let Some(u) = stack.pop() {
            if !visited.insert(u) {
                continue;
            }
            let children: Vec<Uid> = self
                .children_by_parent
                .get(&u)
                .cloned()
                .unwrap_or_default();
            for child in children {
                let still_has_other_parent = self
                    .nodes
                    .get(&child)
                    .map(|n| n.header().parent_uids.iter().any(|p| *p != u && !visited.contains(p)))
                    .unwrap_or(false);
                if still_has_other_parent {
                    orphans.push(child);
                } else {
                    stack.push(child);
                }
            }
        }
        let mut removed = Vec::new();
        for u in &visited {
            if let Some(node) = self.nodes.remove(u) {
                for parent in &node.header().parent_uids {
                    if let Some(list) = self.children_by_parent.get_mut(parent) {
                        list.retain(|c| c != u);
                    }
                }
                removed.push(*u);
            }
            self.children_by_parent.remove(u);
        }
        self.invalidate_stats();
        RemoveOutcome { removed, orphans }
    }

    /// Replaces everything currently stored with `nodes`, as produced by a
    /// fresh on-disk-index rescan. Returns the UIDs present before the swap
    /// but absent from `nodes` - the orphan set a rescan needs to report to
    /// upstream subscribers as removed.
    pub fn replace_subtree(&mut self, nodes: Vec<Node>) -> Vec<Uid> {
        let previous: FxHashSet<Uid> = self.nodes.keys().copied().collect();
        let incoming: FxHashSet<Uid> = nodes.iter().map(|n| n.uid()).collect();
        let removed: Vec<Uid> = previous.difference(&incoming).copied().collect();

        self.nodes.clear();
        self.children_by_parent.clear();
        for node in nodes {
            self.insert_one(node);
        }
        self.invalidate_stats();
        removed
    }

    pub fn get_subtree_bfs_list(&self, root: Uid) -> Vec<Uid> {
        let mut out = Vec::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(root);
        let mut visited = FxHashSet::default();
        while let Some(uid) = queue.pop_front() {
            if !visited.insert(uid) {
                continue;
            }
            out.push(uid);
            if let Some(children) = self.children_by_parent.get(&uid) {
                for child in children {
                    queue.push_back(*child);
                }
            }
        }
        out
    }

    pub fn generate_dir_stats(&self, root: Uid) -> DirStats {
        if let Some(cached) = self.dir_stats_cache.borrow().get(&root) {
            return cached.clone();
        }
        let mut stats = DirStats::default();
        for uid in self.get_subtree_bfs_list(root) {
            if uid == root {
                continue;
            }
            match self.nodes.get(&uid) {
                Some(n) if n.is_dir() => stats.dir_count += 1,
                Some(n) if n.is_file() => {
                    stats.file_count += 1;
                    if let crate::node::Node::LocalFile(f) | crate::node::Node::RemoteFile(f) = n {
                        stats.total_size_bytes += f.size_bytes;
                    }
                }
                _ => {}
            }
        }
        self.dir_stats_cache.borrow_mut().insert(root, stats.clone());
        stats
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for MemTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{NodeHeader, TrashStatus};
    use jiff::Timestamp;

    fn mk(uid: u64, parents: &[u64]) -> Node {
        Node::Empty(NodeHeader {
            node_uid: Uid::new(uid).unwrap(),
            device_uid: Uid::new(1).unwrap(),
            parent_uids: parents.iter().map(|p| Uid::new(*p).unwrap()).collect(),
            trash_status: TrashStatus::NotTrashed,
            is_live: true,
            sync_ts: Timestamp::UNIX_EPOCH,
        })
    }

    #[test]
    fn upsert_then_query_children() {
        let mut t = MemTree::new();
        t.upsert(mk(1, &[]));
        t.upsert(mk(2, &[1]));
        t.upsert(mk(3, &[1]));
        let children = t.get_child_list_for_uid(Uid::new(1).unwrap());
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn remove_subtree_reports_external_orphans() {
        let mut t = MemTree::new();
        t.upsert(mk(1, &[]));
        t.upsert(mk(2, &[1]));
        t.upsert(mk(3, &[])); // second parent for node 2
        t.upsert(mk(2, &[1, 3]));
        let outcome = t.remove_subtree(Uid::new(1).unwrap());
        assert_eq!(outcome.orphans, vec![Uid::new(2).unwrap()]);
        assert_eq!(outcome.removed, vec![Uid::new(1).unwrap()]);
        assert!(t.get_node_for_uid(Uid::new(2).unwrap()).is_some());
    }

    #[test]
    fn replace_subtree_reports_removed_uids() {
        let mut t = MemTree::new();
        t.upsert(mk(1, &[]));
        t.upsert(mk(2, &[1]));
        let removed = t.replace_subtree(vec![mk(1, &[])]);
        assert_eq!(removed, vec![Uid::new(2).unwrap()]);
    }

    #[test]
    fn dir_stats_are_memoized_until_invalidated() {
        let mut t = MemTree::new();
        t.upsert(mk(1, &[]));
        t.upsert(mk(2, &[1]));
        let first = t.generate_dir_stats(Uid::new(1).unwrap());
        t.upsert(mk(3, &[1]));
        let second = t.generate_dir_stats(Uid::new(1).unwrap());
        assert_ne!(first.dir_count, second.dir_count);
    }
}
