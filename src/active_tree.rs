//! Active Tree Manager: tracks which subtrees the UI currently has open
//! (`tree_id -> ActiveDisplayTreeMeta`) and relays cache-change signals only
//! to the tree_ids whose root actually contains the affected node, instead
//! of every subscriber re-filtering the full signal firehose itself.
//!
//! Grounded in
//! `examples/original_source/outlet/backend/display_tree/active_tree_manager.py`.

use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashMap;

use crate::signal::Signal;
use crate::uid::Uid;

#[derive(Debug, Clone)]
pub struct ActiveDisplayTreeMeta {
    pub tree_id: String,
    pub device_uid: Uid,
    /// Path (local) or remote-id (remote) prefix this display tree's root
    /// is rooted at; a signal relays to this tree only if its node's path
    /// starts with this prefix.
    pub root_path_prefix: String,
}

pub struct ActiveTreeManager {
    trees: Mutex<FxHashMap<String, ActiveDisplayTreeMeta>>,
    senders: Mutex<FxHashMap<String, Sender<Signal>>>,
}

impl ActiveTreeManager {
    pub fn new() -> Self {
        Self {
            trees: Mutex::new(FxHashMap::default()),
            senders: Mutex::new(FxHashMap::default()),
        }
    }

    /// Registers a newly opened display tree and returns the channel it'll
    /// receive relayed signals on.
    pub fn register_tree(&self, meta: ActiveDisplayTreeMeta) -> Receiver<Signal> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let tree_id = meta.tree_id.clone();
        self.senders.lock().unwrap().insert(tree_id.clone(), tx);
        self.trees.lock().unwrap().insert(tree_id, meta);
        rx
    }

    pub fn unregister_tree(&self, tree_id: &str) {
        self.trees.lock().unwrap().remove(tree_id);
        self.senders.lock().unwrap().remove(tree_id);
    }

    pub fn get_meta(&self, tree_id: &str) -> Option<ActiveDisplayTreeMeta> {
        self.trees.lock().unwrap().get(tree_id).cloned()
    }

    fn spid_of(signal: &Signal) -> Option<&crate::node::Spid> {
        match signal {
            Signal::NodeUpsertedInCache { spid } | Signal::NodeRemovedInCache { spid } => Some(spid),
            _ => None,
        }
    }

    /// Forwards `signal` to every registered tree whose root contains the
    /// affected node. Non-node signals (batch/op lifecycle, device
    /// load/unload) aren't relayed - those go out over the main
    /// [`SignalBus`](crate::signal::SignalBus) directly.
    pub fn relay(&self, signal: &Signal) {
        let Some(spid) = Self::spid_of(signal) else {
            return;
        };
        let trees = self.trees.lock().unwrap();
        let senders = self.senders.lock().unwrap();
        for (tree_id, meta) in trees.iter() {
            if meta.device_uid != spid.device_uid {
                continue;
            }
            if !spid.path.as_str().starts_with(meta.root_path_prefix.as_str()) {
                continue;
            }
            if let Some(tx) = senders.get(tree_id) {
                let _ = tx.send(signal.clone());
            }
        }
    }
}

impl Default for ActiveTreeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::Spid;
    use camino::Utf8PathBuf;

    #[test]
    fn relay_only_reaches_matching_tree() {
        let mgr = ActiveTreeManager::new();
        let rx_a = mgr.register_tree(ActiveDisplayTreeMeta {
            tree_id: "a".to_string(),
            device_uid: Uid::new(1).unwrap(),
            root_path_prefix: "/home/user/docs".to_string(),
        });
        let rx_b = mgr.register_tree(ActiveDisplayTreeMeta {
            tree_id: "b".to_string(),
            device_uid: Uid::new(1).unwrap(),
            root_path_prefix: "/home/user/photos".to_string(),
        });

        mgr.relay(&Signal::NodeUpsertedInCache {
            spid: Spid::new(
                Uid::new(1).unwrap(),
                Uid::new(9).unwrap(),
                Utf8PathBuf::from("/home/user/docs/a.txt"),
            ),
        });

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
