use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use jiff::Timestamp;

use crate::backend::LocalFs;
use crate::disk_index::DiskIndex;
use crate::mem_tree::MemTree;
use crate::node::{DirFields, FileFields, Node, NodeHeader, Spid, TrashStatus, UserOp};
use crate::signal::{Signal, SignalBus};
use crate::uid::{PathMapper, Uid};

use super::MAX_FS_LINK_DEPTH;

/// `TreeStore` over a real (or faked) POSIX filesystem.
pub struct LocalTreeStore {
    device_uid: Uid,
    root_path: Utf8PathBuf,
    fs: Arc<dyn LocalFs + Send + Sync>,
    path_mapper: PathMapper,
    disk_index: DiskIndex,
    mem_tree: Mutex<MemTree>,
    signal_bus: Arc<SignalBus>,
}

impl LocalTreeStore {
    pub fn new(
        device_uid: Uid,
        root_path: Utf8PathBuf,
        fs: Arc<dyn LocalFs + Send + Sync>,
        path_mapper: PathMapper,
        disk_index: DiskIndex,
        signal_bus: Arc<SignalBus>,
    ) -> Self {
        Self {
            device_uid,
            root_path,
            fs,
            path_mapper,
            disk_index,
            mem_tree: Mutex::new(MemTree::new()),
            signal_bus,
        }
    }

    fn spid_for(&self, uid: Uid, path: &Utf8Path) -> Spid {
        Spid::new(self.device_uid, uid, path.to_owned())
    }

    fn publish_upsert(&self, uid: Uid, path: &Utf8Path) {
        self.signal_bus.publish(Signal::NodeUpsertedInCache {
            spid: self.spid_for(uid, path),
        });
    }

    /// Flips `all_children_fetched` on a directory already in the tree -
    /// the `FINISH_DIR_*` effect, shared by the copy and move variants.
    fn mark_dir_fetched(&self, uid: Uid) -> Result<()> {
        let mut tree = self.mem_tree.lock().unwrap();
        if let Some(Node::LocalDir(mut d)) = tree.get_node_for_uid(uid).cloned() {
            d.all_children_fetched = true;
            let node = Node::LocalDir(d);
            tree.upsert(node.clone());
            drop(tree);
            self.disk_index.upsert_node(&node)?;
        }
        Ok(())
    }

    /// Recursively scans `path`, appending every node found to `out`.
    /// Follows symlinks up to [`MAX_FS_LINK_DEPTH`]; a dangling or cyclic
    /// link yields no node rather than an error.
    fn scan(
        &self,
        path: &Utf8Path,
        parent_uid: Option<Uid>,
        depth: u32,
        out: &mut Vec<Node>,
    ) -> Result<()> {
        if depth > MAX_FS_LINK_DEPTH {
            return Ok(());
        }
        let stat = match self.fs.stat(path)? {
            Some(s) => s,
            None => return Ok(()),
        };

        if stat.is_symlink {
            if let Some(target) = self.fs.readlink(path)? {
                let resolved = if target.is_absolute() {
                    target
                } else {
                    path.parent().unwrap_or(path).join(target)
                };
                return self.scan(&resolved, parent_uid, depth + 1, out);
            }
            return Ok(());
        }

        let uid = self.path_mapper.uid_for_path(path.as_str(), None)?;
        let header = NodeHeader {
            node_uid: uid,
            device_uid: self.device_uid,
            parent_uids: parent_uid.into_iter().collect(),
            trash_status: TrashStatus::NotTrashed,
            is_live: true,
            sync_ts: Timestamp::now(),
        };

        if stat.is_dir {
            out.push(Node::LocalDir(DirFields {
                header,
                all_children_fetched: true,
            }));
            for child in self.fs.listdir(path)? {
                self.scan(&child, Some(uid), depth + 1, out)?;
            }
        } else if stat.is_file {
            out.push(Node::LocalFile(FileFields {
                header,
                size_bytes: stat.size_bytes,
                create_ts: Timestamp::try_from(stat.created).unwrap_or(Timestamp::UNIX_EPOCH),
                modify_ts: Timestamp::try_from(stat.modified).unwrap_or(Timestamp::UNIX_EPOCH),
                change_ts: Timestamp::try_from(stat.modified).unwrap_or(Timestamp::UNIX_EPOCH),
                content_meta_uid: None,
            }));
        }
        Ok(())
    }
}

impl super::TreeStore for LocalTreeStore {
    fn device_uid(&self) -> Uid {
        self.device_uid
    }

    fn rescan(&self) -> Result<Vec<Uid>> {
        let mut collected = Vec::new();
        self.scan(&self.root_path.clone(), None, 0, &mut collected)?;

        self.disk_index.begin_replace()?;
        self.disk_index.upsert_nodes(&collected)?;
        self.disk_index.mark_complete(Timestamp::now())?;

        let removed = {
            let mut tree = self.mem_tree.lock().unwrap();
            tree.replace_subtree(collected.clone())
        };

        for node in &collected {
            if let Some(path) = self.path_mapper.path_for_uid(node.uid())? {
                self.publish_upsert(node.uid(), Utf8Path::new(&path));
            }
        }
        for uid in &removed {
            if let Some(path) = self.path_mapper.path_for_uid(*uid)? {
                self.signal_bus.publish(Signal::NodeRemovedInCache {
                    spid: self.spid_for(*uid, Utf8Path::new(&path)),
                });
            }
            self.disk_index.remove_node(*uid)?;
        }
        Ok(removed)
    }

    fn get_node(&self, uid: Uid) -> Option<Node> {
        self.mem_tree.lock().unwrap().get_node_for_uid(uid).cloned()
    }

    fn get_children(&self, uid: Uid) -> Vec<Node> {
        self.mem_tree
            .lock()
            .unwrap()
            .get_child_list_for_uid(uid)
            .into_iter()
            .cloned()
            .collect()
    }

    fn execute_write(&self, op: &UserOp) -> Result<()> {
        match op {
            UserOp::Mkdir { parent_spid, name } => {
                let path = parent_spid.path.join(name);
                self.fs.mkdir(&path)?;
                let uid = self.path_mapper.uid_for_path(path.as_str(), None)?;
                let header = NodeHeader {
                    node_uid: uid,
                    device_uid: self.device_uid,
                    parent_uids: vec![parent_spid.node_uid],
                    trash_status: TrashStatus::NotTrashed,
                    is_live: true,
                    sync_ts: Timestamp::now(),
                };
                let node = Node::LocalDir(DirFields {
                    header,
                    all_children_fetched: false,
                });
                self.mem_tree.lock().unwrap().upsert(node.clone());
                self.disk_index.upsert_node(&node)?;
                self.publish_upsert(uid, &path);
                Ok(())
            }
            UserOp::Rm { spid } => {
                let is_dir = self
                    .get_node(spid.node_uid)
                    .map(|n| n.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    self.fs.remove_dir(&spid.path)?;
                } else {
                    self.fs.remove_file(&spid.path)?;
                }
                let outcome = self.mem_tree.lock().unwrap().remove_subtree(spid.node_uid);
                for uid in &outcome.removed {
                    self.disk_index.remove_node(*uid)?;
                }
                self.signal_bus.publish(Signal::NodeRemovedInCache {
                    spid: spid.clone(),
                });
                Ok(())
            }
            UserOp::Mv {
                src_spid,
                dst_parent_spid,
                new_name,
            } => {
                let name = new_name.clone().unwrap_or_else(|| {
                    src_spid
                        .path
                        .file_name()
                        .unwrap_or_default()
                        .to_string()
                });
                let dst_path = dst_parent_spid.path.join(&name);
                self.fs.rename(&src_spid.path, &dst_path)?;
                self.path_mapper
                    .uid_for_path(dst_path.as_str(), Some(src_spid.node_uid))?;
                let mut node = self
                    .get_node(src_spid.node_uid)
                    .with_context(|| format!("Moved node {} vanished from the tree", src_spid.node_uid))?;
                node.header_mut().parent_uids = vec![dst_parent_spid.node_uid];
                self.mem_tree.lock().unwrap().upsert(node.clone());
                self.disk_index.upsert_node(&node)?;
                self.publish_upsert(src_spid.node_uid, &dst_path);
                Ok(())
            }
            UserOp::Cp {
                src_spid,
                dst_parent_spid,
                new_name,
            } => {
                let name = new_name.clone().unwrap_or_else(|| {
                    src_spid
                        .path
                        .file_name()
                        .unwrap_or_default()
                        .to_string()
                });
                let dst_path = dst_parent_spid.path.join(&name);
                if self
                    .get_node(src_spid.node_uid)
                    .map(|n| n.is_dir())
                    .unwrap_or(false)
                {
                    bail!("recursive directory copy is not implemented by LocalTreeStore");
                }
                std::fs::copy(src_spid.path.as_str(), dst_path.as_str())
                    .with_context(|| format!("Couldn't copy {} to {}", src_spid.path, dst_path))?;
                let uid = self.path_mapper.uid_for_path(dst_path.as_str(), None)?;
                let stat = self
                    .fs
                    .stat(&dst_path)?
                    .with_context(|| format!("Copy destination {} vanished", dst_path))?;
                let header = NodeHeader {
                    node_uid: uid,
                    device_uid: self.device_uid,
                    parent_uids: vec![dst_parent_spid.node_uid],
                    trash_status: TrashStatus::NotTrashed,
                    is_live: true,
                    sync_ts: Timestamp::now(),
                };
                let node = Node::LocalFile(FileFields {
                    header,
                    size_bytes: stat.size_bytes,
                    create_ts: Timestamp::now(),
                    modify_ts: Timestamp::now(),
                    change_ts: Timestamp::now(),
                    content_meta_uid: None,
                });
                self.mem_tree.lock().unwrap().upsert(node.clone());
                self.disk_index.upsert_node(&node)?;
                self.publish_upsert(uid, &dst_path);
                Ok(())
            }
            UserOp::StartDirCp {
                src_spid,
                dst_parent_spid,
                new_name,
            }
            | UserOp::StartDirMv {
                src_spid,
                dst_parent_spid,
                new_name,
            } => {
                // Creates the destination directory shell; the recursive
                // copy/move's children are queued as their own CP/MV ops
                // against it, and FINISH_DIR_* marks it fully populated
                // once every one of them has completed.
                let name = new_name.clone().unwrap_or_else(|| {
                    src_spid
                        .path
                        .file_name()
                        .unwrap_or_default()
                        .to_string()
                });
                let path = dst_parent_spid.path.join(&name);
                self.fs.mkdir(&path)?;
                let uid = self.path_mapper.uid_for_path(path.as_str(), None)?;
                let header = NodeHeader {
                    node_uid: uid,
                    device_uid: self.device_uid,
                    parent_uids: vec![dst_parent_spid.node_uid],
                    trash_status: TrashStatus::NotTrashed,
                    is_live: true,
                    sync_ts: Timestamp::now(),
                };
                let node = Node::LocalDir(DirFields {
                    header,
                    all_children_fetched: false,
                });
                self.mem_tree.lock().unwrap().upsert(node.clone());
                self.disk_index.upsert_node(&node)?;
                self.publish_upsert(uid, &path);
                Ok(())
            }
            UserOp::FinishDirCp { dst_spid, .. } => self.mark_dir_fetched(dst_spid.node_uid),
            UserOp::FinishDirMv { src_spid, dst_spid } => {
                self.mark_dir_fetched(dst_spid.node_uid)?;
                // Every child has been moved out from under the source
                // directory by now; it's empty, so the move finishes by
                // removing it.
                if self.fs.stat(&src_spid.path)?.is_some() {
                    self.fs.remove_dir(&src_spid.path)?;
                }
                let outcome = self.mem_tree.lock().unwrap().remove_subtree(src_spid.node_uid);
                for uid in &outcome.removed {
                    self.disk_index.remove_node(*uid)?;
                }
                self.signal_bus.publish(Signal::NodeRemovedInCache {
                    spid: src_spid.clone(),
                });
                Ok(())
            }
        }
    }

    fn apply_upsert(&self, node: Node) -> Result<()> {
        self.mem_tree.lock().unwrap().upsert(node.clone());
        self.disk_index.upsert_node(&node)?;
        if let Some(path) = self.path_mapper.path_for_uid(node.uid())? {
            self.publish_upsert(node.uid(), Utf8Path::new(&path));
        }
        Ok(())
    }

    fn apply_remove(&self, uid: Uid) -> Result<()> {
        let path = self.path_mapper.path_for_uid(uid)?;
        let outcome = self.mem_tree.lock().unwrap().remove_subtree(uid);
        for removed in &outcome.removed {
            self.disk_index.remove_node(*removed)?;
        }
        self.signal_bus.publish(Signal::NodeRemovedInCache {
            spid: self.spid_for(uid, Utf8Path::new(path.as_deref().unwrap_or(""))),
        });
        Ok(())
    }
}
