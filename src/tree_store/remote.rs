use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use jiff::Timestamp;

use crate::backend::RemoteClient;
use crate::disk_index::DiskIndex;
use crate::mem_tree::MemTree;
use crate::node::{DirFields, FileFields, Node, NodeHeader, Spid, TrashStatus, UserOp};
use crate::signal::{Signal, SignalBus};
use crate::uid::{RemoteIdMapper, Uid, REMOTE_VIRTUAL_ROOT_UID};

use super::MAX_FS_LINK_DEPTH;

/// `TreeStore` over an abstract remote object store. The synthetic virtual
/// root (`REMOTE_VIRTUAL_ROOT_UID`) is the parent any node with no other
/// parent is attached to, since a remote store's top-level objects have no
/// local filesystem-style single root.
pub struct RemoteTreeStore {
    device_uid: Uid,
    root_remote_id: String,
    client: Arc<dyn RemoteClient + Send + Sync>,
    id_mapper: RemoteIdMapper,
    disk_index: DiskIndex,
    mem_tree: Mutex<MemTree>,
    signal_bus: Arc<SignalBus>,
}

impl RemoteTreeStore {
    pub fn new(
        device_uid: Uid,
        root_remote_id: String,
        client: Arc<dyn RemoteClient + Send + Sync>,
        id_mapper: RemoteIdMapper,
        disk_index: DiskIndex,
        signal_bus: Arc<SignalBus>,
    ) -> Self {
        Self {
            device_uid,
            root_remote_id,
            client,
            id_mapper,
            disk_index,
            mem_tree: Mutex::new(MemTree::new()),
            signal_bus,
        }
    }

    fn node_for_entry(
        &self,
        entry: &crate::backend::RemoteEntry,
        parent_uid: Uid,
    ) -> Result<Node> {
        let uid = self
            .id_mapper
            .uid_for_remote_id(&entry.remote_id, None)?;
        let header = NodeHeader {
            node_uid: uid,
            device_uid: self.device_uid,
            parent_uids: vec![parent_uid],
            trash_status: if entry.trashed {
                TrashStatus::ExplicitlyTrashed
            } else {
                TrashStatus::NotTrashed
            },
            is_live: true,
            sync_ts: Timestamp::now(),
        };
        Ok(if entry.is_folder {
            Node::RemoteFolder(DirFields {
                header,
                all_children_fetched: false,
            })
        } else {
            let ts = Timestamp::try_from(entry.modified).unwrap_or(Timestamp::UNIX_EPOCH);
            Node::RemoteFile(FileFields {
                header,
                size_bytes: entry.size_bytes,
                create_ts: ts,
                modify_ts: ts,
                change_ts: ts,
                content_meta_uid: None,
            })
        })
    }

    fn scan(&self, remote_id: &str, parent_uid: Uid, depth: u32, out: &mut Vec<Node>) -> Result<()> {
        if depth > MAX_FS_LINK_DEPTH {
            return Ok(());
        }
        for entry in self.client.list_children(remote_id)? {
            let node = self.node_for_entry(&entry, parent_uid)?;
            let uid = node.uid();
            let is_folder = node.is_dir();
            out.push(node);
            if is_folder {
                self.scan(&entry.remote_id, uid, depth + 1, out)?;
            }
        }
        Ok(())
    }

    /// Flips `all_children_fetched` on a folder already in the tree - the
    /// `FINISH_DIR_*` effect, shared by the copy and move variants.
    fn mark_dir_fetched(&self, uid: Uid) -> Result<()> {
        let mut tree = self.mem_tree.lock().unwrap();
        if let Some(Node::RemoteFolder(mut d)) = tree.get_node_for_uid(uid).cloned() {
            d.all_children_fetched = true;
            let node = Node::RemoteFolder(d);
            tree.upsert(node.clone());
            drop(tree);
            self.disk_index.upsert_node(&node)?;
        }
        Ok(())
    }

    /// Resolves a node UID to the remote id it should be addressed by,
    /// special-casing the synthetic virtual root (which has no remote id
    /// mapping of its own - it stands in for `root_remote_id`).
    fn remote_id_for_parent(&self, parent_uid: Uid) -> Result<String> {
        if parent_uid == REMOTE_VIRTUAL_ROOT_UID {
            return Ok(self.root_remote_id.clone());
        }
        self.id_mapper
            .remote_id_for_uid(parent_uid)?
            .with_context(|| format!("No remote id for parent {parent_uid}"))
    }
}

impl super::TreeStore for RemoteTreeStore {
    fn device_uid(&self) -> Uid {
        self.device_uid
    }

    fn rescan(&self) -> Result<Vec<Uid>> {
        let mut collected = Vec::new();
        self.scan(&self.root_remote_id, REMOTE_VIRTUAL_ROOT_UID, 0, &mut collected)?;

        self.disk_index.begin_replace()?;
        self.disk_index.upsert_nodes(&collected)?;
        self.disk_index.mark_complete(Timestamp::now())?;

        let removed = {
            let mut tree = self.mem_tree.lock().unwrap();
            tree.replace_subtree(collected.clone())
        };

        for node in &collected {
            if let Some(remote_id) = self.id_mapper.remote_id_for_uid(node.uid())? {
                self.signal_bus.publish(Signal::NodeUpsertedInCache {
                    spid: Spid::new(self.device_uid, node.uid(), Utf8PathBuf::from(remote_id)),
                });
            }
        }
        for uid in &removed {
            self.disk_index.remove_node(*uid)?;
            self.signal_bus.publish(Signal::NodeRemovedInCache {
                spid: Spid::new(self.device_uid, *uid, Utf8PathBuf::new()),
            });
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
                let parent_remote_id = self.remote_id_for_parent(parent_spid.node_uid)?;
                let entry = self.client.create_folder(&parent_remote_id, name)?;
                let node = self.node_for_entry(&entry, parent_spid.node_uid)?;
                self.mem_tree.lock().unwrap().upsert(node.clone());
                self.disk_index.upsert_node(&node)?;
                self.signal_bus.publish(Signal::NodeUpsertedInCache {
                    spid: Spid::new(self.device_uid, node.uid(), Utf8PathBuf::from(entry.remote_id)),
                });
                Ok(())
            }
            UserOp::Rm { spid } => {
                let remote_id = self
                    .id_mapper
                    .remote_id_for_uid(spid.node_uid)?
                    .with_context(|| format!("No remote id for {}", spid.node_uid))?;
                self.client.trash(&remote_id)?;
                if let Some(mut node) = self.get_node(spid.node_uid) {
                    node.header_mut().trash_status = TrashStatus::ExplicitlyTrashed;
                    self.mem_tree.lock().unwrap().upsert(node.clone());
                    self.disk_index.upsert_node(&node)?;
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
                let remote_id = self
                    .id_mapper
                    .remote_id_for_uid(src_spid.node_uid)?
                    .with_context(|| format!("No remote id for {}", src_spid.node_uid))?;
                let new_parent_remote_id = self.remote_id_for_parent(dst_parent_spid.node_uid)?;
                let entry = self.client.modify_meta(
                    &remote_id,
                    Some(&new_parent_remote_id),
                    new_name.as_deref(),
                )?;
                let node = self.node_for_entry(&entry, dst_parent_spid.node_uid)?;
                self.mem_tree.lock().unwrap().upsert(node.clone());
                self.disk_index.upsert_node(&node)?;
                self.signal_bus.publish(Signal::NodeUpsertedInCache {
                    spid: Spid::new(self.device_uid, node.uid(), Utf8PathBuf::from(entry.remote_id)),
                });
                Ok(())
            }
            UserOp::Cp { .. } => {
                bail!("server-side copy is not supported by the abstract RemoteClient")
            }
            UserOp::StartDirCp {
                dst_parent_spid,
                new_name,
                src_spid,
            }
            | UserOp::StartDirMv {
                dst_parent_spid,
                new_name,
                src_spid,
            } => {
                let name = new_name.clone().unwrap_or_else(|| {
                    src_spid
                        .path
                        .file_name()
                        .unwrap_or_default()
                        .to_string()
                });
                let parent_remote_id = self.remote_id_for_parent(dst_parent_spid.node_uid)?;
                let entry = self.client.create_folder(&parent_remote_id, &name)?;
                let node = self.node_for_entry(&entry, dst_parent_spid.node_uid)?;
                self.mem_tree.lock().unwrap().upsert(node.clone());
                self.disk_index.upsert_node(&node)?;
                self.signal_bus.publish(Signal::NodeUpsertedInCache {
                    spid: Spid::new(self.device_uid, node.uid(), Utf8PathBuf::from(entry.remote_id)),
                });
                Ok(())
            }
            UserOp::FinishDirCp { dst_spid, .. } => self.mark_dir_fetched(dst_spid.node_uid),
            UserOp::FinishDirMv { src_spid, dst_spid } => {
                self.mark_dir_fetched(dst_spid.node_uid)?;
                // Every child has been moved out of the source folder by
                // now; the move finishes by trashing the now-empty shell.
                let remote_id = self
                    .id_mapper
                    .remote_id_for_uid(src_spid.node_uid)?
                    .with_context(|| format!("No remote id for {}", src_spid.node_uid))?;
                self.client.trash(&remote_id)?;
                if let Some(mut node) = self.get_node(src_spid.node_uid) {
                    node.header_mut().trash_status = TrashStatus::ExplicitlyTrashed;
                    self.mem_tree.lock().unwrap().upsert(node.clone());
                    self.disk_index.upsert_node(&node)?;
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
        if let Some(remote_id) = self.id_mapper.remote_id_for_uid(node.uid())? {
            self.signal_bus.publish(Signal::NodeUpsertedInCache {
                spid: Spid::new(self.device_uid, node.uid(), Utf8PathBuf::from(remote_id)),
            });
        }
        Ok(())
    }

    fn apply_remove(&self, uid: Uid) -> Result<()> {
        let outcome = self.mem_tree.lock().unwrap().remove_subtree(uid);
        for removed in &outcome.removed {
            self.disk_index.remove_node(*removed)?;
        }
        self.signal_bus.publish(Signal::NodeRemovedInCache {
            spid: Spid::new(self.device_uid, uid, Utf8PathBuf::new()),
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{ChangesPage, RemoteEntry};
    use crate::tree_store::TreeStore as _;
    use crate::uid::UidAllocator;
    use std::sync::Mutex as StdMutex;
    use std::time::SystemTime;

    struct FakeClient {
        children: StdMutex<std::collections::HashMap<String, Vec<RemoteEntry>>>,
    }

    impl RemoteClient for FakeClient {
        fn list_children(&self, remote_id: &str) -> Result<Vec<RemoteEntry>> {
            Ok(self
                .children
                .lock()
                .unwrap()
                .get(remote_id)
                .cloned()
                .unwrap_or_default())
        }
        fn get_by_id(&self, _remote_id: &str) -> Result<Option<RemoteEntry>> {
            Ok(None)
        }
        fn create_folder(&self, parent_remote_id: &str, name: &str) -> Result<RemoteEntry> {
            let entry = RemoteEntry {
                remote_id: format!("{parent_remote_id}/{name}"),
                parent_remote_ids: vec![parent_remote_id.to_string()],
                name: name.to_string(),
                is_folder: true,
                size_bytes: 0,
                modified: SystemTime::now(),
                trashed: false,
            };
            self.children
                .lock()
                .unwrap()
                .entry(parent_remote_id.to_string())
                .or_default()
                .push(entry.clone());
            Ok(entry)
        }
        fn upload_file(
            &self,
            _parent_remote_id: &str,
            _name: &str,
            _content: &mut dyn std::io::Read,
        ) -> Result<RemoteEntry> {
            unimplemented!()
        }
        fn modify_meta(
            &self,
            _remote_id: &str,
            _new_parent_remote_id: Option<&str>,
            _new_name: Option<&str>,
        ) -> Result<RemoteEntry> {
            unimplemented!()
        }
        fn trash(&self, _remote_id: &str) -> Result<()> {
            Ok(())
        }
        fn hard_delete(&self, _remote_id: &str) -> Result<()> {
            Ok(())
        }
        fn changes_start_token(&self) -> Result<String> {
            Ok("0".to_string())
        }
        fn changes_list(&self, _start_token: &str) -> Result<ChangesPage> {
            Ok(ChangesPage {
                entries: vec![],
                next_start_token: None,
            })
        }
    }

    fn store() -> RemoteTreeStore {
        let alloc = Arc::new(UidAllocator::open_in_memory().unwrap());
        let mapper = RemoteIdMapper::open_in_memory(alloc).unwrap();
        let disk_index = DiskIndex::open_in_memory(Uid::new(3).unwrap(), "root").unwrap();
        RemoteTreeStore::new(
            Uid::new(3).unwrap(),
            "root".to_string(),
            Arc::new(FakeClient {
                children: StdMutex::new(std::collections::HashMap::new()),
            }),
            mapper,
            disk_index,
            Arc::new(SignalBus::new()),
        )
    }

    #[test]
    fn mkdir_creates_a_remote_folder_node() -> Result<()> {
        let ts = store();
        let parent_spid = Spid::new(ts.device_uid, REMOTE_VIRTUAL_ROOT_UID, Utf8PathBuf::from("root"));
        ts.execute_write(&UserOp::Mkdir {
            parent_spid,
            name: "docs".to_string(),
        })?;
        assert_eq!(ts.mem_tree.lock().unwrap().len(), 1);
        Ok(())
    }
}
