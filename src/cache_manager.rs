//! Cache Manager: the top-level facade. Composes the registry, the loaded
//! `TreeStore`s, the Op Manager, and the Active Tree Manager, and routes
//! calls from a caller who only knows a device uid or a SPID to the right
//! collaborator.
//!
//! Grounded in `original_source/outlet/be/cache_manager.py` and
//! `original_source/outlet/backend/cache_manager.py` (two historical
//! versions of the same class in the original source; method shapes below
//! follow the more complete `/backend/` one: `get_cache_info_for_subtree`,
//! `consolidate_local_caches`, drag-and-drop batch assembly).

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use rustc_hash::FxHashMap;
use std::sync::Mutex;

use crate::active_tree::{ActiveDisplayTreeMeta, ActiveTreeManager};
use crate::backend::{LocalFs, RemoteClient};
use crate::config::Configuration;
use crate::device::{Device, TreeType};
use crate::disk_index::DiskIndex;
use crate::error::EngineError;
use crate::node::{Node, NodeIdentifier, Spid, UserOp};
use crate::op_graph::{OgnId, OpInsertItem};
use crate::op_manager::{CommandResult, CommandStatus, OpManager};
use crate::registry::CacheRegistry;
use crate::signal::{Signal, SignalBus};
use crate::tree_store::{LocalTreeStore, RemoteTreeStore, TreeStore, MAX_FS_LINK_DEPTH};
use crate::uid::{PathMapper, RemoteIdMapper, Uid, UidAllocator};

pub struct CacheManager {
    registry: CacheRegistry,
    config: Configuration,
    allocator: Arc<UidAllocator>,
    signal_bus: Arc<SignalBus>,
    active_trees: Arc<ActiveTreeManager>,
    op_manager: OpManager,
    stores: Mutex<FxHashMap<Uid, Arc<dyn TreeStore + Send + Sync>>>,
}

impl CacheManager {
    pub fn open(config: Configuration) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("Couldn't create cache dir {}", config.cache_dir))?;
        let registry = CacheRegistry::open(
            Path::new(config.cache_dir.as_str()).join("registry.db").as_path(),
            Path::new(config.cache_dir.as_str()),
        )?;
        let allocator = Arc::new(UidAllocator::open(
            Path::new(config.cache_dir.as_str()).join("uids.db").as_path(),
        )?);
        let op_manager = OpManager::open(
            Path::new(config.cache_dir.as_str()).join("ops.db").as_path(),
        )?;
        // S1 (empty-store startup): the synthetic SUPER_ROOT device always
        // exists, parenting every real device, whether or not this is the
        // registry's first run.
        registry.register_device(&Device::super_root())?;

        let signal_bus = Arc::new(SignalBus::new());
        let active_trees = Arc::new(ActiveTreeManager::new());

        // Relay node-change signals into whichever display trees subscribed
        // to them, on a dedicated thread so publishers never block on a
        // slow UI consumer.
        let relay_rx = signal_bus.subscribe();
        let relay_trees = Arc::clone(&active_trees);
        std::thread::Builder::new()
            .name("active-tree-relay".to_string())
            .spawn(move || {
                for signal in relay_rx.iter() {
                    relay_trees.relay(&signal);
                }
            })
            .context("Couldn't spawn active tree relay thread")?;

        Ok(Self {
            registry,
            config,
            allocator,
            signal_bus,
            active_trees,
            op_manager,
            stores: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn signal_bus(&self) -> &Arc<SignalBus> {
        &self.signal_bus
    }

    pub fn active_trees(&self) -> &Arc<ActiveTreeManager> {
        &self.active_trees
    }

    pub fn register_tree(&self, meta: ActiveDisplayTreeMeta) -> crossbeam_channel::Receiver<Signal> {
        self.active_trees.register_tree(meta)
    }

    /// Issues a fresh device uid from the shared allocator - callers
    /// registering a new device shouldn't have to pick one themselves.
    pub fn allocate_device_uid(&self) -> Result<Uid> {
        self.allocator.next()
    }

    /// Looks up the device previously registered under `long_device_id`
    /// (reusing its uid, so caches/op history keyed on that uid keep
    /// working across a restart), or allocates and registers a new one if
    /// this is the first time this identity has been seen - §4.5 step 1's
    /// "create local device for this machine if missing".
    pub fn ensure_local_device(&self, long_device_id: String, friendly_name: String) -> Result<Device> {
        if let Some(existing) = self.registry.get_device_by_long_id(&long_device_id)? {
            return Ok(existing);
        }
        let device = Device {
            uid: self.allocator.next()?,
            long_device_id,
            tree_type: TreeType::Local,
            friendly_name,
        };
        self.registry.register_device(&device)?;
        Ok(device)
    }

    fn store_for(&self, device_uid: Uid) -> Result<Arc<dyn TreeStore + Send + Sync>> {
        self.stores
            .lock()
            .unwrap()
            .get(&device_uid)
            .cloned()
            .ok_or(EngineError::CacheNotLoaded { device_uid }.into())
    }

    /// Loads (creating on first use) the local-filesystem cache for
    /// `device`, rooted at `root_path`, and runs an initial rescan.
    pub fn load_local_cache(
        &self,
        device: Device,
        root_path: Utf8PathBuf,
        fs: Arc<dyn LocalFs + Send + Sync>,
    ) -> Result<Uid> {
        self.registry.register_device(&device)?;
        let index_path = self.registry.register_cache(device.uid, root_path.as_str())?;
        let path_mapper = PathMapper::open(
            Path::new(self.config.cache_dir.as_str())
                .join(format!("paths-{}.db", device.uid.get()))
                .as_path(),
            Arc::clone(&self.allocator),
        )?;
        let disk_index = DiskIndex::open(
            Path::new(index_path.as_str()),
            device.uid,
            root_path.as_str(),
        )?;
        let store: Arc<dyn TreeStore + Send + Sync> = Arc::new(LocalTreeStore::new(
            device.uid,
            root_path,
            fs,
            path_mapper,
            disk_index,
            Arc::clone(&self.signal_bus),
        ));
        self.stores.lock().unwrap().insert(device.uid, Arc::clone(&store));
        self.signal_bus.publish(Signal::DeviceCacheLoaded {
            device_uid: device.uid,
        });
        store.rescan()?;
        Ok(device.uid)
    }

    /// Loads the remote cache for `device`, whose root is the remote-side
    /// object `root_remote_id`, and runs an initial rescan.
    pub fn load_remote_cache(
        &self,
        device: Device,
        root_remote_id: String,
        client: Arc<dyn RemoteClient + Send + Sync>,
    ) -> Result<Uid> {
        if !matches!(device.tree_type, TreeType::Remote) {
            bail!("load_remote_cache requires a Remote-type device");
        }
        self.registry.register_device(&device)?;
        let index_path = self.registry.register_cache(device.uid, &root_remote_id)?;
        let id_mapper = RemoteIdMapper::open(
            Path::new(self.config.cache_dir.as_str())
                .join(format!("remote-ids-{}.db", device.uid.get()))
                .as_path(),
            Arc::clone(&self.allocator),
        )?;
        let disk_index = DiskIndex::open(
            Path::new(index_path.as_str()),
            device.uid,
            &root_remote_id,
        )?;
        let store: Arc<dyn TreeStore + Send + Sync> = Arc::new(RemoteTreeStore::new(
            device.uid,
            root_remote_id,
            client,
            id_mapper,
            disk_index,
            Arc::clone(&self.signal_bus),
        ));
        self.stores.lock().unwrap().insert(device.uid, Arc::clone(&store));
        self.signal_bus.publish(Signal::DeviceCacheLoaded {
            device_uid: device.uid,
        });
        store.rescan()?;
        Ok(device.uid)
    }

    pub fn unload_cache(&self, device_uid: Uid) -> Result<()> {
        self.stores.lock().unwrap().remove(&device_uid);
        self.signal_bus.publish(Signal::DeviceCacheUnloaded { device_uid });
        Ok(())
    }

    pub fn get_node(&self, device_uid: Uid, uid: Uid) -> Result<Node> {
        let store = self.store_for(device_uid)?;
        store.get_node(uid).ok_or(EngineError::NodeNotPresent { uid }.into())
    }

    pub fn get_children(&self, device_uid: Uid, uid: Uid) -> Result<Vec<Node>> {
        let store = self.store_for(device_uid)?;
        let children = store.get_children(uid);
        if children.len() > self.config.max_result_count {
            bail!(EngineError::ResultsExceeded {
                limit: self.config.max_result_count,
            });
        }
        Ok(children)
    }

    pub fn get_cache_info_for_subtree(&self, path: &str) -> Result<Option<crate::registry::CacheInfo>> {
        self.registry.get_cache_info_for_subtree(path)
    }

    pub fn get_device(&self, uid: Uid) -> Result<Option<Device>> {
        self.registry.get_device(uid)
    }

    pub fn consolidate_local_caches(&self) -> Result<Vec<Uid>> {
        self.registry.consolidate_local_caches()
    }

    pub fn rescan(&self, device_uid: Uid) -> Result<Vec<Uid>> {
        self.store_for(device_uid)?.rescan()
    }

    /// Single-op convenience wrapper over [`Self::submit_op_batch`]. `op`
    /// must not be one of the binary ops (`CP`/`MV`/`START_DIR_*`), which
    /// need a destination target too - submit those via
    /// [`Self::submit_op_batch`] with an [`OpInsertItem::binary`].
    pub fn submit_op(&self, op: UserOp, target_uid: Uid, ancestor_uids: Vec<Uid>) -> Result<OgnId> {
        let item = if op.is_rm() {
            OpInsertItem::rm(op, target_uid, ancestor_uids, Vec::new())
        } else {
            OpInsertItem::unary(op, target_uid, Vec::new(), ancestor_uids)
        };
        Ok(self.submit_op_batch(vec![item])?[0])
    }

    /// Thin pass-through to the Op Manager - the Cache Manager doesn't
    /// interpret batches itself, it only routes them.
    pub fn submit_op_batch(&self, items: Vec<OpInsertItem>) -> Result<Vec<OgnId>> {
        self.op_manager.submit_batch(items)
    }

    /// Entry point for the (out-of-scope) ChangeTree/merge UI subsystem:
    /// it's expected to have already resolved conflicts and built a batch;
    /// the Cache Manager's only job is handing it to the Op Manager.
    pub fn register_change_tree(&self, _tree_id: String) -> Result<()> {
        Ok(())
    }

    pub fn enqueue_op_batch_from_merge(&self, items: Vec<OpInsertItem>) -> Result<Vec<OgnId>> {
        self.submit_op_batch(items)
    }

    pub fn get_next_command(&self) -> Option<OgnId> {
        self.op_manager.get_next_command()
    }

    pub fn op_for(&self, id: OgnId) -> Option<UserOp> {
        self.op_manager.op_for(id)
    }

    /// Ingests a [`CommandResult`] reported back by an executor: lands
    /// every upserted/removed node in its owning `TreeStore`, signals the
    /// outcome, then tells the Op Graph the command is done (or failed).
    pub fn finish_command(&self, id: OgnId, ancestor_uids: &[Uid], result: CommandResult) -> Result<()> {
        for node in result.nodes_to_upsert {
            self.store_for(node.device_uid())?.apply_upsert(node)?;
        }
        for identifier in result.nodes_to_remove {
            self.store_for(identifier.device_uid)?.apply_remove(identifier.node_uid)?;
        }

        let op = self.op_manager.op_for(id);
        match result.status {
            CommandStatus::Ok => {
                if let Some(op) = &op {
                    self.signal_bus.publish(Signal::OpExecuted {
                        guid: op.primary_spid().guid(),
                    });
                }
                self.op_manager.finish_command(id, ancestor_uids)
            }
            CommandStatus::Err(reason) => {
                if let Some(op) = &op {
                    self.signal_bus.publish(Signal::OpFailed {
                        guid: op.primary_spid().guid(),
                        reason: reason.clone(),
                    });
                }
                self.op_manager.fail_command(id, ancestor_uids)
            }
        }
    }

    pub fn fail_command(&self, id: OgnId, ancestor_uids: &[Uid], reason: String) -> Result<()> {
        if let Some(op) = self.op_manager.op_for(id) {
            self.signal_bus.publish(Signal::OpFailed {
                guid: op.primary_spid().guid(),
                reason,
            });
        }
        self.op_manager.fail_command(id, ancestor_uids)
    }

    pub fn retry_command(&self, id: OgnId, ancestor_uids: &[Uid]) -> Result<()> {
        self.op_manager.retry_command(id, ancestor_uids)
    }

    /// True if `candidate_ancestor` is an ancestor of (or equal to) `node_uid`
    /// within `device_uid`'s tree, walking the parent chain up to
    /// `MAX_FS_LINK_DEPTH` hops.
    fn is_ancestor_or_self(
        &self,
        store: &Arc<dyn TreeStore + Send + Sync>,
        candidate_ancestor: Uid,
        node_uid: Uid,
    ) -> bool {
        if candidate_ancestor == node_uid {
            return true;
        }
        let mut frontier = vec![node_uid];
        for _ in 0..MAX_FS_LINK_DEPTH {
            let mut next = Vec::new();
            for uid in frontier {
                if let Some(node) = store.get_node(uid) {
                    for parent in &node.header().parent_uids {
                        if *parent == candidate_ancestor {
                            return true;
                        }
                        next.push(*parent);
                    }
                }
            }
            if next.is_empty() {
                return false;
            }
            frontier = next;
        }
        false
    }

    fn ancestor_chain(&self, store: &Arc<dyn TreeStore + Send + Sync>, node_uid: Uid) -> Vec<Uid> {
        let mut out = Vec::new();
        let mut frontier = vec![node_uid];
        for _ in 0..MAX_FS_LINK_DEPTH {
            let mut next = Vec::new();
            for uid in frontier {
                if let Some(node) = store.get_node(uid) {
                    for parent in &node.header().parent_uids {
                        out.push(*parent);
                        next.push(*parent);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        out
    }

    /// Drag-and-drop batch assembly: resolves to SPID-node pairs (already
    /// done by the caller - the display tree holding the drag selection
    /// knows each dragged node's current SPID), runs the self-drop check
    /// (dropping onto self, onto the node's current parent, or onto one of
    /// its own descendants is a no-op for that node), and submits a
    /// `Cp`/`Mv` batch for whatever survives the check.
    pub fn drop_dragged_nodes(
        &self,
        src_spids: Vec<Spid>,
        dst_parent_spid: Spid,
        is_move: bool,
    ) -> Result<Vec<OgnId>> {
        let store = self.store_for(dst_parent_spid.device_uid)?;
        let mut items = Vec::new();
        for src in src_spids {
            if src.device_uid != dst_parent_spid.device_uid {
                // Cross-device drag isn't modeled by the abstract
                // TreeStore pair; skip rather than guess a transfer path.
                continue;
            }
            if src.node_uid == dst_parent_spid.node_uid {
                continue;
            }
            let already_there = store
                .get_node(src.node_uid)
                .map(|n| n.header().parent_uids.contains(&dst_parent_spid.node_uid))
                .unwrap_or(false);
            if already_there {
                continue;
            }
            if self.is_ancestor_or_self(&store, src.node_uid, dst_parent_spid.node_uid) {
                continue;
            }
            let op = if is_move {
                UserOp::Mv {
                    src_spid: src.clone(),
                    dst_parent_spid: dst_parent_spid.clone(),
                    new_name: None,
                }
            } else {
                UserOp::Cp {
                    src_spid: src.clone(),
                    dst_parent_spid: dst_parent_spid.clone(),
                    new_name: None,
                }
            };
            let ancestors = self.ancestor_chain(&store, dst_parent_spid.node_uid);
            // The dst-side OGN reserves a uid for the not-yet-existing node
            // the copy/move will create, so it can be linked under the
            // destination directory's own queue tail (insertion rule 3a).
            let dst_target = self.allocator.next()?;
            items.push(OpInsertItem::binary(
                op,
                src.node_uid,
                dst_target,
                vec![dst_parent_spid.node_uid],
                ancestors,
            ));
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }
        self.submit_op_batch(items)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::RealLocalFs;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> Configuration {
        let mut conf = Configuration::default();
        conf.cache_dir = Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap();
        conf
    }

    #[test]
    fn load_local_cache_then_read_root() -> Result<()> {
        let dir = tempdir()?;
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::write(data_dir.join("a.txt"), b"hi")?;

        let mgr = CacheManager::open(config_in(dir.path()))?;
        let device = Device {
            uid: Uid::new(2).unwrap(),
            long_device_id: "host-1".to_string(),
            tree_type: TreeType::Local,
            friendly_name: "laptop".to_string(),
        };
        let root = Utf8PathBuf::from_path_buf(data_dir.clone()).unwrap();
        mgr.load_local_cache(device, root.clone(), Arc::new(RealLocalFs))?;

        let root_uid = mgr
            .registry
            .get_cache_info(Uid::new(2).unwrap())?
            .expect("cache info should be registered");
        assert_eq!(root_uid.subtree_root_path, root.as_str());
        Ok(())
    }

    #[test]
    fn dropping_node_onto_itself_is_a_no_op() -> Result<()> {
        let dir = tempdir()?;
        let mgr = CacheManager::open(config_in(dir.path()))?;
        let device = Device {
            uid: Uid::new(2).unwrap(),
            long_device_id: "host-1".to_string(),
            tree_type: TreeType::Local,
            friendly_name: "laptop".to_string(),
        };
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir)?;
        let root = Utf8PathBuf::from_path_buf(data_dir).unwrap();
        mgr.load_local_cache(device, root.clone(), Arc::new(RealLocalFs))?;

        // The self-drop check short-circuits on src == dst before touching
        // the store, so any shared uid exercises it without needing to know
        // which uid the path mapper actually assigned the root.
        let spid = Spid::new(Uid::new(2).unwrap(), Uid::new(99).unwrap(), root);
        let result = mgr.drop_dragged_nodes(vec![spid.clone()], spid, false)?;
        assert!(result.is_empty());
        Ok(())
    }
}
