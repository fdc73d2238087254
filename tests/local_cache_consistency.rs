//! P1: after a rescan, every node reachable via the in-memory tree
//! round-trips through the on-disk index exactly.

use std::sync::Arc;

use camino::Utf8PathBuf;
use outlet::disk_index::DiskIndex;
use outlet::signal::SignalBus;
use outlet::tree_store::{LocalTreeStore, TreeStore};
use outlet::uid::{PathMapper, Uid, UidAllocator};
use tempfile::tempdir;

#[test]
fn disk_index_agrees_with_in_memory_tree_after_rescan() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let alloc = Arc::new(UidAllocator::open_in_memory().unwrap());
    let mapper = PathMapper::open_in_memory(Arc::clone(&alloc)).unwrap();
    let device_uid = Uid::new(2).unwrap();

    // Resolved before `mapper` moves into the store - `uid_for_path` is
    // idempotent, so the store's own scan resolves to the same uid (P2).
    let root_uid = mapper.uid_for_path(root.as_str(), None).unwrap();

    let index_path = dir.path().join("index.db");
    let disk_index = DiskIndex::open(&index_path, device_uid, root.as_str()).unwrap();
    let store = LocalTreeStore::new(
        device_uid,
        root.clone(),
        Arc::new(outlet::backend::RealLocalFs),
        mapper,
        disk_index,
        Arc::new(SignalBus::new()),
    );

    store.rescan().unwrap();

    let root_node = store.get_node(root_uid).expect("root node should be cached");
    assert!(root_node.is_dir());

    // P8: a completed rescan leaves the root's child listing marked complete.
    match &root_node {
        outlet::node::Node::LocalDir(d) => assert!(d.all_children_fetched),
        other => panic!("expected a local dir, got {other:?}"),
    }

    let reader = DiskIndex::open(&index_path, device_uid, root.as_str()).unwrap();
    assert_eq!(reader.get_by_uid(root_uid).unwrap(), Some(root_node));

    for child in store.get_children(root_uid) {
        let from_disk = reader
            .get_by_uid(child.uid())
            .unwrap()
            .expect("every in-memory node should have a disk-index row");
        assert_eq!(from_disk, child);
    }
}
