//! P9: consolidating local caches only drops redundant (nested) cache rows
//! - it never loses coverage of a subtree a still-registered cache claims.

mod common;

use std::sync::Arc;

use camino::Utf8PathBuf;
use outlet::backend::RealLocalFs;
use outlet::device::{Device, TreeType};
use outlet::uid::Uid;
use tempfile::tempdir;

#[test]
fn consolidating_drops_only_the_nested_cache_and_keeps_the_covering_one() {
    let dir = tempdir().unwrap();
    let outer = dir.path().join("outer");
    let inner = outer.join("inner");
    std::fs::create_dir_all(&inner).unwrap();

    let mgr = common::open_manager(dir.path());

    let outer_device = Device {
        uid: Uid::new(2).unwrap(),
        long_device_id: "outer".to_string(),
        tree_type: TreeType::Local,
        friendly_name: "outer".to_string(),
    };
    let inner_device = Device {
        uid: Uid::new(3).unwrap(),
        long_device_id: "inner".to_string(),
        tree_type: TreeType::Local,
        friendly_name: "inner".to_string(),
    };

    let outer_root = Utf8PathBuf::from_path_buf(outer.clone()).unwrap();
    let inner_root = Utf8PathBuf::from_path_buf(inner.clone()).unwrap();
    mgr.load_local_cache(outer_device, outer_root.clone(), Arc::new(RealLocalFs)).unwrap();
    mgr.load_local_cache(inner_device, inner_root, Arc::new(RealLocalFs)).unwrap();

    let before = mgr.get_cache_info_for_subtree(outer_root.as_str()).unwrap();
    assert!(before.is_some());

    let dropped = mgr.consolidate_local_caches().unwrap();
    assert_eq!(dropped, vec![Uid::new(3).unwrap()]);

    // The outer cache still covers the same subtree after consolidation.
    let after = mgr.get_cache_info_for_subtree(outer_root.as_str()).unwrap();
    assert_eq!(after.map(|c| c.device_uid), Some(Uid::new(2).unwrap()));
}
