//! S1: a fresh config dir, with no caches loaded yet, already has the
//! synthetic `SUPER_ROOT` device registered and an empty Op Graph.

mod common;

use outlet::device::TreeType;
use tempfile::tempdir;

#[test]
fn empty_store_has_super_root_and_no_pending_ops() {
    let dir = tempdir().unwrap();
    let mgr = common::open_manager(dir.path());

    let super_root = mgr
        .get_device(outlet::uid::SUPER_ROOT_DEVICE_UID)
        .unwrap()
        .expect("SUPER_ROOT device should be registered on open");
    assert!(matches!(super_root.tree_type, TreeType::SuperRoot));

    assert!(mgr.get_next_command().is_none());
}

#[test]
fn ensure_local_device_registers_once_and_is_stable_across_calls() {
    let dir = tempdir().unwrap();
    let mgr = common::open_manager(dir.path());

    let first = mgr
        .ensure_local_device("host-a".to_string(), "laptop".to_string())
        .unwrap();
    let second = mgr
        .ensure_local_device("host-a".to_string(), "laptop".to_string())
        .unwrap();
    assert_eq!(first.uid, second.uid);
}
