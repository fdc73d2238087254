#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use camino::Utf8PathBuf;
use outlet::backend::RealLocalFs;
use outlet::cache_manager::CacheManager;
use outlet::config::Configuration;
use outlet::device::{Device, TreeType};
use outlet::uid::Uid;

pub fn config_in(dir: &Path) -> Configuration {
    let mut conf = Configuration::default();
    conf.cache_dir = Utf8PathBuf::from_path_buf(dir.to_path_buf()).unwrap();
    conf
}

pub fn open_manager(dir: &Path) -> CacheManager {
    CacheManager::open(config_in(dir)).expect("cache manager should open")
}

/// Registers and loads a local-filesystem cache rooted at `root`, returning
/// the device uid it was assigned.
pub fn load_local(mgr: &CacheManager, device_uid: u64, root: &Path) -> Uid {
    let device = Device {
        uid: Uid::new(device_uid).unwrap(),
        long_device_id: format!("host-{device_uid}"),
        tree_type: TreeType::Local,
        friendly_name: "test".to_string(),
    };
    let root = Utf8PathBuf::from_path_buf(root.to_path_buf()).unwrap();
    mgr.load_local_cache(device, root, Arc::new(RealLocalFs))
        .expect("load_local_cache should succeed")
}
