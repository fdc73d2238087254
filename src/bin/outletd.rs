//! Thin demo binary: wires up logging and configuration, loads one local
//! cache under a directory given on the command line, and prints what it
//! found. A CLI/GUI/RPC surface is out of scope for this crate; this exists
//! only to smoke-test `CacheManager` end to end.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use outlet::backend::RealLocalFs;
use outlet::cache_manager::CacheManager;
use outlet::config;

#[derive(Parser)]
#[command(about = "Smoke-test the outlet cache engine against one local directory")]
struct Args {
    /// Directory to scan and cache.
    root: camino::Utf8PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut conf = config::load()?;
    let device_long_id = config::ensure_device_long_id(&mut conf)?;
    info!("starting outletd for device {device_long_id}, caching under {}", conf.cache_dir);

    let manager = CacheManager::open(conf)?;
    let device = manager.ensure_local_device(device_long_id, args.root.to_string())?;
    let device_uid = manager.load_local_cache(device, args.root.clone(), Arc::new(RealLocalFs))?;
    let info = manager
        .get_cache_info_for_subtree(args.root.as_str())?
        .expect("just-loaded cache should be registered");
    info!(
        "loaded cache for device {device_uid}, index stored at {}",
        info.index_file_path
    );

    Ok(())
}
