//! Cache Registry: the single sqlite database that tracks which devices
//! this engine knows about and where each device's on-disk index file
//! lives, so `CacheManager` can find (or lazily create) a `DiskIndex`
//! without scanning the filesystem for it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use rusqlite::{Connection, params};

use crate::device::{Device, TreeType};
use crate::uid::Uid;

#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub device_uid: Uid,
    pub subtree_root_path: String,
    pub index_file_path: Utf8PathBuf,
}

pub struct CacheRegistry {
    conn: Mutex<Connection>,
    cache_dir: PathBuf,
}

fn tree_type_to_str(t: TreeType) -> &'static str {
    match t {
        TreeType::Local => "local",
        TreeType::Remote => "remote",
        TreeType::SuperRoot => "super_root",
    }
}

fn tree_type_from_str(s: &str) -> TreeType {
    match s {
        "remote" => TreeType::Remote,
        "super_root" => TreeType::SuperRoot,
        _ => TreeType::Local,
    }
}

impl CacheRegistry {
    pub fn open(registry_db_path: &Path, cache_dir: &Path) -> Result<Self> {
        let mut conn = Connection::open(registry_db_path).with_context(|| {
            format!(
                "Couldn't open cache registry db at {}",
                registry_db_path.display()
            )
        })?;
        let tx = conn.transaction()?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS devices (
                uid INTEGER PRIMARY KEY,
                long_device_id TEXT NOT NULL UNIQUE,
                tree_type TEXT NOT NULL,
                friendly_name TEXT NOT NULL
            ) STRICT",
            (),
        )?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS caches (
                device_uid INTEGER PRIMARY KEY,
                subtree_root_path TEXT NOT NULL,
                index_file_path TEXT NOT NULL
            ) STRICT",
            (),
        )?;
        tx.commit()?;
        conn.execute("PRAGMA journal_mode=wal", ())?;
        let registry = Self {
            conn: Mutex::new(conn),
            cache_dir: cache_dir.to_path_buf(),
        };
        registry.purge_dangling()?;
        Ok(registry)
    }

    /// Startup purge (I6): any `caches` row whose `index_file_path` no
    /// longer exists on disk is dropped rather than merely flagged, per the
    /// decision recorded in DESIGN.md.
    fn purge_dangling(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT device_uid, index_file_path FROM caches")?;
        let rows: Vec<(i64, String)> = stmt
            .query_map((), |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        for (device_uid, path) in rows {
            if !Path::new(&path).exists() {
                conn.execute("DELETE FROM caches WHERE device_uid = ?1", [device_uid])?;
            }
        }
        Ok(())
    }

    pub fn register_device(&self, device: &Device) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "REPLACE INTO devices (uid, long_device_id, tree_type, friendly_name) VALUES (?1, ?2, ?3, ?4)",
            params![
                device.uid.get() as i64,
                device.long_device_id,
                tree_type_to_str(device.tree_type),
                device.friendly_name,
            ],
        )?;
        Ok(())
    }

    /// Looks up a device by its stable external identity rather than its
    /// (registry-lifetime-scoped) uid - how a restart recognizes "this is
    /// the same machine/account as last time" before re-registering it.
    pub fn get_device_by_long_id(&self, long_device_id: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT uid, tree_type, friendly_name FROM devices WHERE long_device_id = ?1",
            [long_device_id],
            |r| {
                let uid: i64 = r.get(0)?;
                let tree_type: String = r.get(1)?;
                Ok(Device {
                    uid: Uid::new(uid as u64).unwrap(),
                    long_device_id: long_device_id.to_string(),
                    tree_type: tree_type_from_str(&tree_type),
                    friendly_name: r.get(2)?,
                })
            },
        )
        .optional_or_none()
    }

    pub fn get_device(&self, uid: Uid) -> Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT long_device_id, tree_type, friendly_name FROM devices WHERE uid = ?1",
            [uid.get() as i64],
            |r| {
                let tree_type: String = r.get(1)?;
                Ok(Device {
                    uid,
                    long_device_id: r.get(0)?,
                    tree_type: tree_type_from_str(&tree_type),
                    friendly_name: r.get(2)?,
                })
            },
        )
        .optional_or_none()
    }

    pub fn register_cache(&self, device_uid: Uid, subtree_root_path: &str) -> Result<Utf8PathBuf> {
        let file_name = format!("cache-{}.db", device_uid.get());
        let index_file_path = Utf8PathBuf::from_path_buf(self.cache_dir.join(file_name))
            .map_err(|p| anyhow::anyhow!("Non-UTF-8 cache dir: {}", p.display()))?;
        std::fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("Couldn't create cache dir {}", self.cache_dir.display()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "REPLACE INTO caches (device_uid, subtree_root_path, index_file_path) VALUES (?1, ?2, ?3)",
            params![
                device_uid.get() as i64,
                subtree_root_path,
                index_file_path.as_str(),
            ],
        )?;
        Ok(index_file_path)
    }

    pub fn get_cache_info(&self, device_uid: Uid) -> Result<Option<CacheInfo>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT subtree_root_path, index_file_path FROM caches WHERE device_uid = ?1",
            [device_uid.get() as i64],
            |r| {
                Ok(CacheInfo {
                    device_uid,
                    subtree_root_path: r.get(0)?,
                    index_file_path: Utf8PathBuf::from(r.get::<_, String>(1)?),
                })
            },
        )
        .optional_or_none()
    }

    /// Returns cache info for the device whose `subtree_root_path` is a
    /// prefix of `path` - used when a caller only knows a path on disk and
    /// needs to find which cache (if any) already covers it.
    pub fn get_cache_info_for_subtree(&self, path: &str) -> Result<Option<CacheInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT device_uid, subtree_root_path, index_file_path FROM caches")?;
        let rows: Vec<(i64, String, String)> = stmt
            .query_map((), |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows
            .into_iter()
            .filter(|(_, root, _)| path.starts_with(root.as_str()))
            .max_by_key(|(_, root, _)| root.len())
            .map(|(uid, root, index)| CacheInfo {
                device_uid: Uid::new(uid as u64).unwrap(),
                subtree_root_path: root,
                index_file_path: Utf8PathBuf::from(index),
            }))
    }

    /// Merges any local-device cache rows whose subtree roots nest inside
    /// one another into a single covering cache, dropping the redundant
    /// rows. Returns the UIDs of devices whose cache rows were dropped.
    pub fn consolidate_local_caches(&self) -> Result<Vec<Uid>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT caches.device_uid, caches.subtree_root_path FROM caches
             JOIN devices ON devices.uid = caches.device_uid
             WHERE devices.tree_type = 'local'",
        )?;
        let mut rows: Vec<(i64, String)> = stmt
            .query_map((), |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        rows.sort_by_key(|(_, root)| root.len());

        let mut dropped = Vec::new();
        for i in 0..rows.len() {
            for j in (i + 1)..rows.len() {
                let (_, shorter) = &rows[i];
                let (longer_uid, longer) = &rows[j];
                if longer.starts_with(shorter.as_str()) && longer != shorter {
                    conn.execute("DELETE FROM caches WHERE device_uid = ?1", [*longer_uid])?;
                    dropped.push(Uid::new(*longer_uid as u64).unwrap());
                }
            }
        }
        Ok(dropped)
    }
}

/// Small helper: `query_row` returns `Err(QueryReturnedNoRows)` for "not
/// found", which this engine represents as `Ok(None)` instead.
trait OptionalOrNone<T> {
    fn optional_or_none(self) -> Result<Option<T>>;
}

impl<T> OptionalOrNone<T> for rusqlite::Result<T> {
    fn optional_or_none(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_and_fetch_device() -> Result<()> {
        let dir = tempdir()?;
        let reg = CacheRegistry::open(&dir.path().join("registry.db"), &dir.path().join("caches"))?;
        let device = Device {
            uid: Uid::new(2).unwrap(),
            long_device_id: "host-1".to_string(),
            tree_type: TreeType::Local,
            friendly_name: "My Laptop".to_string(),
        };
        reg.register_device(&device)?;
        let fetched = reg.get_device(Uid::new(2).unwrap())?.unwrap();
        assert_eq!(fetched.long_device_id, "host-1");
        Ok(())
    }

    #[test]
    fn dangling_cache_entries_are_purged_on_open() -> Result<()> {
        let dir = tempdir()?;
        let registry_path = dir.path().join("registry.db");
        let cache_dir = dir.path().join("caches");
        {
            let reg = CacheRegistry::open(&registry_path, &cache_dir)?;
            reg.register_cache(Uid::new(5).unwrap(), "/tmp/x")?;
        }
        // Remove the cache file the registry pointed at before reopening.
        std::fs::remove_dir_all(&cache_dir).ok();
        let reg = CacheRegistry::open(&registry_path, &cache_dir)?;
        assert!(reg.get_cache_info(Uid::new(5).unwrap())?.is_none());
        Ok(())
    }

    #[test]
    fn consolidate_drops_nested_local_caches() -> Result<()> {
        let dir = tempdir()?;
        let reg = CacheRegistry::open(&dir.path().join("registry.db"), &dir.path().join("caches"))?;
        reg.register_device(&Device {
            uid: Uid::new(2).unwrap(),
            long_device_id: "a".into(),
            tree_type: TreeType::Local,
            friendly_name: "a".into(),
        })?;
        reg.register_device(&Device {
            uid: Uid::new(3).unwrap(),
            long_device_id: "b".into(),
            tree_type: TreeType::Local,
            friendly_name: "b".into(),
        })?;
        reg.register_cache(Uid::new(2).unwrap(), "/home/user")?;
        reg.register_cache(Uid::new(3).unwrap(), "/home/user/docs")?;
        let dropped = reg.consolidate_local_caches()?;
        assert_eq!(dropped, vec![Uid::new(3).unwrap()]);
        Ok(())
    }
}
