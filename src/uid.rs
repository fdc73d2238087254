//! Process-global UID allocator and the identity mappers built on top of it.

use std::num::NonZeroU64;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Opaque, non-zero, process-globally unique identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Uid(NonZeroU64);

impl Uid {
    pub const fn new(v: u64) -> Option<Self> {
        match NonZeroU64::new(v) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved UID for the synthetic `SUPER_ROOT` device.
pub const SUPER_ROOT_DEVICE_UID: Uid = match Uid::new(1) {
    Some(u) => u,
    None => unreachable!(),
};

/// Reserved UID within a remote device's own UID space for its synthetic
/// virtual root (parent of nodes with no other parent). See SPEC_FULL.md §3.
pub const REMOTE_VIRTUAL_ROOT_UID: Uid = match Uid::new(1) {
    Some(u) => u,
    None => unreachable!(),
};

/// Monotonic UID source, persisted across restarts.
///
/// Mirrors the way `backend/cache.rs` guards a single sqlite [`Connection`]
/// with one mutex rather than trying to get clever with concurrent access.
pub struct UidAllocator {
    conn: Mutex<Connection>,
}

impl UidAllocator {
    pub fn open(db_path: &Path) -> Result<Self> {
        let mut conn = Connection::open(db_path)
            .with_context(|| format!("Couldn't open UID allocator db at {}", db_path.display()))?;
        let tx = conn.transaction()?;
        let ver: i32 = tx.query_row("PRAGMA user_version", (), |r| r.get(0))?;
        if ver < 1 {
            tx.execute(
                "CREATE TABLE high_water_mark (id INTEGER PRIMARY KEY CHECK (id = 0), value INTEGER NOT NULL) STRICT",
                (),
            )?;
            tx.execute(
                "INSERT INTO high_water_mark (id, value) VALUES (0, 1)",
                (),
            )?;
        }
        tx.execute("PRAGMA user_version=1", ())?;
        tx.commit()?;
        conn.execute("PRAGMA journal_mode=wal", ())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE high_water_mark (id INTEGER PRIMARY KEY CHECK (id = 0), value INTEGER NOT NULL)",
            (),
        )?;
        conn.execute(
            "INSERT INTO high_water_mark (id, value) VALUES (0, 1)",
            (),
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Issues the next UID, persisting the new high-water mark before returning it.
    pub fn next(&self) -> Result<Uid> {
        let conn = self.conn.lock().unwrap();
        let next: u64 = conn.query_row(
            "UPDATE high_water_mark SET value = value + 1 WHERE id = 0 RETURNING value",
            (),
            |r| r.get(0),
        )?;
        Ok(Uid::new(next).expect("high_water_mark never yields 0"))
    }

    /// Reserves a caller-suggested UID if it's past the current high-water mark.
    /// Used when a mapper wants to keep a UID a caller already knows about.
    pub fn reserve(&self, suggestion: Uid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE high_water_mark SET value = MAX(value, ?1 + 1) WHERE id = 0",
            [suggestion.get() as i64],
        )?;
        Ok(())
    }
}

/// Shared shape for the two identity mappers: bidirectional `key <-> Uid`,
/// persisted to a small sqlite table, with an optional UID suggestion on lookup.
struct MapperTable {
    conn: Mutex<Connection>,
    table_name: &'static str,
}

impl MapperTable {
    fn open(db_path: &Path, table_name: &'static str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Couldn't open mapper db at {}", db_path.display()))?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table_name} (
                    key TEXT NOT NULL PRIMARY KEY,
                    uid INTEGER NOT NULL UNIQUE
                ) STRICT"
            ),
            (),
        )?;
        conn.execute("PRAGMA journal_mode=wal", ())?;
        Ok(Self {
            conn: Mutex::new(conn),
            table_name,
        })
    }

    fn open_in_memory(table_name: &'static str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            &format!(
                "CREATE TABLE {table_name} (key TEXT NOT NULL PRIMARY KEY, uid INTEGER NOT NULL UNIQUE)"
            ),
            (),
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            table_name,
        })
    }

    fn uid_for_key(&self, key: &str) -> Result<Option<Uid>> {
        let conn = self.conn.lock().unwrap();
        let v: Option<i64> = conn
            .query_row(
                &format!("SELECT uid FROM {} WHERE key = ?1", self.table_name),
                [key],
                |r| r.get(0),
            )
            .ok();
        Ok(v.and_then(|v| Uid::new(v as u64)))
    }

    fn key_for_uid(&self, uid: Uid) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let v: Option<String> = conn
            .query_row(
                &format!("SELECT key FROM {} WHERE uid = ?1", self.table_name),
                [uid.get() as i64],
                |r| r.get(0),
            )
            .ok();
        Ok(v)
    }

    /// Binds `key` to `uid`. Fails with [`EngineError::MappingConflict`] if
    /// `key` is already bound to a *different* UID.
    fn bind(&self, key: &str, uid: Uid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if let Ok(existing) = conn.query_row::<i64, _, _>(
            &format!("SELECT uid FROM {} WHERE key = ?1", self.table_name),
            [key],
            |r| r.get(0),
        ) {
            if existing as u64 != uid.get() {
                return Err(EngineError::MappingConflict {
                    key: key.to_string(),
                }
                .into());
            }
            return Ok(());
        }
        conn.execute(
            &format!(
                "INSERT INTO {} (key, uid) VALUES (?1, ?2)",
                self.table_name
            ),
            (key, uid.get() as i64),
        )?;
        Ok(())
    }
}

/// `path -> uid` / `uid -> path` for local nodes (I2: pure function of the
/// normalized absolute path).
pub struct PathMapper {
    table: MapperTable,
    allocator: std::sync::Arc<UidAllocator>,
}

impl PathMapper {
    pub fn open(db_path: &Path, allocator: std::sync::Arc<UidAllocator>) -> Result<Self> {
        Ok(Self {
            table: MapperTable::open(db_path, "path_mapper")?,
            allocator,
        })
    }

    pub fn open_in_memory(allocator: std::sync::Arc<UidAllocator>) -> Result<Self> {
        Ok(Self {
            table: MapperTable::open_in_memory("path_mapper")?,
            allocator,
        })
    }

    pub fn path_for_uid(&self, uid: Uid) -> Result<Option<String>> {
        self.table.key_for_uid(uid)
    }

    /// Looks up (or allocates) the UID for `normalized_path`. If
    /// `uid_suggestion` is given and the path is unmapped, that UID is
    /// reserved and bound instead of calling the allocator.
    pub fn uid_for_path(&self, normalized_path: &str, uid_suggestion: Option<Uid>) -> Result<Uid> {
        if let Some(uid) = self.table.uid_for_key(normalized_path)? {
            return Ok(uid);
        }
        let uid = match uid_suggestion {
            Some(suggested) => {
                self.allocator.reserve(suggested)?;
                suggested
            }
            None => self.allocator.next()?,
        };
        self.table.bind(normalized_path, uid)?;
        Ok(uid)
    }
}

/// `remote_id -> uid` / `uid -> remote_id` for remote nodes (I3: pure
/// function of the remote object id).
pub struct RemoteIdMapper {
    table: MapperTable,
    allocator: std::sync::Arc<UidAllocator>,
}

impl RemoteIdMapper {
    pub fn open(db_path: &Path, allocator: std::sync::Arc<UidAllocator>) -> Result<Self> {
        Ok(Self {
            table: MapperTable::open(db_path, "remote_id_mapper")?,
            allocator,
        })
    }

    pub fn open_in_memory(allocator: std::sync::Arc<UidAllocator>) -> Result<Self> {
        Ok(Self {
            table: MapperTable::open_in_memory("remote_id_mapper")?,
            allocator,
        })
    }

    pub fn remote_id_for_uid(&self, uid: Uid) -> Result<Option<String>> {
        self.table.key_for_uid(uid)
    }

    pub fn uid_for_remote_id(&self, remote_id: &str, uid_suggestion: Option<Uid>) -> Result<Uid> {
        if let Some(uid) = self.table.uid_for_key(remote_id)? {
            return Ok(uid);
        }
        let uid = match uid_suggestion {
            Some(suggested) => {
                self.allocator.reserve(suggested)?;
                suggested
            }
            None => self.allocator.next()?,
        };
        self.table.bind(remote_id, uid)?;
        Ok(uid)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocator_is_monotonic() -> Result<()> {
        let a = UidAllocator::open_in_memory()?;
        let u1 = a.next()?;
        let u2 = a.next()?;
        assert!(u2.get() > u1.get());
        Ok(())
    }

    #[test]
    /// P2: idempotent round-trip for path mapping.
    fn path_round_trip_is_idempotent() -> Result<()> {
        let alloc = Arc::new(UidAllocator::open_in_memory()?);
        let mapper = PathMapper::open_in_memory(alloc)?;
        let p = "/tmp/a/b.txt";
        let u1 = mapper.uid_for_path(p, None)?;
        let round_tripped = mapper.path_for_uid(u1)?.unwrap();
        let u2 = mapper.uid_for_path(&round_tripped, None)?;
        assert_eq!(u1, u2);
        Ok(())
    }

    #[test]
    fn conflicting_uid_suggestion_errors() -> Result<()> {
        let alloc = Arc::new(UidAllocator::open_in_memory()?);
        let mapper = PathMapper::open_in_memory(alloc)?;
        let u1 = mapper.uid_for_path("/a", None)?;
        mapper.uid_for_path("/b", None)?; // advances allocator
        let err = mapper.table.bind("/a", Uid::new(999).unwrap());
        assert!(err.is_err());
        let _ = u1;
        Ok(())
    }
}
