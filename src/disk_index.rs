//! On-disk index: one sqlite database per cache, storing the last known
//! state of a subtree so it doesn't have to be rescanned from scratch on
//! every restart.
//!
//! Table layout mirrors `backend/cache.rs`'s local sqlite cache: `PRAGMA
//! user_version` for schema versioning, WAL journaling, and a small number
//! of `STRICT` tables. Node payloads are CBOR blobs via `ciborium`, the same
//! encoding `tree::serialize_and_hash` uses for frozen trees.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension, params};

use crate::node::Node;
use crate::uid::Uid;

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone)]
pub struct IndexHeader {
    pub device_uid: Uid,
    pub subtree_root_path: String,
    pub last_sync_ts: Option<Timestamp>,
    pub is_complete: bool,
}

/// Per-cache on-disk store. One `DiskIndex` per loaded device cache; the
/// `rusqlite::Connection` is guarded by a single mutex the way
/// `backend/cache.rs`'s `Cache` guards its connection - there's no benefit
/// to finer-grained locking for a cache this small.
pub struct DiskIndex {
    conn: Mutex<Connection>,
}

fn encode_node(node: &Node) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(node, &mut buf).context("Couldn't encode node")?;
    Ok(buf)
}

fn decode_node(bytes: &[u8]) -> Result<Node> {
    ciborium::from_reader(bytes).context("Couldn't decode node")
}

impl DiskIndex {
    pub fn open(path: &Path, device_uid: Uid, subtree_root_path: &str) -> Result<Self> {
        let mut conn = Connection::open(path)
            .with_context(|| format!("Couldn't open index db at {}", path.display()))?;
        let tx = conn.transaction()?;
        let ver: i32 = tx.query_row("PRAGMA user_version", (), |r| r.get(0))?;
        if ver < SCHEMA_VERSION {
            tx.execute(
                "CREATE TABLE IF NOT EXISTS header (
                    id INTEGER PRIMARY KEY CHECK (id = 0),
                    device_uid INTEGER NOT NULL,
                    subtree_root_path TEXT NOT NULL,
                    last_sync_ts INTEGER,
                    is_complete INTEGER NOT NULL DEFAULT 0
                ) STRICT",
                (),
            )?;
            tx.execute(
                "CREATE TABLE IF NOT EXISTS nodes (
                    uid INTEGER PRIMARY KEY,
                    data BLOB NOT NULL
                ) STRICT",
                (),
            )?;
            tx.execute(
                "CREATE TABLE IF NOT EXISTS node_parents (
                    child_uid INTEGER NOT NULL,
                    parent_uid INTEGER NOT NULL,
                    PRIMARY KEY (child_uid, parent_uid)
                ) STRICT",
                (),
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO header (id, device_uid, subtree_root_path, last_sync_ts, is_complete)
                 VALUES (0, ?1, ?2, NULL, 0)",
                params![device_uid.get() as i64, subtree_root_path],
            )?;
        }
        tx.execute(&format!("PRAGMA user_version={SCHEMA_VERSION}"), ())?;
        tx.commit()?;
        conn.execute("PRAGMA journal_mode=wal", ())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory(device_uid: Uid, subtree_root_path: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE header (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                device_uid INTEGER NOT NULL,
                subtree_root_path TEXT NOT NULL,
                last_sync_ts INTEGER,
                is_complete INTEGER NOT NULL DEFAULT 0
            )",
            (),
        )?;
        conn.execute(
            "CREATE TABLE nodes (uid INTEGER PRIMARY KEY, data BLOB NOT NULL)",
            (),
        )?;
        conn.execute(
            "CREATE TABLE node_parents (child_uid INTEGER NOT NULL, parent_uid INTEGER NOT NULL, PRIMARY KEY (child_uid, parent_uid))",
            (),
        )?;
        conn.execute(
            "INSERT INTO header (id, device_uid, subtree_root_path, last_sync_ts, is_complete) VALUES (0, ?1, ?2, NULL, 0)",
            params![device_uid.get() as i64, subtree_root_path],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn header(&self) -> Result<IndexHeader> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT device_uid, subtree_root_path, last_sync_ts, is_complete FROM header WHERE id = 0",
            (),
            |r| {
                let device_uid: i64 = r.get(0)?;
                let last_sync: Option<i64> = r.get(2)?;
                let is_complete: i64 = r.get(3)?;
                Ok(IndexHeader {
                    device_uid: Uid::new(device_uid as u64).unwrap(),
                    subtree_root_path: r.get(1)?,
                    last_sync_ts: last_sync.map(Timestamp::from_second).transpose().unwrap_or(None),
                    is_complete: is_complete != 0,
                })
            },
        )
        .context("Couldn't read index header")
    }

    /// Clears `is_complete` before a full rescan writes new node rows, so a
    /// crash mid-rescan leaves the index correctly marked stale instead of
    /// silently serving half-replaced data.
    pub fn begin_replace(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE header SET is_complete = 0 WHERE id = 0", ())?;
        conn.execute("DELETE FROM nodes", ())?;
        conn.execute("DELETE FROM node_parents", ())?;
        Ok(())
    }

    pub fn mark_complete(&self, last_sync_ts: Timestamp) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE header SET is_complete = 1, last_sync_ts = ?1 WHERE id = 0",
            [last_sync_ts.as_second()],
        )?;
        Ok(())
    }

    pub fn upsert_node(&self, node: &Node) -> Result<()> {
        let data = encode_node(node)?;
        let conn = self.conn.lock().unwrap();
        let uid = node.uid().get() as i64;
        conn.execute(
            "REPLACE INTO nodes (uid, data) VALUES (?1, ?2)",
            params![uid, data],
        )?;
        conn.execute("DELETE FROM node_parents WHERE child_uid = ?1", [uid])?;
        for parent in &node.header().parent_uids {
            conn.execute(
                "INSERT OR IGNORE INTO node_parents (child_uid, parent_uid) VALUES (?1, ?2)",
                params![uid, parent.get() as i64],
            )?;
        }
        Ok(())
    }

    pub fn upsert_nodes(&self, nodes: &[Node]) -> Result<()> {
        // One transaction for the whole batch so a rescan either lands
        // completely or not at all, matching `begin_replace`'s guarantee.
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for node in nodes {
            let data = encode_node(node)?;
            let uid = node.uid().get() as i64;
            tx.execute(
                "REPLACE INTO nodes (uid, data) VALUES (?1, ?2)",
                params![uid, data],
            )?;
            tx.execute("DELETE FROM node_parents WHERE child_uid = ?1", [uid])?;
            for parent in &node.header().parent_uids {
                tx.execute(
                    "INSERT OR IGNORE INTO node_parents (child_uid, parent_uid) VALUES (?1, ?2)",
                    params![uid, parent.get() as i64],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_node(&self, uid: Uid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM nodes WHERE uid = ?1", [uid.get() as i64])?;
        conn.execute(
            "DELETE FROM node_parents WHERE child_uid = ?1 OR parent_uid = ?1",
            [uid.get() as i64],
        )?;
        Ok(())
    }

    pub fn get_by_uid(&self, uid: Uid) -> Result<Option<Node>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM nodes WHERE uid = ?1",
                [uid.get() as i64],
                |r| r.get(0),
            )
            .optional()?;
        data.map(|d| decode_node(&d)).transpose()
    }

    pub fn get_children(&self, parent_uid: Uid) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT nodes.data FROM nodes
             JOIN node_parents ON nodes.uid = node_parents.child_uid
             WHERE node_parents.parent_uid = ?1",
        )?;
        let rows = stmt.query_map([parent_uid.get() as i64], |r| r.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_node(&row?)?);
        }
        Ok(out)
    }

    /// Every node currently stored, for handing to `mem_tree::replace_subtree`
    /// after a full rescan.
    pub fn load_all(&self) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT data FROM nodes")?;
        let rows = stmt.query_map((), |r| r.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_node(&row?)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{NodeHeader, TrashStatus};

    fn mk_node(uid: u64, parent: Option<u64>) -> Node {
        Node::Empty(NodeHeader {
            node_uid: Uid::new(uid).unwrap(),
            device_uid: Uid::new(1).unwrap(),
            parent_uids: parent.map(|p| vec![Uid::new(p).unwrap()]).unwrap_or_default(),
            trash_status: TrashStatus::NotTrashed,
            is_live: true,
            sync_ts: Timestamp::UNIX_EPOCH,
        })
    }

    #[test]
    fn round_trips_a_node() -> Result<()> {
        let idx = DiskIndex::open_in_memory(Uid::new(1).unwrap(), "/")?;
        let n = mk_node(2, None);
        idx.upsert_node(&n)?;
        let got = idx.get_by_uid(Uid::new(2).unwrap())?.unwrap();
        assert_eq!(got.uid(), n.uid());
        Ok(())
    }

    #[test]
    fn get_children_uses_parent_index() -> Result<()> {
        let idx = DiskIndex::open_in_memory(Uid::new(1).unwrap(), "/")?;
        idx.upsert_nodes(&[mk_node(10, None), mk_node(11, Some(10)), mk_node(12, Some(10))])?;
        let mut children = idx.get_children(Uid::new(10).unwrap())?;
        children.sort_by_key(|n| n.uid().get());
        assert_eq!(children.len(), 2);
        Ok(())
    }

    #[test]
    /// I6-adjacent: begin_replace clears is_complete until mark_complete runs again.
    fn begin_replace_clears_completeness() -> Result<()> {
        let idx = DiskIndex::open_in_memory(Uid::new(1).unwrap(), "/")?;
        idx.mark_complete(Timestamp::UNIX_EPOCH)?;
        assert!(idx.header()?.is_complete);
        idx.begin_replace()?;
        assert!(!idx.header()?.is_complete);
        Ok(())
    }
}
