//! Op Manager: persists submitted batches of [`UserOp`]s to disk (so a
//! crash mid-batch doesn't lose queued work), submits them into the
//! [`OpGraph`], and drains completed/failed commands back out to callers.
//!
//! Grounded in `original_source/outlet/be/cache_manager.py`'s composition
//! of `OpManager` alongside `CacheRegistry`; the on-disk half reuses the
//! same sqlite-backed pattern as `disk_index.rs`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use rustc_hash::FxHashMap;

use crate::node::{Node, NodeIdentifier, UserOp};
use crate::op_graph::{OgnId, OpGraph, OpInsertItem};
use crate::uid::Uid;

/// One row of persisted batch state, recovered on restart so in-flight
/// batches aren't silently dropped.
pub struct PersistedBatch {
    pub batch_id: u64,
    pub ops: Vec<UserOp>,
}

/// One dispatched unit of work: an OGN ready to run, paired with the
/// `UserOp` an executor needs to actually perform it.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: OgnId,
    pub op: UserOp,
}

#[derive(Debug, Clone)]
pub enum CommandStatus {
    Ok,
    Err(String),
}

/// What an executor reports back after running a [`Command`] - per §6, the
/// Cache Manager applies `nodes_to_upsert`/`nodes_to_remove` to each node's
/// owning `TreeStore` before telling the Op Graph the command is done.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub nodes_to_upsert: Vec<Node>,
    pub nodes_to_remove: Vec<NodeIdentifier>,
}

pub struct OpManager {
    conn: Mutex<Connection>,
    graph: Mutex<OpGraph>,
    /// Count of not-yet-completed OGNs per batch, so a persisted batch's
    /// rows can be purged once every op in it has actually finished.
    batch_remaining: Mutex<FxHashMap<u64, usize>>,
}

impl OpManager {
    pub fn open(db_path: &Path) -> Result<Self> {
        let mut conn = Connection::open(db_path)
            .with_context(|| format!("Couldn't open op manager db at {}", db_path.display()))?;
        let tx = conn.transaction()?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS batches (
                batch_id INTEGER PRIMARY KEY,
                submitted_ts INTEGER NOT NULL
            ) STRICT",
            (),
        )?;
        tx.execute(
            "CREATE TABLE IF NOT EXISTS op_store (
                batch_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (batch_id, seq)
            ) STRICT",
            (),
        )?;
        tx.commit()?;
        conn.execute("PRAGMA journal_mode=wal", ())?;
        Ok(Self {
            conn: Mutex::new(conn),
            graph: Mutex::new(OpGraph::new()),
            batch_remaining: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE batches (batch_id INTEGER PRIMARY KEY, submitted_ts INTEGER NOT NULL)",
            (),
        )?;
        conn.execute(
            "CREATE TABLE op_store (batch_id INTEGER NOT NULL, seq INTEGER NOT NULL, data BLOB NOT NULL, PRIMARY KEY (batch_id, seq))",
            (),
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            graph: Mutex::new(OpGraph::new()),
            batch_remaining: Mutex::new(FxHashMap::default()),
        })
    }

    /// Persists `items`' ops as one batch, then submits them into the Op
    /// Graph. The caller (the Cache Manager, which has the tree) has
    /// already resolved each item's target uids, ancestor chain, and
    /// adoption edges, since the Op Graph itself doesn't know about tree
    /// structure.
    pub fn submit_batch(&self, items: Vec<OpInsertItem>) -> Result<Vec<OgnId>> {
        let batch_id = {
            let conn = self.conn.lock().unwrap();
            let batch_id: i64 = conn.query_row(
                "INSERT INTO batches (batch_id, submitted_ts) VALUES (
                    COALESCE((SELECT MAX(batch_id) FROM batches), -1) + 1, unixepoch()
                ) RETURNING batch_id",
                (),
                |r| r.get(0),
            )?;
            for (seq, item) in items.iter().enumerate() {
                let mut buf = Vec::new();
                ciborium::into_writer(&item.op, &mut buf).context("Couldn't encode op")?;
                conn.execute(
                    "INSERT INTO op_store (batch_id, seq, data) VALUES (?1, ?2, ?3)",
                    params![batch_id, seq as i64, buf],
                )?;
            }
            batch_id
        };
        let item_count = items.len();
        let mut graph = self.graph.lock().unwrap();
        let result = graph.insert_batch(items);
        drop(graph);
        if result.is_err() {
            // Batch failed to insert into the graph; drop its persisted
            // rows too so a restart doesn't resurrect a phantom batch.
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM op_store WHERE batch_id = ?1", [batch_id])?;
            conn.execute("DELETE FROM batches WHERE batch_id = ?1", [batch_id])?;
        } else {
            self.batch_remaining
                .lock()
                .unwrap()
                .insert(batch_id as u64, item_count);
        }
        result
    }

    pub fn load_persisted_batches(&self) -> Result<Vec<PersistedBatch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT batch_id, data FROM op_store ORDER BY batch_id, seq",
        )?;
        let rows: Vec<(i64, Vec<u8>)> = stmt
            .query_map((), |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        let mut batches: Vec<PersistedBatch> = Vec::new();
        for (batch_id, data) in rows {
            let op: UserOp = ciborium::from_reader(data.as_slice()).context("Couldn't decode op")?;
            match batches.last_mut() {
                Some(b) if b.batch_id as i64 == batch_id => b.ops.push(op),
                _ => batches.push(PersistedBatch {
                    batch_id: batch_id as u64,
                    ops: vec![op],
                }),
            }
        }
        Ok(batches)
    }

    pub fn get_next_command(&self) -> Option<OgnId> {
        self.graph.lock().unwrap().get_next_op()
    }

    pub fn op_for(&self, id: OgnId) -> Option<UserOp> {
        self.graph.lock().unwrap().op_for(id).cloned()
    }

    /// Bundles [`Self::get_next_command`] and [`Self::op_for`] - the shape
    /// an executor actually wants to pull work in.
    pub fn next_command(&self) -> Option<Command> {
        let mut graph = self.graph.lock().unwrap();
        let id = graph.get_next_op()?;
        let op = graph.op_for(id)?.clone();
        Some(Command { id, op })
    }

    pub fn finish_command(&self, id: OgnId, ancestor_uids: &[Uid]) -> Result<()> {
        // Captured before popping: a completed OGN's arena slot is freed,
        // so its batch id wouldn't be recoverable afterward.
        let batch_id = self.graph.lock().unwrap().batch_id_for(id);
        self.graph.lock().unwrap().pop_completed_op(id, ancestor_uids)?;
        if let Some(batch_id) = batch_id {
            self.purge_batch_if_drained(batch_id)?;
        }
        Ok(())
    }

    pub fn fail_command(&self, id: OgnId, ancestor_uids: &[Uid]) -> Result<()> {
        self.graph.lock().unwrap().fail_op(id, ancestor_uids)
    }

    pub fn retry_command(&self, id: OgnId, ancestor_uids: &[Uid]) -> Result<()> {
        self.graph.lock().unwrap().retry_failed_op(id, ancestor_uids)
    }

    /// Decrements `batch_id`'s remaining-op count and, once it hits zero,
    /// deletes its persisted `op_store`/`batches` rows - they've fully
    /// replayed into the Op Graph and completed, so there's nothing left
    /// for a restart to recover.
    fn purge_batch_if_drained(&self, batch_id: u64) -> Result<()> {
        let drained = {
            let mut remaining = self.batch_remaining.lock().unwrap();
            match remaining.get_mut(&batch_id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let drained = *count == 0;
                    if drained {
                        remaining.remove(&batch_id);
                    }
                    drained
                }
                None => false,
            }
        };
        if drained {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM op_store WHERE batch_id = ?1", [batch_id as i64])?;
            conn.execute("DELETE FROM batches WHERE batch_id = ?1", [batch_id as i64])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::Spid;
    use camino::Utf8PathBuf;

    fn spid(uid: u64) -> Spid {
        Spid::new(Uid::new(1).unwrap(), Uid::new(uid).unwrap(), Utf8PathBuf::from("/x"))
    }

    #[test]
    fn submit_then_drain_one_op() -> Result<()> {
        let mgr = OpManager::open_in_memory()?;
        let target = Uid::new(5).unwrap();
        mgr.submit_batch(vec![OpInsertItem::rm(UserOp::Rm { spid: spid(5) }, target, vec![], vec![])])?;
        let id = mgr.get_next_command().expect("op should be ready");
        assert!(matches!(mgr.op_for(id), Some(UserOp::Rm { .. })));
        mgr.finish_command(id, &[])?;
        assert!(mgr.get_next_command().is_none());
        Ok(())
    }

    #[test]
    fn persisted_batches_survive_reload() -> Result<()> {
        let mgr = OpManager::open_in_memory()?;
        let target = Uid::new(7).unwrap();
        mgr.submit_batch(vec![OpInsertItem::rm(UserOp::Rm { spid: spid(7) }, target, vec![], vec![])])?;
        let persisted = mgr.load_persisted_batches()?;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].ops.len(), 1);
        Ok(())
    }

    #[test]
    fn finish_command_purges_drained_batch() -> Result<()> {
        let mgr = OpManager::open_in_memory()?;
        let target = Uid::new(9).unwrap();
        mgr.submit_batch(vec![OpInsertItem::rm(UserOp::Rm { spid: spid(9) }, target, vec![], vec![])])?;
        let id = mgr.get_next_command().expect("op should be ready");
        mgr.finish_command(id, &[])?;
        let persisted = mgr.load_persisted_batches()?;
        assert!(persisted.is_empty());
        Ok(())
    }
}
