//! Signature-calc worker: a background thread that reads file content and
//! computes `ContentMeta` (MD5 + SHA256) for nodes TreeStore flagged as
//! needing one, batching writes the way `file_util::read_file` picks
//! buffered-vs-mapped reads by size rather than hashing one byte at a time.

use std::io::Read;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use md5::{Digest, Md5};
use sha2::Sha256;

use crate::node::ContentMeta;
use crate::uid::Uid;

/// One file node needing a signature, and where to read its bytes from.
pub struct SigRequest {
    pub uid: Uid,
    pub path: std::path::PathBuf,
}

pub enum SigResult {
    Computed { uid: Uid, meta: ContentMeta },
    Failed { uid: Uid, reason: String },
}

fn hash_file(path: &std::path::Path) -> Result<(u64, [u8; 16], [u8; 32])> {
    let mut f =
        std::fs::File::open(path).with_context(|| format!("Couldn't open {}", path.display()))?;
    let mut md5 = Md5::new();
    let mut sha256 = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha256.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, md5.finalize().into(), sha256.finalize().into()))
}

/// Spawns the worker thread. `request_tx`/`result_rx` are returned to the
/// caller; `batch_size` bounds how many requests accumulate in the channel
/// before the worker is guaranteed to have drained at least one, giving the
/// producer side back-pressure without an unbounded queue.
pub struct SigWorker {
    request_tx: Option<Sender<SigRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl SigWorker {
    pub fn spawn(batch_size: usize, result_tx: Sender<SigResult>, uid_alloc: Arc<crate::uid::UidAllocator>) -> Self {
        let (request_tx, request_rx): (Sender<SigRequest>, Receiver<SigRequest>) =
            bounded(batch_size.max(1));
        let handle = std::thread::Builder::new()
            .name("sig-worker".to_string())
            .spawn(move || Self::run(request_rx, result_tx, uid_alloc))
            .expect("Couldn't spawn signature worker thread");
        Self {
            request_tx: Some(request_tx),
            handle: Some(handle),
        }
    }

    fn run(
        request_rx: Receiver<SigRequest>,
        result_tx: Sender<SigResult>,
        uid_alloc: Arc<crate::uid::UidAllocator>,
    ) {
        for req in request_rx.iter() {
            let outcome = match hash_file(&req.path) {
                Ok((size_bytes, md5, sha256)) => match uid_alloc.next() {
                    Ok(meta_uid) => SigResult::Computed {
                        uid: req.uid,
                        meta: ContentMeta {
                            uid: meta_uid,
                            size_bytes,
                            md5,
                            sha256,
                        },
                    },
                    Err(e) => SigResult::Failed {
                        uid: req.uid,
                        reason: e.to_string(),
                    },
                },
                Err(e) => SigResult::Failed {
                    uid: req.uid,
                    reason: e.to_string(),
                },
            };
            // A disconnected receiver means the caller shut down; stop
            // quietly rather than panicking on send.
            if result_tx.send(outcome).is_err() {
                break;
            }
        }
    }

    pub fn submit(&self, req: SigRequest) -> Result<()> {
        match &self.request_tx {
            Some(tx) => tx
                .send(req)
                .map_err(|_| anyhow::anyhow!("Signature worker has shut down")),
            None => Err(anyhow::anyhow!("Signature worker has shut down")),
        }
    }

    /// Drops the request sender (so the worker's `for req in request_rx.iter()`
    /// loop ends once it drains whatever's queued) and joins the thread.
    pub fn shutdown(mut self) {
        self.request_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SigWorker {
    fn drop(&mut self) {
        // Drop the sender first so the worker's `request_rx.iter()` loop
        // sees the channel disconnect and exits instead of blocking forever.
        self.request_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::uid::UidAllocator;
    use std::io::Write;

    #[test]
    fn computes_md5_and_sha256_for_a_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.txt");
        std::fs::File::create(&path)?.write_all(b"hello world")?;

        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let alloc = Arc::new(UidAllocator::open_in_memory()?);
        let worker = SigWorker::spawn(8, result_tx, alloc);
        worker.submit(SigRequest {
            uid: Uid::new(42).unwrap(),
            path: path.clone(),
        })?;
        let result = result_rx.recv_timeout(std::time::Duration::from_secs(5))?;
        match result {
            SigResult::Computed { uid, meta } => {
                assert_eq!(uid, Uid::new(42).unwrap());
                assert_eq!(meta.size_bytes, 11);
            }
            SigResult::Failed { reason, .. } => panic!("unexpected failure: {reason}"),
        }
        worker.shutdown();
        Ok(())
    }
}
