//! Minimal priority task runner the rest of the engine hands work to (a
//! rescan, an op execution, a signature request) without scheduling threads
//! itself.
//!
//! Grounded in `concurrently.rs`'s `JoinSet`-based fan-out, adapted from
//! tokio tasks to a fixed thread pool per Design Note §9 ("replace
//! async/coroutines with explicit task objects") - there's no async runtime
//! anywhere else in this crate, so a task queue plus worker threads is the
//! direct translation of `concurrently`'s "spawn everything, wait for all"
//! shape onto threads.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};

/// Coarse priority bands, highest first. Matches the P1/P2/P3/P7 tiers
/// spec.md's Concurrency & Resource Model names for interactive vs.
/// background work.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    /// User-interactive: a click the UI is waiting on.
    P1,
    /// User-requested but not blocking the UI (a drag-and-drop batch).
    P2,
    /// Foreground housekeeping (a rescan the user triggered).
    P3,
    /// Background housekeeping (signature-calc backlog, cache consolidation).
    P7,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    task: Task,
}

/// Fixed-size thread pool that always runs the highest-priority ready job
/// first. Unlike a single FIFO queue, a flood of P7 background work can't
/// starve a P1 job queued after it.
pub struct PriorityExecutor {
    senders: [Sender<Job>; 4],
    handles: Vec<JoinHandle<()>>,
}

fn band_index(p: Priority) -> usize {
    match p {
        Priority::P1 => 0,
        Priority::P2 => 1,
        Priority::P3 => 2,
        Priority::P7 => 3,
    }
}

impl PriorityExecutor {
    pub fn new(worker_count: usize) -> Self {
        let (tx0, rx0) = unbounded::<Job>();
        let (tx1, rx1) = unbounded::<Job>();
        let (tx2, rx2) = unbounded::<Job>();
        let (tx3, rx3) = unbounded::<Job>();
        let receivers: [Receiver<Job>; 4] = [rx0, rx1, rx2, rx3];

        let mut handles = Vec::with_capacity(worker_count.max(1));
        for i in 0..worker_count.max(1) {
            let receivers = receivers.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("priority-executor-{i}"))
                    .spawn(move || Self::run(receivers))
                    .expect("Couldn't spawn priority executor worker"),
            );
        }

        Self {
            senders: [tx0, tx1, tx2, tx3],
            handles,
        }
    }

    fn run(receivers: [Receiver<Job>; 4]) {
        loop {
            // Drain strictly in priority order: try P1 first, only fall
            // through to a lower band if nothing higher is ready, blocking
            // on a `select` across all four only once everything's empty.
            let mut found = false;
            for rx in &receivers {
                if let Ok(job) = rx.try_recv() {
                    (job.task)();
                    found = true;
                    break;
                }
            }
            if found {
                continue;
            }

            let mut sel = crossbeam_channel::Select::new();
            for rx in &receivers {
                sel.recv(rx);
            }
            let oper = sel.select();
            let index = oper.index();
            match oper.recv(&receivers[index]) {
                Ok(job) => (job.task)(),
                // `shutdown` drops every band's sender in the same call, so
                // any one band disconnecting means the pool is shutting down.
                Err(_) => return,
            }
        }
    }

    pub fn submit(&self, priority: Priority, task: impl FnOnce() + Send + 'static) {
        let _ = self.senders[band_index(priority)].send(Job {
            task: Box::new(task),
        });
    }

    /// Drops every sender (ending each worker's loop once its queues are
    /// drained) and joins all worker threads.
    pub fn shutdown(mut self) {
        self.senders = [unbounded().0, unbounded().0, unbounded().0, unbounded().0];
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn runs_submitted_tasks() {
        let exec = PriorityExecutor::new(2);
        let results = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let results = Arc::clone(&results);
            exec.submit(Priority::P3, move || {
                results.lock().unwrap().push(i);
            });
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
        exec.shutdown();
        let mut got = results.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }
}
