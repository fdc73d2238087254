//! Typed multi-producer broadcast bus (Design Note §9): every module that
//! wants to observe cache/op-graph events subscribes once and gets its own
//! `Receiver`; publishers don't know or care who's listening.

use crossbeam_channel::{Receiver, Sender};
use std::sync::Mutex;

use crate::node::{Guid, Spid};
use crate::uid::Uid;

#[derive(Debug, Clone)]
pub enum Signal {
    NodeUpsertedInCache { spid: Spid },
    NodeRemovedInCache { spid: Spid },
    SubtreeSyncStarted { device_uid: Uid, tree_id: String },
    SubtreeSyncDone { device_uid: Uid, tree_id: String },
    OpExecuted { guid: Guid },
    OpFailed { guid: Guid, reason: String },
    OpBatchEnqueued { batch_id: u64 },
    IconsChanged { guids: Vec<Guid> },
    DeviceCacheLoaded { device_uid: Uid },
    DeviceCacheUnloaded { device_uid: Uid },
}

/// Registry of subscribers. Each `publish` clones the signal once per
/// subscriber and sends it down that subscriber's channel; a full or
/// disconnected channel is dropped from the registry rather than blocking
/// the publisher.
#[derive(Default)]
pub struct SignalBus {
    subscribers: Mutex<Vec<Sender<Signal>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Signal> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, signal: Signal) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(signal.clone()).is_ok());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subscriber_receives_published_signal() {
        let bus = SignalBus::new();
        let rx = bus.subscribe();
        bus.publish(Signal::DeviceCacheLoaded {
            device_uid: Uid::new(1).unwrap(),
        });
        let got = rx.try_recv().expect("signal should be queued");
        assert!(matches!(got, Signal::DeviceCacheLoaded { .. }));
    }

    #[test]
    fn dropped_subscriber_is_pruned_not_blocking() {
        let bus = SignalBus::new();
        {
            let _rx = bus.subscribe();
        } // dropped, channel now disconnected
        bus.publish(Signal::OpBatchEnqueued { batch_id: 1 });
        assert_eq!(bus.subscribers.lock().unwrap().len(), 0);
    }
}
