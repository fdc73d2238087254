//! Device registration: one row per local machine or remote account the
//! engine tracks a tree for.

use serde::{Deserialize, Serialize};

use crate::uid::Uid;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum TreeType {
    /// A POSIX filesystem reachable directly via `LocalFs`.
    Local,
    /// An account on a remote backend reachable via `RemoteClient`.
    Remote,
    /// The synthetic device that owns `SUPER_ROOT`, parent of every other
    /// device's root node.
    SuperRoot,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub uid: Uid,
    /// Stable external identity: hostname+uuid for `Local`, account id for
    /// `Remote`. Never reused across devices, unlike `uid` which is only
    /// unique for the lifetime of one registry.
    pub long_device_id: String,
    pub tree_type: TreeType,
    pub friendly_name: String,
}

impl Device {
    pub fn super_root() -> Self {
        Self {
            uid: crate::uid::SUPER_ROOT_DEVICE_UID,
            long_device_id: "SUPER_ROOT".to_string(),
            tree_type: TreeType::SuperRoot,
            friendly_name: "SUPER_ROOT".to_string(),
        }
    }
}
