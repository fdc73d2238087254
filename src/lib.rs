//! Outlet cache & operation engine: a unified local/remote file-tree cache
//! with a UID-addressed in-memory tree, an on-disk index per device, and an
//! operation graph that serializes user mutations (mkdir/rm/cp/mv, including
//! the start/finish pair a recursive directory copy or move splits into)
//! against whichever backend actually owns the node.
//!
//! See [`cache_manager`] for the top-level facade most callers want.

pub mod active_tree;
pub mod backend;
pub mod cache_manager;
pub mod config;
pub mod device;
pub mod disk_index;
pub mod error;
pub mod executor;
pub mod mem_tree;
pub mod node;
pub mod op_graph;
pub mod op_manager;
pub mod registry;
pub mod sig_worker;
pub mod signal;
pub mod tree_store;
pub mod uid;
