//! S4 (DAG ordering) and P3 (a fully-completed batch leaves the graph empty
//! of its own ops), driven through `CacheManager` rather than the Op Graph
//! directly.

mod common;

use camino::Utf8PathBuf;
use outlet::node::{Spid, UserOp};
use outlet::op_graph::OpInsertItem;
use outlet::op_manager::{CommandResult, CommandStatus};
use outlet::uid::Uid;
use tempfile::tempdir;

fn spid(uid: u64) -> Spid {
    Spid::new(Uid::new(1).unwrap(), Uid::new(uid).unwrap(), Utf8PathBuf::from("/x"))
}

fn ok() -> CommandResult {
    CommandResult {
        status: CommandStatus::Ok,
        nodes_to_upsert: Vec::new(),
        nodes_to_remove: Vec::new(),
    }
}

#[test]
fn mkdir_then_cp_into_it_dequeues_in_order() {
    let dir = tempdir().unwrap();
    let mgr = common::open_manager(dir.path());

    let new_dir = Uid::new(100).unwrap();
    let mkdir_ids = mgr
        .submit_op_batch(vec![OpInsertItem::unary(
            UserOp::Mkdir {
                parent_spid: spid(1),
                name: "x".to_string(),
            },
            new_dir,
            Vec::new(),
            Vec::new(),
        )])
        .unwrap();
    let mkdir_id = mkdir_ids[0];

    let cp_ids = mgr
        .submit_op_batch(vec![OpInsertItem::binary(
            UserOp::Cp {
                src_spid: spid(5),
                dst_parent_spid: spid(100),
                new_name: None,
            },
            Uid::new(5).unwrap(),
            Uid::new(101).unwrap(),
            vec![new_dir],
            Vec::new(),
        )])
        .unwrap();
    let cp_id = cp_ids[0];

    // get_next_op returns the MKDIR first.
    let next = mgr.get_next_command().expect("mkdir should be ready");
    assert_eq!(next, mkdir_id);

    // Without finishing it, nothing else is ready (the CP's dst-side OGN is
    // still queued behind the MKDIR).
    assert!(mgr.get_next_command().is_none());

    mgr.finish_command(mkdir_id, &[], ok()).unwrap();

    let next = mgr.get_next_command().expect("cp should now be ready");
    assert_eq!(next, cp_id);

    // P3: once the CP also finishes, nothing from either batch remains.
    mgr.finish_command(cp_id, &[], ok()).unwrap();
    assert!(mgr.get_next_command().is_none());
}
