//! S5 + P6: failing an op blocks everything downstream of it in the DAG,
//! and retrying it unblocks the whole chain again.

mod common;

use camino::Utf8PathBuf;
use outlet::node::{Spid, UserOp};
use outlet::op_graph::OpInsertItem;
use tempfile::tempdir;
use outlet::uid::Uid;

fn spid(uid: u64) -> Spid {
    Spid::new(Uid::new(1).unwrap(), Uid::new(uid).unwrap(), Utf8PathBuf::from("/x"))
}

#[test]
fn failing_an_op_blocks_its_descendants_until_retried() {
    let dir = tempdir().unwrap();
    let mgr = common::open_manager(dir.path());

    // MKDIR /x
    let x = Uid::new(100).unwrap();
    let mkdir_x = mgr
        .submit_op_batch(vec![OpInsertItem::unary(
            UserOp::Mkdir {
                parent_spid: spid(1),
                name: "x".to_string(),
            },
            x,
            Vec::new(),
            Vec::new(),
        )])
        .unwrap()[0];

    // MKDIR /x/y, parented under MKDIR /x's target.
    let y = Uid::new(101).unwrap();
    let mkdir_y = mgr
        .submit_op_batch(vec![OpInsertItem::unary(
            UserOp::Mkdir {
                parent_spid: spid(100),
                name: "y".to_string(),
            },
            y,
            vec![x],
            Vec::new(),
        )])
        .unwrap()[0];

    // CP /src -> /x/y/src, parented under MKDIR /x/y's target.
    let cp = mgr
        .submit_op_batch(vec![OpInsertItem::binary(
            UserOp::Cp {
                src_spid: spid(5),
                dst_parent_spid: spid(101),
                new_name: None,
            },
            Uid::new(5).unwrap(),
            Uid::new(102).unwrap(),
            vec![y],
            Vec::new(),
        )])
        .unwrap()[0];

    // Only the first MKDIR is ready.
    let next = mgr.get_next_command().expect("mkdir /x should be ready");
    assert_eq!(next, mkdir_x);

    // Fail it: MKDIR /x/y and CP must both become unreachable.
    mgr.fail_command(mkdir_x, &[], "disk full".to_string()).unwrap();
    assert!(mgr.get_next_command().is_none());

    // Retrying the failed op resets the whole chain back to ready.
    mgr.retry_command(mkdir_x, &[]).unwrap();
    let next = mgr.get_next_command().expect("mkdir /x should be ready again");
    assert_eq!(next, mkdir_x);

    let ok = outlet::op_manager::CommandResult {
        status: outlet::op_manager::CommandStatus::Ok,
        nodes_to_upsert: Vec::new(),
        nodes_to_remove: Vec::new(),
    };
    mgr.finish_command(mkdir_x, &[], ok.clone()).unwrap();

    let next = mgr.get_next_command().expect("mkdir /x/y should now be ready");
    assert_eq!(next, mkdir_y);
    mgr.finish_command(mkdir_y, &[], ok.clone()).unwrap();

    let next = mgr.get_next_command().expect("cp should now be ready");
    assert_eq!(next, cp);
}
