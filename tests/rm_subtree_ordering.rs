//! S6 + P7: removing a subtree dequeues every RM-typed child before its
//! RM-typed parent, and a RM's adopted children must themselves be RMs.

mod common;

use std::collections::HashSet;

use camino::Utf8PathBuf;
use outlet::node::{Spid, UserOp};
use outlet::op_graph::OpInsertItem;
use outlet::op_manager::{CommandResult, CommandStatus};
use outlet::uid::Uid;
use tempfile::tempdir;

fn spid(uid: u64) -> Spid {
    Spid::new(Uid::new(1).unwrap(), Uid::new(uid).unwrap(), Utf8PathBuf::from("/d"))
}

fn ok() -> CommandResult {
    CommandResult {
        status: CommandStatus::Ok,
        nodes_to_upsert: Vec::new(),
        nodes_to_remove: Vec::new(),
    }
}

/// `/d/{a, b/c}`: removing `/d` in the same batch as removing its children
/// must dequeue `a` and `c` first (either order), then `b`, then `d`.
#[test]
fn removing_a_subtree_dequeues_children_before_their_parents() {
    let dir = tempdir().unwrap();
    let mgr = common::open_manager(dir.path());

    let d = Uid::new(200).unwrap();
    let a = Uid::new(201).unwrap();
    let b = Uid::new(202).unwrap();
    let c = Uid::new(203).unwrap();

    // Leaves first, so their OGN ids exist to adopt as child-removal tails.
    let rm_a = mgr
        .submit_op_batch(vec![OpInsertItem::rm(UserOp::Rm { spid: spid(201) }, a, Vec::new(), Vec::new())])
        .unwrap()[0];
    let rm_c = mgr
        .submit_op_batch(vec![OpInsertItem::rm(UserOp::Rm { spid: spid(203) }, c, Vec::new(), Vec::new())])
        .unwrap()[0];
    let rm_b = mgr
        .submit_op_batch(vec![OpInsertItem::rm(
            UserOp::Rm { spid: spid(202) },
            b,
            Vec::new(),
            vec![rm_c],
        )])
        .unwrap()[0];
    let rm_d = mgr
        .submit_op_batch(vec![OpInsertItem::rm(
            UserOp::Rm { spid: spid(200) },
            d,
            Vec::new(),
            vec![rm_a, rm_b],
        )])
        .unwrap()[0];

    // `a` and `c` are both immediately ready; `b` and `d` are not.
    let mut first_round = HashSet::new();
    first_round.insert(mgr.get_next_command().expect("a leaf RM should be ready"));
    first_round.insert(mgr.get_next_command().expect("the other leaf RM should be ready"));
    assert_eq!(first_round, HashSet::from([rm_a, rm_c]));
    assert!(mgr.get_next_command().is_none());

    mgr.finish_command(rm_a, &[], ok()).unwrap();
    mgr.finish_command(rm_c, &[], ok()).unwrap();

    // Now that its only child-removal tail is done, `b` is ready - but `d`
    // still waits on it.
    let next = mgr.get_next_command().expect("rm b should now be ready");
    assert_eq!(next, rm_b);
    assert!(mgr.get_next_command().is_none());

    mgr.finish_command(rm_b, &[], ok()).unwrap();

    let next = mgr.get_next_command().expect("rm d should now be ready");
    assert_eq!(next, rm_d);
}

/// A RM cannot adopt a non-RM op as one of its child-removal tails.
#[test]
fn rm_rejects_a_non_rm_child_removal_tail() {
    let dir = tempdir().unwrap();
    let mgr = common::open_manager(dir.path());

    let parent = Uid::new(210).unwrap();
    let child = Uid::new(211).unwrap();

    let mkdir_child = mgr
        .submit_op_batch(vec![OpInsertItem::unary(
            UserOp::Mkdir {
                parent_spid: spid(210),
                name: "child".to_string(),
            },
            child,
            Vec::new(),
            Vec::new(),
        )])
        .unwrap()[0];

    let result = mgr.submit_op_batch(vec![OpInsertItem::rm(
        UserOp::Rm { spid: spid(210) },
        parent,
        Vec::new(),
        vec![mkdir_child],
    )]);
    assert!(result.is_err());
}
