//! P2: `uid_for_path` is idempotent under a path -> uid -> path -> uid
//! round trip.

use std::sync::Arc;

use outlet::uid::{PathMapper, UidAllocator};

#[test]
fn uid_for_path_round_trips_through_path_for_uid() {
    let alloc = Arc::new(UidAllocator::open_in_memory().unwrap());
    let mapper = PathMapper::open_in_memory(alloc).unwrap();

    let path = "/a/b/c.txt";
    let first = mapper.uid_for_path(path, None).unwrap();
    let back = mapper.path_for_uid(first).unwrap().unwrap();
    let second = mapper.uid_for_path(&back, None).unwrap();
    assert_eq!(first, second);

    // Same for a never-before-seen path mapped fresh.
    let other = mapper.uid_for_path("/a/b/d.txt", None).unwrap();
    assert_ne!(first, other);
}
