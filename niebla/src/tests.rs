// Niebla tests
//
// Austin Shafer - 2025
use crate as nb;

#[test]
fn ids_are_monotonic_and_never_reused() {
    let mut session = nb::Session::new();

    let a = session.mint().unwrap();
    let b = session.mint().unwrap();
    assert_eq!(a.get_raw_id(), 0);
    assert_eq!(b.get_raw_id(), 1);

    // Retire both ids, then mint again. The freed numbers must not
    // come back.
    drop(a);
    drop(b);
    let c = session.mint().unwrap();
    assert_eq!(c.get_raw_id(), 2);
    assert_eq!(session.minted_count(), 3);
    assert_eq!(session.live_count(), 1);
}

#[test]
fn component_roundtrip() {
    let mut session = nb::Session::new();
    let id = session.mint().unwrap();

    let meta = session.add_component();
    meta.set(&id, 1024u64);
    assert_eq!(*meta.get(&id).unwrap(), 1024);

    *meta.get_mut(&id).unwrap() = 4096;
    assert_eq!(meta.get_clone(&id), Some(4096));

    assert_eq!(meta.take(&id), Some(4096));
    assert!(meta.get(&id).is_none());
}

#[test]
fn retiring_an_id_drops_its_values() {
    let mut session = nb::Session::new();
    let id = session.mint().unwrap();
    let other = session.mint().unwrap();

    let meta: nb::Component<String> = session.add_component();
    meta.set(&id, "texture".to_string());
    meta.set(&other, "buffer".to_string());

    let dup = id.clone();
    drop(id);
    // A clone is still holding the id live
    assert_eq!(*meta.get(&dup).unwrap(), "texture");

    drop(dup);
    assert_eq!(session.live_count(), 1);
    assert_eq!(*meta.get(&other).unwrap(), "buffer");
}

#[test]
fn non_sparse_slice_access() {
    let mut session = nb::Session::new();
    let a = session.mint().unwrap();
    let b = session.mint().unwrap();
    let c = session.mint().unwrap();

    // This mirrors the PUID-to-block map: every id gets a cell, with
    // an invalid marker for untracked entries.
    let map = session.add_non_sparse_component(|| u32::MAX);
    map.set(&a, 0);
    map.set(&c, 64);

    map.ensure_len(session.minted_count());
    let slice = map.get_data_slice();
    assert_eq!(slice.data(), &[0, u32::MAX, 64]);
    drop(slice);

    let _ = b;
}

#[test]
fn for_each_walks_sparse_tables() {
    let mut session = nb::Session::new();
    let ids: Vec<_> = (0..100).map(|_| session.mint().unwrap()).collect();

    let meta = session.add_component();
    // Populate a scattered subset so multiple blocks are in play
    for i in (0..100).step_by(7) {
        meta.set(&ids[i], i);
    }

    let mut seen = Vec::new();
    meta.for_each(|id, val| {
        assert_eq!(id, *val);
        seen.push(id);
    });
    let expected: Vec<usize> = (0..100).step_by(7).collect();
    assert_eq!(seen, expected);
}
