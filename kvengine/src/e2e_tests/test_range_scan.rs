//! Test range scans: half-open bounds, ordering, and bound validation.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::e2e_tests::helpers::{collect_range, key, keys_of, open_temp, small_config};
use crate::engine::RetCode;

fn keys(list: &[&str]) -> Vec<Vec<u8>> {
    list.iter().map(|k| k.as_bytes().to_vec()).collect()
}

#[test]
fn test_range_half_open() {
    let (_dir, engine) = open_temp(&small_config());
    for k in ["a", "b", "c", "d"] {
        engine.write(k.as_bytes(), k.as_bytes()).expect("write");
    }

    let records = collect_range(&engine, b"b", b"d");
    assert_eq!(
        records,
        vec![(b"b".to_vec(), b"b".to_vec()), (b"c".to_vec(), b"c".to_vec())]
    );
}

#[test]
fn test_range_open_bounds() {
    let (_dir, engine) = open_temp(&small_config());
    for k in ["a", "b", "c", "d"] {
        engine.write(k.as_bytes(), b"v").expect("write");
    }

    assert_eq!(keys_of(&collect_range(&engine, b"", b"c")), keys(&["a", "b"]));
    assert_eq!(keys_of(&collect_range(&engine, b"bb", b"")), keys(&["c", "d"]));
    assert_eq!(keys_of(&collect_range(&engine, b"", b"")), keys(&["a", "b", "c", "d"]));
    assert!(collect_range(&engine, b"e", b"").is_empty());
    assert!(collect_range(&engine, b"b", b"b").is_empty());
}

#[test]
fn test_full_scan_sorted_after_shuffled_inserts() {
    let (_dir, engine) = open_temp(&small_config());
    let mut ids: Vec<u32> = (0..300).collect();
    ids.shuffle(&mut StdRng::seed_from_u64(42));

    for &i in &ids {
        engine.write(&key(i), &i.to_le_bytes()).expect("write");
    }
    // Update a third of them; order and count must not change.
    for &i in ids.iter().step_by(3) {
        engine.write(&key(i), &(i + 1000).to_le_bytes()).expect("update");
    }

    let records = collect_range(&engine, b"", b"");
    assert_eq!(records.len(), 300);
    assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(keys_of(&records), (0..300).map(key).collect::<Vec<_>>());

    let middle = collect_range(&engine, &key(100), &key(200));
    assert_eq!(keys_of(&middle), (100..200).map(key).collect::<Vec<_>>());
}

#[test]
fn test_range_spanning_many_leaves() {
    let (_dir, engine) = open_temp(&small_config());
    for i in 0..120 {
        engine.write(&key(i), b"v").expect("write");
    }
    assert!(engine.meta().leaf_node_num > 10);

    for (lower, upper) in [(0, 120), (1, 2), (37, 91), (119, 120)] {
        let records = collect_range(&engine, &key(lower), &key(upper));
        assert_eq!(
            keys_of(&records),
            (lower..upper).map(key).collect::<Vec<_>>(),
            "[{lower}, {upper})"
        );
    }
}

#[test]
fn test_reversed_range_rejected() {
    let (_dir, engine) = open_temp(&small_config());
    for k in ["a", "b", "c"] {
        engine.write(k.as_bytes(), b"v").expect("write");
    }

    let mut visits = 0;
    let err = engine
        .range(b"c", b"a", &mut |_: &[u8], _: &[u8]| visits += 1)
        .expect_err("reversed range");
    assert_eq!(err.code(), RetCode::InvalidArgument);
    assert_eq!(visits, 0);
}
