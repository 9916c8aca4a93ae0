//! Test that writing an existing key replaces its value without duplicating it.

use crate::e2e_tests::helpers::{collect_range, key, open_temp, small_config, value};

#[test]
fn test_update_overwrites_value() {
    let (_dir, engine) = open_temp(&small_config());

    engine.write(b"k", b"original").expect("write");
    engine.write(b"k", b"updated").expect("update");

    assert_eq!(engine.read(b"k").expect("read"), b"updated");
    let records = collect_range(&engine, b"", b"");
    assert_eq!(records, vec![(b"k".to_vec(), b"updated".to_vec())]);
}

#[test]
fn test_update_in_full_tree() {
    let (_dir, engine) = open_temp(&small_config());

    for round in 0..3 {
        for i in 0..50 {
            engine.write(&key(i), &value(i, round)).expect("write");
        }
    }

    for i in 0..50 {
        assert_eq!(engine.read(&key(i)).expect("read"), value(i, 2));
    }
    let stats = engine.verify().expect("verify");
    assert_eq!(stats.records, 50);
    assert_eq!(collect_range(&engine, b"", b"").len(), 50);
}

#[test]
fn test_update_to_empty_and_back() {
    let (_dir, engine) = open_temp(&small_config());

    engine.write(b"k", b"something").expect("write");
    engine.write(b"k", b"").expect("update to empty");
    assert!(engine.read(b"k").expect("read").is_empty());

    engine.write(b"k", b"again").expect("update");
    assert_eq!(engine.read(b"k").expect("read"), b"again");
}
