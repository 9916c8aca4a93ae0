//! Test that node splits keep every key reachable and the tree well formed.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::{collect_range, key, open_temp, small_config, value};
use crate::storage::btree::MIN_ORDER;
use crate::storage::btree::MAX_KEY_SIZE;

#[test]
fn test_increasing_keys_split() {
    let mut config = small_config();
    config.layout.order = MIN_ORDER;
    let (_dir, engine) = open_temp(&config);
    let count = (config.layout.order * 3) as u32;

    for i in 0..count {
        engine.write(&key(i), &value(i, 0)).expect("write");
    }

    let stats = engine.verify().expect("verify");
    assert!(stats.height > 1, "height {}", stats.height);
    assert_eq!(stats.records, u64::from(count));
    for i in 0..count {
        assert_eq!(engine.read(&key(i)).expect("read"), value(i, 0));
    }
}

#[test]
fn test_random_order_many_keys() {
    let (_dir, engine) = open_temp(&small_config());
    let mut ids: Vec<u32> = (0..1500).collect();
    ids.shuffle(&mut StdRng::seed_from_u64(1234));

    for &i in &ids {
        engine.write(&key(i), &value(i, 0)).expect("write");
    }

    let stats = engine.verify().expect("verify");
    assert_eq!(stats.records, 1500);
    assert!(stats.height >= 4, "height {}", stats.height);
    let meta = engine.meta();
    assert_eq!(meta.leaf_node_num, stats.leaf_nodes);
    assert_eq!(meta.internal_node_num, stats.internal_nodes);

    for i in (0..1500).step_by(7) {
        assert_eq!(engine.read(&key(i)).expect("read"), value(i, 0));
    }
}

#[test]
fn test_variable_length_keys_split_by_pool() {
    let mut config = small_config();
    config.layout.order = 32;
    let (_dir, engine) = open_temp(&config);
    let mut rng = StdRng::seed_from_u64(99);

    let mut written = Vec::new();
    for i in 0..200u32 {
        let len = rng.random_range(1..=MAX_KEY_SIZE);
        let mut k: Vec<u8> = (0..len).map(|_| rng.random_range(b'a'..=b'z')).collect();
        k.extend_from_slice(&i.to_be_bytes());
        k.truncate(MAX_KEY_SIZE);
        engine.write(&k, &i.to_le_bytes()).expect("write");
        written.push((k, i));
    }

    let stats = engine.verify().expect("verify");
    written.sort();
    written.dedup_by(|a, b| a.0 == b.0);
    assert_eq!(stats.records, written.len() as u64);

    let records = collect_range(&engine, b"", b"");
    assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
    for (k, _) in &written {
        assert!(engine.read(k).is_ok(), "{k:?}");
    }
}
