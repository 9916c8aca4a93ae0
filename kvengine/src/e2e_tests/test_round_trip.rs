//! Test that every written value reads back byte for byte.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::{open_temp, small_config};
use crate::engine::{EngineError, RetCode};
use crate::storage::btree::MAX_KEY_SIZE;

#[test]
fn test_round_trip_simple() {
    let (_dir, engine) = open_temp(&small_config());

    engine.write(b"hello", b"world").expect("write");
    assert_eq!(engine.read(b"hello").expect("read"), b"world");
}

#[test]
fn test_round_trip_empty_and_large_values() {
    let (_dir, engine) = open_temp(&small_config());
    let mut rng = StdRng::seed_from_u64(7);
    let large: Vec<u8> = (0..1024 * 1024).map(|_| rng.random()).collect();

    engine.write(b"empty", b"").expect("write empty value");
    engine.write(b"large", &large).expect("write large value");

    assert_eq!(engine.read(b"empty").expect("read empty"), Vec::<u8>::new());
    assert_eq!(engine.read(b"large").expect("read large"), large);
}

#[test]
fn test_round_trip_binary_keys() {
    let (_dir, engine) = open_temp(&small_config());
    let keys: Vec<Vec<u8>> = vec![
        Vec::new(),
        vec![0],
        vec![0, 0],
        vec![0xFF; MAX_KEY_SIZE],
        b"plain".to_vec(),
    ];

    for (i, key) in keys.iter().enumerate() {
        engine.write(key, &[i as u8; 3]).expect("write");
    }
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(engine.read(key).expect("read"), vec![i as u8; 3], "{key:?}");
    }
}

#[test]
fn test_read_missing_key() {
    let (_dir, engine) = open_temp(&small_config());
    engine.write(b"present", b"1").expect("write");

    let err = engine.read(b"absent").expect_err("missing key");
    assert!(matches!(err, EngineError::NotFound));
    assert_eq!(err.code(), RetCode::NotFound);
}

#[test]
fn test_oversized_key_rejected() {
    let (_dir, engine) = open_temp(&small_config());
    let key = vec![b'k'; MAX_KEY_SIZE + 1];

    let err = engine.write(&key, b"v").expect_err("oversized key");
    assert_eq!(err.code(), RetCode::InvalidArgument);
    assert_eq!(
        engine.read(&key).expect_err("oversized key").code(),
        RetCode::InvalidArgument
    );
}
