//! Test that data written through one engine is visible after reopening the
//! directory.

use crate::config::EngineConfig;
use crate::e2e_tests::helpers::{SMALL_LAYOUT, collect_range, key, small_config, value};
use crate::engine::Engine;
use crate::storage::recovery::RecoveryOutcome;

#[test]
fn test_reopen_persists_data() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = small_config();

    {
        let engine = Engine::open_with_config(dir.path(), &config).expect("open");
        for i in 0..200 {
            engine.write(&key(i), &value(i, 0)).expect("write");
        }
        engine.write(&key(5), &value(5, 1)).expect("update");
    }

    let engine = Engine::open_with_config(dir.path(), &config).expect("reopen");
    assert_eq!(engine.recovery_outcome(), RecoveryOutcome::AlreadyCommitted);
    assert_eq!(engine.read(&key(5)).expect("read"), value(5, 1));
    assert_eq!(engine.read(&key(199)).expect("read"), value(199, 0));
    assert_eq!(collect_range(&engine, b"", b"").len(), 200);
    assert_eq!(engine.verify().expect("verify").records, 200);

    engine.write(&key(200), &value(200, 0)).expect("write after reopen");
    assert_eq!(engine.read(&key(200)).expect("read"), value(200, 0));
}

#[test]
fn test_reopen_keeps_stored_layout() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");

    {
        let engine = Engine::open_with_config(dir.path(), &small_config()).expect("open");
        engine.write(b"k", b"v").expect("write");
    }

    let config = EngineConfig {
        sync: false,
        ..EngineConfig::default()
    };
    let engine = Engine::open_with_config(dir.path(), &config).expect("reopen");
    assert_eq!(engine.meta().layout, SMALL_LAYOUT);
    assert_eq!(engine.read(b"k").expect("read"), b"v");
}

#[test]
fn test_reopen_empty_engine() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    drop(Engine::open(dir.path()).expect("open"));

    let engine = Engine::open(dir.path()).expect("reopen");
    assert!(collect_range(&engine, b"", b"").is_empty());
    let meta = engine.meta();
    assert_eq!(meta.height, 1);
    assert_eq!(meta.leaf_node_num, 1);
}
