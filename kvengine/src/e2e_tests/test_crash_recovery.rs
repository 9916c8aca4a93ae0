//! Test recovery after crashes and power loss around a commit.

use crate::e2e_tests::helpers::{durable_config, key, open_simulated, open_simulated_with, value};
use crate::engine::RetCode;
use crate::storage::recovery::RecoveryOutcome;
use crate::storage::simulated::SimulatedStore;

#[test]
fn test_crash_after_log_write_is_replayed() {
    let data = SimulatedStore::new();
    let log = SimulatedStore::new();

    let engine = open_simulated(&data, &log);
    assert_eq!(engine.recovery_outcome(), RecoveryOutcome::EmptyLog);
    for i in 0..40 {
        engine.write(&key(i), &value(i, 0)).expect("write");
    }

    // The log record lands, then every data-file write fails: the commit
    // dies before its committed marker.
    data.fail_writes_after(0);
    let err = engine.write(b"in-flight", b"").expect_err("data write fails");
    assert_eq!(err.code(), RetCode::IoError);
    // The logger is poisoned until reopened.
    assert_eq!(
        engine.write(b"later", b"x").expect_err("poisoned").code(),
        RetCode::IoError
    );
    drop(engine);
    data.heal();

    let engine = open_simulated(&data, &log);
    assert!(matches!(
        engine.recovery_outcome(),
        RecoveryOutcome::Replayed { items, .. } if items > 0
    ));
    for i in 0..40 {
        assert_eq!(engine.read(&key(i)).expect("read"), value(i, 0));
    }
    // The logged transaction was complete, so replay applies it too.
    assert!(engine.read(b"in-flight").expect("replayed").is_empty());
    assert_eq!(engine.read(b"later").expect_err("never logged").code(), RetCode::NotFound);
    assert_eq!(engine.verify().expect("verify").records, 41);

    // Recovery of an already-applied log changes nothing.
    drop(engine);
    let before = data.snapshot();
    let engine = open_simulated(&data, &log);
    assert_eq!(engine.recovery_outcome(), RecoveryOutcome::AlreadyCommitted);
    assert_eq!(data.snapshot(), before);
    assert_eq!(engine.read(&key(7)).expect("read"), value(7, 0));
}

#[test]
fn test_crash_before_log_write_loses_only_that_write() {
    let data = SimulatedStore::new();
    let log = SimulatedStore::new();

    let engine = open_simulated(&data, &log);
    for i in 0..10 {
        engine.write(&key(i), &value(i, 0)).expect("write");
    }

    log.fail_writes_after(0);
    assert!(engine.write(b"lost", b"value").is_err());
    drop(engine);
    log.heal();

    let engine = open_simulated(&data, &log);
    assert_eq!(engine.recovery_outcome(), RecoveryOutcome::AlreadyCommitted);
    assert_eq!(engine.read(b"lost").expect_err("not durable").code(), RetCode::NotFound);
    for i in 0..10 {
        assert_eq!(engine.read(&key(i)).expect("read"), value(i, 0));
    }

    // The engine keeps working after the lost write.
    engine.write(b"lost", b"again").expect("write after recovery");
    assert_eq!(engine.read(b"lost").expect("read"), b"again");
    assert_eq!(engine.verify().expect("verify").records, 11);
}

#[test]
fn test_crash_during_split_is_replayed() {
    let data = SimulatedStore::new();
    let log = SimulatedStore::new();

    let engine = open_simulated(&data, &log);
    // Four keys fill the first leaf of the small layout.
    for i in 0..4 {
        engine.write(&key(i), b"").expect("write");
    }
    let leaves_before = engine.meta().leaf_node_num;

    data.fail_writes_after(0);
    assert!(engine.write(&key(4), b"").is_err());
    drop(engine);
    data.heal();

    let engine = open_simulated(&data, &log);
    let stats = engine.verify().expect("verify");
    assert_eq!(stats.records, 5);
    assert_eq!(stats.leaf_nodes, leaves_before + 1);
    for i in 0..5 {
        assert!(engine.read(&key(i)).expect("read").is_empty());
    }
}

#[test]
fn test_power_loss_after_log_write_keeps_updated_value() {
    let data = SimulatedStore::new();
    let log = SimulatedStore::new();
    let config = durable_config();

    let engine = open_simulated_with(&data, &log, &config);
    for i in 0..20 {
        engine.write(&key(i), &value(i, 0)).expect("write");
    }

    // The value blob is written, then every node write to the data file fails
    // after the log record is durable.
    data.fail_writes_after(1);
    let err = engine.write(&key(7), &value(7, 1)).expect_err("node write fails");
    assert_eq!(err.code(), RetCode::IoError);
    drop(engine);
    data.crash();
    log.crash();

    let engine = open_simulated_with(&data, &log, &config);
    assert!(matches!(engine.recovery_outcome(), RecoveryOutcome::Replayed { .. }));
    assert_eq!(engine.read(&key(7)).expect("read updated key"), value(7, 1));
    for i in (0..20).filter(|&i| i != 7) {
        assert_eq!(engine.read(&key(i)).expect("read"), value(i, 0));
    }
    assert_eq!(engine.verify().expect("verify").records, 20);
}

#[test]
fn test_power_loss_before_log_write_keeps_old_value() {
    let data = SimulatedStore::new();
    let log = SimulatedStore::new();
    let config = durable_config();

    let engine = open_simulated_with(&data, &log, &config);
    for i in 0..20 {
        engine.write(&key(i), &value(i, 0)).expect("write");
    }

    log.fail_writes_after(0);
    assert!(engine.write(&key(3), &value(3, 1)).is_err());
    drop(engine);
    data.crash();
    log.crash();

    let engine = open_simulated_with(&data, &log, &config);
    assert_eq!(engine.recovery_outcome(), RecoveryOutcome::AlreadyCommitted);
    assert_eq!(engine.read(&key(3)).expect("read old value"), value(3, 0));

    engine.write(&key(3), &value(3, 2)).expect("write after recovery");
    assert_eq!(engine.read(&key(3)).expect("read"), value(3, 2));
    assert_eq!(engine.verify().expect("verify").records, 20);
}
