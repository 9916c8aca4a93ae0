//! Test writers on disjoint key sets running concurrently with readers.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::e2e_tests::helpers::{collect_range, key, open_temp, small_config, value};

const THREADS: u32 = 4;
const KEYS_PER_THREAD: u32 = 250;

#[test]
fn test_concurrent_disjoint_writers() {
    let (_dir, engine) = open_temp(&small_config());

    std::thread::scope(|scope| {
        for t in 0..THREADS {
            let engine = &engine;
            scope.spawn(move || {
                // Interleave keys across threads so writers share leaves.
                for i in 0..KEYS_PER_THREAD {
                    let k = i * THREADS + t;
                    engine.write(&key(k), &value(k, 0)).expect("write");
                }
                for i in (0..KEYS_PER_THREAD).step_by(2) {
                    let k = i * THREADS + t;
                    engine.write(&key(k), &value(k, 1)).expect("update");
                }
            });
        }
    });

    let total = THREADS * KEYS_PER_THREAD;
    for k in 0..total {
        let round = u32::from((k / THREADS) % 2 == 0);
        assert_eq!(engine.read(&key(k)).expect("read"), value(k, round), "key {k}");
    }
    let stats = engine.verify().expect("verify");
    assert_eq!(stats.records, u64::from(total));
}

#[test]
fn test_readers_during_splits() {
    let (_dir, engine) = open_temp(&small_config());
    for k in (0..400).step_by(4) {
        engine.write(&key(k), &value(k, 0)).expect("seed");
    }
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let engine = &engine;
        let done = &done;

        let writers: Vec<_> = (1..4u32)
            .map(|t| {
                scope.spawn(move || {
                    for i in 0..100 {
                        let k = i * 4 + t;
                        engine.write(&key(k), &value(k, 0)).expect("write");
                    }
                })
            })
            .collect();

        scope.spawn(move || {
            loop {
                let finished = done.load(Ordering::SeqCst);
                // Seeded keys are never rewritten and must stay visible.
                for k in (0..400).step_by(20) {
                    assert_eq!(engine.read(&key(k)).expect("read"), value(k, 0));
                }
                let records = collect_range(engine, b"", b"");
                assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
                assert!(records.len() >= 100);
                if finished {
                    assert_eq!(records.len(), 400);
                    break;
                }
            }
        });

        scope.spawn(move || {
            for _ in 0..20 {
                let records = collect_range(engine, &key(100), &key(300));
                assert!(records.iter().all(|(k, _)| *k >= key(100) && *k < key(300)));
            }
        });

        for writer in writers {
            writer.join().expect("writer thread");
        }
        done.store(true, Ordering::SeqCst);
    });

    assert_eq!(engine.verify().expect("verify").records, 400);
    for k in 0..400 {
        assert_eq!(engine.read(&key(k)).expect("read"), value(k, 0));
    }
}
