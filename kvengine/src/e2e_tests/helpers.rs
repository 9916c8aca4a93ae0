//! Common helpers for end-to-end tests.

use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::storage::btree::NodeLayout;
use crate::storage::io::BlockStore;
use crate::storage::simulated::SimulatedStore;

/// Node geometry small enough that a few dozen keys force several splits.
pub const SMALL_LAYOUT: NodeLayout = NodeLayout {
    order: 4,
    pool_capacity: 1024,
};

/// Configuration for tests: small nodes, no fsync.
#[must_use]
pub fn small_config() -> EngineConfig {
    EngineConfig {
        layout: SMALL_LAYOUT,
        sync: false,
        ..EngineConfig::default()
    }
}

/// Small nodes with fsync on, for tests that simulate power loss.
#[must_use]
pub fn durable_config() -> EngineConfig {
    EngineConfig {
        sync: true,
        ..small_config()
    }
}

/// An engine in a fresh temporary directory. The directory lives as long as
/// the returned guard.
#[must_use]
pub fn open_temp(config: &EngineConfig) -> (TempDir, Engine) {
    #[allow(clippy::expect_used)]
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    #[allow(clippy::expect_used)]
    let engine = Engine::open_with_config(dir.path(), config).expect("Failed to open engine");
    (dir, engine)
}

/// An engine over in-memory stores. Clones of the stores see the same bytes,
/// so dropping the engine and calling this again simulates a restart.
#[must_use]
pub fn open_simulated(data: &SimulatedStore, log: &SimulatedStore) -> Engine<SimulatedStore> {
    open_simulated_with(data, log, &small_config())
}

#[must_use]
pub fn open_simulated_with(
    data: &SimulatedStore,
    log: &SimulatedStore,
    config: &EngineConfig,
) -> Engine<SimulatedStore> {
    #[allow(clippy::expect_used)]
    Engine::with_stores(data.clone(), log.clone(), config).expect("Failed to open engine")
}

/// Deterministic key that sorts in numeric order.
#[must_use]
pub fn key(i: u32) -> Vec<u8> {
    format!("key{i:06}").into_bytes()
}

/// Deterministic value for key `i` written in round `round`.
#[must_use]
pub fn value(i: u32, round: u32) -> Vec<u8> {
    format!("value-{i}-{round}-{}", "x".repeat((i % 17) as usize)).into_bytes()
}

/// Every record in `[lower, upper)`.
#[must_use]
pub fn collect_range<S: BlockStore>(engine: &Engine<S>, lower: &[u8], upper: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut records = Vec::new();
    #[allow(clippy::expect_used)]
    engine
        .range(lower, upper, &mut |k: &[u8], v: &[u8]| {
            records.push((k.to_vec(), v.to_vec()));
        })
        .expect("range scan failed");
    records
}

/// Keys of `records`, in order.
#[must_use]
pub fn keys_of(records: &[(Vec<u8>, Vec<u8>)]) -> Vec<Vec<u8>> {
    records.iter().map(|(k, _)| k.clone()).collect()
}
