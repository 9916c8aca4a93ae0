//! End-to-end tests at the engine facade.
//!
//! Each test file covers a specific scenario, using deterministic inputs
//! to verify complete write/read/range cycles.

#![cfg(test)]

mod helpers;

mod test_concurrent_writers;
mod test_crash_recovery;
mod test_range_scan;
mod test_reopen;
mod test_round_trip;
mod test_split_correctness;
mod test_update_overwrites;
