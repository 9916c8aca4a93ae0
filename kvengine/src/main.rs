//! Command-line driver.
//!
//! ```text
//! kvengine <dir> put <key> <value>
//! kvengine <dir> get <key>
//! kvengine <dir> scan [lower] [upper]
//! kvengine <dir> bench <threads> <count>
//! ```
//!
//! Configuration comes from `KVENGINE_*` environment variables and logging
//! from `RUST_LOG` (default `kvengine=info`).

use std::process::ExitCode;
use std::time::Instant;

use kvengine::{ConfigError, Engine, EngineConfig, EngineError, RetCode};
use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: kvengine <dir> put <key> <value> | get <key> | scan [lower] [upper] | bench <threads> <count>";

enum Command {
    Put { key: String, value: String },
    Get { key: String },
    Scan { lower: String, upper: String },
    Bench { threads: usize, count: usize },
}

enum CliError {
    Usage(String),
    Config(ConfigError),
    Engine(EngineError),
    WorkerPanicked,
    BenchMismatch(usize),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usage(msg) => write!(f, "{msg}\n{USAGE}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::Engine(e) => write!(f, "{} ({e})", e.code()),
            Self::WorkerPanicked => write!(f, "bench worker panicked"),
            Self::BenchMismatch(n) => write!(f, "{n} keys read back with the wrong value"),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<EngineError> for CliError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvengine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<(), CliError> {
    let [dir, command, rest @ ..] = args else {
        return Err(CliError::Usage("missing directory or command".to_string()));
    };
    let command = parse_command(command, rest)?;
    let config = EngineConfig::from_env()?;
    let engine = Engine::open_with_config(dir, &config)?;

    match command {
        Command::Put { key, value } => {
            engine.write(key.as_bytes(), value.as_bytes())?;
            println!("{}", RetCode::Succ);
        }
        Command::Get { key } => match engine.read(key.as_bytes()) {
            Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
            Err(EngineError::NotFound) => println!("{}", RetCode::NotFound),
            Err(e) => return Err(e.into()),
        },
        Command::Scan { lower, upper } => {
            engine.range(lower.as_bytes(), upper.as_bytes(), &mut |key: &[u8], value: &[u8]| {
                println!(
                    "{}\t{}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(value)
                );
            })?;
        }
        Command::Bench { threads, count } => bench(&engine, threads, count)?,
    }
    Ok(())
}

fn parse_command(command: &str, rest: &[String]) -> Result<Command, CliError> {
    let number = |s: &String| {
        s.parse::<usize>()
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| CliError::Usage(format!("'{s}' is not a positive number")))
    };

    match (command, rest) {
        ("put", [key, value]) => Ok(Command::Put {
            key: key.clone(),
            value: value.clone(),
        }),
        ("get", [key]) => Ok(Command::Get { key: key.clone() }),
        ("scan", bounds) if bounds.len() <= 2 => Ok(Command::Scan {
            lower: bounds.first().cloned().unwrap_or_default(),
            upper: bounds.get(1).cloned().unwrap_or_default(),
        }),
        ("bench", [threads, count]) => Ok(Command::Bench {
            threads: number(threads)?,
            count: number(count)?,
        }),
        _ => Err(CliError::Usage(format!("bad command: {command}"))),
    }
}

/// Write `count` random pairs from each of `threads` threads, then read
/// every pair back.
#[allow(clippy::cast_precision_loss)]
fn bench(engine: &Engine, threads: usize, count: usize) -> Result<(), CliError> {
    let base_seed: u64 = rand::random();
    let started = Instant::now();

    let written = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..threads as u64)
            .map(|t| scope.spawn(move || write_random(engine, base_seed.wrapping_add(t), t, count)))
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().map_err(|_| CliError::WorkerPanicked)?)
            .collect::<Result<Vec<_>, CliError>>()
    })?;
    let write_secs = started.elapsed().as_secs_f64();

    let started = Instant::now();
    let mut mismatches = 0;
    for (key, value) in written.iter().flatten() {
        if engine.read(key)? != *value {
            mismatches += 1;
        }
    }
    let read_secs = started.elapsed().as_secs_f64();

    let total = threads * count;
    println!(
        "wrote {total} keys in {write_secs:.3}s ({:.0} ops/s), read back in {read_secs:.3}s ({:.0} ops/s)",
        total as f64 / write_secs,
        total as f64 / read_secs
    );
    if mismatches > 0 {
        return Err(CliError::BenchMismatch(mismatches));
    }
    Ok(())
}

fn write_random(
    engine: &Engine,
    seed: u64,
    thread: u64,
    count: usize,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CliError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pairs = Vec::with_capacity(count);
    for i in 0..count {
        let key = format!("t{thread:02}-{:016x}-{i}", rng.random::<u64>()).into_bytes();
        let len = rng.random_range(1..=64);
        let value: Vec<u8> = (&mut rng).sample_iter(Alphanumeric).take(len).collect();
        engine.write(&key, &value)?;
        pairs.push((key, value));
    }
    Ok(pairs)
}
