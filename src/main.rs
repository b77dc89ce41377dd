//! Triple buffer demonstration
//!
//! A producer thread publishes an increasing counter at a fixed period, while
//! the main thread polls the consumer end and prints every new value it sees.
//!
//! Configuration comes from the environment:
//!
//! - `TRIPLEBUF_TICK_MS`: producer period in milliseconds (default 750)
//! - `TRIPLEBUF_MAX`: last value to be produced (default 25)
//! - `RUST_LOG`: log filter, as understood by `env_logger`

use anyhow::{Context, Result};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use triplebuf::TripleBuffer;

/// Demo settings
#[derive(Debug)]
struct Config {
    /// Delay between two producer commits
    tick: Duration,

    /// Last value produced before stopping
    max_value: u32,
}
//
impl Config {
    /// Load the settings from the environment, falling back to defaults
    fn from_env() -> Result<Self> {
        Ok(Self {
            tick: Duration::from_millis(env_or("TRIPLEBUF_TICK_MS", 750)?),
            max_value: env_or("TRIPLEBUF_MAX", 25)?,
        })
    }
}

/// Parse an environment variable, if set
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value {raw:?} for {key}")),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).with_context(|| format!("cannot read {key}")),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let config = Config::from_env()?;
    log::info!("Starting demo with {config:?}");

    let (mut producer, mut consumer) = TripleBuffer::<u32>::new().split();

    // The producer commits one value per tick
    let Config { tick, max_value } = config;
    let writer = thread::spawn(move || -> Result<()> {
        for value in 0..=max_value {
            let start = Instant::now();
            producer.write(value);
            producer.commit()?;
            thread::sleep(tick.saturating_sub(start.elapsed()));
        }
        Ok(())
    });

    // The consumer polls without ever waiting for the producer
    let mut last_seen = None;
    while last_seen != Some(max_value) {
        let (value, pending) = consumer.read();
        match value {
            Some(&value) if last_seen != Some(value) => {
                println!("val: {value} - pending {pending}");
                last_seen = Some(value);
            }
            _ => thread::yield_now(),
        }
    }

    writer
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
    log::info!("Demo complete");
    Ok(())
}
