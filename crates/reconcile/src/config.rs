//! Environment knobs for the controller and runner.

use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Concurrent live lookups during filtering and health checks.
pub fn lookup_concurrency() -> usize { env_parse::<usize>("KEEL_LOOKUP_CONCURRENCY").filter(|n| *n > 0).unwrap_or(8) }

pub fn workers() -> usize { env_parse::<usize>("KEEL_WORKERS").filter(|n| *n > 0).unwrap_or(2) }

pub fn queue_cap() -> usize { env_parse::<usize>("KEEL_QUEUE_CAP").filter(|n| *n > 0).unwrap_or(4096) }

/// Delay before retrying a failed pass.
pub fn requeue_after() -> Duration { Duration::from_secs(env_parse::<u64>("KEEL_REQUEUE_SECS").unwrap_or(30)) }

/// Delay before retrying a gated pass.
pub fn gate_retry_after() -> Duration { Duration::from_secs(env_parse::<u64>("KEEL_GATE_RETRY_SECS").unwrap_or(300)) }
