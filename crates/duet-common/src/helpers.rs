//! Environment helpers shared by configuration loaders.

use std::str::FromStr;

/// Read and parse a value, falling back to `default` when unset or unparsable.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    env_parse(name, default)
}
