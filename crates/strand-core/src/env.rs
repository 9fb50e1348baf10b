//! Environment variable overrides for configuration
//!
//! Every tunable has a compile-time default; these helpers let a
//! `STRAND_*` variable replace it at runtime. Unparseable values are
//! ignored rather than reported, so a typo falls back to the default.
//!
//! ```ignore
//! use strand_core::env::{env_get, env_flag, env_millis};
//!
//! let threads: usize = env_get("STRAND_THREADS", 4);
//! let hook = env_flag("STRAND_HOOK_ENABLE", true);
//! let wait = env_millis("STRAND_REACTOR_MAX_WAIT_MS", 5000);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` when unset or malformed.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if it is set and well-formed.
#[inline]
pub fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean switch.
///
/// "1", "true", "yes", "on" enable; "0", "false", "no", "off" disable
/// (case-insensitive). Anything else keeps `default`.
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => parse_flag(&val).unwrap_or(default),
        Err(_) => default,
    }
}

/// Millisecond duration.
#[inline]
pub fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

fn parse_flag(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
