//! Tunables, read once from `OBJSYNC_*` environment variables.
//!
//! An unparsable value logs a warning and falls back to the default rather
//! than failing startup.

use log::warn;

#[derive(Debug, Clone)]
pub struct Options {
    /// Start locks as mark-word biases. Off, every lock goes straight to a
    /// monitor; useful for flushing out revocation-dependent bugs.
    pub biased_locking: bool,
    /// Minimum time between deflation sweeps, in milliseconds.
    pub deflation_interval_ms: u64,
    /// Deflate when `free_monitors * ratio < monitors_in_circulation`,
    /// i.e. a higher ratio tolerates a smaller free reserve.
    pub deflation_free_ratio: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            biased_locking: true,
            deflation_interval_ms: 1000,
            deflation_free_ratio: 8,
        }
    }
}

impl Options {
    /// Defaults overridden by any `OBJSYNC_*` variables present.
    pub fn from_env() -> Options {
        let mut options = Options::default();
        read_env("OBJSYNC_BIASED_LOCKING", &mut options.biased_locking);
        read_env("OBJSYNC_DEFLATION_INTERVAL_MS", &mut options.deflation_interval_ms);
        read_env("OBJSYNC_DEFLATION_FREE_RATIO", &mut options.deflation_free_ratio);
        options
    }
}

fn read_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!("ignoring unparsable {}={:?}", name, val),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let options = Options::default();
        assert!(options.deflation_interval_ms > 0);
        assert!(options.deflation_free_ratio > 0);
    }
}
