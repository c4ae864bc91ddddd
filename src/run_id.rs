//! Run identifier generation.
//!
//! Format: `YYYYMMDD-HHMMSS-<ms>-<random>` using local time, per the external
//! interface contract. The random suffix is the only use of randomness in
//! the core, so it is injected the same way the clock is: production wires
//! the OS RNG, tests wire a fixed source.

use chrono::{DateTime, Local, Utc};

pub trait EntropySource: Send + Sync {
    /// Returns a short alphanumeric suffix.
    fn random_suffix(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn random_suffix(&self) -> String {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..6)
            .map(|_| {
                let idx = rng.gen_range(0..36);
                std::char::from_digit(idx, 36).unwrap_or('0')
            })
            .collect()
    }
}

/// Generates a run id from a timestamp and entropy source. The timestamp is
/// taken from the injected clock, not sampled here, so the whole id is
/// reproducible given a fixed clock and entropy source. The `YYYYMMDD-HHMMSS`
/// portion is rendered in local time, per the external interface contract.
pub fn generate(now: DateTime<Utc>, entropy: &dyn EntropySource) -> String {
    let local = now.with_timezone(&Local);
    format!(
        "{}-{}-{}",
        local.format("%Y%m%d-%H%M%S"),
        local.timestamp_subsec_millis(),
        entropy.random_suffix()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEntropy(&'static str);
    impl EntropySource for FixedEntropy {
        fn random_suffix(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn generate_has_expected_shape() {
        let now = "2024-01-02T03:04:05.123Z".parse::<DateTime<Utc>>().unwrap();
        let id = generate(now, &FixedEntropy("ab12cd"));
        // Computed the same way `generate` does, rather than hardcoding a
        // UTC-formatted string, since the id is rendered in local time.
        let local = now.with_timezone(&Local);
        let expected = format!(
            "{}-{}-ab12cd",
            local.format("%Y%m%d-%H%M%S"),
            local.timestamp_subsec_millis()
        );
        assert_eq!(id, expected);
    }

    #[test]
    fn os_entropy_produces_six_chars() {
        let suffix = OsEntropy.random_suffix();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
