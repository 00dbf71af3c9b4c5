use std::time::Duration;

use taskseeker_core::settings::Settings;

const DEFAULT_FLUSH_MS: u64 = 150;
const FLUSH_MS_RANGE: (u64, u64) = (100, 200);
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 1200;
const JOIN_TIMEOUT_MS_RANGE: (u64, u64) = (1000, 1500);
const DEFAULT_FORCED_GRACE_MS: u64 = 250;
const DEFAULT_MAX_QUERY_CHARS: usize = 5000;

/// Runtime knobs for the dispatcher and runner. Built once and injected;
/// changing it later goes through `Dispatcher::reconfigure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// StreamBuffer coalescing period.
    pub flush_interval: Duration,
    /// How long `cancel_and_join` waits for a cooperative stop.
    pub join_timeout: Duration,
    /// Extra wait after the kill token fires before the context is fenced.
    pub forced_grace: Duration,
    pub max_query_chars: usize,
    pub stream_responses: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_MS),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            forced_grace: Duration::from_millis(DEFAULT_FORCED_GRACE_MS),
            max_query_chars: DEFAULT_MAX_QUERY_CHARS,
            stream_responses: true,
        }
    }
}

impl EngineConfig {
    pub fn from_settings(s: &Settings) -> Self {
        let d = Self::default();
        let clamp = |v: u64, (lo, hi): (u64, u64)| v.clamp(lo, hi);
        Self {
            flush_interval: s
                .stream_flush_ms
                .map(|ms| Duration::from_millis(clamp(ms, FLUSH_MS_RANGE)))
                .unwrap_or(d.flush_interval),
            join_timeout: s
                .job_join_timeout_ms
                .map(|ms| Duration::from_millis(clamp(ms, JOIN_TIMEOUT_MS_RANGE)))
                .unwrap_or(d.join_timeout),
            forced_grace: d.forced_grace,
            max_query_chars: s
                .max_query_chars
                .filter(|n| *n > 0)
                .unwrap_or(d.max_query_chars),
            stream_responses: s.stream_responses.unwrap_or(d.stream_responses),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_empty_settings() {
        assert_eq!(EngineConfig::from_settings(&Settings::default()), EngineConfig::default());
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let s = Settings {
            stream_flush_ms: Some(5),
            job_join_timeout_ms: Some(60_000),
            max_query_chars: Some(0),
            stream_responses: Some(false),
            ..Settings::default()
        };
        let c = EngineConfig::from_settings(&s);
        assert_eq!(c.flush_interval, Duration::from_millis(100));
        assert_eq!(c.join_timeout, Duration::from_millis(1500));
        assert_eq!(c.max_query_chars, 5000);
        assert!(!c.stream_responses);
    }
}
