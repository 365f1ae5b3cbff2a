use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::limits::DEFAULT_CHUNK_SIZE;
use crate::model::Ms;

const DAY_MS: Ms = 24 * 60 * 60 * 1000;

/// Daemon settings, read from `UPTRAIL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
    /// Closed intervals older than this are purged.
    pub purge_retention_ms: Ms,
    pub purge_interval: Duration,
    /// An agent silent for longer than this is marked backfilled.
    pub agent_suspect_ms: Ms,
    pub backfill_interval: Duration,
    /// Upper bound on a single full-report request to an agent.
    pub agent_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            purge_retention_ms: 365 * DAY_MS,
            purge_interval: Duration::from_secs(3600),
            agent_suspect_ms: 300_000,
            backfill_interval: Duration::from_secs(30),
            agent_timeout: Duration::from_millis(5000),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys take the default; unparseable
    /// values take the default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let chunk_size = parsed(&lookup, "UPTRAIL_CHUNK_SIZE", d.chunk_size);
        Self {
            data_dir: lookup("UPTRAIL_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: lookup("UPTRAIL_METRICS_PORT").and_then(|raw| {
                raw.parse()
                    .inspect_err(|_| warn!(key = "UPTRAIL_METRICS_PORT", value = %raw, "ignoring unparseable port, metrics disabled"))
                    .ok()
            }),
            compact_threshold: parsed(&lookup, "UPTRAIL_COMPACT_THRESHOLD", d.compact_threshold),
            purge_retention_ms: parsed(&lookup, "UPTRAIL_PURGE_RETENTION_MS", d.purge_retention_ms),
            purge_interval: Duration::from_secs(parsed(
                &lookup,
                "UPTRAIL_PURGE_INTERVAL_SECS",
                d.purge_interval.as_secs(),
            )),
            agent_suspect_ms: parsed(&lookup, "UPTRAIL_AGENT_SUSPECT_MS", d.agent_suspect_ms),
            backfill_interval: Duration::from_secs(parsed(
                &lookup,
                "UPTRAIL_BACKFILL_INTERVAL_SECS",
                d.backfill_interval.as_secs(),
            )),
            agent_timeout: Duration::from_millis(parsed(
                &lookup,
                "UPTRAIL_AGENT_TIMEOUT_MS",
                d.agent_timeout.as_millis() as u64,
            )),
            chunk_size: if chunk_size == 0 { d.chunk_size } else { chunk_size },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("availability.wal")
    }
}

fn parsed<T: FromStr + Copy>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable setting, using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_lookup_gives_defaults() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
        assert_eq!(config.purge_retention_ms, 31_536_000_000);
        assert_eq!(config.wal_path(), PathBuf::from("./data/availability.wal"));
    }

    #[test]
    fn values_are_read() {
        let config = Config::from_lookup(lookup_from(&[
            ("UPTRAIL_DATA_DIR", "/var/lib/uptrail"),
            ("UPTRAIL_METRICS_PORT", "9100"),
            ("UPTRAIL_COMPACT_THRESHOLD", "50"),
            ("UPTRAIL_AGENT_SUSPECT_MS", "60000"),
            ("UPTRAIL_AGENT_TIMEOUT_MS", "250"),
            ("UPTRAIL_CHUNK_SIZE", " 10 "),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/uptrail"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.agent_suspect_ms, 60_000);
        assert_eq!(config.agent_timeout, Duration::from_millis(250));
        assert_eq!(config.chunk_size, 10);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let config = Config::from_lookup(lookup_from(&[
            ("UPTRAIL_METRICS_PORT", "not-a-port"),
            ("UPTRAIL_PURGE_INTERVAL_SECS", "-5"),
            ("UPTRAIL_CHUNK_SIZE", "0"),
        ]));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.purge_interval, Duration::from_secs(3600));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
