use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process settings, read from `FIELDLEDGER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends since the last compaction before the compactor rewrites the log.
    pub compact_threshold: u64,
    /// Default deadline for mutating requests; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub lookup_retries: u32,
    pub lookup_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            request_timeout: Some(Duration::from_millis(5000)),
            lookup_retries: 2,
            lookup_backoff: Duration::from_millis(25),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parse = |key: &str| get(key).and_then(|v| parse_trimmed::<u64>(&v));

        Self {
            bind: get("FIELDLEDGER_BIND").unwrap_or(defaults.bind),
            port: get("FIELDLEDGER_PORT")
                .and_then(|v| parse_trimmed(&v))
                .unwrap_or(defaults.port),
            data_dir: get("FIELDLEDGER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: get("FIELDLEDGER_METRICS_PORT").and_then(|v| parse_trimmed(&v)),
            compact_threshold: parse("FIELDLEDGER_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            // 0 disables the default deadline
            request_timeout: match parse("FIELDLEDGER_REQUEST_TIMEOUT_MS") {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.request_timeout,
            },
            lookup_retries: get("FIELDLEDGER_LOOKUP_RETRIES")
                .and_then(|v| parse_trimmed(&v))
                .unwrap_or(defaults.lookup_retries),
            lookup_backoff: parse("FIELDLEDGER_LOOKUP_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lookup_backoff),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

fn parse_trimmed<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from_pairs(&[]), Config::default());
    }

    #[test]
    fn reads_every_key() {
        let cfg = from_pairs(&[
            ("FIELDLEDGER_BIND", "127.0.0.1"),
            ("FIELDLEDGER_PORT", "9090"),
            ("FIELDLEDGER_DATA_DIR", "/var/lib/fieldledger"),
            ("FIELDLEDGER_METRICS_PORT", "9100"),
            ("FIELDLEDGER_COMPACT_THRESHOLD", "50"),
            ("FIELDLEDGER_REQUEST_TIMEOUT_MS", "250"),
            ("FIELDLEDGER_LOOKUP_RETRIES", "4"),
            ("FIELDLEDGER_LOOKUP_BACKOFF_MS", "10"),
        ]);
        assert_eq!(cfg.addr(), "127.0.0.1:9090");
        assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/fieldledger/ledger.wal"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.request_timeout, Some(Duration::from_millis(250)));
        assert_eq!(cfg.lookup_retries, 4);
        assert_eq!(cfg.lookup_backoff, Duration::from_millis(10));
    }

    #[test]
    fn zero_timeout_disables_deadline_and_junk_falls_back() {
        let cfg = from_pairs(&[
            ("FIELDLEDGER_REQUEST_TIMEOUT_MS", "0"),
            ("FIELDLEDGER_PORT", "eighty"),
            ("FIELDLEDGER_BIND", "  "),
        ]);
        assert_eq!(cfg.request_timeout, None);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.bind, "0.0.0.0");
    }
}
