use std::env;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:6390";
const DEFAULT_MAX_BULK_LEN: usize = 1024 * 1024;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub max_bulk_len: usize,
    pub stats_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_bulk_len = match lookup("MAX_BULK_LEN") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|len| *len > 0)
                .ok_or_else(|| anyhow::anyhow!("MAX_BULK_LEN must be a positive integer, got '{}'", raw))?,
            None => DEFAULT_MAX_BULK_LEN,
        };
        let stats_interval_secs = match lookup("STATS_INTERVAL_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| anyhow::anyhow!("STATS_INTERVAL_SECS must be a non-negative integer, got '{}'", raw))?,
            None => DEFAULT_STATS_INTERVAL_SECS,
        };

        Ok(Config {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            max_bulk_len,
            stats_interval_secs,
        })
    }

    /// `None` when periodic stats logging is disabled.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}
