use chrono::Duration;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::hn_client::DEFAULT_API_BASE;
use crate::sink::RetryPolicy;

/// Knobs for the rank and lifecycle rules.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stories per front page. Front page is `rank <= page_size`, deep pages are
    /// `rank > 2 * page_size`.
    pub page_size: usize,
    /// A previous rank sample older than this means the poller was stopped in between.
    pub stale_rank_after: Duration,
    /// Stories older than this jumping onto the front page get reported as upranked.
    pub long_stale_after: Duration,
    pub rank_history_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            stale_rank_after: Duration::seconds(30),
            long_stale_after: Duration::hours(6),
            rank_history_len: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Records not written for this long are dropped on flush.
    pub retention: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::days(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Sqlite,
    Json,
    Volatile,
}

/// Upper bound for the `*_secs` settings (about 100 years), so the derived durations and
/// the cutoffs computed from them stay inside chrono's range.
const MAX_SECS: i64 = 100 * 365 * 86_400;

/// Command line / environment surface of the `hn_watch` binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "hn_watch")]
#[command(about = "Report Hacker News stories that get killed, deleted, resurrected or re-ranked")]
#[command(version)]
pub struct Cli {
    /// Directory holding the memory database
    #[arg(long, env = "HN_WATCH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Storage backend for the memory store
    #[arg(long, env = "HN_WATCH_BACKEND", value_enum, default_value_t = BackendKind::Sqlite)]
    pub backend: BackendKind,

    /// Base URL of the Firebase API
    #[arg(long, env = "HN_WATCH_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Seconds between poll cycles
    #[arg(long, env = "HN_WATCH_INTERVAL_SECS", default_value_t = 3)]
    pub interval_secs: u64,

    #[arg(long, env = "HN_WATCH_PAGE_SIZE", default_value_t = 30)]
    pub page_size: usize,

    #[arg(long, env = "HN_WATCH_RETENTION_SECS", default_value_t = 86_400,
          value_parser = clap::value_parser!(i64).range(0..=MAX_SECS))]
    pub retention_secs: i64,

    #[arg(long, env = "HN_WATCH_STALE_RANK_SECS", default_value_t = 30,
          value_parser = clap::value_parser!(i64).range(0..=MAX_SECS))]
    pub stale_rank_secs: i64,

    #[arg(long, env = "HN_WATCH_LONG_STALE_SECS", default_value_t = 21_600,
          value_parser = clap::value_parser!(i64).range(0..=MAX_SECS))]
    pub long_stale_secs: i64,

    /// Rank samples kept per story
    #[arg(long, env = "HN_WATCH_RANK_HISTORY", default_value_t = 2)]
    pub rank_history: usize,

    #[arg(long, env = "HN_WATCH_REQUEST_TIMEOUT_SECS", default_value_t = 3)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "HN_WATCH_MAX_DELIVERY_ATTEMPTS", default_value_t = 5)]
    pub max_delivery_attempts: u32,

    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            page_size: self.page_size,
            stale_rank_after: Duration::seconds(self.stale_rank_secs),
            long_stale_after: Duration::seconds(self.long_stale_secs),
            // A single sample can never show a rank change.
            rank_history_len: self.rank_history.max(2),
        }
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            retention: Duration::seconds(self.retention_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_delivery_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    /// `--data-dir`, or `~/.hn_watch`.
    pub fn resolve_data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let home_dir = dirs_next::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home_dir.join(".hn_watch"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_match_library_defaults() {
        let cli = Cli::parse_from(["hn_watch"]);
        let engine = cli.engine_config();
        let defaults = EngineConfig::default();
        assert_eq!(engine.page_size, defaults.page_size);
        assert_eq!(engine.stale_rank_after, defaults.stale_rank_after);
        assert_eq!(engine.long_stale_after, defaults.long_stale_after);
        assert_eq!(engine.rank_history_len, defaults.rank_history_len);
        assert_eq!(cli.memory_config().retention, MemoryConfig::default().retention);
        assert_eq!(cli.backend, BackendKind::Sqlite);
        assert_eq!(cli.api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from([
            "hn_watch",
            "--backend",
            "json",
            "--page-size",
            "10",
            "--rank-history",
            "1",
            "--data-dir",
            "/tmp/x",
            "--once",
        ]);
        assert_eq!(cli.backend, BackendKind::Json);
        assert_eq!(cli.engine_config().page_size, 10);
        assert_eq!(cli.engine_config().rank_history_len, 2);
        assert_eq!(cli.resolve_data_dir().unwrap(), PathBuf::from("/tmp/x"));
        assert!(cli.once);
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        for flag in ["--retention-secs", "--stale-rank-secs", "--long-stale-secs"] {
            assert!(Cli::try_parse_from(["hn_watch", flag, "9223372036854775807"]).is_err());
            assert!(Cli::try_parse_from(["hn_watch", flag, "-1"]).is_err());
        }
        let cli = Cli::try_parse_from(["hn_watch", "--retention-secs", "3600"]).unwrap();
        assert_eq!(cli.memory_config().retention, Duration::hours(1));
    }
}
