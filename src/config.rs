//! Configuration module
//!
//! The engine consumes a fully resolved [`RunConfig`]; argument parsing and
//! validation live in `cli.rs`.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of concurrent workers per target.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1500;

/// Constant seed for reproducible shuffling in fast mode.
pub const FAST_MODE_SEED: u64 = 42;

/// Fraction of each loaded corpus kept in fast mode.
pub const FAST_MODE_SAMPLE_PERCENTAGE: f64 = 0.15;

/// User-Agent sent with health checks and canary probes.
pub const HEALTH_CHECK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:105.0) Gecko/20100101 Firefox/105.0";

/// Canary query string appended to a target's base URL for the
/// prevention-mode check. Unambiguously malicious: any WAF in prevention
/// mode is expected to block it.
pub const CANARY_PATH: &str = "/?a=<script>alert(1)</script>";

/// Whether this invocation starts from empty state or extends prior results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Wipe all prior observations, targets and stored run configuration.
    Fresh,
    /// Reuse prior state; dispatch only records not yet attempted per target.
    Resume,
}

/// Resolved run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Target (name, base_url) pairs from the CLI. Ignored on resume in
    /// favor of the stored configuration.
    pub targets: Vec<(String, String)>,
    /// Concurrent workers per target.
    pub max_workers: usize,
    /// Sample ~15% of each corpus with a constant seed.
    pub fast_mode: bool,
    /// Discard all prior results and configuration before running.
    pub fresh_run: bool,
    /// Directory holding `Legitimate/` and `Malicious/` corpus files.
    pub datasets_dir: PathBuf,
    /// SQLite database URL for the results store.
    pub database_url: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            max_workers: DEFAULT_MAX_WORKERS,
            fast_mode: false,
            fresh_run: false,
            datasets_dir: PathBuf::from("results/datasets"),
            database_url: "sqlite://results/waf_comparison.db".to_string(),
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}
