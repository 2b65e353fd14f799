//! Command line interface
//!
//! Parses and validates arguments into the resolved [`RunConfig`] the engine
//! consumes. Validation failures are configuration errors, fatal before any
//! dispatch.

use crate::config::{RunConfig, DEFAULT_MAX_WORKERS, DEFAULT_TIMEOUT_MS};
use crate::error::{EngineError, EngineResult};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "waf-comparison")]
#[command(about = "Benchmark how accurately WAFs distinguish legitimate from malicious traffic")]
pub struct Args {
    /// WAF name (can be used multiple times, paired with --waf-url)
    #[arg(long = "waf-name")]
    pub waf_name: Vec<String>,

    /// WAF URL (can be used multiple times, paired with --waf-name)
    #[arg(long = "waf-url")]
    pub waf_url: Vec<String>,

    /// Number of concurrent workers per target
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,

    /// Fast mode: sample ~15% of requests with a constant seed
    #[arg(long)]
    pub fast: bool,

    /// Delete the existing results database and stored WAF configuration,
    /// then run a fresh analysis
    #[arg(long)]
    pub fresh_run: bool,

    /// Directory holding the Legitimate/ and Malicious/ corpus files
    #[arg(long, default_value = "results/datasets")]
    pub datasets_dir: PathBuf,

    /// SQLite results database file
    #[arg(long, default_value = "results/waf_comparison.db")]
    pub database: PathBuf,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,
}

impl Args {
    /// Validate and resolve into a [`RunConfig`].
    ///
    /// An empty target list is allowed here: a resumed run takes its targets
    /// from the store and ignores these flags. The Run Controller rejects an
    /// empty list when the run turns out to be fresh.
    pub fn into_config(self) -> EngineResult<RunConfig> {
        let targets = validate_targets(&self.waf_name, &self.waf_url)?;

        if self.max_workers == 0 {
            return Err(EngineError::Config("'--max-workers' must be at least 1".to_string()));
        }

        Ok(RunConfig {
            targets,
            max_workers: self.max_workers,
            fast_mode: self.fast,
            fresh_run: self.fresh_run,
            datasets_dir: self.datasets_dir,
            database_url: format!("sqlite://{}", self.database.display()),
            request_timeout: Duration::from_millis(self.timeout_ms),
        })
    }
}

fn validate_targets(names: &[String], urls: &[String]) -> EngineResult<Vec<(String, String)>> {
    let config_err = |msg: &str| Err(EngineError::Config(msg.to_string()));

    if names.is_empty() && urls.is_empty() {
        return Ok(Vec::new());
    }
    if names.is_empty() || urls.is_empty() {
        return config_err(
            "both '--waf-name' and '--waf-url' arguments must be provided if either is used",
        );
    }
    if names.len() != urls.len() {
        return config_err("number of '--waf-name' and '--waf-url' arguments must match");
    }
    if names.iter().any(|name| name.trim().is_empty()) {
        return config_err("empty values detected in '--waf-name' arguments; each WAF name must be non-empty");
    }
    for url in urls {
        let trimmed = url.trim().to_lowercase();
        if trimmed.is_empty()
            || !(trimmed.starts_with("http://") || trimmed.starts_with("https://"))
        {
            return Err(EngineError::Config(format!(
                "invalid URL in '--waf-url' arguments: {url:?}; each URL must start with 'http://' or 'https://'"
            )));
        }
    }
    if names.iter().collect::<HashSet<_>>().len() != names.len() {
        return config_err("duplicate WAF names detected in '--waf-name' arguments; each WAF name must be unique");
    }
    if urls.iter().collect::<HashSet<_>>().len() != urls.len() {
        return config_err("duplicate WAF URLs detected in '--waf-url' arguments; each WAF URL must be unique");
    }

    Ok(names.iter().cloned().zip(urls.iter().cloned()).collect())
}
