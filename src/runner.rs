//! Run Controller
//!
//! Owns the run lifecycle:
//! `ResolveMode -> (FreshReset | ResumeLoad) -> HealthCheckAllTargets ->
//! DispatchAllCorpora -> Finalize`.
//!
//! A target failing its health checks is skipped with a reason, never fatal;
//! partial results for the remaining targets are a valid outcome. Only
//! configuration and store failures abort the run.

use crate::classify::VerdictContract;
use crate::config::{RunConfig, RunMode};
use crate::corpus::{self, CorpusKind, CorpusRecord};
use crate::dispatch::DispatchPool;
use crate::error::{EngineError, EngineResult};
use crate::health::HealthChecker;
use crate::metrics::{self, fmt_rate, Metrics};
use crate::store::{HealthState, ResultStore, Target};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Outcome of a completed run, consumed by the external report generator.
#[derive(Debug)]
pub struct RunReport {
    pub mode: RunMode,
    /// Healthy targets with their computed metrics, best balanced accuracy
    /// first.
    pub results: Vec<(Target, Metrics)>,
    /// Targets excluded from dispatch, with the health state explaining why.
    pub skipped: Vec<Target>,
}

pub struct RunController {
    config: RunConfig,
    contract: VerdictContract,
    abort: watch::Receiver<bool>,
}

impl RunController {
    pub fn new(config: RunConfig, contract: VerdictContract, abort: watch::Receiver<bool>) -> Self {
        Self { config, contract, abort }
    }

    pub async fn run(&self) -> EngineResult<RunReport> {
        let store = ResultStore::connect(&self.config.database_url).await?;

        // ResolveMode: fresh when requested, or when there is nothing to
        // resume from.
        let mode = if self.config.fresh_run || !store.has_prior_state().await? {
            RunMode::Fresh
        } else {
            RunMode::Resume
        };

        let (targets, max_workers, fast_mode) = match mode {
            RunMode::Fresh => self.fresh_reset(&store).await?,
            RunMode::Resume => self.resume_load(&store).await?,
        };

        let client = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("cannot build HTTP client: {e}")))?;

        // Health-gate every target before any dispatch.
        let checker = HealthChecker::new(client.clone(), self.contract.clone());
        let mut healthy = Vec::new();
        let mut skipped = Vec::new();
        for mut target in targets {
            target.health_state = checker.check(&target).await;
            store.update_health(&target.name, target.health_state).await?;
            if target.health_state == HealthState::Healthy {
                healthy.push(target);
            } else {
                tracing::warn!(
                    waf = %target.name,
                    reason = target.health_state.skip_reason(),
                    "target skipped for this run"
                );
                skipped.push(target);
            }
        }

        let records = self.load_corpora(fast_mode);
        if healthy.is_empty() {
            tracing::error!("no target passed the health checks; nothing to dispatch");
        } else if !records.is_empty() {
            self.dispatch_all(&store, &client, &healthy, &records, max_workers, mode).await;
        }

        self.finalize(&store, healthy, skipped, mode).await
    }

    /// FreshReset: wipe prior observations, targets and cached configuration,
    /// then re-derive targets from the current invocation.
    async fn fresh_reset(
        &self,
        store: &ResultStore,
    ) -> EngineResult<(Vec<Target>, usize, bool)> {
        tracing::info!("running fresh analysis...");
        store.reset().await?;

        if self.config.targets.is_empty() {
            return Err(EngineError::Config(
                "both '--waf-name' and '--waf-url' arguments must be provided".to_string(),
            ));
        }

        let targets: Vec<Target> = self
            .config
            .targets
            .iter()
            .map(|(name, url)| Target::new(name.clone(), url.clone()))
            .collect();
        store.save_targets(&targets).await?;
        store.save_run_config(self.config.max_workers, self.config.fast_mode).await?;

        if self.config.fast_mode {
            tracing::info!(
                "fast mode initialized: will sample ~{}% of requests with a constant seed",
                (crate::config::FAST_MODE_SAMPLE_PERCENTAGE * 100.0) as u32
            );
        }
        Ok((targets, self.config.max_workers, self.config.fast_mode))
    }

    /// ResumeLoad: reuse the stored targets and settings. New CLI flags are
    /// deliberately ignored so the stored result set and its described
    /// configuration cannot drift apart.
    async fn resume_load(&self, store: &ResultStore) -> EngineResult<(Vec<Target>, usize, bool)> {
        tracing::info!("using existing results database and stored WAF configuration");
        tracing::warn!(
            "changes to '--waf-name', '--waf-url', '--max-workers' and '--fast' have no effect on a resumed run"
        );
        tracing::warn!(
            "to apply configuration changes use '--fresh-run'; it deletes the existing results and starts over"
        );

        let targets = store.load_targets().await?;
        let stored = store.load_run_config().await?.ok_or_else(|| {
            EngineError::Config("resume requested but no stored run configuration found".to_string())
        })?;
        Ok((targets, stored.max_workers.max(1) as usize, stored.fast_mode))
    }

    /// Load both corpora. A malformed corpus is fatal for that corpus only:
    /// the run proceeds with whatever loaded cleanly.
    fn load_corpora(&self, fast_mode: bool) -> Vec<CorpusRecord> {
        let mut records = Vec::new();
        for kind in [CorpusKind::Malicious, CorpusKind::Legitimate] {
            match corpus::load_corpus(kind, &self.config.datasets_dir) {
                Ok(mut loaded) => {
                    if fast_mode {
                        loaded = corpus::sample_fast_mode(&loaded);
                    }
                    tracing::info!(corpus = kind.as_str(), records = loaded.len(), "corpus ready");
                    records.extend(loaded);
                }
                Err(e) => {
                    tracing::error!(corpus = kind.as_str(), error = %e, "corpus skipped");
                }
            }
        }
        records
    }

    /// Run each healthy target's bounded pool; pools for different targets
    /// run concurrently. A store failure halts only the affected target.
    async fn dispatch_all(
        &self,
        store: &ResultStore,
        client: &reqwest::Client,
        healthy: &[Target],
        records: &[CorpusRecord],
        max_workers: usize,
        mode: RunMode,
    ) {
        tracing::info!("starting to send legitimate & malicious requests to WAFs...");

        let mut tasks: JoinSet<()> = JoinSet::new();
        for target in healthy {
            let target = target.clone();
            let records = records.to_vec();
            let store = store.clone();
            let pool = DispatchPool::new(
                client.clone(),
                self.contract.clone(),
                store.clone(),
                max_workers,
                mode,
                self.abort.clone(),
            );

            tasks.spawn(async move {
                // Resume semantics: records already attempted for this
                // target never enter the pool.
                let pending: Vec<CorpusRecord> = match store.existing_record_ids(&target.name).await
                {
                    Ok(existing) => records
                        .into_iter()
                        .filter(|r| !existing.contains(&r.record_id))
                        .collect(),
                    Err(e) => {
                        tracing::error!(waf = %target.name, error = %e, "cannot read prior observations, target halted");
                        return;
                    }
                };

                if let Err(e) = pool.run_target(&target, pending).await {
                    tracing::error!(waf = %target.name, error = %e, "dispatch halted for this target");
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        tracing::info!("finished sending legitimate & malicious requests");
    }

    /// Finalize: compute per-target metrics and report the run summary,
    /// including skipped targets and error rates.
    async fn finalize(
        &self,
        store: &ResultStore,
        healthy: Vec<Target>,
        skipped: Vec<Target>,
        mode: RunMode,
    ) -> EngineResult<RunReport> {
        let mut results = Vec::with_capacity(healthy.len());
        for target in healthy {
            let metrics = metrics::compute(store, &target.name).await?;
            results.push((target, metrics));
        }
        // Best balanced accuracy first; unscorable targets last.
        results.sort_by(|a, b| {
            b.1.balanced_accuracy
                .unwrap_or(f64::NEG_INFINITY)
                .total_cmp(&a.1.balanced_accuracy.unwrap_or(f64::NEG_INFINITY))
        });

        tracing::info!("=== WAF comparison summary ===");
        for (target, m) in &results {
            tracing::info!(
                waf = %target.name,
                tp = m.tp,
                fp = m.fp,
                tn = m.tn,
                fne = m.fne,
                errors = m.error_count,
                tpr = %fmt_rate(m.tpr),
                tnr = %fmt_rate(m.tnr),
                balanced_accuracy = %fmt_rate(m.balanced_accuracy),
                error_rate = %fmt_rate(m.error_rate()),
                "scored"
            );
        }
        for target in &skipped {
            tracing::warn!(
                waf = %target.name,
                reason = target.health_state.skip_reason(),
                "skipped"
            );
        }

        Ok(RunReport { mode, results, skipped })
    }
}
