//! Dispatch Pool
//!
//! Drives up to `max_workers` concurrently in-flight requests per target,
//! replaying corpus records verbatim and handing each outcome through the
//! classifier into the store. Workers race, so completion order is
//! unconstrained; the store's keyed upsert makes that irrelevant.
//!
//! Transport failures are observations, not errors: a WAF that times out or
//! resets connections under malicious traffic is producing signal the
//! benchmark wants to keep. Requests are never retried for the same reason.
//! Only a store failure stops a target's dispatch.

use crate::classify::{classify, ErrorKind, Verdict, VerdictContract};
use crate::config::RunMode;
use crate::corpus::CorpusRecord;
use crate::error::{EngineError, EngineResult};
use crate::store::{Observation, ResultStore, Target};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Summary of one target's dispatch phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub dispatched: usize,
    pub errors: usize,
    pub aborted: bool,
}

pub struct DispatchPool {
    client: reqwest::Client,
    contract: VerdictContract,
    store: ResultStore,
    max_workers: usize,
    mode: RunMode,
    abort: watch::Receiver<bool>,
}

impl DispatchPool {
    pub fn new(
        client: reqwest::Client,
        contract: VerdictContract,
        store: ResultStore,
        max_workers: usize,
        mode: RunMode,
        abort: watch::Receiver<bool>,
    ) -> Self {
        Self { client, contract, store, max_workers: max_workers.max(1), mode, abort }
    }

    /// Replay `records` against one target. The input is already filtered to
    /// records without an observation for this target. Returns early only on
    /// a store failure; an abort signal stops admission but drains in-flight
    /// requests so no observation is lost mid-write.
    pub async fn run_target(
        &self,
        target: &Target,
        records: Vec<CorpusRecord>,
    ) -> EngineResult<DispatchStats> {
        let total = records.len();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks: JoinSet<EngineResult<bool>> = JoinSet::new();
        let mut stats = DispatchStats::default();
        let mut store_error = None;

        tracing::info!(waf = %target.name, records = total, "dispatching corpus records");

        for record in records {
            if *self.abort.borrow() {
                stats.aborted = true;
                tracing::warn!(waf = %target.name, "abort requested, no further requests will be issued");
                break;
            }

            // Collect any finished workers before admitting more; a store
            // failure must halt this target promptly.
            while let Some(joined) = tasks.try_join_next() {
                record_outcome(&mut stats, &mut store_error, joined);
            }
            if store_error.is_some() {
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                // Closed semaphore means shutdown; treat like an abort.
                Err(_) => {
                    stats.aborted = true;
                    break;
                }
            };

            let client = self.client.clone();
            let contract = self.contract.clone();
            let store = self.store.clone();
            let mode = self.mode;
            let target_name = target.name.clone();
            let base_url = target.base_url.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let (http_status, error_kind, verdict) =
                    send_probe(&client, &contract, &base_url, &record).await;

                let observation = Observation {
                    target_name,
                    record_id: record.record_id.clone(),
                    corpus: record.corpus,
                    ground_truth: record.ground_truth(),
                    http_status,
                    error_kind,
                    classification: classify(record.ground_truth(), verdict, error_kind),
                    test_name: record.test_name.clone(),
                    observed_at: Utc::now(),
                };

                store.upsert(&observation, mode).await?;
                Ok(error_kind.is_some())
            });
        }

        // Drain everything still in flight.
        while let Some(joined) = tasks.join_next().await {
            record_outcome(&mut stats, &mut store_error, joined);
        }

        if let Some(e) = store_error {
            tracing::error!(waf = %target.name, error = %e, "store failure, halting dispatch for this target");
            return Err(e);
        }

        tracing::info!(
            waf = %target.name,
            dispatched = stats.dispatched,
            errors = stats.errors,
            "finished sending requests"
        );
        Ok(stats)
    }
}

fn record_outcome(
    stats: &mut DispatchStats,
    store_error: &mut Option<EngineError>,
    joined: Result<EngineResult<bool>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(was_error)) => {
            stats.dispatched += 1;
            stats.errors += usize::from(was_error);
        }
        Ok(Err(e)) => *store_error = Some(e),
        // A panicking worker stored nothing, so it must not count as
        // dispatched or the stats drift from the persisted rows.
        Err(join_error) => {
            tracing::error!(error = %join_error, "dispatch worker failed");
        }
    }
}

/// Issue one request exactly as recorded and read the response far enough to
/// apply the verdict contract.
async fn send_probe(
    client: &reqwest::Client,
    contract: &VerdictContract,
    base_url: &str,
    record: &CorpusRecord,
) -> (Option<u16>, Option<ErrorKind>, Option<Verdict>) {
    // Validated at corpus load; a failure here means the record was mutated
    // in memory, which we record rather than panic on.
    let Ok(method) = reqwest::Method::from_bytes(record.method.as_bytes()) else {
        return (None, Some(ErrorKind::MalformedResponse), None);
    };

    let url = format!("{}{}", base_url.trim_end_matches('/'), record.path);
    let mut request = client.request(method, &url);
    for (name, value) in &record.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if !record.body.is_empty() {
        request = request.body(record.body.clone());
    }

    let started = Instant::now();
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return (None, Some(map_send_error(&e)), None),
    };

    let status = response.status().as_u16();
    // The body is needed for contracts that match a block-page marker.
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) if e.is_timeout() => return (Some(status), Some(ErrorKind::Timeout), None),
        Err(_) => return (Some(status), Some(ErrorKind::MalformedResponse), None),
    };

    tracing::trace!(
        record = %record.record_id,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );

    (Some(status), None, Some(contract.verdict(status, &body)))
}

fn map_send_error(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_connect() || e.is_request() {
        ErrorKind::ConnectionFailed
    } else {
        ErrorKind::MalformedResponse
    }
}
