//! Health Checker
//!
//! Gates each target before any dispatch: first a plain reachability probe,
//! then a canary request that must be blocked to prove the WAF is operating
//! in prevention mode rather than detection-only. A failed check skips the
//! target; it never aborts the run for the others.

use crate::classify::{Verdict, VerdictContract};
use crate::config::{CANARY_PATH, HEALTH_CHECK_USER_AGENT};
use crate::store::{HealthState, Target};

pub struct HealthChecker {
    client: reqwest::Client,
    contract: VerdictContract,
}

impl HealthChecker {
    pub fn new(client: reqwest::Client, contract: VerdictContract) -> Self {
        Self { client, contract }
    }

    /// Run both checks in order. Returns the state the target ends up in;
    /// the caller persists it and decides whether to dispatch.
    pub async fn check(&self, target: &Target) -> HealthState {
        tracing::debug!(
            waf = %target.name,
            "initiating WAF health and functionality checks to verify connectivity and confirm prevention mode"
        );

        // Reachability: any HTTP response counts, including non-2xx. A WAF
        // fronting a broken backend is still a reachable WAF.
        let reachable = self
            .client
            .get(&target.base_url)
            .header(reqwest::header::USER_AGENT, HEALTH_CHECK_USER_AGENT)
            .send()
            .await;

        match reachable {
            Ok(response) => {
                tracing::info!(waf = %target.name, status = response.status().as_u16(), "health check passed");
            }
            Err(e) => {
                tracing::error!(
                    waf = %target.name,
                    error = %e,
                    "health check failed - please ensure the WAF allows requests to {}",
                    target.base_url
                );
                return HealthState::Unreachable;
            }
        }

        // Prevention-mode confirmation: the canary must come back blocked.
        let canary_url = format!("{}{}", target.base_url.trim_end_matches('/'), CANARY_PATH);
        let canary = self
            .client
            .get(&canary_url)
            .header(reqwest::header::USER_AGENT, HEALTH_CHECK_USER_AGENT)
            .send()
            .await;

        let response = match canary {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(waf = %target.name, error = %e, "canary request failed to complete");
                return HealthState::Unreachable;
            }
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        match self.contract.verdict(status, &body) {
            Verdict::Blocked => {
                tracing::info!(waf = %target.name, "WAF functionality check passed");
                HealthState::Healthy
            }
            Verdict::Allowed => {
                tracing::error!(
                    waf = %target.name,
                    status,
                    "WAF functionality check failed - please ensure the WAF blocks the following payload: {canary_url}"
                );
                HealthState::NotInPreventionMode
            }
        }
    }
}
