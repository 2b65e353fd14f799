//! Result Classifier
//!
//! Maps an observed HTTP response (or transport failure) plus the record's
//! ground-truth label into a confusion-matrix cell. The status-to-verdict
//! mapping is an explicit, validated contract supplied at construction, not
//! scattered conditionals: different WAFs block with non-standard status
//! codes and the contract is the single place that knowledge lives.

use crate::error::{EngineError, EngineResult};
use std::collections::HashSet;

/// True nature of a corpus record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundTruth {
    Benign,
    Malicious,
}

impl GroundTruth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Benign => "benign",
            Self::Malicious => "malicious",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "benign" => Some(Self::Benign),
            "malicious" => Some(Self::Malicious),
            _ => None,
        }
    }
}

/// Binary verdict a WAF response maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Blocked,
    Allowed,
}

/// Transport-level failure kinds recorded instead of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    ConnectionFailed,
    MalformedResponse,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionFailed => "connection_failed",
            Self::MalformedResponse => "malformed_response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(Self::Timeout),
            "connection_failed" => Some(Self::ConnectionFailed),
            "malformed_response" => Some(Self::MalformedResponse),
            _ => None,
        }
    }
}

/// Confusion-matrix cell for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    TruePositive,
    FalsePositive,
    TrueNegative,
    FalseNegative,
    /// Transport failure; excluded from TPR/TNR denominators and reported
    /// separately as an error rate.
    Error,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TruePositive => "true_positive",
            Self::FalsePositive => "false_positive",
            Self::TrueNegative => "true_negative",
            Self::FalseNegative => "false_negative",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "true_positive" => Some(Self::TruePositive),
            "false_positive" => Some(Self::FalsePositive),
            "true_negative" => Some(Self::TrueNegative),
            "false_negative" => Some(Self::FalseNegative),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Status-code-to-verdict contract.
///
/// A status in `block_statuses`, or a response body containing
/// `block_body_marker`, is `Blocked`. Any 2xx/3xx status is `Allowed`.
/// Every other status falls back to `fallback`, which defaults to `Allowed`:
/// only an explicit block signal counts as blocking, so a misconfigured
/// backend answering 500 does not inflate a WAF's detection rate.
#[derive(Debug, Clone)]
pub struct VerdictContract {
    block_statuses: HashSet<u16>,
    block_body_marker: Option<String>,
    fallback: Verdict,
}

impl Default for VerdictContract {
    fn default() -> Self {
        Self {
            block_statuses: HashSet::from([403, 406]),
            // Classic F5/BIG-IP block page marker, kept for parity with
            // WAFs that block with a 200 error page.
            block_body_marker: Some(
                "The requested URL was rejected. Please consult with your administrator."
                    .to_string(),
            ),
            fallback: Verdict::Allowed,
        }
    }
}

impl VerdictContract {
    /// Build a validated contract. A block status inside the 2xx/3xx allowed
    /// range would make the mapping ambiguous and is rejected.
    pub fn new(
        block_statuses: HashSet<u16>,
        block_body_marker: Option<String>,
        fallback: Verdict,
    ) -> EngineResult<Self> {
        if block_statuses.is_empty() {
            return Err(EngineError::Config(
                "verdict contract requires at least one block status".to_string(),
            ));
        }
        if let Some(status) = block_statuses.iter().find(|s| (200..400).contains(*s)) {
            return Err(EngineError::Config(format!(
                "block status {status} conflicts with the 2xx/3xx allowed range"
            )));
        }
        Ok(Self { block_statuses, block_body_marker, fallback })
    }

    /// Map a response to a verdict. Total: every status code maps to exactly
    /// one verdict.
    pub fn verdict(&self, status: u16, body: &str) -> Verdict {
        if self.block_statuses.contains(&status) {
            return Verdict::Blocked;
        }
        if let Some(marker) = &self.block_body_marker {
            if body.contains(marker.as_str()) {
                return Verdict::Blocked;
            }
        }
        if (200..400).contains(&status) {
            Verdict::Allowed
        } else {
            self.fallback
        }
    }
}

/// Pure classification of one outcome.
pub fn classify(
    ground_truth: GroundTruth,
    verdict: Option<Verdict>,
    error_kind: Option<ErrorKind>,
) -> Classification {
    if error_kind.is_some() {
        return Classification::Error;
    }
    match (ground_truth, verdict) {
        (GroundTruth::Malicious, Some(Verdict::Blocked)) => Classification::TruePositive,
        (GroundTruth::Malicious, Some(Verdict::Allowed)) => Classification::FalseNegative,
        (GroundTruth::Benign, Some(Verdict::Blocked)) => Classification::FalsePositive,
        (GroundTruth::Benign, Some(Verdict::Allowed)) => Classification::TrueNegative,
        // No verdict and no error kind cannot be produced by the dispatcher;
        // treat it as a transport error rather than invent a verdict.
        (_, None) => Classification::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_contract_blocks_403_and_406() {
        let contract = VerdictContract::default();
        assert_eq!(contract.verdict(403, ""), Verdict::Blocked);
        assert_eq!(contract.verdict(406, ""), Verdict::Blocked);
        assert_eq!(contract.verdict(200, ""), Verdict::Allowed);
        assert_eq!(contract.verdict(301, ""), Verdict::Allowed);
    }

    #[test]
    fn body_marker_blocks_even_on_200() {
        let contract = VerdictContract::default();
        let body = "<html>The requested URL was rejected. Please consult with your administrator.</html>";
        assert_eq!(contract.verdict(200, body), Verdict::Blocked);
    }

    #[test]
    fn unlisted_statuses_fall_back_to_allowed() {
        let contract = VerdictContract::default();
        assert_eq!(contract.verdict(500, ""), Verdict::Allowed);
        assert_eq!(contract.verdict(404, ""), Verdict::Allowed);
        assert_eq!(contract.verdict(418, ""), Verdict::Allowed);
    }

    #[test]
    fn contract_rejects_block_status_in_allowed_range() {
        let err = VerdictContract::new(HashSet::from([302]), None, Verdict::Allowed);
        assert!(err.is_err());

        let err = VerdictContract::new(HashSet::new(), None, Verdict::Allowed);
        assert!(err.is_err());
    }

    #[test]
    fn confusion_matrix_mapping() {
        assert_eq!(
            classify(GroundTruth::Malicious, Some(Verdict::Blocked), None),
            Classification::TruePositive
        );
        assert_eq!(
            classify(GroundTruth::Malicious, Some(Verdict::Allowed), None),
            Classification::FalseNegative
        );
        assert_eq!(
            classify(GroundTruth::Benign, Some(Verdict::Blocked), None),
            Classification::FalsePositive
        );
        assert_eq!(
            classify(GroundTruth::Benign, Some(Verdict::Allowed), None),
            Classification::TrueNegative
        );
    }

    #[test]
    fn transport_error_wins_over_any_verdict() {
        assert_eq!(
            classify(GroundTruth::Malicious, Some(Verdict::Blocked), Some(ErrorKind::Timeout)),
            Classification::Error
        );
        assert_eq!(classify(GroundTruth::Benign, None, None), Classification::Error);
    }
}
