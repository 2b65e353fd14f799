//! Scoring Aggregator
//!
//! Pure read over persisted observations, recomputed fresh on every call so
//! the score always reflects the latest stored state, including rows added
//! by a resumed run. Never cached, never persisted: the observations are the
//! single source of truth.

use crate::error::EngineResult;
use crate::store::ResultStore;

/// Detection-quality metrics for one target.
///
/// Error observations are excluded from both denominators and reported as a
/// separate error rate: a broken target must not read as either a good or a
/// bad detector. Rates are `None` when their denominator is zero; callers
/// report "n/a" rather than coercing to 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub tp: i64,
    pub fp: i64,
    pub tn: i64,
    pub fne: i64,
    pub error_count: i64,
    pub total: i64,
    pub tpr: Option<f64>,
    pub tnr: Option<f64>,
    pub balanced_accuracy: Option<f64>,
}

impl Metrics {
    fn from_counts(tp: i64, fp: i64, tn: i64, fne: i64, error_count: i64) -> Self {
        let tpr = rate(tp, tp + fne);
        let tnr = rate(tn, tn + fp);
        let balanced_accuracy = match (tpr, tnr) {
            (Some(tpr), Some(tnr)) => Some((tpr + tnr) / 2.0),
            _ => None,
        };
        Self {
            tp,
            fp,
            tn,
            fne,
            error_count,
            total: tp + fp + tn + fne + error_count,
            tpr,
            tnr,
            balanced_accuracy,
        }
    }

    /// Share of dispatched requests that ended in a transport error.
    pub fn error_rate(&self) -> Option<f64> {
        rate(self.error_count, self.total)
    }
}

fn rate(numerator: i64, denominator: i64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Compute metrics for one target from its persisted observations.
pub async fn compute(store: &ResultStore, target_name: &str) -> EngineResult<Metrics> {
    let counts = store.classification_counts(target_name).await?;
    Ok(Metrics::from_counts(counts.tp, counts.fp, counts.tn, counts.fne, counts.errors))
}

/// Format an optional rate as a percentage for the run summary.
pub fn fmt_rate(rate: Option<f64>) -> String {
    match rate {
        Some(value) => format!("{:.1}%", value * 100.0),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_by_two_scenario_scores_half() {
        // m1 blocked, m2 allowed, l1 blocked, l2 allowed.
        let metrics = Metrics::from_counts(1, 1, 1, 1, 0);
        assert_eq!(metrics.tpr, Some(0.5));
        assert_eq!(metrics.tnr, Some(0.5));
        assert_eq!(metrics.balanced_accuracy, Some(0.5));
        assert_eq!(metrics.total, 4);
    }

    #[test]
    fn empty_denominators_are_reported_not_zeroed() {
        // No malicious records dispatched at all.
        let metrics = Metrics::from_counts(0, 1, 3, 0, 0);
        assert_eq!(metrics.tpr, None);
        assert_eq!(metrics.tnr, Some(0.75));
        assert_eq!(metrics.balanced_accuracy, None);
        assert_eq!(fmt_rate(metrics.tpr), "n/a");

        let empty = Metrics::from_counts(0, 0, 0, 0, 0);
        assert_eq!(empty.tpr, None);
        assert_eq!(empty.tnr, None);
        assert_eq!(empty.error_rate(), None);
    }

    #[test]
    fn errors_excluded_from_rate_denominators() {
        let metrics = Metrics::from_counts(2, 0, 0, 2, 6);
        assert_eq!(metrics.tpr, Some(0.5));
        assert_eq!(metrics.error_rate(), Some(0.6));
        assert_eq!(metrics.total, 10);
    }

    #[test]
    fn rates_stay_in_unit_interval() {
        for (tp, fp, tn, fne, err) in
            [(5, 0, 0, 0, 0), (0, 5, 0, 5, 0), (1, 2, 3, 4, 5), (100, 1, 1, 100, 7)]
        {
            let m = Metrics::from_counts(tp, fp, tn, fne, err);
            for r in [m.tpr, m.tnr, m.balanced_accuracy].into_iter().flatten() {
                assert!((0.0..=1.0).contains(&r));
            }
        }
    }
}
