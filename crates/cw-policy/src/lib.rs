#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanAction {
    Proceed,
    AutoAggregate,
    CapLimit,
    Fallback,
}

/// One recorded policy decision. The subject names the decision point,
/// the detail carries the inputs that drove it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: ScanAction,
    pub subject: String,
    pub detail: String,
}

/// Caller-visible audit trail of policy decisions, threaded through the
/// chart operations the way the store threads its page requests: created
/// by the caller, appended to by the policy, inspected afterwards.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionLog {
    records: Vec<Decision>,
}

impl DecisionLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Decision) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[Decision] {
        &self.records
    }
}

/// Outcome of a series-admission check. `AutoAggregate` and `CapLimit`
/// carry the row limit the derived request must not exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDecision {
    Proceed,
    AutoAggregate { limit: usize },
    CapLimit { limit: usize },
}

/// Thresholds for bounding chart scan cost and payload size. These are
/// heuristics, not correctness rules: a decision other than `Proceed`
/// must only ever shrink the work a derived request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPolicy {
    /// Above this many matching rows, an aggregation-free request is
    /// given a default aggregation.
    pub auto_aggregate_rows: u64,
    /// Row cap applied together with the default aggregation.
    pub auto_aggregate_limit: usize,
    /// Above this many matching rows, the scan limit is capped.
    pub capped_scan_rows: u64,
    /// The cap applied for merely-large scans.
    pub capped_scan_limit: usize,
    /// Matching-row count above which validation warns.
    pub warn_rows: u64,
    /// Point budget for chart previews.
    pub preview_points: usize,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            auto_aggregate_rows: 5_000,
            auto_aggregate_limit: 1_000,
            capped_scan_rows: 1_000,
            capped_scan_limit: 2_000,
            warn_rows: 10_000,
            preview_points: 50,
        }
    }
}

impl ScanPolicy {
    pub fn decide_series_admission(
        &self,
        matching_rows: u64,
        has_aggregation: bool,
        log: &mut DecisionLog,
    ) -> ScanDecision {
        let (decision, action) = if matching_rows > self.auto_aggregate_rows && !has_aggregation {
            (
                ScanDecision::AutoAggregate {
                    limit: self.auto_aggregate_limit,
                },
                ScanAction::AutoAggregate,
            )
        } else if matching_rows > self.capped_scan_rows {
            (
                ScanDecision::CapLimit {
                    limit: self.capped_scan_limit,
                },
                ScanAction::CapLimit,
            )
        } else {
            (ScanDecision::Proceed, ScanAction::Proceed)
        };

        log.push(Decision {
            action,
            subject: "series_admission".to_owned(),
            detail: format!("matching_rows={matching_rows}, has_aggregation={has_aggregation}"),
        });

        decision
    }

    /// Record that the admission check itself failed and the original
    /// request is being used unmodified.
    pub fn record_fallback(&self, detail: impl Into<String>, log: &mut DecisionLog) {
        log.push(Decision {
            action: ScanAction::Fallback,
            subject: "series_admission".to_owned(),
            detail: detail.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{DecisionLog, ScanAction, ScanDecision, ScanPolicy};

    #[test]
    fn large_unaggregated_scans_get_auto_aggregation() {
        let mut log = DecisionLog::new();
        let policy = ScanPolicy::default();

        let decision = policy.decide_series_admission(8_000, false, &mut log);
        assert_eq!(decision, ScanDecision::AutoAggregate { limit: 1_000 });
        assert_eq!(log.records()[0].action, ScanAction::AutoAggregate);
    }

    #[test]
    fn large_aggregated_scans_only_get_a_limit_cap() {
        let mut log = DecisionLog::new();
        let policy = ScanPolicy::default();

        let decision = policy.decide_series_admission(8_000, true, &mut log);
        assert_eq!(decision, ScanDecision::CapLimit { limit: 2_000 });
    }

    #[test]
    fn small_scans_proceed_untouched_but_are_still_recorded() {
        let mut log = DecisionLog::new();
        let policy = ScanPolicy::default();

        let decision = policy.decide_series_admission(500, false, &mut log);
        assert_eq!(decision, ScanDecision::Proceed);
        assert_eq!(log.records().len(), 1);
    }

    #[test]
    fn boundary_counts_do_not_trigger_optimization() {
        let mut log = DecisionLog::new();
        let policy = ScanPolicy::default();

        assert_eq!(
            policy.decide_series_admission(5_000, false, &mut log),
            ScanDecision::CapLimit { limit: 2_000 }
        );
        assert_eq!(
            policy.decide_series_admission(1_000, false, &mut log),
            ScanDecision::Proceed
        );
    }
}
