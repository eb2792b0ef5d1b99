//! Combines voter committee results into one decision.
//!
//! A pure function of its inputs (§8 invariant 6): no I/O, no clock,
//! no hidden state.

use specq_types::{Decision, Finding, Risk, RiskPolicy, Severity, Verdict, VerificationStrategy, VoteResult};

/// Resolve the strategy to run for one change: a non-empty per-change
/// override wins, otherwise fall back to the risk policy table.
pub fn resolve_strategy(
    override_strategy: Option<VerificationStrategy>,
    risk: Risk,
    policy: &RiskPolicy,
) -> VerificationStrategy {
    override_strategy.unwrap_or_else(|| policy.strategy_for(risk))
}

/// Aggregate a committee's votes into a decision and the merged
/// finding list, per the rules in order:
///   1. `skip` always approves with no findings.
///   2. Zero voters rejects.
///   3. `majority`/`unanimous` thresholds on `pass` count (an `error`
///      verdict never counts as a pass).
///   4. A passing vote still escalates to `needs_review` when any
///      finding is `critical`, or the change is high risk.
pub fn aggregate(votes: &[VoteResult], strategy: VerificationStrategy, risk: Risk) -> (Decision, Vec<Finding>) {
    if strategy == VerificationStrategy::Skip {
        return (Decision::Approved, Vec::new());
    }

    let all_findings: Vec<Finding> = votes.iter().flat_map(|v| v.findings.clone()).collect();

    if votes.is_empty() {
        return (Decision::Rejected, all_findings);
    }

    let total = votes.len();
    let passed = votes.iter().filter(|v| v.verdict == Verdict::Pass).count();
    let passed_threshold = match strategy {
        VerificationStrategy::Majority => passed * 2 > total,
        VerificationStrategy::Unanimous => passed == total,
        VerificationStrategy::Skip => unreachable!("handled above"),
    };

    if !passed_threshold {
        return (Decision::Rejected, all_findings);
    }

    let has_critical = all_findings.iter().any(|f| f.severity == Severity::Critical);
    if has_critical || risk == Risk::High {
        return (Decision::NeedsReview, all_findings);
    }

    (Decision::Approved, all_findings)
}
