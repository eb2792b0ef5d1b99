//! Core data model for specq: changes, tasks, votes, and log events.
//!
//! These types are shared between the scanner, the pipeline loop, the
//! state store, and the CLI. They carry no behavior beyond small,
//! total helper methods (risk ranking, status classification) — the
//! pipeline and aggregator own all decision logic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`WorkItem`].
///
/// Transitions are owned by the pipeline loop; this type only names
/// the legal values and classifies which ones are terminal for a
/// single pipeline cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    Blocked,
    Ready,
    Compiling,
    Running,
    Verifying,
    NeedsReview,
    Accepted,
    Rejected,
    Failed,
    Skipped,
}

impl Status {
    /// True for statuses the pipeline loop never advances out of on
    /// its own — they end a cycle's handling of this change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Accepted | Status::Failed | Status::Skipped | Status::NeedsReview
        )
    }

    /// True for statuses reached only while work is actively
    /// in-flight. Status reconciliation must never move an item out
    /// of one of these except by the pipeline itself finishing that
    /// stage.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Status::Compiling | Status::Running | Status::Verifying
        )
    }
}

/// Declared risk level of a change. Governs the default verification
/// strategy and whether a passing vote still needs human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    #[default]
    Medium,
    High,
}

impl Risk {
    /// Ordering used by the scheduler's tie-break key: low risk
    /// sorts first among otherwise-equal ready items.
    pub fn rank(self) -> u8 {
        match self {
            Risk::Low => 0,
            Risk::Medium => 1,
            Risk::High => 2,
        }
    }
}

/// How a verification committee's votes are combined into a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStrategy {
    /// No committee is run; the change is approved unconditionally.
    Skip,
    /// Approved once more than half the voters return `pass`.
    Majority,
    /// Approved only when every voter returns `pass`.
    Unanimous,
}

/// One reviewer's verdict on a voter, before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// The voter's response could not be parsed or the voter itself
    /// raised; always counts as not-pass during aggregation.
    Error,
}

/// Severity of one voter [`Finding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A single reviewer observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: String,
    pub description: String,
}

/// The outcome of one voter's review of one diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResult {
    /// `"{provider}/{model}"`, or `"claude_code/{model}"` for the
    /// local-CLI voter.
    pub voter: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub summary: String,
}

impl VoteResult {
    /// Build an `error` verdict for a voter that raised or whose
    /// response failed to parse. Findings and confidence are always
    /// empty/zero for this variant.
    pub fn error(voter: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            voter: voter.into(),
            verdict: Verdict::Error,
            confidence: 0.0,
            findings: Vec::new(),
            summary: summary.into(),
        }
    }
}

/// Provider/model pair identifying one configured voter or compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

/// One task within a change. Tasks execute in source (declaration)
/// order, never sorted by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub execution_output: String,
    #[serde(default)]
    pub turns_used: u32,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub duration_sec: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: Status::Pending,
            files_changed: Vec::new(),
            commit_hash: String::new(),
            execution_output: String::new(),
            turns_used: 0,
            tokens_in: 0,
            tokens_out: 0,
            duration_sec: 0.0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A change to be orchestrated: a proposal plus an ordered list of
/// tasks, tracked through the pipeline state machine.
///
/// `id` is the change's directory name and is never reassigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub change_dir: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub risk: Risk,

    /// Per-change override of the global executor config; empty
    /// string means "use the resolved [`Config`] default".
    #[serde(default)]
    pub executor_type: String,
    #[serde(default)]
    pub executor_model: String,
    #[serde(default)]
    pub executor_max_turns: u32,
    #[serde(default)]
    pub executor_tools: Vec<String>,
    /// `None` means "resolve from the risk policy table".
    #[serde(default)]
    pub verification_strategy: Option<VerificationStrategy>,
    #[serde(default)]
    pub voters: Vec<ModelRef>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_duration_sec")]
    pub max_duration_sec: u64,

    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub vote_results: Vec<VoteResult>,
    #[serde(default)]
    pub compiled_brief: String,
    #[serde(default)]
    pub error_message: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_duration_sec() -> u64 {
    600
}

impl WorkItem {
    /// Construct a freshly-scanned item with source-of-truth defaults.
    /// The caller (scanner) still has to apply front-matter overrides.
    pub fn new(id: impl Into<String>, change_dir: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            change_dir: change_dir.into(),
            title: String::new(),
            description: String::new(),
            deps: Vec::new(),
            priority: 0,
            risk: Risk::Medium,
            executor_type: String::new(),
            executor_model: String::new(),
            executor_max_turns: 0,
            executor_tools: Vec::new(),
            verification_strategy: None,
            voters: Vec::new(),
            max_retries: default_max_retries(),
            max_duration_sec: default_max_duration_sec(),
            status: Status::Pending,
            tasks: Vec::new(),
            retry_count: 0,
            vote_results: Vec::new(),
            compiled_brief: String::new(),
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Vote results recorded for a specific retry attempt
    /// (`retry_count + 1` when the attempt is current).
    pub fn votes_for_attempt(&self, attempt: u32) -> Vec<&VoteResult> {
        // Attempt numbering isn't carried on VoteResult itself here —
        // the store keys by attempt; in-memory WorkItems only ever
        // hold the votes for the most recent attempt at a time.
        let _ = attempt;
        self.vote_results.iter().collect()
    }
}

/// Outcome of driving one agent subprocess to completion. Produced by
/// the agent client, consumed by the executor and the voter committee.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRun {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub duration_sec: f64,
}

/// Outcome of one executor invocation: an [`AgentRun`] plus the git
/// fingerprint of whatever the agent committed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub duration_sec: f64,
    #[serde(default)]
    pub turns_used: u32,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
}

/// Final decision produced by the aggregator for one verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    NeedsReview,
}

/// One append-only entry in a change's run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub change_id: String,
    pub event: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(change_id: impl Into<String>, event: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            change_id: change_id.into(),
            event: event.into(),
            detail,
            created_at: Utc::now(),
        }
    }
}

/// Webhook event names the notifier dispatches on. Kept as plain
/// strings on the wire (matching the configured `notify.events`
/// allow-list) but enumerated here so callers don't typo them.
pub mod webhook_events {
    pub const CHANGE_COMPLETED: &str = "change.completed";
    pub const CHANGE_NEEDS_REVIEW: &str = "change.needs_review";
    pub const CHANGE_FAILED: &str = "change.failed";
}

/// A resolved map of risk → default verification strategy, as loaded
/// from config. Kept here (rather than in the config crate module) so
/// both the config loader and the aggregator can share one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicy(pub BTreeMap<Risk, VerificationStrategy>);

impl Default for RiskPolicy {
    fn default() -> Self {
        let mut m = BTreeMap::new();
        m.insert(Risk::Low, VerificationStrategy::Skip);
        m.insert(Risk::Medium, VerificationStrategy::Majority);
        m.insert(Risk::High, VerificationStrategy::Unanimous);
        Self(m)
    }
}

impl RiskPolicy {
    pub fn strategy_for(&self, risk: Risk) -> VerificationStrategy {
        self.0.get(&risk).copied().unwrap_or(VerificationStrategy::Majority)
    }
}

// `Risk` needs a total order to live as a BTreeMap key; `Eq` is
// already derived above.
impl PartialOrd for Risk {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Risk {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_rank_orders_low_medium_high() {
        assert!(Risk::Low.rank() < Risk::Medium.rank());
        assert!(Risk::Medium.rank() < Risk::High.rank());
    }

    #[test]
    fn status_terminal_classification() {
        assert!(Status::Accepted.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Skipped.is_terminal());
        assert!(Status::NeedsReview.is_terminal());
        assert!(!Status::Ready.is_terminal());
        assert!(!Status::Pending.is_terminal());
    }

    #[test]
    fn status_transient_classification() {
        assert!(Status::Running.is_transient());
        assert!(Status::Verifying.is_transient());
        assert!(Status::Compiling.is_transient());
        assert!(!Status::Ready.is_transient());
    }

    #[test]
    fn default_risk_policy_matches_spec_table() {
        let policy = RiskPolicy::default();
        assert_eq!(policy.strategy_for(Risk::Low), VerificationStrategy::Skip);
        assert_eq!(policy.strategy_for(Risk::Medium), VerificationStrategy::Majority);
        assert_eq!(policy.strategy_for(Risk::High), VerificationStrategy::Unanimous);
    }

    #[test]
    fn work_item_round_trips_through_json() {
        let item = WorkItem::new("add-thing", "changes/add-thing");
        let json = serde_json::to_string(&item).expect("serialize");
        let back: WorkItem = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.id, item.id);
        assert_eq!(back.status, item.status);
        assert_eq!(back.max_retries, item.max_retries);
    }

    #[test]
    fn vote_error_has_zero_confidence_and_no_findings() {
        let v = VoteResult::error("anthropic/claude", "boom");
        assert_eq!(v.verdict, Verdict::Error);
        assert_eq!(v.confidence, 0.0);
        assert!(v.findings.is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn change_id_strategy() -> impl Strategy<Value = String> {
            "[a-z][a-z0-9-]{0,23}"
        }

        proptest! {
            #[test]
            fn status_roundtrip(
                status in prop_oneof![
                    Just(Status::Pending),
                    Just(Status::Blocked),
                    Just(Status::Ready),
                    Just(Status::Compiling),
                    Just(Status::Running),
                    Just(Status::Verifying),
                    Just(Status::NeedsReview),
                    Just(Status::Accepted),
                    Just(Status::Rejected),
                    Just(Status::Failed),
                    Just(Status::Skipped),
                ]
            ) {
                let json = serde_json::to_string(&status).unwrap();
                let parsed: Status = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(status, parsed);
            }

            #[test]
            fn risk_roundtrip(
                risk in prop_oneof![Just(Risk::Low), Just(Risk::Medium), Just(Risk::High)]
            ) {
                let json = serde_json::to_string(&risk).unwrap();
                let parsed: Risk = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(risk, parsed);
            }

            #[test]
            fn risk_rank_is_strictly_monotonic(
                a in prop_oneof![Just(Risk::Low), Just(Risk::Medium), Just(Risk::High)],
                b in prop_oneof![Just(Risk::Low), Just(Risk::Medium), Just(Risk::High)],
            ) {
                prop_assert_eq!(a.rank() < b.rank(), a < b);
            }

            #[test]
            fn work_item_roundtrip_preserves_id_and_deps(
                id in change_id_strategy(),
                deps in prop::collection::vec(change_id_strategy(), 0..4),
            ) {
                let mut item = WorkItem::new(id.clone(), format!("changes/{id}"));
                item.deps = deps.clone();
                let json = serde_json::to_string(&item).unwrap();
                let back: WorkItem = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(back.id, item.id);
                prop_assert_eq!(back.deps, item.deps);
            }

            #[test]
            fn vote_error_always_has_zero_confidence(
                voter in "[a-z/.-]{1,40}",
                reason in ".{0,80}",
            ) {
                let v = VoteResult::error(voter, reason);
                prop_assert_eq!(v.verdict, Verdict::Error);
                prop_assert_eq!(v.confidence, 0.0);
            }
        }
    }
}
