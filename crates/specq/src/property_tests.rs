//! Property-based tests for invariants that should hold across the
//! scheduler and aggregator for all inputs, not just the handful of
//! fixtures covered by the unit tests alongside each module.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use specq_types::{Decision, Finding, Risk, Severity, Status, Verdict, VerificationStrategy, VoteResult, WorkItem};

    fn change_id_strategy() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,9}"
    }

    /// Build a small acyclic chain `id -> id-1 -> id-2 -> ...` so the
    /// generated graph is always valid input to [`crate::dag::Dag::build`].
    fn chain_strategy() -> impl Strategy<Value = Vec<WorkItem>> {
        (1usize..8).prop_flat_map(|n| {
            change_id_strategy().prop_map(move |prefix| {
                (0..n)
                    .map(|i| {
                        let id = format!("{prefix}-{i}");
                        let mut item = WorkItem::new(id, "changes/x");
                        if i > 0 {
                            item.deps = vec![format!("{prefix}-{}", i - 1)];
                        }
                        item
                    })
                    .collect::<Vec<_>>()
            })
        })
    }

    proptest! {
        /// Property: change state serialization roundtrips correctly.
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

        /// Property: for every dependency edge `a -> b` in a validated
        /// graph, `b` appears before `a` in the topological order.
        #[test]
        fn topo_order_respects_edges(items in chain_strategy()) {
            let dag = crate::dag::Dag::build(&items).expect("chain is acyclic by construction");
            let order = dag.topo_order();
            let position: std::collections::BTreeMap<&str, usize> =
                order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

            for item in &items {
                for dep in &item.deps {
                    prop_assert!(position[dep.as_str()] < position[item.id.as_str()]);
                }
            }
        }

        /// Property: unlock_count of the tail of a chain is never
        /// smaller than the unlock_count of an item closer to the head.
        #[test]
        fn unlock_count_decreases_toward_the_tail(items in chain_strategy()) {
            let dag = crate::dag::Dag::build(&items).expect("chain is acyclic by construction");
            for pair in items.windows(2) {
                let earlier = dag.unlock_count(&pair[0].id);
                let later = dag.unlock_count(&pair[1].id);
                prop_assert!(earlier >= later);
            }
        }

        /// Property: majority aggregation only ever approves or escalates
        /// a change when strictly more than half the votes passed.
        #[test]
        fn majority_requires_strict_majority(
            passed in 0usize..10,
            failed in 0usize..10,
        ) {
            let votes: Vec<VoteResult> = (0..passed)
                .map(|i| VoteResult { voter: format!("v{i}"), verdict: Verdict::Pass, confidence: 1.0, findings: Vec::new(), summary: String::new() })
                .chain((0..failed).map(|i| VoteResult { voter: format!("f{i}"), verdict: Verdict::Fail, confidence: 1.0, findings: Vec::new(), summary: String::new() }))
                .collect();
            prop_assume!(!votes.is_empty());

            let (decision, _) = crate::aggregator::aggregate(&votes, VerificationStrategy::Majority, Risk::Low);
            let total = votes.len();
            let approved_or_review = matches!(decision, Decision::Approved | Decision::NeedsReview);
            prop_assert_eq!(approved_or_review, passed * 2 > total);
        }

        /// Property: a critical finding always escalates a passing vote
        /// to needs_review, regardless of declared risk.
        #[test]
        fn critical_finding_always_escalates(risk in prop_oneof![Just(Risk::Low), Just(Risk::Medium), Just(Risk::High)]) {
            let votes = vec![VoteResult {
                voter: "v".to_string(),
                verdict: Verdict::Pass,
                confidence: 1.0,
                findings: vec![Finding { severity: Severity::Critical, category: "c".to_string(), description: "d".to_string() }],
                summary: String::new(),
            }];
            let (decision, _) = crate::aggregator::aggregate(&votes, VerificationStrategy::Unanimous, risk);
            prop_assert_eq!(decision, Decision::NeedsReview);
        }
    }
}

#[cfg(test)]
mod state_machine_tests {
    use specq_types::Status;

    /// Statuses the pipeline reconciliation logic must never move an
    /// item into or out of except by finishing the stage itself.
    fn transient_statuses() -> &'static [Status] {
        &[Status::Compiling, Status::Running, Status::Verifying]
    }

    /// Statuses that end a cycle's handling of a change outright.
    fn terminal_statuses() -> &'static [Status] {
        &[Status::Accepted, Status::Failed, Status::Skipped, Status::NeedsReview]
    }

    #[test]
    fn transient_and_terminal_are_disjoint() {
        for t in transient_statuses() {
            assert!(!terminal_statuses().contains(t));
        }
    }

    #[test]
    fn every_status_is_transient_xor_neither_terminal_nor_transient_is_ambiguous() {
        for &status in transient_statuses() {
            assert!(status.is_transient());
            assert!(!status.is_terminal());
        }
        for &status in terminal_statuses() {
            assert!(status.is_terminal());
            assert!(!status.is_transient());
        }
    }

    #[test]
    fn ready_and_pending_are_neither_terminal_nor_transient() {
        for status in [Status::Pending, Status::Blocked, Status::Ready, Status::Rejected] {
            assert!(!status.is_terminal());
            assert!(!status.is_transient());
        }
    }
}
