//! Conflict resolution: every strategy is a pure function of its inputs.

use std::sync::Arc;

use proptest::prelude::*;

use crewline::metrics::{self, MemorySink};
use crewline::orchestration::{
    decide, ConflictContext, ConflictResolver, ConflictType, ABSTAIN,
};
use crewline::Error;

fn parties(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn context_strategy() -> impl Strategy<Value = (Vec<String>, ConflictContext)> {
    prop::collection::vec("[a-e]", 1..6).prop_flat_map(|names| {
        let n = names.len();
        (
            Just(names),
            prop::collection::vec(-5.0f64..5.0, n),
            prop::collection::vec(prop::option::of("(yes|no|maybe)"), n),
            prop::collection::vec(prop::collection::vec(0.0f64..1.0, 2), n),
            prop::collection::vec(0.0f64..1.0, 2),
            0u64..100,
        )
            .prop_map(|(names, priorities, votes, levels, required, round)| {
                let mut ctx = ConflictContext::new().with_round(round);
                for (i, name) in names.iter().enumerate() {
                    ctx = ctx.with_priority(name, priorities[i]);
                    if let Some(vote) = &votes[i] {
                        ctx = ctx.with_vote(name, vote);
                    }
                    ctx = ctx
                        .with_expertise(name, "rust", levels[i][0])
                        .with_expertise(name, "sql", levels[i][1]);
                }
                ctx = ctx
                    .with_requirement("rust", required[0])
                    .with_requirement("sql", required[1]);
                (names, ctx)
            })
    })
}

proptest! {
    /// Identical inputs give identical outcomes for every conflict type.
    #[test]
    fn prop_strategies_are_deterministic((names, ctx) in context_strategy()) {
        for conflict_type in ConflictType::ALL {
            let first = decide(conflict_type, &names, &ctx);
            let second = decide(conflict_type, &names, &ctx.clone());
            prop_assert_eq!(&first, &second);
        }
    }

    /// Winners are always one of the parties; round robin cycles through them.
    #[test]
    fn prop_winners_are_parties((names, ctx) in context_strategy()) {
        for conflict_type in [ConflictType::Resource, ConflictType::Expertise, ConflictType::Timing] {
            let decision = decide(conflict_type, &names, &ctx);
            let winner = decision.outcome.winner().unwrap();
            prop_assert!(names.iter().any(|n| n == winner));
        }
        let timing = decide(ConflictType::Timing, &names, &ctx);
        let expected = &names[(ctx.current_round % names.len() as u64) as usize];
        prop_assert_eq!(timing.outcome.winner(), Some(expected.as_str()));
    }

    /// The converged priority is the mean and lies within the parties' range.
    #[test]
    fn prop_priority_converges_to_mean((names, ctx) in context_strategy()) {
        let decision = decide(ConflictType::Priority, &names, &ctx);
        let values: Vec<f64> = names.iter().map(|n| ctx.priority_of(n)).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let converged = decision.outcome.converged_priority().unwrap();
        prop_assert!((converged - mean).abs() < 1e-9);
        let lo = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(converged >= lo - 1e-9 && converged <= hi + 1e-9);
    }
}

/// Given a resolver shared by several crews
/// When conflicts of every type are resolved through it
/// Then each lands in the history in order and is counted
#[test]
fn test_resolver_history_and_metrics() {
    let sink = Arc::new(MemorySink::new());
    let resolver = ConflictResolver::new(sink.clone());
    let team = parties(&["ana", "bo", "cy"]);
    let ctx = ConflictContext::new()
        .with_priority("ana", 1.0)
        .with_priority("bo", 3.0)
        .with_vote("ana", "ship")
        .with_vote("bo", "wait")
        .with_vote("cy", "ship")
        .with_expertise("cy", "rust", 0.9)
        .with_requirement("rust", 0.8)
        .with_round(4);

    let outcomes: Vec<_> = ConflictType::ALL
        .into_iter()
        .map(|t| resolver.resolve(t, &team, &ctx).unwrap())
        .collect();

    assert_eq!(outcomes[0].outcome.winner(), Some("bo"));
    assert_eq!(outcomes[1].outcome.converged_priority(), Some(4.0 / 3.0));
    assert_eq!(outcomes[2].outcome.choice(), Some("ship"));
    assert_eq!(outcomes[3].outcome.winner(), Some("cy"));
    assert_eq!(outcomes[4].outcome.winner(), Some("bo"));

    let history = resolver.history();
    assert_eq!(history.len(), 5);
    assert_eq!(
        history.iter().map(|r| r.strategy.as_str()).collect::<Vec<_>>(),
        vec![
            "priority_allocation",
            "priority_convergence",
            "majority_vote",
            "expertise_match",
            "round_robin"
        ]
    );
    assert_eq!(sink.total(metrics::CONFLICT_RESOLVED), 5.0);
}

/// Given parties that did not vote
/// When a decision conflict is resolved
/// Then missing votes count as abstentions and can win
#[test]
fn test_abstentions_are_votes() {
    let resolver = ConflictResolver::default();
    let team = parties(&["a", "b", "c"]);
    let ctx = ConflictContext::new().with_vote("a", "yes");
    let resolution = resolver.resolve(ConflictType::Decision, &team, &ctx).unwrap();
    assert_eq!(resolution.outcome.choice(), Some(ABSTAIN));
}

/// Given an unknown conflict type name or no parties
/// When resolution is requested
/// Then it is rejected without touching the history
#[test]
fn test_invalid_conflicts_rejected() {
    let resolver = ConflictResolver::default();
    let err = resolver
        .resolve_str("budget", &parties(&["a"]), &ConflictContext::new())
        .unwrap_err();
    assert!(matches!(err, Error::UnknownConflictType(_)));

    let err = resolver
        .resolve(ConflictType::Timing, &[], &ConflictContext::new())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConflict(_)));
    assert!(resolver.history().is_empty());
}
