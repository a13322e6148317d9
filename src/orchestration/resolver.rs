//! Deterministic resolution of contention between parties.
//!
//! Each [`ConflictType`] maps to one pure strategy function of
//! `(parties, context)`. The resolver wraps the result in an immutable
//! [`ConflictResolution`] record and keeps the history.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics::{self, Metric, SharedSink};
use crate::log_info;

/// Vote assumed for parties that did not cast one.
pub const ABSTAIN: &str = "abstain";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Resource,
    Priority,
    Decision,
    Expertise,
    Timing,
}

impl ConflictType {
    pub const ALL: [ConflictType; 5] = [
        ConflictType::Resource,
        ConflictType::Priority,
        ConflictType::Decision,
        ConflictType::Expertise,
        ConflictType::Timing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::Resource => "resource",
            ConflictType::Priority => "priority",
            ConflictType::Decision => "decision",
            ConflictType::Expertise => "expertise",
            ConflictType::Timing => "timing",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| Error::UnknownConflictType(s.to_string()))
    }
}

/// Inputs the strategies read. Every list keeps caller order, which is
/// what tie-breaking follows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictContext {
    /// Party priorities; higher wins resource conflicts.
    pub priorities: Vec<(String, f64)>,
    pub votes: Vec<(String, String)>,
    /// Party to (skill, level) pairs.
    pub expertise: Vec<(String, Vec<(String, f64)>)>,
    /// Skill to minimum level.
    pub requirements: Vec<(String, f64)>,
    pub current_round: u64,
    pub metadata: BTreeMap<String, Value>,
}

impl ConflictContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, party: &str, priority: f64) -> Self {
        self.priorities.push((party.to_string(), priority));
        self
    }

    pub fn with_vote(mut self, party: &str, vote: &str) -> Self {
        self.votes.push((party.to_string(), vote.to_string()));
        self
    }

    pub fn with_expertise(mut self, party: &str, skill: &str, level: f64) -> Self {
        let entry = match self.expertise.iter().position(|(p, _)| p == party) {
            Some(pos) => &mut self.expertise[pos].1,
            None => {
                self.expertise.push((party.to_string(), Vec::new()));
                let last = self.expertise.len() - 1;
                &mut self.expertise[last].1
            }
        };
        entry.push((skill.to_string(), level));
        self
    }

    pub fn with_requirement(mut self, skill: &str, level: f64) -> Self {
        self.requirements.push((skill.to_string(), level));
        self
    }

    pub fn with_round(mut self, round: u64) -> Self {
        self.current_round = round;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// A party's priority; 0 when absent.
    pub fn priority_of(&self, party: &str) -> f64 {
        self.priorities
            .iter()
            .find(|(p, _)| p == party)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }

    pub fn vote_of(&self, party: &str) -> &str {
        self.votes
            .iter()
            .find(|(p, _)| p == party)
            .map(|(_, v)| v.as_str())
            .unwrap_or(ABSTAIN)
    }

    pub fn expertise_of(&self, party: &str, skill: &str) -> Option<f64> {
        self.expertise
            .iter()
            .find(|(p, _)| p == party)
            .and_then(|(_, skills)| skills.iter().find(|(s, _)| s == skill))
            .map(|(_, level)| *level)
    }
}

/// What a strategy decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictOutcome {
    /// One party prevails.
    Winner { party: String },
    /// The plurality choice among the votes.
    Decision { choice: String, votes: usize },
    /// Every party is assigned the same priority.
    Converged { priority: f64 },
}

impl ConflictOutcome {
    pub fn winner(&self) -> Option<&str> {
        match self {
            ConflictOutcome::Winner { party } => Some(party),
            _ => None,
        }
    }

    pub fn choice(&self) -> Option<&str> {
        match self {
            ConflictOutcome::Decision { choice, .. } => Some(choice),
            _ => None,
        }
    }

    pub fn converged_priority(&self) -> Option<f64> {
        match self {
            ConflictOutcome::Converged { priority } => Some(*priority),
            _ => None,
        }
    }
}

/// Immutable record of a resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub id: String,
    pub conflict_type: ConflictType,
    pub parties: Vec<String>,
    pub strategy: String,
    pub outcome: ConflictOutcome,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
}

/// Result of a strategy function, before it is stamped into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyDecision {
    pub strategy: &'static str,
    pub outcome: ConflictOutcome,
    pub metadata: BTreeMap<String, Value>,
}

/// Run the strategy for `conflict_type`. Pure; `parties` must be non-empty.
pub fn decide(
    conflict_type: ConflictType,
    parties: &[String],
    context: &ConflictContext,
) -> StrategyDecision {
    match conflict_type {
        ConflictType::Resource => resolve_resource(parties, context),
        ConflictType::Priority => resolve_priority(parties, context),
        ConflictType::Decision => resolve_decision(parties, context),
        ConflictType::Expertise => resolve_expertise(parties, context),
        ConflictType::Timing => resolve_timing(parties, context),
    }
}

fn resolve_resource(parties: &[String], context: &ConflictContext) -> StrategyDecision {
    let mut ranking: Vec<&String> = parties.iter().collect();
    // Stable sort keeps caller order among equal priorities.
    ranking.sort_by(|a, b| context.priority_of(b).total_cmp(&context.priority_of(a)));
    let mut metadata = BTreeMap::new();
    metadata.insert("ranking".to_string(), json!(ranking));
    StrategyDecision {
        strategy: "priority_allocation",
        outcome: ConflictOutcome::Winner {
            party: ranking[0].clone(),
        },
        metadata,
    }
}

fn resolve_priority(parties: &[String], context: &ConflictContext) -> StrategyDecision {
    let previous: Vec<(&String, f64)> = parties
        .iter()
        .map(|p| (p, context.priority_of(p)))
        .collect();
    let mean = previous.iter().map(|(_, v)| v).sum::<f64>() / parties.len() as f64;
    let mut metadata = BTreeMap::new();
    metadata.insert("previous".to_string(), json!(previous));
    StrategyDecision {
        strategy: "priority_convergence",
        outcome: ConflictOutcome::Converged { priority: mean },
        metadata,
    }
}

fn resolve_decision(parties: &[String], context: &ConflictContext) -> StrategyDecision {
    let mut tally: Vec<(&str, usize)> = Vec::new();
    for party in parties {
        let vote = context.vote_of(party);
        match tally.iter_mut().find(|(choice, _)| *choice == vote) {
            Some((_, count)) => *count += 1,
            None => tally.push((vote, 1)),
        }
    }
    let mut best = tally[0];
    for entry in &tally[1..] {
        if entry.1 > best.1 {
            best = *entry;
        }
    }
    let mut metadata = BTreeMap::new();
    metadata.insert("tally".to_string(), json!(tally));
    StrategyDecision {
        strategy: "majority_vote",
        outcome: ConflictOutcome::Decision {
            choice: best.0.to_string(),
            votes: best.1,
        },
        metadata,
    }
}

fn resolve_expertise(parties: &[String], context: &ConflictContext) -> StrategyDecision {
    let scores: Vec<(&String, usize)> = parties
        .iter()
        .map(|party| {
            let met = context
                .requirements
                .iter()
                .filter(|(skill, required)| {
                    context
                        .expertise_of(party, skill)
                        .is_some_and(|level| level >= *required)
                })
                .count();
            (party, met)
        })
        .collect();
    let mut best = scores[0];
    for entry in &scores[1..] {
        if entry.1 > best.1 {
            best = *entry;
        }
    }
    let mut metadata = BTreeMap::new();
    metadata.insert("scores".to_string(), json!(scores));
    StrategyDecision {
        strategy: "expertise_match",
        outcome: ConflictOutcome::Winner {
            party: best.0.clone(),
        },
        metadata,
    }
}

fn resolve_timing(parties: &[String], context: &ConflictContext) -> StrategyDecision {
    let index = (context.current_round % parties.len() as u64) as usize;
    let mut metadata = BTreeMap::new();
    metadata.insert("round".to_string(), json!(context.current_round));
    StrategyDecision {
        strategy: "round_robin",
        outcome: ConflictOutcome::Winner {
            party: parties[index].clone(),
        },
        metadata,
    }
}

/// Resolves conflicts and keeps an append-only history.
pub struct ConflictResolver {
    history: Mutex<Vec<ConflictResolution>>,
    metrics: SharedSink,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(metrics::default_sink())
    }
}

impl ConflictResolver {
    pub fn new(metrics: SharedSink) -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            metrics,
        }
    }

    pub fn resolve(
        &self,
        conflict_type: ConflictType,
        parties: &[String],
        context: &ConflictContext,
    ) -> Result<ConflictResolution> {
        if parties.is_empty() {
            return Err(Error::InvalidConflict(format!(
                "{} conflict has no parties",
                conflict_type
            )));
        }

        let decision = decide(conflict_type, parties, context);
        let resolution = ConflictResolution {
            id: Uuid::new_v4().to_string(),
            conflict_type,
            parties: parties.to_vec(),
            strategy: decision.strategy.to_string(),
            outcome: decision.outcome,
            timestamp: Utc::now(),
            metadata: decision.metadata,
        };

        log_info!(
            "Resolver: {} conflict among {:?} resolved by {}: {:?}",
            conflict_type,
            parties,
            resolution.strategy,
            resolution.outcome
        );
        self.metrics.emit(
            Metric::count(metrics::CONFLICT_RESOLVED)
                .label("type", conflict_type)
                .label("strategy", &resolution.strategy),
        );
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(resolution.clone());
        Ok(resolution)
    }

    /// Like [`resolve`](Self::resolve) with the type given by name.
    pub fn resolve_str(
        &self,
        conflict_type: &str,
        parties: &[String],
        context: &ConflictContext,
    ) -> Result<ConflictResolution> {
        self.resolve(conflict_type.parse()?, parties, context)
    }

    pub fn history(&self) -> Vec<ConflictResolution> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
