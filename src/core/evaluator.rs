//! Scent Condition Evaluation
//!
//! A scent's condition is a finite tree of predicates over the live
//! environment: threshold aggregations over pheromone intensities,
//! boolean composites, and emission-rate tests over the history window.
//! Evaluation is a single function that pattern-matches on the variant,
//! keeping the predicate language closed and exhaustively checked.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use uuid::Uuid;

use crate::core::error::SbpError;
use crate::core::physics::Pheromone;

/// Defensive bound on predicate tree depth
pub const MAX_CONDITION_DEPTH: usize = 32;

/// Matches pheromones whose type should be accepted regardless of value
pub const TYPE_WILDCARD: &str = "*";

/// Optional tag constraints; a pheromone passes iff every specified
/// predicate holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagFilter {
    /// At least one of these must appear
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<Vec<String>>,

    /// Every listed tag must appear
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<Vec<String>>,

    /// None of these may appear
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub none: Option<Vec<String>>,
}

impl TagFilter {
    pub fn matches(&self, tags: &[String]) -> bool {
        if let Some(any) = &self.any {
            if !any.iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        if let Some(all) = &self.all {
            if !all.iter().all(|t| tags.contains(t)) {
                return false;
            }
        }
        if let Some(none) = &self.none {
            if none.iter().any(|t| tags.contains(t)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    pub fn holds(&self, a: f64, b: f64) -> bool {
        match self {
            Self::Gte => a >= b,
            Self::Gt => a > b,
            Self::Lte => a <= b,
            Self::Lt => a < b,
            Self::Eq => a == b,
            Self::Ne => a != b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Max,
    Avg,
    Count,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateMetric {
    EmissionsPerSecond,
    /// Named by the protocol but reserved; rejected at registration
    IntensityDelta,
}

/// A registered predicate tree. Composites own their children by value,
/// so the structure is a finite tree with no cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScentCondition {
    Threshold {
        trail: String,
        signal_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tags: Option<TagFilter>,
        aggregation: Aggregation,
        operator: Comparator,
        value: f64,
    },
    Composite {
        operator: CompositeOp,
        conditions: Vec<ScentCondition>,
    },
    Rate {
        trail: String,
        signal_type: String,
        metric: RateMetric,
        window_ms: i64,
        operator: Comparator,
        value: f64,
    },
}

/// One recorded emission, retained in the sliding history window and
/// consumed only by rate predicates.
#[derive(Debug, Clone)]
pub struct Emission {
    pub trail: String,
    pub kind: String,
    pub timestamp: i64,
}

/// Consistent view of the environment for one evaluation pass
pub struct EvaluationContext<'a> {
    pub pheromones: Vec<&'a Pheromone>,
    pub now: i64,
    pub history: &'a VecDeque<Emission>,
}

/// What every predicate kind reports back
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub met: bool,
    pub value: f64,
    pub matching_ids: Vec<Uuid>,
}

impl ScentCondition {
    /// Structural validation at registration time. Rejecting here keeps
    /// the evaluation loop free of malformed trees.
    pub fn validate(&self) -> Result<(), SbpError> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> Result<(), SbpError> {
        if depth > MAX_CONDITION_DEPTH {
            return Err(SbpError::InvalidParams(format!(
                "condition tree exceeds maximum depth of {}",
                MAX_CONDITION_DEPTH
            )));
        }

        match self {
            Self::Threshold { trail, .. } => {
                if trail.is_empty() {
                    return Err(SbpError::InvalidParams(
                        "threshold condition requires a trail".into(),
                    ));
                }
            }
            Self::Composite { operator, conditions } => {
                if conditions.is_empty() {
                    return Err(SbpError::InvalidParams(
                        "composite condition requires at least one child".into(),
                    ));
                }
                if *operator == CompositeOp::Not && conditions.len() != 1 {
                    return Err(SbpError::InvalidParams(
                        "'not' takes exactly one child condition".into(),
                    ));
                }
                for child in conditions {
                    child.validate_at(depth + 1)?;
                }
            }
            Self::Rate { metric, window_ms, .. } => {
                if *window_ms <= 0 {
                    return Err(SbpError::InvalidParams(
                        "rate condition requires window_ms > 0".into(),
                    ));
                }
                if *metric == RateMetric::IntensityDelta {
                    return Err(SbpError::InvalidParams(
                        "unsupported metric: intensity_delta is reserved".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Evaluate this condition against a consistent environment snapshot
    pub fn evaluate(&self, ctx: &EvaluationContext) -> EvaluationResult {
        match self {
            Self::Threshold {
                trail,
                signal_type,
                tags,
                aggregation,
                operator,
                value,
            } => evaluate_threshold(ctx, trail, signal_type, tags.as_ref(), *aggregation, *operator, *value),
            Self::Composite { operator, conditions } => {
                evaluate_composite(ctx, *operator, conditions)
            }
            Self::Rate {
                trail,
                signal_type,
                metric,
                window_ms,
                operator,
                value,
            } => evaluate_rate(ctx, trail, signal_type, *metric, *window_ms, *operator, *value),
        }
    }
}

fn evaluate_threshold(
    ctx: &EvaluationContext,
    trail: &str,
    signal_type: &str,
    tags: Option<&TagFilter>,
    aggregation: Aggregation,
    operator: Comparator,
    value: f64,
) -> EvaluationResult {
    let matching: Vec<&Pheromone> = ctx
        .pheromones
        .iter()
        .filter(|p| p.trail == trail)
        .filter(|p| signal_type == TYPE_WILDCARD || p.kind == signal_type)
        .filter(|p| !p.is_evaporated(ctx.now))
        .filter(|p| tags.map_or(true, |filter| filter.matches(&p.tags)))
        .copied()
        .collect();

    let intensities: Vec<f64> = matching.iter().map(|p| p.current_intensity(ctx.now)).collect();

    // Empty match set yields 0 for every aggregation
    let agg_value = match aggregation {
        Aggregation::Sum => intensities.iter().sum(),
        Aggregation::Max => intensities.iter().copied().fold(0.0, f64::max),
        Aggregation::Avg => {
            if intensities.is_empty() {
                0.0
            } else {
                intensities.iter().sum::<f64>() / intensities.len() as f64
            }
        }
        Aggregation::Count => matching.len() as f64,
        Aggregation::Any => {
            if matching.is_empty() {
                0.0
            } else {
                1.0
            }
        }
    };

    EvaluationResult {
        met: operator.holds(agg_value, value),
        value: agg_value,
        matching_ids: matching.iter().map(|p| p.id).collect(),
    }
}

fn evaluate_composite(
    ctx: &EvaluationContext,
    operator: CompositeOp,
    conditions: &[ScentCondition],
) -> EvaluationResult {
    if conditions.is_empty() {
        return EvaluationResult {
            met: false,
            value: 0.0,
            matching_ids: Vec::new(),
        };
    }

    let results: Vec<EvaluationResult> = conditions.iter().map(|c| c.evaluate(ctx)).collect();

    // Union of children's ids feeds context assembly regardless of outcome
    let all_ids: BTreeSet<Uuid> = results
        .iter()
        .flat_map(|r| r.matching_ids.iter().copied())
        .collect();

    let met = match operator {
        CompositeOp::And => results.iter().all(|r| r.met),
        CompositeOp::Or => results.iter().any(|r| r.met),
        CompositeOp::Not => !results[0].met,
    };

    EvaluationResult {
        met,
        value: results.iter().filter(|r| r.met).count() as f64,
        matching_ids: all_ids.into_iter().collect(),
    }
}

fn evaluate_rate(
    ctx: &EvaluationContext,
    trail: &str,
    signal_type: &str,
    metric: RateMetric,
    window_ms: i64,
    operator: Comparator,
    value: f64,
) -> EvaluationResult {
    let window_start = ctx.now - window_ms;
    let count = ctx
        .history
        .iter()
        .filter(|e| e.trail == trail)
        .filter(|e| signal_type == TYPE_WILDCARD || e.kind == signal_type)
        .filter(|e| e.timestamp >= window_start)
        .count();

    let rate = match metric {
        RateMetric::EmissionsPerSecond => count as f64 / (window_ms as f64 / 1000.0),
        // Unreachable through registration; defensively report the raw count
        RateMetric::IntensityDelta => count as f64,
    };

    EvaluationResult {
        met: operator.holds(rate, value),
        value: rate,
        matching_ids: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::physics::{DecayModel, DEFAULT_TTL_FLOOR};
    use serde_json::Map;

    const NOW: i64 = 100_000;

    fn pheromone(trail: &str, kind: &str, intensity: f64, tags: &[&str]) -> Pheromone {
        Pheromone {
            id: Uuid::new_v4(),
            trail: trail.to_string(),
            kind: kind.to_string(),
            emitted_at: NOW - 1_000,
            last_reinforced_at: NOW - 1_000,
            initial_intensity: intensity,
            decay_model: DecayModel::Immortal,
            payload: Map::new(),
            source_agent: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ttl_floor: DEFAULT_TTL_FLOOR,
        }
    }

    fn ctx<'a>(
        pheromones: &'a [Pheromone],
        history: &'a VecDeque<Emission>,
    ) -> EvaluationContext<'a> {
        EvaluationContext {
            pheromones: pheromones.iter().collect(),
            now: NOW,
            history,
        }
    }

    fn threshold(trail: &str, signal_type: &str, agg: Aggregation, op: Comparator, value: f64) -> ScentCondition {
        ScentCondition::Threshold {
            trail: trail.to_string(),
            signal_type: signal_type.to_string(),
            tags: None,
            aggregation: agg,
            operator: op,
            value,
        }
    }

    #[test]
    fn threshold_aggregations() {
        let pheromones = vec![
            pheromone("a", "x", 0.8, &[]),
            pheromone("a", "x", 0.4, &[]),
            pheromone("a", "y", 0.9, &[]),
            pheromone("b", "x", 1.0, &[]),
        ];
        let history = VecDeque::new();
        let ctx = ctx(&pheromones, &history);

        let sum = threshold("a", "x", Aggregation::Sum, Comparator::Gte, 1.0).evaluate(&ctx);
        assert!(sum.met);
        assert!((sum.value - 1.2).abs() < 1e-9);
        assert_eq!(sum.matching_ids.len(), 2);

        let max = threshold("a", "x", Aggregation::Max, Comparator::Gte, 0.8).evaluate(&ctx);
        assert!(max.met);
        assert!((max.value - 0.8).abs() < 1e-9);

        let avg = threshold("a", "x", Aggregation::Avg, Comparator::Eq, 0.6).evaluate(&ctx);
        assert!((avg.value - 0.6).abs() < 1e-9);

        let count = threshold("a", "*", Aggregation::Count, Comparator::Gte, 3.0).evaluate(&ctx);
        assert!(count.met);
        assert_eq!(count.value, 3.0);
        assert_eq!(count.matching_ids.len(), 3);

        let any = threshold("b", "x", Aggregation::Any, Comparator::Gte, 1.0).evaluate(&ctx);
        assert!(any.met);
        assert_eq!(any.value, 1.0);
    }

    #[test]
    fn empty_match_set_yields_zero() {
        let pheromones: Vec<Pheromone> = Vec::new();
        let history = VecDeque::new();
        let ctx = ctx(&pheromones, &history);

        for agg in [
            Aggregation::Sum,
            Aggregation::Max,
            Aggregation::Avg,
            Aggregation::Count,
            Aggregation::Any,
        ] {
            let result = threshold("a", "x", agg, Comparator::Eq, 0.0).evaluate(&ctx);
            assert_eq!(result.value, 0.0);
            assert!(result.met);
            assert!(result.matching_ids.is_empty());
        }
    }

    #[test]
    fn evaporated_pheromones_are_excluded() {
        let mut faded = pheromone("a", "x", 0.5, &[]);
        faded.decay_model = DecayModel::Linear { rate_per_ms: 1.0 };
        let pheromones = vec![faded, pheromone("a", "x", 0.3, &[])];
        let history = VecDeque::new();
        let ctx = ctx(&pheromones, &history);

        let result = threshold("a", "x", Aggregation::Count, Comparator::Eq, 1.0).evaluate(&ctx);
        assert!(result.met);
    }

    #[test]
    fn tag_filter_predicates() {
        let filter = TagFilter {
            any: Some(vec!["urgent".into(), "high".into()]),
            all: Some(vec!["validated".into()]),
            none: Some(vec!["stale".into()]),
        };

        let tag = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert!(filter.matches(&tag(&["urgent", "validated"])));
        assert!(!filter.matches(&tag(&["validated"])));
        assert!(!filter.matches(&tag(&["urgent"])));
        assert!(!filter.matches(&tag(&["urgent", "validated", "stale"])));
        assert!(TagFilter::default().matches(&tag(&[])));
    }

    #[test]
    fn threshold_respects_tag_filter() {
        let pheromones = vec![
            pheromone("a", "x", 0.9, &["urgent"]),
            pheromone("a", "x", 0.9, &["routine"]),
        ];
        let history = VecDeque::new();
        let ctx = ctx(&pheromones, &history);

        let condition = ScentCondition::Threshold {
            trail: "a".to_string(),
            signal_type: "x".to_string(),
            tags: Some(TagFilter {
                any: Some(vec!["urgent".into()]),
                ..Default::default()
            }),
            aggregation: Aggregation::Count,
            operator: Comparator::Eq,
            value: 1.0,
        };
        assert!(condition.evaluate(&ctx).met);
    }

    #[test]
    fn composite_and_or_not() {
        let pheromones = vec![pheromone("a", "x", 0.9, &[])];
        let history = VecDeque::new();
        let ctx = ctx(&pheromones, &history);

        let present = threshold("a", "x", Aggregation::Any, Comparator::Gte, 1.0);
        let absent = threshold("missing", "x", Aggregation::Any, Comparator::Gte, 1.0);

        let and = ScentCondition::Composite {
            operator: CompositeOp::And,
            conditions: vec![present.clone(), absent.clone()],
        };
        assert!(!and.evaluate(&ctx).met);

        let or = ScentCondition::Composite {
            operator: CompositeOp::Or,
            conditions: vec![present.clone(), absent.clone()],
        };
        let or_result = or.evaluate(&ctx);
        assert!(or_result.met);
        // value counts met children
        assert_eq!(or_result.value, 1.0);

        let not = ScentCondition::Composite {
            operator: CompositeOp::Not,
            conditions: vec![absent],
        };
        assert!(not.evaluate(&ctx).met);

        let nested = ScentCondition::Composite {
            operator: CompositeOp::And,
            conditions: vec![
                present,
                ScentCondition::Composite {
                    operator: CompositeOp::Not,
                    conditions: vec![threshold("control", "pause", Aggregation::Max, Comparator::Gte, 0.5)],
                },
            ],
        };
        assert!(nested.evaluate(&ctx).met);
    }

    #[test]
    fn composite_collects_ids_from_unmet_children() {
        let pheromones = vec![pheromone("a", "x", 0.9, &[])];
        let history = VecDeque::new();
        let ctx = ctx(&pheromones, &history);

        // Child matches a pheromone but the comparison fails
        let unmet = threshold("a", "x", Aggregation::Max, Comparator::Gte, 5.0);
        let composite = ScentCondition::Composite {
            operator: CompositeOp::And,
            conditions: vec![unmet],
        };
        let result = composite.evaluate(&ctx);
        assert!(!result.met);
        assert_eq!(result.matching_ids.len(), 1);
    }

    #[test]
    fn rate_emissions_per_second() {
        let pheromones: Vec<Pheromone> = Vec::new();
        let mut history = VecDeque::new();
        for i in 0..12 {
            history.push_back(Emission {
                trail: "sensor".to_string(),
                kind: "reading".to_string(),
                timestamp: NOW - 400 + i * 10,
            });
        }
        // Outside the window
        history.push_front(Emission {
            trail: "sensor".to_string(),
            kind: "reading".to_string(),
            timestamp: NOW - 5_000,
        });
        let ctx = ctx(&pheromones, &history);

        let condition = ScentCondition::Rate {
            trail: "sensor".to_string(),
            signal_type: "reading".to_string(),
            metric: RateMetric::EmissionsPerSecond,
            window_ms: 1_000,
            operator: Comparator::Gte,
            value: 10.0,
        };
        let result = condition.evaluate(&ctx);
        assert!(result.met);
        assert!((result.value - 12.0).abs() < 1e-9);
        assert!(result.matching_ids.is_empty());
    }

    #[test]
    fn validation_rejects_malformed_trees() {
        let empty = ScentCondition::Composite {
            operator: CompositeOp::And,
            conditions: vec![],
        };
        assert!(empty.validate().is_err());

        let bare = threshold("a", "x", Aggregation::Any, Comparator::Gte, 1.0);
        let two_child_not = ScentCondition::Composite {
            operator: CompositeOp::Not,
            conditions: vec![bare.clone(), bare.clone()],
        };
        assert!(two_child_not.validate().is_err());

        let reserved = ScentCondition::Rate {
            trail: "a".to_string(),
            signal_type: "*".to_string(),
            metric: RateMetric::IntensityDelta,
            window_ms: 1_000,
            operator: Comparator::Gte,
            value: 1.0,
        };
        assert!(reserved.validate().is_err());

        let zero_window = ScentCondition::Rate {
            trail: "a".to_string(),
            signal_type: "*".to_string(),
            metric: RateMetric::EmissionsPerSecond,
            window_ms: 0,
            operator: Comparator::Gte,
            value: 1.0,
        };
        assert!(zero_window.validate().is_err());

        let mut deep = bare.clone();
        for _ in 0..MAX_CONDITION_DEPTH {
            deep = ScentCondition::Composite {
                operator: CompositeOp::Not,
                conditions: vec![deep],
            };
        }
        assert!(deep.validate().is_err());
        assert!(bare.validate().is_ok());
    }

    #[test]
    fn condition_wire_format() {
        let parsed: ScentCondition = serde_json::from_value(serde_json::json!({
            "type": "threshold",
            "trail": "market.signals",
            "signal_type": "volatility",
            "aggregation": "max",
            "operator": ">=",
            "value": 0.7
        }))
        .unwrap();

        match &parsed {
            ScentCondition::Threshold { aggregation, operator, .. } => {
                assert_eq!(*aggregation, Aggregation::Max);
                assert_eq!(*operator, Comparator::Gte);
            }
            _ => panic!("expected threshold"),
        }

        let composite: ScentCondition = serde_json::from_value(serde_json::json!({
            "type": "composite",
            "operator": "and",
            "conditions": [
                {"type": "threshold", "trail": "a", "signal_type": "x",
                 "aggregation": "count", "operator": ">=", "value": 2},
                {"type": "rate", "trail": "a", "signal_type": "*",
                 "metric": "emissions_per_second", "window_ms": 1000,
                 "operator": ">", "value": 5}
            ]
        }))
        .unwrap();
        assert!(composite.validate().is_ok());
    }
}
