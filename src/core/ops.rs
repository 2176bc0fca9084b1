//! Operation Parameters & Results
//!
//! Wire-shaped types for the engine's operations. These are the JSON bodies
//! carried by the RPC surface and the trigger payloads pushed to
//! subscribers; the blackboard consumes and produces them directly so the
//! in-process and remote surfaces stay identical.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::evaluator::{ScentCondition, TagFilter};
use crate::core::physics::{DecayModel, PheromoneSnapshot};

fn default_limit() -> usize {
    100
}

/// How an emit folds into an existing slot with the same
/// (trail, type, payload digest) identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Reset intensity and reinforcement time; payload and tags unchanged
    #[default]
    Reinforce,
    /// As reinforce, plus overwrite payload and tags
    Replace,
    /// Keep the stronger of current and incoming intensity
    Max,
    /// Sum intensities, saturating at 1
    Add,
    /// Never merge; always create a fresh pheromone
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitAction {
    Created,
    Reinforced,
    Replaced,
    Merged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitParams {
    pub trail: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub intensity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay: Option<DecayModel>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitResult {
    pub pheromone_id: Uuid,
    pub action: EmitAction,
    /// Current intensity of the slot just before the merge; absent on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_intensity: Option<f64>,
    /// Post-merge current intensity
    pub new_intensity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniffParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trails: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default)]
    pub min_intensity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagFilter>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub include_evaporated: bool,
}

impl Default for SniffParams {
    fn default() -> Self {
        Self {
            trails: None,
            types: None,
            min_intensity: 0.0,
            max_age_ms: None,
            tags: None,
            limit: default_limit(),
            include_evaporated: false,
        }
    }
}

/// Per-trail/type statistics over the full pre-truncation match set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStats {
    pub count: usize,
    pub sum_intensity: f64,
    pub max_intensity: f64,
    pub avg_intensity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniffResult {
    pub timestamp: i64,
    /// Sorted by current intensity, strongest first
    pub pheromones: Vec<PheromoneSnapshot>,
    /// Keyed by "trail/type"
    pub aggregates: BTreeMap<String, AggregateStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fire whenever the condition holds
    #[default]
    Level,
    /// Fire on the false→true transition
    EdgeRising,
    /// Fire on the true→false transition
    EdgeFalling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterScentParams {
    pub scent_id: String,
    /// Addressing hint only; delivery follows the registering session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_endpoint: Option<String>,
    pub condition: ScentCondition,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub activation_payload: Map<String, Value>,
    #[serde(default)]
    pub trigger_mode: TriggerMode,
    /// Advisory; accepted pending protocol clarification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hysteresis: Option<f64>,
    /// Advisory handler duration cap; overruns are reported, not unwound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_trails: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStatus {
    Registered,
    Updated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionState {
    pub met: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterScentResult {
    pub scent_id: String,
    pub status: RegisterStatus,
    /// Immediate evaluation at registration time
    pub current_condition_state: ConditionState,
}

/// Shared by deregister, subscribe, and unsubscribe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScentIdParams {
    pub scent_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeregisterStatus {
    Deregistered,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterScentResult {
    pub scent_id: String,
    pub status: DeregisterStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaporateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    /// Age from emitted_at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub older_than_ms: Option<i64>,
    /// Current intensity, strict <
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below_intensity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaporateResult {
    pub evaporated_count: usize,
    pub trails_affected: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectSection {
    Trails,
    Scents,
    Stats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectParams {
    /// Defaults to every section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<InspectSection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailInfo {
    pub pheromone_count: usize,
    pub types: Vec<String>,
    pub total_intensity: f64,
    pub strongest: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScentInfo {
    pub scent_id: String,
    pub trigger_mode: TriggerMode,
    pub cooldown_ms: u64,
    pub last_triggered_at: Option<i64>,
    pub last_condition_met: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub live_pheromones: usize,
    pub scent_count: usize,
    pub emissions_total: u64,
    pub triggers_total: u64,
    pub ticks_total: u64,
    pub history_len: usize,
    pub uptime_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectResult {
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trails: Option<BTreeMap<String, TrailInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scents: Option<Vec<ScentInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<EngineStats>,
}

/// The evaluation record behind a fired trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSnapshot {
    pub value: f64,
    pub pheromone_ids: Vec<Uuid>,
}

/// What a triggered agent receives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub scent_id: String,
    pub triggered_at: i64,
    pub condition_snapshot: BTreeMap<String, ConditionSnapshot>,
    /// Context-trail snapshots if the scent names trails, else the
    /// matching pheromones from the evaluation
    pub context_pheromones: Vec<PheromoneSnapshot>,
    pub activation_payload: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_params_defaults() {
        let params: EmitParams = serde_json::from_value(json!({
            "trail": "market.signals",
            "type": "volatility",
            "intensity": 0.8
        }))
        .unwrap();

        assert_eq!(params.merge_strategy, MergeStrategy::Reinforce);
        assert!(params.decay.is_none());
        assert!(params.payload.is_empty());
        assert!(params.tags.is_empty());
    }

    #[test]
    fn sniff_params_defaults() {
        let params: SniffParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!(params.limit, 100);
        assert_eq!(params.min_intensity, 0.0);
        assert!(!params.include_evaporated);
    }

    #[test]
    fn register_params_defaults() {
        let params: RegisterScentParams = serde_json::from_value(json!({
            "scent_id": "s1",
            "condition": {
                "type": "threshold",
                "trail": "a",
                "signal_type": "x",
                "aggregation": "max",
                "operator": ">=",
                "value": 0.7
            }
        }))
        .unwrap();

        assert_eq!(params.trigger_mode, TriggerMode::Level);
        assert_eq!(params.cooldown_ms, 0);
        assert!(params.context_trails.is_none());
    }

    #[test]
    fn trigger_mode_wire_names() {
        assert_eq!(
            serde_json::to_value(TriggerMode::EdgeRising).unwrap(),
            json!("edge_rising")
        );
        assert_eq!(
            serde_json::to_value(DeregisterStatus::NotFound).unwrap(),
            json!("not_found")
        );
        assert_eq!(
            serde_json::to_value(EmitAction::Created).unwrap(),
            json!("created")
        );
    }
}
