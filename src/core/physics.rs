//! Pheromone Physics Engine
//!
//! Implements the mathematical model for time-decaying signals that enable
//! stigmergic coordination between agents. Each pheromone carries one of four
//! decay models; its current intensity is a pure function of the model, the
//! intensity at last reinforcement, and elapsed wall-clock milliseconds.
//!
//! This creates "antifragile" behavior: when emitters fall silent, their
//! signals fade naturally, causing downstream agents to go dormant rather
//! than acting on stale data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::error::SbpError;

/// Intensity below which a pheromone counts as evaporated (engine default).
pub const DEFAULT_TTL_FLOOR: f64 = 0.01;

/// Half-life applied when an emit carries no decay model.
pub const DEFAULT_HALF_LIFE_MS: f64 = 300_000.0;

/// How a pheromone's intensity declines over time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecayModel {
    /// I(t) = I₀ · 2^(−Δ/half_life_ms)
    Exponential { half_life_ms: f64 },

    /// I(t) = max(0, I₀ − rate·Δ)
    Linear { rate_per_ms: f64 },

    /// Step function keyed on Δ: the last step with at_ms ≤ Δ applies;
    /// before the first step the initial intensity holds.
    Step { steps: Vec<DecayStep> },

    /// I(t) = I₀ for all t
    Immortal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayStep {
    pub at_ms: i64,
    pub intensity: f64,
}

impl Default for DecayModel {
    fn default() -> Self {
        Self::Exponential {
            half_life_ms: DEFAULT_HALF_LIFE_MS,
        }
    }
}

impl DecayModel {
    /// Reject models that would make intensity undefined. Runs before any
    /// emit mutates the store, so a bad model never leaves partial state.
    pub fn validate(&self) -> Result<(), SbpError> {
        match self {
            Self::Exponential { half_life_ms } => {
                if !half_life_ms.is_finite() || *half_life_ms <= 0.0 {
                    return Err(SbpError::InvalidParams(
                        "exponential decay requires half_life_ms > 0".into(),
                    ));
                }
            }
            Self::Linear { rate_per_ms } => {
                if !rate_per_ms.is_finite() || *rate_per_ms <= 0.0 {
                    return Err(SbpError::InvalidParams(
                        "linear decay requires rate_per_ms > 0".into(),
                    ));
                }
            }
            Self::Step { steps } => {
                if steps.is_empty() {
                    return Err(SbpError::InvalidParams(
                        "step decay requires at least one step".into(),
                    ));
                }
                for step in steps {
                    if !(0.0..=1.0).contains(&step.intensity) {
                        return Err(SbpError::InvalidParams(
                            "step intensities must lie in [0, 1]".into(),
                        ));
                    }
                }
            }
            Self::Immortal => {}
        }
        Ok(())
    }
}

/// A time-decaying signal deposited onto a trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pheromone {
    pub id: Uuid,

    /// String-namespaced channel this signal lives on
    pub trail: String,

    /// Sub-kind within the trail
    #[serde(rename = "type")]
    pub kind: String,

    /// Wall-clock milliseconds at first emit
    pub emitted_at: i64,

    /// Wall-clock milliseconds at the most recent reinforcement.
    /// Invariant: last_reinforced_at ≥ emitted_at.
    pub last_reinforced_at: i64,

    /// Intensity at last reinforcement, in [0, 1]
    pub initial_intensity: f64,

    pub decay_model: DecayModel,

    /// Opaque JSON payload; its canonical digest defines merge identity
    pub payload: Map<String, Value>,

    pub source_agent: Option<String>,

    pub tags: Vec<String>,

    /// Intensity below which this pheromone counts as evaporated
    pub ttl_floor: f64,
}

impl Pheromone {
    /// Current intensity at `now` (milliseconds). Pure: the same inputs
    /// always produce the same output. Results are clamped to [0, I₀].
    pub fn current_intensity(&self, now: i64) -> f64 {
        let elapsed = now - self.last_reinforced_at;
        if elapsed <= 0 {
            return self.initial_intensity;
        }

        let raw = match &self.decay_model {
            DecayModel::Exponential { half_life_ms } => {
                // Base-2 exponentiation avoids log/exp round-off drift
                self.initial_intensity * f64::exp2(-(elapsed as f64) / half_life_ms)
            }
            DecayModel::Linear { rate_per_ms } => {
                self.initial_intensity - rate_per_ms * elapsed as f64
            }
            DecayModel::Step { steps } => steps
                .iter()
                .rev()
                .find(|step| elapsed >= step.at_ms)
                .map(|step| step.intensity)
                .unwrap_or(self.initial_intensity),
            DecayModel::Immortal => self.initial_intensity,
        };

        raw.clamp(0.0, self.initial_intensity)
    }

    /// Evaporated means current intensity has fallen strictly below the floor
    pub fn is_evaporated(&self, now: i64) -> bool {
        self.current_intensity(now) < self.ttl_floor
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.emitted_at
    }

    /// Point-in-time view handed to sniff results and trigger payloads
    pub fn snapshot(&self, now: i64) -> PheromoneSnapshot {
        PheromoneSnapshot {
            id: self.id,
            trail: self.trail.clone(),
            kind: self.kind.clone(),
            current_intensity: self.current_intensity(now),
            payload: self.payload.clone(),
            age_ms: self.age_ms(now),
            tags: self.tags.clone(),
        }
    }
}

/// Frozen view of a pheromone at a specific instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PheromoneSnapshot {
    pub id: Uuid,
    pub trail: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub current_intensity: f64,
    pub payload: Map<String, Value>,
    pub age_ms: i64,
    pub tags: Vec<String>,
}
