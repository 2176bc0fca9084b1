//! Stigmergic Blackboard
//!
//! In-memory shared environment for agent coordination. Agents never
//! communicate directly - they only interact with this shared "blackboard"
//! by depositing pheromones and registering scents whose predicates are
//! re-tested by a periodic evaluation loop.
//!
//! All shared state sits behind a single write lock: every mutation is
//! serialized, and no sniff or evaluation pass can observe a half-applied
//! merge. Trigger dispatch happens outside the lock on spawned tasks, so a
//! slow handler never stalls the loop.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Map;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::error::SbpError;
use crate::core::evaluator::{Emission, EvaluationContext, EvaluationResult, ScentCondition};
use crate::core::identity::payload_digest;
use crate::core::ops::{
    AggregateStats, ConditionSnapshot, ConditionState, DeregisterScentResult, DeregisterStatus,
    EmitAction, EmitParams, EmitResult, EngineStats, EvaporateParams, EvaporateResult,
    InspectParams, InspectResult, InspectSection, MergeStrategy, RegisterScentParams,
    RegisterScentResult, RegisterStatus, ScentInfo, SniffParams, SniffResult, TrailInfo,
    TriggerMode, TriggerPayload,
};
use crate::core::physics::{DecayModel, Pheromone, PheromoneSnapshot};

/// Callback seam for in-process subscribers. Handlers run on their own
/// task; errors are logged and never reach the evaluation loop.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn on_trigger(&self, trigger: TriggerPayload) -> Result<()>;
}

/// A registered predicate plus its dispatch policy and runtime state
#[derive(Debug, Clone)]
pub struct Scent {
    pub id: String,
    pub condition: ScentCondition,
    pub cooldown_ms: u64,
    pub activation_payload: Map<String, serde_json::Value>,
    pub context_trails: Option<Vec<String>>,
    pub trigger_mode: TriggerMode,
    /// Addressing hint only; delivery follows the subscription channel
    pub agent_endpoint: Option<String>,
    /// Advisory, pending protocol clarification
    pub hysteresis: Option<f64>,
    pub max_execution_ms: Option<u64>,
    pub last_triggered_at: Option<i64>,
    pub last_condition_met: bool,
}

/// Everything the single writer guards
struct BoardState {
    pheromones: HashMap<Uuid, Pheromone>,
    /// BTreeMap keeps per-tick evaluation order deterministic
    scents: BTreeMap<String, Scent>,
    history: VecDeque<Emission>,
}

/// The shared environment for stigmergic coordination
pub struct Blackboard {
    config: Arc<Config>,
    state: RwLock<BoardState>,
    handlers: RwLock<HashMap<String, Arc<dyn TriggerHandler>>>,

    /// Fan-out consumed by push-channel sessions
    trigger_tx: broadcast::Sender<TriggerPayload>,

    running: AtomicBool,
    started_at: i64,
    emissions_total: AtomicU64,
    triggers_total: AtomicU64,
    ticks_total: AtomicU64,
}

impl Blackboard {
    pub fn new(config: Arc<Config>) -> Self {
        let (trigger_tx, _) = broadcast::channel(256);

        Self {
            config,
            state: RwLock::new(BoardState {
                pheromones: HashMap::new(),
                scents: BTreeMap::new(),
                history: VecDeque::new(),
            }),
            handlers: RwLock::new(HashMap::new()),
            trigger_tx,
            running: AtomicBool::new(false),
            started_at: Self::now_ms(),
            emissions_total: AtomicU64::new(0),
            triggers_total: AtomicU64::new(0),
            ticks_total: AtomicU64::new(0),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Deposit a pheromone, merging into an existing slot when trail, type,
    /// and canonical payload digest agree and the slot has not evaporated.
    pub async fn emit(&self, params: EmitParams) -> Result<EmitResult, SbpError> {
        if params.trail.is_empty() || params.kind.is_empty() {
            return Err(SbpError::InvalidParams(
                "emit requires non-empty trail and type".into(),
            ));
        }
        if !params.intensity.is_finite() {
            return Err(SbpError::InvalidParams("intensity must be finite".into()));
        }
        if let Some(decay) = &params.decay {
            decay.validate()?;
        }

        let now = Self::now_ms();
        let intensity = params.intensity.clamp(0.0, 1.0);
        let digest = payload_digest(&params.payload);

        let mut state = self.state.write().await;

        // Every emit lands in the history, whatever the merge outcome
        state.history.push_back(Emission {
            trail: params.trail.clone(),
            kind: params.kind.clone(),
            timestamp: now,
        });
        prune_history(&mut state.history, now, self.config.engine.history_window_ms);
        self.emissions_total.fetch_add(1, Ordering::SeqCst);

        if params.merge_strategy != MergeStrategy::New {
            let existing = state.pheromones.values_mut().find(|p| {
                p.trail == params.trail
                    && p.kind == params.kind
                    && !p.is_evaporated(now)
                    && payload_digest(&p.payload) == digest
            });

            if let Some(existing) = existing {
                let previous = existing.current_intensity(now);

                let action = match params.merge_strategy {
                    MergeStrategy::Reinforce => {
                        existing.initial_intensity = intensity;
                        existing.last_reinforced_at = now;
                        EmitAction::Reinforced
                    }
                    MergeStrategy::Replace => {
                        existing.initial_intensity = intensity;
                        existing.last_reinforced_at = now;
                        existing.payload = params.payload;
                        existing.tags = params.tags;
                        EmitAction::Replaced
                    }
                    MergeStrategy::Max => {
                        existing.initial_intensity = previous.max(intensity);
                        existing.last_reinforced_at = now;
                        EmitAction::Merged
                    }
                    MergeStrategy::Add => {
                        existing.initial_intensity = (previous + intensity).min(1.0);
                        existing.last_reinforced_at = now;
                        EmitAction::Merged
                    }
                    MergeStrategy::New => unreachable!("new strategy never merges"),
                };

                let new_intensity = existing.current_intensity(now);
                let id = existing.id;

                debug!(
                    "📤 EMIT [{}/{}] {:?} {:.2} -> {:.2}",
                    params.trail, params.kind, action, previous, new_intensity
                );

                return Ok(EmitResult {
                    pheromone_id: id,
                    action,
                    previous_intensity: Some(previous),
                    new_intensity,
                });
            }
        }

        let pheromone = Pheromone {
            id: Uuid::new_v4(),
            trail: params.trail,
            kind: params.kind,
            emitted_at: now,
            last_reinforced_at: now,
            initial_intensity: intensity,
            decay_model: params.decay.unwrap_or(DecayModel::Exponential {
                half_life_ms: self.config.engine.default_half_life_ms,
            }),
            payload: params.payload,
            source_agent: params.source_agent,
            tags: params.tags,
            ttl_floor: self.config.engine.ttl_floor,
        };
        let id = pheromone.id;

        debug!(
            "📤 EMIT [{}/{}] created intensity={:.2}",
            pheromone.trail, pheromone.kind, intensity
        );

        state.pheromones.insert(id, pheromone);

        Ok(EmitResult {
            pheromone_id: id,
            action: EmitAction::Created,
            previous_intensity: None,
            new_intensity: intensity,
        })
    }

    /// Point-in-time query over the live environment
    pub async fn sniff(&self, params: SniffParams) -> SniffResult {
        let now = Self::now_ms();
        let state = self.state.read().await;

        let mut matches: Vec<PheromoneSnapshot> = Vec::new();
        // key -> (count, sum, max) over the full match set
        let mut rollups: BTreeMap<String, (usize, f64, f64)> = BTreeMap::new();

        for p in state.pheromones.values() {
            if let Some(trails) = &params.trails {
                if !trails.contains(&p.trail) {
                    continue;
                }
            }
            if let Some(types) = &params.types {
                if !types.contains(&p.kind) {
                    continue;
                }
            }

            let intensity = p.current_intensity(now);
            if !params.include_evaporated && intensity < p.ttl_floor {
                continue;
            }
            if intensity < params.min_intensity {
                continue;
            }
            if let Some(max_age) = params.max_age_ms {
                if now - p.emitted_at > max_age {
                    continue;
                }
            }
            if let Some(filter) = &params.tags {
                if !filter.matches(&p.tags) {
                    continue;
                }
            }

            matches.push(p.snapshot(now));

            let entry = rollups
                .entry(format!("{}/{}", p.trail, p.kind))
                .or_insert((0, 0.0, 0.0));
            entry.0 += 1;
            entry.1 += intensity;
            entry.2 = entry.2.max(intensity);
        }

        matches.sort_by(|a, b| {
            b.current_intensity
                .partial_cmp(&a.current_intensity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(params.limit);

        let aggregates = rollups
            .into_iter()
            .map(|(key, (count, sum, max))| {
                (
                    key,
                    AggregateStats {
                        count,
                        sum_intensity: sum,
                        max_intensity: max,
                        avg_intensity: if count > 0 { sum / count as f64 } else { 0.0 },
                    },
                )
            })
            .collect();

        trace!("👃 SNIFF matched {} pheromones", matches.len());

        SniffResult {
            timestamp: now,
            pheromones: matches,
            aggregates,
        }
    }

    /// Force-remove pheromones matching ALL specified filters
    pub async fn evaporate(&self, params: EvaporateParams) -> EvaporateResult {
        let now = Self::now_ms();
        let mut state = self.state.write().await;

        let mut trails_affected: BTreeSet<String> = BTreeSet::new();
        let before = state.pheromones.len();

        state.pheromones.retain(|_, p| {
            if let Some(trail) = &params.trail {
                if &p.trail != trail {
                    return true;
                }
            }
            if let Some(types) = &params.types {
                if !types.contains(&p.kind) {
                    return true;
                }
            }
            if let Some(age) = params.older_than_ms {
                if now - p.emitted_at <= age {
                    return true;
                }
            }
            if let Some(floor) = params.below_intensity {
                // Strict <: a pheromone exactly at the floor survives
                if p.current_intensity(now) >= floor {
                    return true;
                }
            }
            if let Some(filter) = &params.tags {
                if !filter.matches(&p.tags) {
                    return true;
                }
            }
            trails_affected.insert(p.trail.clone());
            false
        });

        let evaporated_count = before - state.pheromones.len();
        if evaporated_count > 0 {
            info!(
                "🔥 EVAPORATE removed {} pheromones across {} trails",
                evaporated_count,
                trails_affected.len()
            );
        }

        EvaporateResult {
            evaporated_count,
            trails_affected: trails_affected.into_iter().collect(),
        }
    }

    /// Drop evaporated entries. Runs on the evaluation schedule; also
    /// callable directly, and idempotent at a fixed clock.
    pub async fn gc(&self) -> usize {
        let now = Self::now_ms();
        let mut state = self.state.write().await;
        gc_pass(&mut state.pheromones, now)
    }

    /// Create or replace a scent. The condition is evaluated once
    /// immediately for the reply; runtime state is reset so the first
    /// loop iteration can observe an edge.
    pub async fn register_scent(
        &self,
        params: RegisterScentParams,
    ) -> Result<RegisterScentResult, SbpError> {
        if params.scent_id.is_empty() {
            return Err(SbpError::InvalidParams("scent_id must be non-empty".into()));
        }
        params.condition.validate()?;

        let now = Self::now_ms();
        let mut state = self.state.write().await;

        let met = {
            let ctx = EvaluationContext {
                pheromones: state.pheromones.values().collect(),
                now,
                history: &state.history,
            };
            params.condition.evaluate(&ctx).met
        };

        let is_update = state.scents.contains_key(&params.scent_id);
        let scent = Scent {
            id: params.scent_id.clone(),
            condition: params.condition,
            cooldown_ms: params.cooldown_ms,
            activation_payload: params.activation_payload,
            context_trails: params.context_trails,
            trigger_mode: params.trigger_mode,
            agent_endpoint: params.agent_endpoint,
            hysteresis: params.hysteresis,
            max_execution_ms: params.max_execution_ms,
            last_triggered_at: None,
            last_condition_met: false,
        };

        info!(
            "🌸 SCENT {} '{}' mode={:?} cooldown={}ms endpoint={}",
            if is_update { "updated" } else { "registered" },
            scent.id,
            scent.trigger_mode,
            scent.cooldown_ms,
            scent.agent_endpoint.as_deref().unwrap_or("-")
        );
        if let Some(hysteresis) = scent.hysteresis {
            // Accepted but advisory; semantics pending protocol clarification
            debug!("Scent '{}' carries hysteresis {} (advisory)", scent.id, hysteresis);
        }

        state.scents.insert(params.scent_id.clone(), scent);

        Ok(RegisterScentResult {
            scent_id: params.scent_id,
            status: if is_update {
                RegisterStatus::Updated
            } else {
                RegisterStatus::Registered
            },
            current_condition_state: ConditionState { met },
        })
    }

    /// Remove a scent and any in-process handler bound to it
    pub async fn deregister_scent(&self, scent_id: &str) -> DeregisterScentResult {
        let removed = {
            let mut state = self.state.write().await;
            state.scents.remove(scent_id).is_some()
        };

        if removed {
            self.handlers.write().await.remove(scent_id);
            info!("🥀 SCENT deregistered '{}'", scent_id);
        }

        DeregisterScentResult {
            scent_id: scent_id.to_string(),
            status: if removed {
                DeregisterStatus::Deregistered
            } else {
                DeregisterStatus::NotFound
            },
        }
    }

    /// Register an in-process handler for a scent's triggers
    pub async fn subscribe(&self, scent_id: &str, handler: Arc<dyn TriggerHandler>) {
        self.handlers
            .write()
            .await
            .insert(scent_id.to_string(), handler);
    }

    /// Remove an in-process handler; reports whether one was present
    pub async fn unsubscribe(&self, scent_id: &str) -> bool {
        self.handlers.write().await.remove(scent_id).is_some()
    }

    /// Subscribe to the trigger fan-out (push-channel sessions)
    pub fn subscribe_triggers(&self) -> broadcast::Receiver<TriggerPayload> {
        self.trigger_tx.subscribe()
    }

    /// Structured view of trails, scents, and engine statistics
    pub async fn inspect(&self, params: InspectParams) -> InspectResult {
        let now = Self::now_ms();
        let include = params.include.unwrap_or_else(|| {
            vec![
                InspectSection::Trails,
                InspectSection::Scents,
                InspectSection::Stats,
            ]
        });
        let state = self.state.read().await;

        let trails = include.contains(&InspectSection::Trails).then(|| {
            let mut trails: BTreeMap<String, TrailInfo> = BTreeMap::new();
            for p in state.pheromones.values() {
                if p.is_evaporated(now) {
                    continue;
                }
                let intensity = p.current_intensity(now);
                let info = trails.entry(p.trail.clone()).or_insert(TrailInfo {
                    pheromone_count: 0,
                    types: Vec::new(),
                    total_intensity: 0.0,
                    strongest: 0.0,
                });
                info.pheromone_count += 1;
                info.total_intensity += intensity;
                info.strongest = info.strongest.max(intensity);
                if !info.types.contains(&p.kind) {
                    info.types.push(p.kind.clone());
                }
            }
            for info in trails.values_mut() {
                info.types.sort();
            }
            trails
        });

        let scents = include.contains(&InspectSection::Scents).then(|| {
            state
                .scents
                .values()
                .map(|s| ScentInfo {
                    scent_id: s.id.clone(),
                    trigger_mode: s.trigger_mode,
                    cooldown_ms: s.cooldown_ms,
                    last_triggered_at: s.last_triggered_at,
                    last_condition_met: s.last_condition_met,
                })
                .collect()
        });

        let stats = include.contains(&InspectSection::Stats).then(|| EngineStats {
            live_pheromones: state
                .pheromones
                .values()
                .filter(|p| !p.is_evaporated(now))
                .count(),
            scent_count: state.scents.len(),
            emissions_total: self.emissions_total.load(Ordering::SeqCst),
            triggers_total: self.triggers_total.load(Ordering::SeqCst),
            ticks_total: self.ticks_total.load(Ordering::SeqCst),
            history_len: state.history.len(),
            uptime_ms: now - self.started_at,
        });

        InspectResult {
            timestamp: now,
            trails,
            scents,
            stats,
        }
    }

    /// One evaluation tick: walk the registry against a consistent
    /// snapshot, fire what should fire, then collect garbage.
    pub async fn evaluate_scents(&self) {
        let now = Self::now_ms();
        self.ticks_total.fetch_add(1, Ordering::SeqCst);

        let mut dispatches: Vec<(TriggerPayload, Option<u64>)> = Vec::new();

        {
            let mut state = self.state.write().await;
            let BoardState {
                pheromones,
                scents,
                history,
            } = &mut *state;

            prune_history(history, now, self.config.engine.history_window_ms);

            {
                let ctx = EvaluationContext {
                    pheromones: pheromones.values().collect(),
                    now,
                    history,
                };

                for scent in scents.values_mut() {
                    // Cooldown gates BEFORE evaluation: a skipped scent keeps
                    // its previous last_condition_met, so edges that occur
                    // during cooldown are lost.
                    if let Some(last) = scent.last_triggered_at {
                        if now - last < scent.cooldown_ms as i64 {
                            continue;
                        }
                    }

                    let result = scent.condition.evaluate(&ctx);
                    let met = result.met;

                    let should_trigger = match scent.trigger_mode {
                        TriggerMode::Level => met,
                        TriggerMode::EdgeRising => met && !scent.last_condition_met,
                        TriggerMode::EdgeFalling => !met && scent.last_condition_met,
                    };

                    scent.last_condition_met = met;

                    if should_trigger {
                        scent.last_triggered_at = Some(now);
                        let payload = build_trigger_payload(scent, &result, pheromones, now);
                        dispatches.push((payload, scent.max_execution_ms));
                    }
                }
            }

            gc_pass(pheromones, now);
        }

        for (payload, max_execution_ms) in dispatches {
            self.dispatch_trigger(payload, max_execution_ms).await;
        }
    }

    /// Deliver one trigger: fan out to push sessions and hand the payload
    /// to the in-process handler on its own task.
    async fn dispatch_trigger(&self, payload: TriggerPayload, max_execution_ms: Option<u64>) {
        self.triggers_total.fetch_add(1, Ordering::SeqCst);

        info!(
            "🔔 TRIGGER [{}] at {} ({} context pheromones)",
            payload.scent_id,
            payload.triggered_at,
            payload.context_pheromones.len()
        );

        // Best-effort: no push subscribers is fine
        let _ = self.trigger_tx.send(payload.clone());

        let handler = self.handlers.read().await.get(&payload.scent_id).cloned();
        let Some(handler) = handler else {
            return;
        };

        let scent_id = payload.scent_id.clone();
        let advisory_ms = max_execution_ms.unwrap_or(self.config.dispatch.max_execution_ms);

        tokio::spawn(async move {
            let started = Instant::now();
            if let Err(e) = handler.on_trigger(payload).await {
                warn!("Handler for scent '{}' failed: {:#}", scent_id, e);
            }
            let elapsed = started.elapsed().as_millis() as u64;
            if elapsed > advisory_ms {
                warn!(
                    "Handler for scent '{}' ran {}ms (advisory max {}ms)",
                    scent_id, elapsed, advisory_ms
                );
            }
        });
    }

    /// Spawn the evaluation loop task
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_evaluation_loop().await })
    }

    /// Periodic evaluation loop; exits after the in-flight tick once
    /// `stop` is called.
    pub async fn run_evaluation_loop(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Evaluation loop already running");
            return;
        }

        let period = Duration::from_millis(self.config.engine.tick_interval_ms);
        let mut ticker = interval(period);

        info!("⏱️ Evaluation loop started (period {:?})", period);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.evaluate_scents().await;
        }

        info!("⏱️ Evaluation loop stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Trim the sliding window consumed by rate predicates
fn prune_history(history: &mut VecDeque<Emission>, now: i64, window_ms: i64) {
    let cutoff = now - window_ms;
    while history.front().map_or(false, |e| e.timestamp < cutoff) {
        history.pop_front();
    }
}

fn gc_pass(pheromones: &mut HashMap<Uuid, Pheromone>, now: i64) -> usize {
    let before = pheromones.len();
    pheromones.retain(|_, p| !p.is_evaporated(now));
    let removed = before - pheromones.len();
    if removed > 0 {
        debug!("🧹 GC removed {} evaporated pheromones", removed);
    }
    removed
}

fn build_trigger_payload(
    scent: &Scent,
    result: &EvaluationResult,
    pheromones: &HashMap<Uuid, Pheromone>,
    now: i64,
) -> TriggerPayload {
    let context_pheromones: Vec<PheromoneSnapshot> = match &scent.context_trails {
        Some(trails) => pheromones
            .values()
            .filter(|p| trails.contains(&p.trail) && !p.is_evaporated(now))
            .map(|p| p.snapshot(now))
            .collect(),
        None => result
            .matching_ids
            .iter()
            .filter_map(|id| pheromones.get(id))
            .map(|p| p.snapshot(now))
            .collect(),
    };

    let mut condition_snapshot = BTreeMap::new();
    condition_snapshot.insert(
        scent.id.clone(),
        ConditionSnapshot {
            value: result.value,
            pheromone_ids: result.matching_ids.clone(),
        },
    );

    TriggerPayload {
        scent_id: scent.id.clone(),
        triggered_at: now,
        condition_snapshot,
        context_pheromones,
        activation_payload: scent.activation_payload.clone(),
    }
}
