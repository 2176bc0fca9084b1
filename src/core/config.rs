//! Configuration Management
//!
//! Loads settings from config.toml including the evaluation loop period,
//! emission-history window, evaporation floor, and server parameters.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

use crate::core::physics::{DEFAULT_HALF_LIFE_MS, DEFAULT_TTL_FLOOR};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Evaluation loop period; GC runs on the same schedule
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Sliding window retained for rate predicates
    #[serde(default = "default_history_window")]
    pub history_window_ms: i64,

    /// Evaporation floor applied to newly created pheromones
    #[serde(default = "default_ttl_floor")]
    pub ttl_floor: f64,

    /// Half-life used when an emit carries no decay model
    #[serde(default = "default_half_life")]
    pub default_half_life_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval between keepalive comments on the push channel
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    /// Per-session replay buffer for Last-Event-ID resumption
    #[serde(default = "default_replay_buffer")]
    pub replay_buffer_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Advisory handler duration; overruns are logged, never unwound
    #[serde(default = "default_max_execution")]
    pub max_execution_ms: u64,
}

fn default_tick_interval() -> u64 { 100 }
fn default_history_window() -> i64 { 60_000 }
fn default_ttl_floor() -> f64 { DEFAULT_TTL_FLOOR }
fn default_half_life() -> f64 { DEFAULT_HALF_LIFE_MS }
fn default_port() -> u16 { 3000 }
fn default_keepalive() -> u64 { 15 }
fn default_replay_buffer() -> usize { 256 }
fn default_max_execution() -> u64 { 30_000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            history_window_ms: default_history_window(),
            ttl_floor: default_ttl_floor(),
            default_half_life_ms: default_half_life(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            keepalive_secs: default_keepalive(),
            replay_buffer_len: default_replay_buffer(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_execution_ms: default_max_execution(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            server: ServerConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from default location (config.toml in project root)
    pub fn load_default() -> Result<Self> {
        Self::load("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let config = Config::default();
        assert_eq!(config.engine.tick_interval_ms, 100);
        assert_eq!(config.engine.history_window_ms, 60_000);
        assert_eq!(config.engine.ttl_floor, 0.01);
        assert_eq!(config.engine.default_half_life_ms, 300_000.0);
        assert_eq!(config.dispatch.max_execution_ms, 30_000);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            tick_interval_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.tick_interval_ms, 50);
        assert_eq!(config.engine.history_window_ms, 60_000);
        assert_eq!(config.server.port, 3000);
    }
}
