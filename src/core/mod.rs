//! SBP Core Module
//!
//! Provides the fundamental building blocks of the blackboard engine:
//! - Pheromone physics: time-decaying signals for indirect coordination
//! - Blackboard: shared environment with store, scent registry, and loop
//! - Evaluator: the predicate language scents are written in
//! - Config: centralized configuration management

pub mod blackboard;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod identity;
pub mod ops;
pub mod physics;

pub use blackboard::{Blackboard, TriggerHandler};
pub use config::Config;
pub use error::SbpError;
pub use physics::Pheromone;
