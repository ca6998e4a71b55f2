//! RankFlow Backend Library
//!
//! Rank-upgrade and migration analysis over multi-round counselling allocation logs:
//! per-rank journeys, round-to-round flows, seat stability, next-round destination
//! probabilities and rank-band comparisons.

pub mod analysis;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fixtures;
pub mod models;
pub mod store;

pub use config::EngineConfig;
pub use engine::MigrationEngine;
pub use error::{AnalysisError, AnalysisResult, StoreError};
pub use models::{AllocationRecord, AllocationStatus, Round, SeatKey, UpgradeType};
