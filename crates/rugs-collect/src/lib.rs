//! Rugs-collect: real-time session collector for a multi-round crash game feed.
//!
//! This crate provides:
//! - Frame normalization for Socket.IO and plain JSON feeds
//! - A session segmentation state machine driven by terminal markers
//! - Per-session analytics and cross-session pattern alerts
//! - Hour-bucketed JSON persistence with three independent targets
//! - A reconnecting WebSocket supervisor

pub mod analyzer;
pub mod collector;
pub mod config;
pub mod normalizer;
pub mod recorder;
pub mod stats;
pub mod supervisor;
pub mod tracker;
pub mod writer;

pub use collector::{Collector, CollectorError, CollectorReport};
pub use config::{CollectConfig, Profile, RecordOptions};
pub use stats::{CollectorSnapshot, CollectorStats, StatsHandle};
pub use supervisor::{ConnectionSupervisor, SupervisorSignal};
