//! Shared types for the rugs session collector.
//!
//! This crate contains:
//! - The canonical event model produced by the transport normalizer
//! - Session summaries and cross-session alerts
//! - The persisted session record schema
//! - A fixed-capacity FIFO ring buffer used for rolling statistics

pub mod record;
pub mod ring;
pub mod types;

pub use record::{CollectionMetadata, RecordTiming, SequenceMetadata, SessionRecord};
pub use ring::RingBuffer;
pub use types::*;
