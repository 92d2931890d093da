//! Behavioral telemetry aggregation and causal anomaly diagnosis.
//!
//! The producer side ([`telemetry`]) compresses high-frequency UI, logic and
//! audio signals into per-window OHLC frames. The consumer side
//! ([`analysis`]) replays stored frames to diagnose frozen input handling,
//! silent sound cues and broken visual stacking.

pub mod analysis;
pub mod api;
pub mod config;
pub mod service;
pub mod store;
pub mod telemetry;
