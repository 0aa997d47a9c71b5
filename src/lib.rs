//! # aegis-gateway
//!
//! Real-time anomaly detection engine for the Aegis API gateway.
//!
//! Completed requests are reduced to feature events, queued on a bounded non-blocking
//! stream, and evaluated by a rolling-window rule detector, an online PCA outlier
//! detector, or both in sequence.

pub mod anomaly;
pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
