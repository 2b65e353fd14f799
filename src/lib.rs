//! WAF Comparison benchmark engine.
//!
//! Replays labeled corpora of legitimate and malicious HTTP requests against
//! one or more WAF targets, persists every observed verdict idempotently in
//! an embedded SQLite store, and derives per-target detection metrics
//! (TPR, TNR, balanced accuracy).

pub mod classify;
pub mod cli;
pub mod config;
pub mod corpus;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod metrics;
pub mod runner;
pub mod store;

pub use error::{EngineError, EngineResult};
