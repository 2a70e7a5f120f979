#![forbid(unsafe_code)]

//! Sensitivity-adjustment and dosing-safety core for a closed-loop insulin
//! controller.
//!
//! This crate provides:
//! - Glucose noise reduction (double exponential smoothing)
//! - Glucose status derivation (deltas, plateau, parabola fit)
//! - Multi-factor autoISF sensitivity ratio fusion
//! - Safety clamps (IOB gate, SMB shaping, B30 boost, KetoProtect floor)
//! - Decision assembly with a reason trail
//! - Persistence edges (config, snapshots, audit log, CSV rollup)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod policy;
pub mod preferences;
pub mod smoothing;
pub mod glucose_status;
pub mod sensitivity;
pub mod safety;
pub mod engine;
pub mod snapshot;
pub mod audit;
pub mod csv_rollup;
pub mod history;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use policy::Policy;
pub use smoothing::{smooth_series, SmoothingOutcome};
pub use glucose_status::GlucoseStatus;
pub use sensitivity::{FusionResult, SensitivityRatioEngine};
pub use safety::{SafetyClampLayer, SafetyOutcome};
pub use engine::assemble_decision;
pub use snapshot::load_snapshot;
pub use audit::{DecisionSink, JsonlAuditLog};
pub use history::load_recent_decisions;
