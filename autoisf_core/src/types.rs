//! Core domain types for the autoISF decision core.
//!
//! This module defines:
//! - Glucose samples and the sentinel convention
//! - Per-cycle inputs (IOB, meal, temp target, boluses, profile)
//! - Per-factor contributions and dosing overrides
//! - The immutable decision record handed to the dosing engine

use crate::policy::Policy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CGM value that signals a sensor error rather than a reading.
pub const SENSOR_ERROR_SENTINEL: f64 = 38.0;

/// Reason recorded when the pipeline cannot run.
pub const INSUFFICIENT_DATA: &str = "insufficient data";

// ============================================================================
// Glucose
// ============================================================================

/// A single CGM reading in mg/dL
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlucoseSample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_sentinel_error: bool,
}

impl GlucoseSample {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            timestamp,
            is_sentinel_error: false,
        }
    }

    /// True for flagged errors, the 38 mg/dL sentinel, and non-finite values.
    pub fn is_error(&self) -> bool {
        self.is_sentinel_error || self.value == SENSOR_ERROR_SENTINEL || !self.value.is_finite()
    }
}

// ============================================================================
// Cycle inputs
// ============================================================================

/// Insulin on board, split by source
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct IobSnapshot {
    #[serde(default)]
    pub iob: f64,
    #[serde(default)]
    pub basal_iob: f64,
    #[serde(default)]
    pub bolus_iob: f64,
}

impl IobSnapshot {
    /// Basal-sourced plus bolus-sourced insulin
    pub fn net(&self) -> f64 {
        self.basal_iob + self.bolus_iob
    }
}

/// Carbs on board and the time of the last recorded meal
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct MealSnapshot {
    #[serde(default)]
    pub cob: f64,
    #[serde(default)]
    pub last_carb_time: Option<DateTime<Utc>>,
}

impl MealSnapshot {
    /// Hours since the last meal, if one was recorded
    pub fn hours_since_meal(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_carb_time
            .map(|t| (now - t).num_seconds() as f64 / 3600.0)
    }
}

/// Kind of temporary target, as tagged by the user or an automation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TempTargetKind {
    EatingSoon,
    Exercise,
    Other(String),
}

/// A temporary glucose target
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TempTarget {
    /// Lower boundary in mg/dL (the value that drives the loop)
    pub target: f64,
    pub kind: TempTargetKind,
    pub activated_at: DateTime<Utc>,
    pub duration_minutes: f64,
}

impl TempTarget {
    /// A cancelled target has zero duration, so it is never active.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let elapsed = minutes_between(self.activated_at, now);
        elapsed >= 0.0 && elapsed < self.duration_minutes
    }
}

/// A manually given bolus
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BolusEvent {
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
}

/// Profile values that apply to the current cycle
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProfileSnapshot {
    pub target_low: f64,
    pub target_high: f64,
    /// Profile ISF in mg/dL per unit
    #[serde(default)]
    pub sens: Option<f64>,
    /// Scheduled basal rate in U/hr
    pub current_basal: f64,
}

/// Everything one control cycle reads, captured at a single instant
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub now: DateTime<Utc>,
    #[serde(default)]
    pub glucose: Option<Vec<GlucoseSample>>,
    #[serde(default)]
    pub policy: Option<Policy>,
    #[serde(default)]
    pub iob: IobSnapshot,
    #[serde(default)]
    pub meal: MealSnapshot,
    #[serde(default)]
    pub temp_target: Option<TempTarget>,
    #[serde(default)]
    pub boluses: Vec<BolusEvent>,
    #[serde(default)]
    pub profile: Option<ProfileSnapshot>,
    /// Temp basal the upstream engine wants to set, in U/hr
    #[serde(default)]
    pub proposed_temp_basal: Option<f64>,
    /// What the upstream engine would do about SMB without this core
    #[serde(default = "default_true")]
    pub smb_enabled_default: bool,
}

fn default_true() -> bool {
    true
}

impl CycleSnapshot {
    /// The temp target if it is running at `now`
    pub fn active_temp_target(&self) -> Option<&TempTarget> {
        self.temp_target.as_ref().filter(|tt| tt.is_active(self.now))
    }
}

// ============================================================================
// Outputs
// ============================================================================

/// The five autoISF fusion factors
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityFactor {
    Acceleration,
    BgLevel,
    Delta,
    Duration,
    PostMeal,
}

impl SensitivityFactor {
    pub const ALL: [SensitivityFactor; 5] = [
        SensitivityFactor::Acceleration,
        SensitivityFactor::BgLevel,
        SensitivityFactor::Delta,
        SensitivityFactor::Duration,
        SensitivityFactor::PostMeal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SensitivityFactor::Acceleration => "acce_ISF",
            SensitivityFactor::BgLevel => "bg_ISF",
            SensitivityFactor::Delta => "delta_ISF",
            SensitivityFactor::Duration => "dura_ISF",
            SensitivityFactor::PostMeal => "pp_ISF",
        }
    }
}

/// One factor's multiplicative effect on ISF (below 1.0 means stronger insulin)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SensitivityContribution {
    pub factor: SensitivityFactor,
    pub ratio: f64,
    pub active: bool,
}

impl SensitivityContribution {
    pub fn neutral(factor: SensitivityFactor) -> Self {
        Self {
            factor,
            ratio: 1.0,
            active: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.factor.name()
    }
}

/// How the KetoProtect floor was sized
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KetoFloorMode {
    Percent,
    Absolute,
}

/// A basal directive that replaces what the upstream engine proposed
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DosingOverride {
    /// Meal-absorption boost after an EatingSoon bolus
    B30Boost {
        rate: f64,
        factor: f64,
        duration_minutes: f64,
    },
    /// Minimum basal in place of a zero temp
    KetoProtectFloor {
        rate: f64,
        mode: KetoFloorMode,
        duration_minutes: f64,
    },
}

impl DosingOverride {
    pub fn rate(&self) -> f64 {
        match self {
            DosingOverride::B30Boost { rate, .. } => *rate,
            DosingOverride::KetoProtectFloor { rate, .. } => *rate,
        }
    }

    pub fn duration_minutes(&self) -> f64 {
        match self {
            DosingOverride::B30Boost {
                duration_minutes, ..
            } => *duration_minutes,
            DosingOverride::KetoProtectFloor {
                duration_minutes, ..
            } => *duration_minutes,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            DosingOverride::B30Boost { .. } => "b30",
            DosingOverride::KetoProtectFloor { .. } => "keto_protect",
        }
    }
}

/// Autosens bounds in effect after autoISF precedence is applied
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutosensBounds {
    pub min: f64,
    pub max: f64,
}

/// The single output of one control cycle
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Current glucose after smoothing, when known
    pub glucose: Option<f64>,
    pub sensitivity_ratio: f64,
    pub per_factor_breakdown: Vec<SensitivityContribution>,
    pub adjusted_isf: Option<f64>,
    pub smb_enabled: bool,
    pub smb_delivery_ratio: f64,
    pub max_smb_basal_minutes: f64,
    pub max_uam_smb_basal_minutes: f64,
    pub basal_override: Option<DosingOverride>,
    pub autosens_bounds: AutosensBounds,
    pub reason_trail: Vec<String>,
}

impl DecisionRecord {
    /// Ratio 1.0, no override, SMB left to upstream, reason "insufficient data".
    pub fn neutral(now: DateTime<Utc>, smb_default: bool, policy: &Policy) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now,
            glucose: None,
            sensitivity_ratio: 1.0,
            per_factor_breakdown: SensitivityFactor::ALL
                .iter()
                .map(|f| SensitivityContribution::neutral(*f))
                .collect(),
            adjusted_isf: None,
            smb_enabled: smb_default,
            smb_delivery_ratio: policy.smb.delivery_ratio.clamp(0.0, 1.0),
            max_smb_basal_minutes: policy.smb.max_smb_basal_minutes,
            max_uam_smb_basal_minutes: policy.smb.max_uam_smb_basal_minutes,
            basal_override: None,
            autosens_bounds: policy.resolved().autosens_bounds(),
            reason_trail: vec![INSUFFICIENT_DATA.to_string()],
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.reason_trail.len() == 1 && self.reason_trail[0] == INSUFFICIENT_DATA
    }

    pub fn contribution(&self, factor: SensitivityFactor) -> Option<&SensitivityContribution> {
        self.per_factor_breakdown.iter().find(|c| c.factor == factor)
    }
}

/// Fractional minutes from `from` to `to`
pub fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

/// Test series on a 5-minute grid ending at `newest_at`
#[cfg(test)]
pub fn series_from_values(values: &[f64], newest_at: DateTime<Utc>) -> Vec<GlucoseSample> {
    let n = values.len() as i64;
    values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            GlucoseSample::new(*v, newest_at - chrono::Duration::minutes(5 * (n - 1 - i as i64)))
        })
        .collect()
}
