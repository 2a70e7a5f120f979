//! Safety clamps and dosing overrides.
//!
//! Rules run in a fixed precedence:
//! 1. Exercise override (ratio forced to 1.0, autoISF clamps 2-5 skipped)
//! 2. IOB threshold gate
//! 3. Temp-target parity gate
//! 4. SMB delivery-ratio shaping
//! 5. SMB duration extension
//! 6. B30 basal boost
//! 7. KetoProtect basal floor
//!
//! At most one basal override comes out. B30 wins over KetoProtect.

use crate::policy::Policy;
use crate::types::minutes_between;
use crate::{
    BolusEvent, DosingOverride, IobSnapshot, KetoFloorMode, ProfileSnapshot, TempTarget,
    TempTargetKind,
};
use chrono::{DateTime, Utc};

/// mg/dL per mmol/L reciprocal used for range conversion
const MMOL_TO_MGDL_FACTOR: f64 = 0.0555;
/// Ranges below this are taken to be in mmol/L
const MMOL_RANGE_LIMIT: f64 = 10.0;
const KETO_FLOOR_DURATION_MINUTES: f64 = 30.0;
const KETO_PERCENT_BOUNDS: (f64, f64) = (5.0, 50.0);
const KETO_ABSOLUTE_BOUNDS: (f64, f64) = (0.0, 2.0);

/// Per-cycle inputs to the clamp layer
#[derive(Clone, Debug)]
pub struct SafetyInputs<'a> {
    pub now: DateTime<Utc>,
    /// Combined ratio from the fusion engine
    pub sensitivity_ratio: f64,
    pub glucose: f64,
    pub delta: f64,
    /// Target in effect (temp target if active, else profile)
    pub target_bg: f64,
    pub profile: &'a ProfileSnapshot,
    pub iob: &'a IobSnapshot,
    /// Only an active temp target
    pub temp_target: Option<&'a TempTarget>,
    pub boluses: &'a [BolusEvent],
    pub proposed_temp_basal: Option<f64>,
    pub smb_enabled_default: bool,
}

/// What the clamp layer decided
#[derive(Clone, Debug, PartialEq)]
pub struct SafetyOutcome {
    pub sensitivity_ratio: f64,
    pub exercise_override: bool,
    pub smb_enabled: bool,
    pub smb_delivery_ratio: f64,
    pub max_smb_basal_minutes: f64,
    pub max_uam_smb_basal_minutes: f64,
    pub basal_override: Option<DosingOverride>,
    pub reasons: Vec<String>,
}

pub struct SafetyClampLayer<'a> {
    policy: &'a Policy,
}

impl<'a> SafetyClampLayer<'a> {
    pub fn new(policy: &'a Policy) -> Self {
        Self { policy }
    }

    /// True when an active exercise target switches autoISF off
    pub fn exercise_override(&self, temp_target: Option<&TempTarget>) -> bool {
        if !self.policy.autoisf.off_during_exercise {
            return false;
        }
        let Some(tt) = temp_target else {
            return false;
        };
        let high_target_is_exercise = self.policy.exercise.exercise_mode
            || self.policy.exercise.high_temptarget_raises_sensitivity;
        tt.kind == TempTargetKind::Exercise || (tt.target > 100.0 && high_target_is_exercise)
    }

    pub fn apply(&self, inputs: &SafetyInputs<'_>) -> SafetyOutcome {
        let p = self.policy;
        let mut reasons = Vec::new();
        let exercise_override = self.exercise_override(inputs.temp_target);

        let mut outcome = SafetyOutcome {
            sensitivity_ratio: inputs.sensitivity_ratio,
            exercise_override,
            smb_enabled: inputs.smb_enabled_default,
            smb_delivery_ratio: bounded(p.smb.delivery_ratio, 0.0, 1.0),
            max_smb_basal_minutes: p.smb.max_smb_basal_minutes,
            max_uam_smb_basal_minutes: p.smb.max_uam_smb_basal_minutes,
            basal_override: None,
            reasons: Vec::new(),
        };

        if exercise_override {
            outcome.sensitivity_ratio = 1.0;
            reasons.push("autoISF off during exercise; ratio 1.0".to_string());
            tracing::info!("Exercise target active; autoISF bypassed");
        } else if p.autoisf.enabled {
            let gated = self.iob_gate(inputs, &mut reasons);
            if gated {
                outcome.smb_enabled = false;
            } else if let Some(parity) = self.parity_gate(inputs, &mut reasons) {
                outcome.smb_enabled = parity;
            }
            outcome.smb_delivery_ratio = self.delivery_ratio(inputs, &mut reasons);

            let ext = p.autoisf.smb_max_range_extension;
            if ext != 1.0 {
                outcome.max_smb_basal_minutes *= ext;
                outcome.max_uam_smb_basal_minutes *= ext;
                reasons.push(format!(
                    "SMB max range extended by {} to {:.0}/{:.0}m",
                    ext, outcome.max_smb_basal_minutes, outcome.max_uam_smb_basal_minutes
                ));
            }
        }

        outcome.basal_override = match self.b30(inputs, &mut reasons) {
            Some(boost) => Some(boost),
            None => self.keto_floor(inputs, &mut reasons),
        };

        outcome.reasons = reasons;
        outcome
    }

    /// Disable SMB once IOB reaches the threshold share of max IOB
    fn iob_gate(&self, inputs: &SafetyInputs<'_>, reasons: &mut Vec<String>) -> bool {
        let max_iob = self.policy.smb.max_iob;
        if max_iob <= 0.0 {
            return false;
        }
        let threshold = max_iob * self.policy.autoisf.iob_threshold_percent / 100.0;
        if inputs.iob.iob >= threshold {
            reasons.push(format!(
                "SMB disabled; IOB {:.2} at or above {}% of max IOB ({:.2})",
                inputs.iob.iob, self.policy.autoisf.iob_threshold_percent, threshold
            ));
            tracing::info!(iob = inputs.iob.iob, threshold, "SMB disabled by IOB threshold");
            return true;
        }
        false
    }

    /// Even target enables SMB, odd disables. `None` when the gate is off.
    fn parity_gate(&self, inputs: &SafetyInputs<'_>, reasons: &mut Vec<String>) -> Option<bool> {
        let a = &self.policy.autoisf;
        let (target, source) = match inputs.temp_target {
            Some(tt) if a.smb_even_on_odd_off => (tt.target, "temp target"),
            Some(_) => return None,
            None => {
                let profile = inputs.profile;
                if a.smb_even_on_odd_off_always
                    && profile.target_low == profile.target_high
                    && !self.policy.smb.allow_smb_with_high_temptarget
                {
                    (profile.target_low, "profile target")
                } else {
                    return None;
                }
            }
        };

        let even = (target.round() as i64) % 2 == 0;
        if even {
            reasons.push(format!("SMB enabled by even {} {:.0}", source, target));
        } else {
            reasons.push(format!("SMB disabled by odd {} {:.0}", source, target));
            tracing::info!("SMB disabled by odd {} {:.0}", source, target);
        }
        Some(even)
    }

    fn delivery_ratio(&self, inputs: &SafetyInputs<'_>, reasons: &mut Vec<String>) -> f64 {
        let s = &self.policy.smb;
        let mut range = s.delivery_ratio_bg_range;
        if range.is_nan() || range <= 0.0 {
            return bounded(s.delivery_ratio, 0.0, 1.0);
        }
        if range < MMOL_RANGE_LIMIT {
            range /= MMOL_TO_MGDL_FACTOR;
        }

        let low = bounded(s.delivery_ratio_min, 0.0, 1.0);
        let high = bounded(s.delivery_ratio_max, 0.0, 1.0);
        let share = ((inputs.glucose - inputs.target_bg) / range).clamp(0.0, 1.0);
        let ratio = (low + (high - low) * share).clamp(low.min(high), low.max(high));
        reasons.push(format!(
            "SMB delivery ratio {:.2} from BG range {:.0}",
            ratio, range
        ));
        ratio
    }

    fn b30(&self, inputs: &SafetyInputs<'_>, reasons: &mut Vec<String>) -> Option<DosingOverride> {
        let b = &self.policy.b30;
        if !b.enabled {
            return None;
        }
        let tt = inputs.temp_target?;
        if tt.kind != TempTargetKind::EatingSoon || tt.target.round() != b.target_level.round() {
            return None;
        }

        let bolus = inputs
            .boluses
            .iter()
            .filter(|e| e.timestamp <= inputs.now)
            .max_by_key(|e| e.timestamp)?;
        if bolus.amount < b.start_bolus {
            return None;
        }
        let elapsed = minutes_between(bolus.timestamp, inputs.now);
        if elapsed >= b.duration_minutes {
            return None;
        }

        if inputs.glucose >= b.upper_limit {
            reasons.push(format!(
                "B30 stopped; glucose {:.0} reached upper limit {:.0}",
                inputs.glucose, b.upper_limit
            ));
            tracing::info!("B30 stopped by glucose {:.0}", inputs.glucose);
            return None;
        }
        if inputs.delta >= b.upper_delta {
            reasons.push(format!(
                "B30 stopped; delta {:.1} reached upper delta {:.1}",
                inputs.delta, b.upper_delta
            ));
            tracing::info!("B30 stopped by delta {:.1}", inputs.delta);
            return None;
        }

        let rate = inputs.profile.current_basal * b.basal_factor;
        let remaining = b.duration_minutes - elapsed;
        reasons.push(format!(
            "B30 active; basal {:.2} U/hr ({}x) for {:.0}m after {:.2}U bolus",
            rate, b.basal_factor, remaining, bolus.amount
        ));
        tracing::info!(rate, remaining, "B30 basal boost active");
        Some(DosingOverride::B30Boost {
            rate,
            factor: b.basal_factor,
            duration_minutes: remaining,
        })
    }

    fn keto_floor(&self, inputs: &SafetyInputs<'_>, reasons: &mut Vec<String>) -> Option<DosingOverride> {
        let k = &self.policy.keto_protect;
        if !k.enabled {
            return None;
        }
        let proposed = inputs.proposed_temp_basal?;
        if proposed > 0.0 {
            return None;
        }
        let basal = inputs.profile.current_basal;
        if k.variable && inputs.iob.net() >= -basal {
            return None;
        }

        let (rate, mode) = if k.absolute {
            let (lo, hi) = KETO_ABSOLUTE_BOUNDS;
            (bounded(k.basal_absolute, lo, hi), KetoFloorMode::Absolute)
        } else {
            let (lo, hi) = KETO_PERCENT_BOUNDS;
            (
                bounded(k.basal_percent, lo, hi) / 100.0 * basal,
                KetoFloorMode::Percent,
            )
        };
        reasons.push(format!(
            "KetoProtect floor {:.2} U/hr replaces temp basal {:.2}",
            rate, proposed
        ));
        tracing::info!(rate, proposed, "KetoProtect basal floor applied");
        Some(DosingOverride::KetoProtectFloor {
            rate,
            mode,
            duration_minutes: KETO_FLOOR_DURATION_MINUTES,
        })
    }
}

/// Clamp that maps non-finite input to the lower bound
fn bounded(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_finite() {
        value.clamp(lo, hi)
    } else {
        lo
    }
}
