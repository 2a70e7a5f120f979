//! Decision assembly for one control cycle.
//!
//! Runs the pipeline on an immutable snapshot:
//! - Smooth the glucose history
//! - Derive the glucose status
//! - Fuse the sensitivity factors into one ratio
//! - Apply safety clamps and pick at most one basal override
//!
//! Nothing here returns an error. Missing or unusable input yields the
//! neutral "insufficient data" record.

use crate::glucose_status::GlucoseStatus;
use crate::safety::SafetyInputs;
use crate::sensitivity::FusionInputs;
use crate::types::minutes_between;
use crate::{
    smooth_series, CycleSnapshot, DecisionRecord, FusionResult, Policy, ProfileSnapshot,
    SafetyClampLayer, SensitivityRatioEngine, TempTarget,
};
use uuid::Uuid;

/// Newest reading older than this (minutes) is not acted on
pub const MAX_GLUCOSE_AGE_MINUTES: f64 = 12.0;
/// Upper bound on the adjusted ISF in mg/dL per unit
pub const MAX_ADJUSTED_ISF: f64 = 720.0;

/// Build the decision record for `snapshot`
pub fn assemble_decision(snapshot: &CycleSnapshot) -> DecisionRecord {
    let now = snapshot.now;
    let smb_default = snapshot.smb_enabled_default;

    let Some(raw_policy) = snapshot.policy.as_ref() else {
        tracing::warn!("No policy in snapshot; neutral decision");
        return DecisionRecord::neutral(now, smb_default, &Policy::default());
    };
    let (sanitized, mut reasons) = raw_policy.sanitized();
    let policy = sanitized.resolved();

    let history = match snapshot.glucose.as_deref() {
        Some(h) if !h.is_empty() => h,
        _ => {
            tracing::warn!("No glucose history; neutral decision");
            return DecisionRecord::neutral(now, smb_default, &policy);
        }
    };
    let Some(profile) = snapshot.profile.as_ref() else {
        tracing::warn!("No profile in snapshot; neutral decision");
        return DecisionRecord::neutral(now, smb_default, &policy);
    };

    let smoothing = smooth_series(history);
    if let Some(reason) = &smoothing.reason {
        reasons.push(format!("glucose smoothing skipped: {}", reason));
    }

    let Some(status) = GlucoseStatus::from_series(&smoothing.series) else {
        tracing::warn!("Newest glucose reading is a sensor error; neutral decision");
        return DecisionRecord::neutral(now, smb_default, &policy);
    };
    let age = minutes_between(status.timestamp, now);
    if age > MAX_GLUCOSE_AGE_MINUTES {
        tracing::warn!("Newest glucose reading is {:.0} minutes old; neutral decision", age);
        return DecisionRecord::neutral(now, smb_default, &policy);
    }

    let temp_target = snapshot.active_temp_target();
    let target_bg = effective_target(profile, temp_target);
    let layer = SafetyClampLayer::new(&policy);
    let exercise = layer.exercise_override(temp_target);

    let fusion = if exercise {
        FusionResult::neutral("autoISF bypassed")
    } else {
        let inputs = FusionInputs {
            status: &status,
            target_bg,
            cob: snapshot.meal.cob,
            hours_since_meal: snapshot.meal.hours_since_meal(now),
        };
        let fusion = SensitivityRatioEngine::new(&policy.autoisf).evaluate(&inputs);
        reasons.extend(fusion.reasons.iter().cloned());
        fusion
    };

    let safety = layer.apply(&SafetyInputs {
        now,
        sensitivity_ratio: fusion.ratio,
        glucose: status.glucose,
        delta: status.delta,
        target_bg,
        profile,
        iob: &snapshot.iob,
        temp_target,
        boluses: &snapshot.boluses,
        proposed_temp_basal: snapshot.proposed_temp_basal,
        smb_enabled_default: smb_default,
    });
    reasons.extend(safety.reasons.iter().cloned());

    let ratio = safety.sensitivity_ratio;
    let adjusted_isf = profile.sens.map(|sens| (sens * ratio).min(MAX_ADJUSTED_ISF));

    for reason in &reasons {
        tracing::debug!("{}", reason);
    }
    tracing::info!(
        glucose = status.glucose,
        ratio,
        smb = safety.smb_enabled,
        "Decision assembled"
    );

    DecisionRecord {
        id: Uuid::new_v4(),
        timestamp: now,
        glucose: Some(status.glucose),
        sensitivity_ratio: ratio,
        per_factor_breakdown: fusion.contributions,
        adjusted_isf,
        smb_enabled: safety.smb_enabled,
        smb_delivery_ratio: safety.smb_delivery_ratio,
        max_smb_basal_minutes: safety.max_smb_basal_minutes,
        max_uam_smb_basal_minutes: safety.max_uam_smb_basal_minutes,
        basal_override: safety.basal_override,
        autosens_bounds: policy.autosens_bounds(),
        reason_trail: reasons,
    }
}

/// Temp target when one is running, otherwise the middle of the profile range
fn effective_target(profile: &ProfileSnapshot, temp_target: Option<&TempTarget>) -> f64 {
    match temp_target {
        Some(tt) => tt.target,
        None => (profile.target_low + profile.target_high) / 2.0,
    }
}
