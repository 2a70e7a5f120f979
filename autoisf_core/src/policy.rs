//! Policy snapshot: every tunable the decision core reads.
//!
//! The policy is an explicit nested structure. Core computation reads fields
//! directly; the [`fields`] descriptor table exists only so front ends can
//! render and validate the policy generically.

use crate::types::AutosensBounds;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable per-cycle configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct Policy {
    #[serde(default)]
    pub autoisf: AutoIsfPolicy,

    #[serde(default)]
    pub smb: SmbPolicy,

    #[serde(default)]
    pub autosens: AutosensPolicy,

    #[serde(default)]
    pub exercise: ExercisePolicy,

    #[serde(default)]
    pub b30: B30Policy,

    #[serde(default)]
    pub keto_protect: KetoProtectPolicy,
}

/// autoISF fusion and its SMB-related switches
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoIsfPolicy {
    pub enabled: bool,
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub enable_bg_acceleration: bool,
    pub bg_accel_weight: f64,
    pub bg_brake_weight: f64,
    pub lower_range_weight: f64,
    pub higher_range_weight: f64,
    pub delta_range_weight: f64,
    /// Plateau weight; 1.0 halves ISF after one hour at double target
    pub dura_weight: f64,
    pub enable_dura_with_cob: bool,
    pub post_meal_weight: f64,
    pub post_meal_duration_hours: f64,
    pub post_meal_always: bool,
    pub off_during_exercise: bool,
    pub smb_max_range_extension: f64,
    pub iob_threshold_percent: f64,
    pub smb_even_on_odd_off: bool,
    pub smb_even_on_odd_off_always: bool,
}

impl Default for AutoIsfPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            min_ratio: 0.7,
            max_ratio: 1.3,
            enable_bg_acceleration: true,
            bg_accel_weight: 0.0,
            bg_brake_weight: 0.0,
            lower_range_weight: 0.0,
            higher_range_weight: 0.0,
            delta_range_weight: 0.0,
            dura_weight: 0.0,
            enable_dura_with_cob: true,
            post_meal_weight: 0.0,
            post_meal_duration_hours: 3.0,
            post_meal_always: false,
            off_during_exercise: false,
            smb_max_range_extension: 1.0,
            iob_threshold_percent: 100.0,
            smb_even_on_odd_off: true,
            smb_even_on_odd_off_always: true,
        }
    }
}

/// Super-micro-bolus delivery limits
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SmbPolicy {
    pub delivery_ratio: f64,
    pub delivery_ratio_min: f64,
    pub delivery_ratio_max: f64,
    /// 0 disables interpolation; values below 10 are read as mmol/L
    pub delivery_ratio_bg_range: f64,
    pub max_smb_basal_minutes: f64,
    pub max_uam_smb_basal_minutes: f64,
    pub max_iob: f64,
    pub allow_smb_with_high_temptarget: bool,
}

impl Default for SmbPolicy {
    fn default() -> Self {
        Self {
            delivery_ratio: 0.5,
            delivery_ratio_min: 0.65,
            delivery_ratio_max: 0.80,
            delivery_ratio_bg_range: 0.0,
            max_smb_basal_minutes: 30.0,
            max_uam_smb_basal_minutes: 30.0,
            max_iob: 0.0,
            allow_smb_with_high_temptarget: false,
        }
    }
}

/// Legacy autosens bounds
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutosensPolicy {
    pub enabled: bool,
    pub min: f64,
    pub max: f64,
}

impl Default for AutosensPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min: 0.7,
            max: 1.3,
        }
    }
}

/// How high temp targets are interpreted
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ExercisePolicy {
    pub exercise_mode: bool,
    pub high_temptarget_raises_sensitivity: bool,
}

/// B30 meal-absorption basal boost
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct B30Policy {
    pub enabled: bool,
    /// EatingSoon temp target level in mg/dL
    pub target_level: f64,
    pub start_bolus: f64,
    pub duration_minutes: f64,
    pub basal_factor: f64,
    pub upper_limit: f64,
    pub upper_delta: f64,
}

impl Default for B30Policy {
    fn default() -> Self {
        Self {
            enabled: false,
            target_level: 90.0,
            start_bolus: 1.5,
            duration_minutes: 30.0,
            basal_factor: 7.0,
            upper_limit: 130.0,
            upper_delta: 8.0,
        }
    }
}

/// Basal floor against ketoacidosis
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KetoProtectPolicy {
    pub enabled: bool,
    pub variable: bool,
    pub basal_percent: f64,
    pub absolute: bool,
    pub basal_absolute: f64,
}

impl Default for KetoProtectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            variable: false,
            basal_percent: 20.0,
            absolute: false,
            basal_absolute: 0.0,
        }
    }
}

impl Policy {
    /// Effective policy: an enabled autoISF neutralizes autosens.
    ///
    /// The precedence only runs one way. Enabling autosens never switches
    /// autoISF off.
    pub fn resolved(&self) -> Policy {
        let mut policy = self.clone();
        if policy.autoisf.enabled {
            policy.autosens.min = 1.0;
            policy.autosens.max = 1.0;
        }
        policy
    }

    pub fn autosens_bounds(&self) -> AutosensBounds {
        if self.autosens.enabled {
            AutosensBounds {
                min: self.autosens.min,
                max: self.autosens.max,
            }
        } else {
            AutosensBounds { min: 1.0, max: 1.0 }
        }
    }

    /// Clamp out-of-range values and report every adjustment made.
    pub fn sanitized(&self) -> (Policy, Vec<String>) {
        let mut p = self.clone();
        let mut notes = Vec::new();

        let a = &mut p.autoisf;
        if !(a.min_ratio.is_finite() && a.min_ratio > 0.0) {
            notes.push(format!("autoISF_min {} replaced by 0.7", a.min_ratio));
            a.min_ratio = 0.7;
        }
        if !(a.max_ratio.is_finite() && a.max_ratio > 0.0) {
            notes.push(format!("autoISF_max {} replaced by 1.3", a.max_ratio));
            a.max_ratio = 1.3;
        }
        if a.min_ratio > a.max_ratio {
            notes.push(format!(
                "autoISF_min {} above autoISF_max {}; swapped",
                a.min_ratio, a.max_ratio
            ));
            std::mem::swap(&mut a.min_ratio, &mut a.max_ratio);
        }
        for (name, weight) in [
            ("bgAccel_ISF_weight", &mut a.bg_accel_weight),
            ("bgBrake_ISF_weight", &mut a.bg_brake_weight),
            ("lower_ISFrange_weight", &mut a.lower_range_weight),
            ("higher_ISFrange_weight", &mut a.higher_range_weight),
            ("delta_ISFrange_weight", &mut a.delta_range_weight),
            ("dura_ISF_weight", &mut a.dura_weight),
            ("pp_ISF_weight", &mut a.post_meal_weight),
        ] {
            if !weight.is_finite() {
                notes.push(format!("{} is not a number; set to 0", name));
                *weight = 0.0;
            }
        }
        clamp_field(
            &mut a.iob_threshold_percent,
            0.0,
            100.0,
            "iob_threshold_percent",
            &mut notes,
        );
        if !(a.smb_max_range_extension.is_finite() && a.smb_max_range_extension >= 1.0) {
            notes.push(format!(
                "smb_max_range_extension {} raised to 1",
                a.smb_max_range_extension
            ));
            a.smb_max_range_extension = 1.0;
        }

        let s = &mut p.smb;
        clamp_field(&mut s.delivery_ratio, 0.0, 1.0, "smb_delivery_ratio", &mut notes);
        clamp_field(
            &mut s.delivery_ratio_min,
            0.0,
            1.0,
            "smb_delivery_ratio_min",
            &mut notes,
        );
        clamp_field(
            &mut s.delivery_ratio_max,
            0.0,
            1.0,
            "smb_delivery_ratio_max",
            &mut notes,
        );
        if !(s.delivery_ratio_bg_range.is_finite() && s.delivery_ratio_bg_range >= 0.0) {
            notes.push(format!(
                "smb_delivery_ratio_bg_range {} set to 0",
                s.delivery_ratio_bg_range
            ));
            s.delivery_ratio_bg_range = 0.0;
        }

        let k = &mut p.keto_protect;
        clamp_field(&mut k.basal_percent, 5.0, 50.0, "keto_protect_basal_percent", &mut notes);
        clamp_field(
            &mut k.basal_absolute,
            0.0,
            2.0,
            "keto_protect_basal_absolute",
            &mut notes,
        );

        for note in &notes {
            tracing::info!("Policy clamp: {}", note);
        }
        (p, notes)
    }

    /// Check every decimal field against its descriptor bounds
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for field in fields() {
            if let (FieldKind::Decimal { min, max, .. }, FieldValue::Number(v)) =
                (&field.kind, (field.read)(self))
            {
                if !v.is_finite() || v < *min || v > *max {
                    errors.push(format!(
                        "{}.{} = {} outside [{}, {}]",
                        field.section, field.key, v, min, max
                    ));
                }
            }
        }
        errors
    }
}

fn clamp_field(value: &mut f64, lo: f64, hi: f64, name: &str, notes: &mut Vec<String>) {
    if !value.is_finite() {
        notes.push(format!("{} is not a number; set to {}", name, lo));
        *value = lo;
    } else if *value < lo || *value > hi {
        let clamped = value.clamp(lo, hi);
        notes.push(format!("{} {} clamped to {}", name, value, clamped));
        *value = clamped;
    }
}

// ============================================================================
// Field descriptors (rendering only)
// ============================================================================

/// Declared type and bounds of a policy field
#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    Toggle,
    Decimal {
        min: f64,
        max: f64,
        unit: &'static str,
    },
}

/// Current value of a policy field
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Number(n) => write!(f, "{}", n),
        }
    }
}

/// One renderable policy field
#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub section: &'static str,
    pub key: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub read: fn(&Policy) -> FieldValue,
}

static POLICY_FIELDS: Lazy<Vec<FieldDescriptor>> = Lazy::new(build_fields);

/// The descriptor table, built once
pub fn fields() -> &'static [FieldDescriptor] {
    &POLICY_FIELDS
}

fn toggle(
    section: &'static str,
    key: &'static str,
    label: &'static str,
    read: fn(&Policy) -> FieldValue,
) -> FieldDescriptor {
    FieldDescriptor {
        section,
        key,
        label,
        kind: FieldKind::Toggle,
        read,
    }
}

fn decimal(
    section: &'static str,
    key: &'static str,
    label: &'static str,
    (min, max, unit): (f64, f64, &'static str),
    read: fn(&Policy) -> FieldValue,
) -> FieldDescriptor {
    FieldDescriptor {
        section,
        key,
        label,
        kind: FieldKind::Decimal { min, max, unit },
        read,
    }
}

fn build_fields() -> Vec<FieldDescriptor> {
    use FieldValue::{Bool, Number};
    vec![
        toggle("autoisf", "enabled", "Enable autoISF", |p| Bool(p.autoisf.enabled)),
        decimal("autoisf", "min_ratio", "autoISF Min", (0.1, 1.0, ""), |p| {
            Number(p.autoisf.min_ratio)
        }),
        decimal("autoisf", "max_ratio", "autoISF Max", (1.0, 3.0, ""), |p| {
            Number(p.autoisf.max_ratio)
        }),
        toggle("autoisf", "enable_bg_acceleration", "Enable BG acceleration", |p| {
            Bool(p.autoisf.enable_bg_acceleration)
        }),
        decimal("autoisf", "bg_accel_weight", "ISF weight while BG accelerates", (0.0, 1.0, ""), |p| {
            Number(p.autoisf.bg_accel_weight)
        }),
        decimal("autoisf", "bg_brake_weight", "ISF weight while BG decelerates", (0.0, 1.0, ""), |p| {
            Number(p.autoisf.bg_brake_weight)
        }),
        decimal("autoisf", "lower_range_weight", "ISF weight for lower BGs", (0.0, 2.0, ""), |p| {
            Number(p.autoisf.lower_range_weight)
        }),
        decimal("autoisf", "higher_range_weight", "ISF weight for higher BGs", (0.0, 2.0, ""), |p| {
            Number(p.autoisf.higher_range_weight)
        }),
        decimal("autoisf", "delta_range_weight", "ISF weight for higher BG deltas", (0.0, 2.0, ""), |p| {
            Number(p.autoisf.delta_range_weight)
        }),
        decimal("autoisf", "dura_weight", "DuraISF weight", (0.0, 3.0, ""), |p| {
            Number(p.autoisf.dura_weight)
        }),
        toggle("autoisf", "enable_dura_with_cob", "Enable DuraISF with COB", |p| {
            Bool(p.autoisf.enable_dura_with_cob)
        }),
        decimal("autoisf", "post_meal_weight", "ISF weight for postprandial rise", (0.0, 1.0, ""), |p| {
            Number(p.autoisf.post_meal_weight)
        }),
        decimal("autoisf", "post_meal_duration_hours", "Duration of postprandial ISF", (0.0, 12.0, "h"), |p| {
            Number(p.autoisf.post_meal_duration_hours)
        }),
        toggle("autoisf", "post_meal_always", "Postprandial ISF always on", |p| {
            Bool(p.autoisf.post_meal_always)
        }),
        toggle("autoisf", "off_during_exercise", "Exercise switches autoISF off", |p| {
            Bool(p.autoisf.off_during_exercise)
        }),
        decimal("autoisf", "smb_max_range_extension", "SMB max range extension", (1.0, 5.0, ""), |p| {
            Number(p.autoisf.smb_max_range_extension)
        }),
        decimal("autoisf", "iob_threshold_percent", "IOB threshold percent", (0.0, 100.0, "%"), |p| {
            Number(p.autoisf.iob_threshold_percent)
        }),
        toggle("autoisf", "smb_even_on_odd_off", "Temp target parity toggles SMB", |p| {
            Bool(p.autoisf.smb_even_on_odd_off)
        }),
        toggle("autoisf", "smb_even_on_odd_off_always", "Profile target parity toggles SMB", |p| {
            Bool(p.autoisf.smb_even_on_odd_off_always)
        }),
        decimal("smb", "delivery_ratio", "SMB delivery ratio", (0.0, 1.0, ""), |p| {
            Number(p.smb.delivery_ratio)
        }),
        decimal("smb", "delivery_ratio_min", "SMB delivery ratio minimum", (0.0, 1.0, ""), |p| {
            Number(p.smb.delivery_ratio_min)
        }),
        decimal("smb", "delivery_ratio_max", "SMB delivery ratio maximum", (0.0, 1.0, ""), |p| {
            Number(p.smb.delivery_ratio_max)
        }),
        decimal("smb", "delivery_ratio_bg_range", "SMB delivery ratio BG range", (0.0, 100.0, "mg/dL"), |p| {
            Number(p.smb.delivery_ratio_bg_range)
        }),
        decimal("smb", "max_smb_basal_minutes", "Max SMB basal minutes", (0.0, 120.0, "min"), |p| {
            Number(p.smb.max_smb_basal_minutes)
        }),
        decimal("smb", "max_uam_smb_basal_minutes", "Max UAM SMB basal minutes", (0.0, 120.0, "min"), |p| {
            Number(p.smb.max_uam_smb_basal_minutes)
        }),
        decimal("smb", "max_iob", "Max IOB", (0.0, 50.0, "U"), |p| Number(p.smb.max_iob)),
        toggle("smb", "allow_smb_with_high_temptarget", "Allow SMB with high temp target", |p| {
            Bool(p.smb.allow_smb_with_high_temptarget)
        }),
        toggle("autosens", "enabled", "Enable autosens", |p| Bool(p.autosens.enabled)),
        decimal("autosens", "min", "Autosens minimum", (0.1, 1.0, ""), |p| Number(p.autosens.min)),
        decimal("autosens", "max", "Autosens maximum", (1.0, 3.0, ""), |p| Number(p.autosens.max)),
        toggle("exercise", "exercise_mode", "Exercise mode", |p| Bool(p.exercise.exercise_mode)),
        toggle("exercise", "high_temptarget_raises_sensitivity", "High temp target raises sensitivity", |p| {
            Bool(p.exercise.high_temptarget_raises_sensitivity)
        }),
        toggle("b30", "enabled", "Enable B30", |p| Bool(p.b30.enabled)),
        decimal("b30", "target_level", "EatingSoon target level", (72.0, 180.0, "mg/dL"), |p| {
            Number(p.b30.target_level)
        }),
        decimal("b30", "start_bolus", "Minimum start bolus", (0.0, 20.0, "U"), |p| {
            Number(p.b30.start_bolus)
        }),
        decimal("b30", "duration_minutes", "Duration of B30 basal", (0.0, 120.0, "min"), |p| {
            Number(p.b30.duration_minutes)
        }),
        decimal("b30", "basal_factor", "B30 basal rate factor", (1.0, 20.0, ""), |p| {
            Number(p.b30.basal_factor)
        }),
        decimal("b30", "upper_limit", "Upper BG limit for B30", (72.0, 300.0, "mg/dL"), |p| {
            Number(p.b30.upper_limit)
        }),
        decimal("b30", "upper_delta", "Upper delta limit for B30", (0.0, 30.0, "mg/dL"), |p| {
            Number(p.b30.upper_delta)
        }),
        toggle("keto_protect", "enabled", "Enable KetoProtect", |p| Bool(p.keto_protect.enabled)),
        toggle("keto_protect", "variable", "Variable protection", |p| Bool(p.keto_protect.variable)),
        decimal("keto_protect", "basal_percent", "Safety TBR", (5.0, 50.0, "%"), |p| {
            Number(p.keto_protect.basal_percent)
        }),
        toggle("keto_protect", "absolute", "Absolute safety TBR", |p| Bool(p.keto_protect.absolute)),
        decimal("keto_protect", "basal_absolute", "Absolute safety TBR rate", (0.0, 2.0, "U/hr"), |p| {
            Number(p.keto_protect.basal_absolute)
        }),
    ]
}
