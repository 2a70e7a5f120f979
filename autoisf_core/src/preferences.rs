//! Import of oref-style `preferences.json`.
//!
//! The loop's settings store keeps a flat key set (`use_autoisf`,
//! `autoISF_max`, `b30_factor`, ...). Keys that are present overwrite the
//! matching [`Policy`] field; absent keys keep the policy default and
//! unknown keys are ignored.

use crate::{Policy, Result};
use serde::Deserialize;
use std::path::Path;

/// Flat preference keys as written by the settings store
#[derive(Debug, Default, Deserialize)]
pub struct OrefPreferences {
    max_iob: Option<f64>,
    enable_autosens: Option<bool>,
    autosens_max: Option<f64>,
    autosens_min: Option<f64>,
    smb_delivery_ratio: Option<f64>,
    high_temptarget_raises_sensitivity: Option<bool>,
    exercise_mode: Option<bool>,
    #[serde(rename = "allowSMB_with_high_temptarget")]
    allow_smb_with_high_temptarget: Option<bool>,
    #[serde(rename = "maxSMBBasalMinutes")]
    max_smb_basal_minutes: Option<f64>,
    #[serde(rename = "maxUAMSMBBasalMinutes")]
    max_uam_smb_basal_minutes: Option<f64>,

    use_autoisf: Option<bool>,
    #[serde(rename = "autoISF_max")]
    autoisf_max: Option<f64>,
    #[serde(rename = "autoISF_min")]
    autoisf_min: Option<f64>,
    smb_max_range_extension: Option<f64>,
    smb_delivery_ratio_bg_range: Option<f64>,
    smb_delivery_ratio_min: Option<f64>,
    smb_delivery_ratio_max: Option<f64>,
    #[serde(rename = "enableautoisf_with_COB")]
    enable_autoisf_with_cob: Option<bool>,
    #[serde(rename = "dura_ISF_weight")]
    dura_isf_weight: Option<f64>,
    #[serde(rename = "higher_ISFrange_weight")]
    higher_isf_range_weight: Option<f64>,
    #[serde(rename = "lower_ISFrange_weight")]
    lower_isf_range_weight: Option<f64>,
    #[serde(rename = "delta_ISFrange_weight")]
    delta_isf_range_weight: Option<f64>,
    #[serde(rename = "pp_ISF_weight")]
    pp_isf_weight: Option<f64>,
    #[serde(rename = "pp_ISF_hours")]
    pp_isf_hours: Option<f64>,
    #[serde(rename = "enable_pp_ISF_always")]
    enable_pp_isf_always: Option<bool>,
    #[serde(rename = "bgAccel_ISF_weight")]
    bg_accel_isf_weight: Option<f64>,
    #[serde(rename = "bgBrake_ISF_weight")]
    bg_brake_isf_weight: Option<f64>,
    #[serde(rename = "enable_BG_acceleration")]
    enable_bg_acceleration: Option<bool>,
    iob_threshold_percent: Option<f64>,
    #[serde(rename = "enableSMB_EvenOn_OddOff")]
    enable_smb_even_on_odd_off: Option<bool>,
    #[serde(rename = "enableSMB_EvenOn_OddOff_always")]
    enable_smb_even_on_odd_off_always: Option<bool>,
    #[serde(rename = "autoISF_off_Sport")]
    autoisf_off_sport: Option<bool>,

    #[serde(rename = "use_B30")]
    use_b30: Option<bool>,
    #[serde(rename = "iTime_Start_Bolus")]
    itime_start_bolus: Option<f64>,
    b30_duration: Option<f64>,
    #[serde(rename = "iTime_target")]
    itime_target: Option<f64>,
    #[serde(rename = "b30_upperBG")]
    b30_upper_bg: Option<f64>,
    b30_upperdelta: Option<f64>,
    b30_factor: Option<f64>,

    keto_protect: Option<bool>,
    variable_keto_protect_strategy: Option<bool>,
    keto_protect_basal_percent: Option<f64>,
    keto_protect_absolute: Option<bool>,
    keto_protect_basal_absolute: Option<f64>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

impl OrefPreferences {
    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Overlay the present keys onto the default policy
    pub fn into_policy(self) -> Policy {
        let mut p = Policy::default();

        set(&mut p.smb.max_iob, self.max_iob);
        set(&mut p.autosens.enabled, self.enable_autosens);
        set(&mut p.autosens.max, self.autosens_max);
        set(&mut p.autosens.min, self.autosens_min);
        set(&mut p.smb.delivery_ratio, self.smb_delivery_ratio);
        set(
            &mut p.exercise.high_temptarget_raises_sensitivity,
            self.high_temptarget_raises_sensitivity,
        );
        set(&mut p.exercise.exercise_mode, self.exercise_mode);
        set(
            &mut p.smb.allow_smb_with_high_temptarget,
            self.allow_smb_with_high_temptarget,
        );
        set(&mut p.smb.max_smb_basal_minutes, self.max_smb_basal_minutes);
        set(
            &mut p.smb.max_uam_smb_basal_minutes,
            self.max_uam_smb_basal_minutes,
        );

        let a = &mut p.autoisf;
        set(&mut a.enabled, self.use_autoisf);
        set(&mut a.max_ratio, self.autoisf_max);
        set(&mut a.min_ratio, self.autoisf_min);
        set(&mut a.smb_max_range_extension, self.smb_max_range_extension);
        set(&mut a.enable_dura_with_cob, self.enable_autoisf_with_cob);
        set(&mut a.dura_weight, self.dura_isf_weight);
        set(&mut a.higher_range_weight, self.higher_isf_range_weight);
        set(&mut a.lower_range_weight, self.lower_isf_range_weight);
        set(&mut a.delta_range_weight, self.delta_isf_range_weight);
        set(&mut a.post_meal_weight, self.pp_isf_weight);
        set(&mut a.post_meal_duration_hours, self.pp_isf_hours);
        set(&mut a.post_meal_always, self.enable_pp_isf_always);
        set(&mut a.bg_accel_weight, self.bg_accel_isf_weight);
        set(&mut a.bg_brake_weight, self.bg_brake_isf_weight);
        set(&mut a.enable_bg_acceleration, self.enable_bg_acceleration);
        set(&mut a.iob_threshold_percent, self.iob_threshold_percent);
        set(&mut a.smb_even_on_odd_off, self.enable_smb_even_on_odd_off);
        set(
            &mut a.smb_even_on_odd_off_always,
            self.enable_smb_even_on_odd_off_always,
        );
        set(&mut a.off_during_exercise, self.autoisf_off_sport);

        set(&mut p.smb.delivery_ratio_bg_range, self.smb_delivery_ratio_bg_range);
        set(&mut p.smb.delivery_ratio_min, self.smb_delivery_ratio_min);
        set(&mut p.smb.delivery_ratio_max, self.smb_delivery_ratio_max);

        let b = &mut p.b30;
        set(&mut b.enabled, self.use_b30);
        set(&mut b.start_bolus, self.itime_start_bolus);
        set(&mut b.duration_minutes, self.b30_duration);
        set(&mut b.target_level, self.itime_target);
        set(&mut b.upper_limit, self.b30_upper_bg);
        set(&mut b.upper_delta, self.b30_upperdelta);
        set(&mut b.basal_factor, self.b30_factor);

        let k = &mut p.keto_protect;
        set(&mut k.enabled, self.keto_protect);
        set(&mut k.variable, self.variable_keto_protect_strategy);
        set(&mut k.basal_percent, self.keto_protect_basal_percent);
        set(&mut k.absolute, self.keto_protect_absolute);
        set(&mut k.basal_absolute, self.keto_protect_basal_absolute);

        p
    }
}

/// Load a policy from a `preferences.json` file
pub fn load_preferences(path: &Path) -> Result<Policy> {
    let contents = std::fs::read_to_string(path)?;
    let policy = OrefPreferences::from_json(&contents)?.into_policy();
    tracing::info!("Loaded preferences from {:?}", path);
    Ok(policy)
}
