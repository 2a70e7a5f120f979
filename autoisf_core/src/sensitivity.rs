//! autoISF sensitivity ratio fusion.
//!
//! Five independent factors look at different aspects of the glucose trace:
//! - Acceleration: curvature of the fitted parabola
//! - BG level: where glucose sits relative to target
//! - Delta: how fast glucose is rising
//! - Duration: how long glucose has plateaued above target
//! - Post-meal: rise during the configured window after a meal
//!
//! Each factor yields a strength `s` (above 1 means insulin should act
//! stronger). Its contribution to the ISF ratio is `1 / s`, so a rising
//! trace pushes the ratio below 1. Contributions are multiplied and the
//! product is clamped into `[min_ratio, max_ratio]`.

use crate::glucose_status::GlucoseStatus;
use crate::policy::AutoIsfPolicy;
use crate::{SensitivityContribution, SensitivityFactor};

/// Fits below this correlation do not drive the acceleration factor
const MIN_FIT_CORRELATION: f64 = 0.9;
/// A predicted minimum this close (minutes) and below target starts braking
const BRAKE_HORIZON_MINUTES: f64 = 30.0;
/// Lower bound on a factor strength before inversion
const MIN_STRENGTH: f64 = 0.1;

const BG_POLY_X: [f64; 9] = [50.0, 60.0, 80.0, 90.0, 100.0, 110.0, 150.0, 180.0, 200.0];
const BG_POLY_Y: [f64; 9] = [-0.5, -0.5, -0.3, -0.2, 0.0, 0.0, 0.5, 0.7, 0.7];
const DELTA_POLY_X: [f64; 5] = [2.0, 7.0, 12.0, 16.0, 20.0];
const DELTA_POLY_Y: [f64; 5] = [0.0, 0.0, 0.4, 0.7, 0.7];

/// Per-cycle inputs to the fusion
#[derive(Clone, Debug)]
pub struct FusionInputs<'a> {
    pub status: &'a GlucoseStatus,
    pub target_bg: f64,
    pub cob: f64,
    pub hours_since_meal: Option<f64>,
}

/// Combined ratio plus the per-factor audit trail
#[derive(Clone, Debug, PartialEq)]
pub struct FusionResult {
    pub ratio: f64,
    /// Product of contributions before clamping
    pub raw_ratio: f64,
    pub contributions: Vec<SensitivityContribution>,
    pub clamped: bool,
    pub reasons: Vec<String>,
}

impl FusionResult {
    /// Ratio 1.0 with every factor inactive
    pub fn neutral(reason: impl Into<String>) -> Self {
        Self {
            ratio: 1.0,
            raw_ratio: 1.0,
            contributions: SensitivityFactor::ALL
                .iter()
                .map(|f| SensitivityContribution::neutral(*f))
                .collect(),
            clamped: false,
            reasons: vec![reason.into()],
        }
    }
}

/// Fuses the five factors under one policy snapshot
pub struct SensitivityRatioEngine<'a> {
    policy: &'a AutoIsfPolicy,
}

impl<'a> SensitivityRatioEngine<'a> {
    pub fn new(policy: &'a AutoIsfPolicy) -> Self {
        Self { policy }
    }

    /// Compute the combined ratio for this cycle
    pub fn evaluate(&self, inputs: &FusionInputs<'_>) -> FusionResult {
        if !self.policy.enabled {
            return FusionResult::neutral("autoISF disabled");
        }

        let mut reasons = Vec::new();
        let contributions = vec![
            self.acceleration(inputs, &mut reasons),
            self.bg_level(inputs, &mut reasons),
            self.delta(inputs, &mut reasons),
            self.duration(inputs, &mut reasons),
            self.post_meal(inputs, &mut reasons),
        ];

        let mut raw_ratio: f64 = contributions
            .iter()
            .filter(|c| c.active)
            .map(|c| c.ratio)
            .product();
        if !raw_ratio.is_finite() {
            reasons.push("autoISF product not finite; using 1.0".to_string());
            raw_ratio = 1.0;
        }

        let (min, max) = (self.policy.min_ratio, self.policy.max_ratio);
        let ratio = raw_ratio.clamp(min, max);
        let clamped = ratio != raw_ratio;
        if raw_ratio < min {
            reasons.push(format!(
                "autoISF ratio {:.2} limited by autoISF_min {}",
                raw_ratio, min
            ));
        } else if raw_ratio > max {
            reasons.push(format!(
                "autoISF ratio {:.2} limited by autoISF_max {}",
                raw_ratio, max
            ));
        }
        reasons.push(format!("autoISF ratio {:.2}", ratio));

        tracing::debug!(raw_ratio, ratio, clamped, "autoISF fusion complete");

        FusionResult {
            ratio,
            raw_ratio,
            contributions,
            clamped,
            reasons,
        }
    }

    fn acceleration(&self, inputs: &FusionInputs<'_>, reasons: &mut Vec<String>) -> SensitivityContribution {
        let factor = SensitivityFactor::Acceleration;
        let p = self.policy;
        if !p.enable_bg_acceleration {
            return SensitivityContribution::neutral(factor);
        }
        let Some(fit) = inputs.status.parabola.as_ref() else {
            return SensitivityContribution::neutral(factor);
        };
        if fit.correlation < MIN_FIT_CORRELATION {
            reasons.push(format!(
                "acce_ISF by-passed; fit correlation {:.3}",
                fit.correlation
            ));
            return SensitivityContribution::neutral(factor);
        }

        let accel = fit.acceleration();
        let mut weight = if accel < 0.0 {
            p.bg_brake_weight
        } else {
            p.bg_accel_weight
        };
        if accel > 0.0 {
            if let Some((minutes, value)) = fit.turning_point() {
                if minutes > 0.0 && minutes <= BRAKE_HORIZON_MINUTES && value < inputs.target_bg {
                    weight = -p.bg_brake_weight;
                    reasons.push(format!(
                        "minimum of {:.0} predicted in {:.0}m is below target; braking",
                        value, minutes
                    ));
                }
            }
        }
        if weight == 0.0 {
            return SensitivityContribution::neutral(factor);
        }

        let fit_share = 10.0 * (fit.correlation - MIN_FIT_CORRELATION);
        let cap_weight = if inputs.status.glucose < inputs.target_bg && accel > 1.0 {
            0.5
        } else {
            1.0
        };
        let strength = 1.0 + accel * cap_weight * weight * fit_share;
        reasons.push(format!("acce_ISF strength {:.2}", strength));
        contribution(factor, strength)
    }

    fn bg_level(&self, inputs: &FusionInputs<'_>, reasons: &mut Vec<String>) -> SensitivityContribution {
        let factor = SensitivityFactor::BgLevel;
        // x > 100 only once glucose is above target + 10
        let x = 100.0 - bg_offset(inputs);
        let weight = if x > 100.0 {
            self.policy.higher_range_weight
        } else {
            self.policy.lower_range_weight
        };
        if weight == 0.0 {
            return SensitivityContribution::neutral(factor);
        }

        let strength = 1.0 + interpolate(&BG_POLY_X, &BG_POLY_Y, x) * weight;
        reasons.push(format!("bg_ISF strength {:.2}", strength));
        contribution(factor, strength)
    }

    fn delta(&self, inputs: &FusionInputs<'_>, reasons: &mut Vec<String>) -> SensitivityContribution {
        let factor = SensitivityFactor::Delta;
        let weight = self.policy.delta_range_weight;
        if weight == 0.0 {
            return SensitivityContribution::neutral(factor);
        }
        if self.post_meal_window(inputs) {
            reasons.push("delta_ISF by-passed; post-meal window open".to_string());
            return SensitivityContribution::neutral(factor);
        }
        if let Some(why) = rise_bypass(inputs) {
            reasons.push(format!("delta_ISF by-passed; {}", why));
            return SensitivityContribution::neutral(factor);
        }

        let mut adjustment =
            interpolate(&DELTA_POLY_X, &DELTA_POLY_Y, inputs.status.short_avg_delta) * weight;
        // half effect within 30 mg/dL of target
        if bg_offset(inputs) > -20.0 {
            adjustment *= 0.5;
        }
        let strength = 1.0 + adjustment;
        reasons.push(format!("delta_ISF strength {:.2}", strength));
        contribution(factor, strength)
    }

    fn duration(&self, inputs: &FusionInputs<'_>, reasons: &mut Vec<String>) -> SensitivityContribution {
        let factor = SensitivityFactor::Duration;
        let p = self.policy;
        let s = inputs.status;
        if p.dura_weight == 0.0 {
            return SensitivityContribution::neutral(factor);
        }
        if inputs.cob > 0.0 && !p.enable_dura_with_cob {
            reasons.push(format!("dura_ISF by-passed; COB of {:.1}", inputs.cob));
            return SensitivityContribution::neutral(factor);
        }
        if s.dura_minutes < 10.0 {
            return SensitivityContribution::neutral(factor);
        }
        if s.dura_average <= inputs.target_bg {
            reasons.push(format!(
                "dura_ISF by-passed; plateau average {:.0} not above target",
                s.dura_average
            ));
            return SensitivityContribution::neutral(factor);
        }

        let strength = 1.0
            + (s.dura_minutes / 60.0)
                * (p.dura_weight / inputs.target_bg)
                * (s.dura_average - inputs.target_bg);
        reasons.push(format!(
            "dura_ISF strength {:.2} after {:.0}m at {:.0}",
            strength, s.dura_minutes, s.dura_average
        ));
        contribution(factor, strength)
    }

    fn post_meal(&self, inputs: &FusionInputs<'_>, reasons: &mut Vec<String>) -> SensitivityContribution {
        let factor = SensitivityFactor::PostMeal;
        let weight = self.policy.post_meal_weight;
        if weight == 0.0 || !self.post_meal_window(inputs) {
            return SensitivityContribution::neutral(factor);
        }
        if let Some(why) = rise_bypass(inputs) {
            reasons.push(format!("pp_ISF by-passed; {}", why));
            return SensitivityContribution::neutral(factor);
        }

        let strength = 1.0 + (inputs.status.delta * weight).max(0.0);
        reasons.push(format!("pp_ISF strength {:.2}", strength));
        contribution(factor, strength)
    }

    fn post_meal_window(&self, inputs: &FusionInputs<'_>) -> bool {
        self.policy.post_meal_always
            || inputs
                .hours_since_meal
                .is_some_and(|h| h >= 0.0 && h <= self.policy.post_meal_duration_hours)
    }
}

/// `target + 10 - bg`; positive when glucose is close to or below target
fn bg_offset(inputs: &FusionInputs<'_>) -> f64 {
    inputs.target_bg + 10.0 - inputs.status.glucose
}

/// Reasons the rise-driven factors stay neutral
fn rise_bypass(inputs: &FusionInputs<'_>) -> Option<String> {
    if bg_offset(inputs) > 0.0 {
        Some(format!("glucose below {:.0}", inputs.target_bg + 10.0))
    } else if inputs.status.short_avg_delta < 0.0 {
        Some("no sustained rise".to_string())
    } else {
        None
    }
}

fn contribution(factor: SensitivityFactor, strength: f64) -> SensitivityContribution {
    SensitivityContribution {
        factor,
        ratio: 1.0 / strength.max(MIN_STRENGTH),
        active: true,
    }
}

/// Piecewise-linear lookup with linear extrapolation from the end segments
pub fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let last = xs.len() - 1;
    let segment = |i: usize| {
        let (x0, x1, y0, y1) = (xs[i], xs[i + 1], ys[i], ys[i + 1]);
        y0 + (y1 - y0) / (x1 - x0) * (x - x0)
    };

    if x < xs[0] {
        return segment(0);
    }
    if x > xs[last] {
        return segment(last - 1);
    }
    for i in 0..last {
        if x == xs[i] {
            return ys[i];
        }
        if x < xs[i + 1] {
            return segment(i);
        }
    }
    ys[last]
}
