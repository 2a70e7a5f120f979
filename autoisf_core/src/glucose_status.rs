//! Glucose status derived from the smoothed series.
//!
//! Computes, relative to the newest reading:
//! - Average 5-minute deltas over short and long horizons
//! - How long glucose has sat on a plateau (within a 5% band)
//! - A least-squares parabola through the recent readings, which gives the
//!   acceleration used by the sensitivity engine

use crate::GlucoseSample;
use chrono::{DateTime, Utc};

/// Plateau band as a fraction of the running average
const PLATEAU_BAND: f64 = 0.05;
/// A gap longer than this ends the plateau scan, in minutes
const PLATEAU_MAX_GAP_MINUTES: f64 = 13.0;
/// Readings older than this are not used for the parabola, in minutes
const PARABOLA_HORIZON_MINUTES: f64 = 47.5;
const PARABOLA_MIN_POINTS: usize = 4;

/// Least-squares fit `bg = a·t² + b·t + c`, with `t` in 5-minute units and
/// the newest reading at `t = 0`
#[derive(Clone, Debug, PartialEq)]
pub struct ParabolaFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    /// Coefficient of determination (R²)
    pub correlation: f64,
    pub points: usize,
}

impl ParabolaFit {
    /// Second derivative in mg/dL per (5 min)²
    pub fn acceleration(&self) -> f64 {
        2.0 * self.a
    }

    /// Minutes from now to the vertex and the glucose value there
    pub fn turning_point(&self) -> Option<(f64, f64)> {
        if self.a.abs() < f64::EPSILON {
            return None;
        }
        let t = -self.b / (2.0 * self.a);
        Some((t * 5.0, self.a * t * t + self.b * t + self.c))
    }
}

/// Glucose trend summary for one cycle
#[derive(Clone, Debug, PartialEq)]
pub struct GlucoseStatus {
    pub glucose: f64,
    pub timestamp: DateTime<Utc>,
    /// Change per 5 minutes over the last ~5 minutes
    pub delta: f64,
    /// Change per 5 minutes averaged over the last ~15 minutes
    pub short_avg_delta: f64,
    /// Change per 5 minutes averaged over ~20 to ~40 minutes ago
    pub long_avg_delta: f64,
    pub dura_minutes: f64,
    pub dura_average: f64,
    pub parabola: Option<ParabolaFit>,
}

impl GlucoseStatus {
    /// Build the status from an ascending series.
    ///
    /// Returns `None` when there is no reading or the newest one is a sensor
    /// error.
    pub fn from_series(series: &[GlucoseSample]) -> Option<Self> {
        let newest = series.last()?;
        if newest.is_error() {
            return None;
        }

        // newest first; the plateau needs the sensor errors to stop on them
        let all: Vec<&GlucoseSample> = series.iter().rev().collect();
        let recent: Vec<&GlucoseSample> = all.iter().copied().filter(|s| !s.is_error()).collect();

        let (delta, short_avg_delta, long_avg_delta) = deltas(&recent);
        let (dura_minutes, dura_average) = plateau(&all);
        let parabola = best_parabola(&recent);

        Some(Self {
            glucose: newest.value,
            timestamp: newest.timestamp,
            delta,
            short_avg_delta,
            long_avg_delta,
            dura_minutes,
            dura_average,
            parabola,
        })
    }

    pub fn acceleration(&self) -> f64 {
        self.parabola.as_ref().map_or(0.0, ParabolaFit::acceleration)
    }

    pub fn fit_correlation(&self) -> f64 {
        self.parabola.as_ref().map_or(0.0, |p| p.correlation)
    }
}

fn minutes_ago(now: &GlucoseSample, then: &GlucoseSample) -> f64 {
    (now.timestamp - then.timestamp).num_milliseconds() as f64 / 60_000.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn deltas(recent: &[&GlucoseSample]) -> (f64, f64, f64) {
    let now = recent[0];
    let mut last = Vec::new();
    let mut short = Vec::new();
    let mut long = Vec::new();

    for &then in &recent[1..] {
        let minutes = minutes_ago(now, then);
        if minutes <= 2.5 {
            continue;
        }
        let per_five = (now.value - then.value) / minutes * 5.0;
        if minutes < 7.5 {
            last.push(per_five);
        }
        if minutes < 17.5 {
            short.push(per_five);
        } else if minutes < 42.5 {
            long.push(per_five);
        } else {
            break;
        }
    }

    (mean(&last), mean(&short), mean(&long))
}

/// Minutes the readings stayed within the band and their average.
///
/// `series` is newest first and still contains sensor errors; the first one
/// ends the plateau like a gap does.
fn plateau(series: &[&GlucoseSample]) -> (f64, f64) {
    let now = series[0];
    let mut sum = now.value;
    let mut avg = now.value;
    let mut n = 1.0;
    let mut minutes = 0.0;
    let mut previous = now;

    for &then in &series[1..] {
        if then.is_error() || minutes_ago(previous, then) > PLATEAU_MAX_GAP_MINUTES {
            break;
        }
        if then.value > avg * (1.0 - PLATEAU_BAND) && then.value < avg * (1.0 + PLATEAU_BAND) {
            n += 1.0;
            sum += then.value;
            avg = sum / n;
            minutes = minutes_ago(now, then).round();
            previous = then;
        } else {
            break;
        }
    }
    (minutes, avg)
}

/// Fit every window from the minimum size up to the horizon, keep the best
fn best_parabola(recent: &[&GlucoseSample]) -> Option<ParabolaFit> {
    let now = recent[0];
    let points: Vec<(f64, f64)> = recent
        .iter()
        .take_while(|s| minutes_ago(now, s) <= PARABOLA_HORIZON_MINUTES)
        .map(|s| (-minutes_ago(now, s) / 5.0, s.value))
        .collect();

    let mut best: Option<ParabolaFit> = None;
    for n in PARABOLA_MIN_POINTS..=points.len() {
        if let Some(fit) = fit_parabola(&points[..n]) {
            if best.as_ref().map_or(true, |b| fit.correlation > b.correlation) {
                best = Some(fit);
            }
        }
    }
    best
}

fn det3(m: [[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Normal equations solved by Cramer's rule
fn fit_parabola(points: &[(f64, f64)]) -> Option<ParabolaFit> {
    let n = points.len() as f64;
    let (mut sx, mut sx2, mut sx3, mut sx4) = (0.0, 0.0, 0.0, 0.0);
    let (mut sy, mut sxy, mut sx2y) = (0.0, 0.0, 0.0);
    for &(x, y) in points {
        let x2 = x * x;
        sx += x;
        sx2 += x2;
        sx3 += x2 * x;
        sx4 += x2 * x2;
        sy += y;
        sxy += x * y;
        sx2y += x2 * y;
    }

    let m = [[sx4, sx3, sx2], [sx3, sx2, sx], [sx2, sx, n]];
    let rhs = [sx2y, sxy, sy];
    let d = det3(m);
    if d.abs() < 1e-9 {
        return None;
    }

    let solve = |col: usize| {
        let mut mc = m;
        for row in 0..3 {
            mc[row][col] = rhs[row];
        }
        det3(mc) / d
    };
    let (a, b, c) = (solve(0), solve(1), solve(2));

    let y_mean = sy / n;
    let mut ss_tot = 0.0;
    let mut ss_res = 0.0;
    for &(x, y) in points {
        let predicted = a * x * x + b * x + c;
        ss_tot += (y - y_mean).powi(2);
        ss_res += (y - predicted).powi(2);
    }
    if ss_tot <= f64::EPSILON {
        return None;
    }

    Some(ParabolaFit {
        a,
        b,
        c,
        correlation: 1.0 - ss_res / ss_tot,
        points: points.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series_from_values;
    use chrono::Utc;

    #[test]
    fn test_linear_rise_deltas() {
        let series = series_from_values(&[100.0, 105.0, 110.0, 115.0, 120.0], Utc::now());
        let status = GlucoseStatus::from_series(&series).unwrap();
        assert_eq!(status.glucose, 120.0);
        assert!((status.delta - 5.0).abs() < 1e-9);
        assert!((status.short_avg_delta - 5.0).abs() < 1e-9);
        assert!((status.long_avg_delta - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_rise_has_no_acceleration() {
        let series = series_from_values(&[100.0, 105.0, 110.0, 115.0, 120.0], Utc::now());
        let status = GlucoseStatus::from_series(&series).unwrap();
        assert!(status.acceleration().abs() < 1e-6);
        assert!(status.fit_correlation() > 0.99);
    }

    #[test]
    fn test_exact_parabola_recovered() {
        // bg = 2t² + 3t + 150 on t = -5..0
        let values: Vec<f64> = (-5..=0)
            .map(|t| {
                let t = t as f64;
                2.0 * t * t + 3.0 * t + 150.0
            })
            .collect();
        let series = series_from_values(&values, Utc::now());
        let fit = GlucoseStatus::from_series(&series).unwrap().parabola.unwrap();
        assert!((fit.a - 2.0).abs() < 1e-6);
        assert!((fit.b - 3.0).abs() < 1e-6);
        assert!((fit.c - 150.0).abs() < 1e-6);
        assert!((fit.acceleration() - 4.0).abs() < 1e-6);
        assert!(fit.correlation > 0.999);

        let (minutes, value) = fit.turning_point().unwrap();
        assert!((minutes - (-3.75)).abs() < 1e-6);
        assert!((value - 148.875).abs() < 1e-6);
    }

    #[test]
    fn test_flat_series_has_no_fit_and_long_plateau() {
        let series = series_from_values(&[150.0; 13], Utc::now());
        let status = GlucoseStatus::from_series(&series).unwrap();
        assert!(status.parabola.is_none());
        assert_eq!(status.dura_minutes, 60.0);
        assert_eq!(status.dura_average, 150.0);
    }

    #[test]
    fn test_plateau_stops_outside_band() {
        let series = series_from_values(&[100.0, 150.0, 152.0, 151.0], Utc::now());
        let status = GlucoseStatus::from_series(&series).unwrap();
        assert_eq!(status.dura_minutes, 10.0);
    }

    #[test]
    fn test_plateau_stops_at_sensor_error() {
        let mut values = vec![150.0; 7];
        values.push(38.0);
        values.extend([150.0; 6]);
        let series = series_from_values(&values, Utc::now());
        let status = GlucoseStatus::from_series(&series).unwrap();
        assert_eq!(status.dura_minutes, 25.0);
        assert_eq!(status.dura_average, 150.0);

        let mut flagged = series_from_values(&[150.0; 8], Utc::now());
        flagged[4].is_sentinel_error = true;
        let status = GlucoseStatus::from_series(&flagged).unwrap();
        assert_eq!(status.dura_minutes, 10.0);
    }

    #[test]
    fn test_sentinel_newest_gives_none() {
        let series = series_from_values(&[100.0, 105.0, 38.0], Utc::now());
        assert!(GlucoseStatus::from_series(&series).is_none());
        assert!(GlucoseStatus::from_series(&[]).is_none());
    }

    #[test]
    fn test_sentinels_skipped_inside_history() {
        let series = series_from_values(&[100.0, 38.0, 110.0, 115.0], Utc::now());
        let status = GlucoseStatus::from_series(&series).unwrap();
        assert!((status.delta - 5.0).abs() < 1e-9);
    }
}
