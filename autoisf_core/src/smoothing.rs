//! Glucose noise reduction.
//!
//! A weighted average of first-order and second-order (double) exponential
//! smoothing. The first-order term follows fast changes, the second-order
//! term tracks the trend; the blend trades a little lag for much less
//! sensor noise.
//!
//! The smoother never mutates the caller's history. It returns a new series
//! where only the most recent [`WRITE_BACK_COUNT`] positions may differ.

use crate::{GlucoseSample, INSUFFICIENT_DATA};

/// Gap that ends the usable window, in minutes
pub const MAX_GAP_MINUTES: i64 = 12;
/// Fewer usable samples than this means no smoothing
pub const MIN_WINDOW: usize = 4;
/// Only this many trailing positions are replaced
pub const WRITE_BACK_COUNT: usize = 10;
/// Smoothed values never go below this
pub const SMOOTHED_FLOOR: f64 = 39.0;

const O1_ALPHA: f64 = 0.5;
const O2_ALPHA: f64 = 0.4;
const O2_BETA: f64 = 1.0;
const O1_WEIGHT: f64 = 0.4;

/// Result of one smoothing pass
#[derive(Clone, Debug, PartialEq)]
pub struct SmoothingOutcome {
    /// Sorted, de-duplicated series with the recent tail smoothed
    pub series: Vec<GlucoseSample>,
    /// Trailing samples that fed the filter
    pub window: usize,
    pub applied: bool,
    pub reason: Option<String>,
}

/// Sort ascending by timestamp and drop duplicate timestamps.
///
/// Ties are broken on every field, valid readings first, so the kept sample
/// does not depend on the order the caller supplied.
pub fn normalize(history: &[GlucoseSample]) -> Vec<GlucoseSample> {
    let mut series = history.to_vec();
    series.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.is_error().cmp(&b.is_error()))
            .then_with(|| a.value.total_cmp(&b.value))
            .then_with(|| a.is_sentinel_error.cmp(&b.is_sentinel_error))
    });
    series.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);
    series
}

/// Count trailing samples usable for filtering.
///
/// Scans from the newest sample backward. A sentinel ends the window and is
/// excluded; a gap of [`MAX_GAP_MINUTES`] or more ends the window after the
/// newer sample of the pair.
pub fn usable_window(series: &[GlucoseSample]) -> usize {
    let n = series.len();
    for i in (0..n).rev() {
        if series[i].is_error() {
            return n - 1 - i;
        }
        if i > 0 {
            let gap = series[i].timestamp - series[i - 1].timestamp;
            if gap.num_seconds() >= MAX_GAP_MINUTES * 60 {
                return n - i;
            }
        }
    }
    n
}

/// Smooth the recent tail of `history`.
///
/// Short or gappy data degrades to an unchanged (sorted) series with the
/// reason "insufficient data"; this is never an error. Running the
/// smoother over a series that already contains smoothed values is allowed.
pub fn smooth_series(history: &[GlucoseSample]) -> SmoothingOutcome {
    let mut series = normalize(history);
    let window = usable_window(&series);

    if window < MIN_WINDOW {
        tracing::debug!(
            "Smoothing skipped: window of {} samples (need {})",
            window,
            MIN_WINDOW
        );
        return SmoothingOutcome {
            series,
            window,
            applied: false,
            reason: Some(INSUFFICIENT_DATA.to_string()),
        };
    }

    let n = series.len();
    let start = n - window;
    let values: Vec<f64> = series[start..].iter().map(|s| s.value).collect();
    let smoothed = blend(&values);

    // smoothed[j] belongs to series[start + j]
    let first_written = n.saturating_sub(WRITE_BACK_COUNT).max(start);
    for (i, sample) in series.iter_mut().enumerate().skip(first_written) {
        sample.value = smoothed[i - start].max(SMOOTHED_FLOOR);
    }

    tracing::debug!(
        "Smoothed {} of {} samples (window {})",
        n - first_written,
        n,
        window
    );

    SmoothingOutcome {
        series,
        window,
        applied: true,
        reason: None,
    }
}

/// Weighted average of first- and second-order exponential smoothing.
/// `values` is oldest first and non-empty.
fn blend(values: &[f64]) -> Vec<f64> {
    let seed = values[0];
    let mut o1 = seed;
    let mut level = seed;
    let mut trend = 0.0;

    let mut out = Vec::with_capacity(values.len());
    out.push(O1_WEIGHT * o1 + (1.0 - O1_WEIGHT) * level);

    for &v in &values[1..] {
        o1 = O1_ALPHA * v + (1.0 - O1_ALPHA) * o1;
        let prev_level = level;
        level = O2_ALPHA * v + (1.0 - O2_ALPHA) * (prev_level + trend);
        trend = O2_BETA * (level - prev_level) + (1.0 - O2_BETA) * trend;
        out.push(O1_WEIGHT * o1 + (1.0 - O1_WEIGHT) * level);
    }
    out
}
