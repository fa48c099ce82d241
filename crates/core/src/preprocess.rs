//! Intensity preprocessing applied to microscopy images before inference.

use ndarray::{Array3, ArrayViewMut2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{InferenceError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Replace NaN with 0 and infinities with the largest finite values.
    pub nan_to_num: bool,
    pub lower_percentile: f32,
    pub upper_percentile: f32,
    pub target_min: f32,
    pub target_max: f32,
    pub clip: bool,
    /// Compute percentiles per channel instead of over the whole image.
    pub channel_wise: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            nan_to_num: true,
            lower_percentile: 0.5,
            upper_percentile: 99.5,
            target_min: 0.0,
            target_max: 1.0,
            clip: true,
            channel_wise: true,
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<()> {
        let (lower, upper) = (self.lower_percentile, self.upper_percentile);
        if !(0.0..=100.0).contains(&lower) || !(0.0..=100.0).contains(&upper) || lower > upper {
            return Err(InferenceError::config(format!(
                "percentiles must satisfy 0 <= lower <= upper <= 100, got {lower} and {upper}"
            )));
        }
        if !self.target_min.is_finite() || !self.target_max.is_finite() {
            return Err(InferenceError::config("target intensity range must be finite"));
        }
        Ok(())
    }
}

/// Apply `config` to a `(C, H, W)` image in place.
pub fn preprocess(image: &mut Array3<f32>, config: &PreprocessConfig) -> Result<()> {
    config.validate()?;
    if config.nan_to_num {
        nan_to_num(image);
    }

    if config.channel_wise {
        for (channel, mut plane) in image.axis_iter_mut(Axis(0)).enumerate() {
            let (lo, hi) = percentile_bounds(plane.iter().copied(), config);
            debug!(channel, lo, hi, "Scaling channel intensities");
            scale_intensity(plane.view_mut(), lo, hi, config);
        }
    } else {
        let (lo, hi) = percentile_bounds(image.iter().copied(), config);
        debug!(lo, hi, "Scaling image intensities");
        for plane in image.axis_iter_mut(Axis(0)) {
            scale_intensity(plane, lo, hi, config);
        }
    }
    Ok(())
}

pub fn nan_to_num(image: &mut Array3<f32>) {
    image.mapv_inplace(|v| {
        if v.is_nan() {
            0.0
        } else if v == f32::INFINITY {
            f32::MAX
        } else if v == f32::NEG_INFINITY {
            f32::MIN
        } else {
            v
        }
    });
}

/// Linearly interpolated percentile of `values`; `q` is in `[0, 100]`.
///
/// NaN values sort last. Returns 0 for an empty input.
pub fn percentile(values: &mut [f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let rank = (q.clamp(0.0, 100.0) as f64 / 100.0) * (values.len() - 1) as f64;
    let below = rank.floor() as usize;
    let above = rank.ceil() as usize;
    if below == above {
        return values[below];
    }
    // f64 keeps the span between f32::MIN and f32::MAX finite
    let frac = rank - below as f64;
    let (a, b) = (f64::from(values[below]), f64::from(values[above]));
    (a * (1.0 - frac) + b * frac) as f32
}

fn percentile_bounds(values: impl Iterator<Item = f32>, config: &PreprocessConfig) -> (f32, f32) {
    let mut values: Vec<f32> = values.collect();
    let lo = percentile(&mut values, config.lower_percentile);
    // already sorted; the second call only interpolates
    let hi = percentile(&mut values, config.upper_percentile);
    (lo, hi)
}

fn scale_intensity(mut plane: ArrayViewMut2<'_, f32>, lo: f32, hi: f32, config: &PreprocessConfig) {
    let (b_min, b_max) = (config.target_min, config.target_max);
    let range = f64::from(hi) - f64::from(lo);

    if range == 0.0 {
        warn!(lo, "Intensity range is empty, shifting to the target minimum");
        plane.mapv_inplace(|v| v - lo + b_min);
    } else if !range.is_finite() {
        warn!(lo, hi, "Intensity range is not finite, leaving values unscaled");
    } else {
        let (lo, b_min) = (f64::from(lo), f64::from(b_min));
        let scale = (f64::from(b_max) - b_min) / range;
        plane.mapv_inplace(|v| ((f64::from(v) - lo) * scale + b_min) as f32);
    }

    if config.clip {
        let (min, max) = (b_min.min(b_max), b_min.max(b_max));
        plane.mapv_inplace(|v| v.clamp(min, max));
    }
}
