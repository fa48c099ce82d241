//! Blend weights for combining overlapping patch predictions.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};

/// Sigma of the Gaussian profile as a fraction of the patch extent.
pub const DEFAULT_SIGMA_SCALE: f32 = 0.125;

/// Lower bound of every weight; keeps `weight_total` positive at patch edges.
pub const MIN_WEIGHT: f32 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    #[default]
    Gaussian,
    Constant,
}

impl BlendMode {
    /// Parse from string (case-insensitive). Returns `Gaussian` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "constant" | "flat" | "uniform" => Self::Constant,
            _ => Self::Gaussian,
        }
    }
}

impl std::fmt::Display for BlendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gaussian => write!(f, "gaussian"),
            Self::Constant => write!(f, "constant"),
        }
    }
}

fn gaussian_profile(len: usize, sigma_scale: f32) -> Array1<f32> {
    let center = (len as f32 - 1.0) / 2.0;
    let sigma = (len as f32 * sigma_scale).max(f32::EPSILON);
    let denom = 2.0 * sigma * sigma;
    Array1::from_shape_fn(len, |i| {
        let d = i as f32 - center;
        (-(d * d) / denom).exp()
    })
}

/// Importance map for one patch: max 1.0 at the center, strictly positive.
pub fn weight_map(
    patch_size: (usize, usize),
    mode: BlendMode,
    sigma_scale: f32,
) -> Result<Array2<f32>> {
    let (h, w) = patch_size;
    if h == 0 || w == 0 {
        return Err(InferenceError::config(format!(
            "patch size must be positive, got {h}x{w}"
        )));
    }

    match mode {
        BlendMode::Constant => Ok(Array2::ones((h, w))),
        BlendMode::Gaussian => {
            if !sigma_scale.is_finite() || sigma_scale <= 0.0 {
                return Err(InferenceError::config(format!(
                    "gaussian sigma scale must be positive, got {sigma_scale}"
                )));
            }
            Ok(gaussian_weight_map(patch_size, sigma_scale))
        }
    }
}

/// Separable Gaussian weight map, normalized so the maximum is exactly 1.0.
pub fn gaussian_weight_map(patch_size: (usize, usize), sigma_scale: f32) -> Array2<f32> {
    let rows = gaussian_profile(patch_size.0, sigma_scale);
    let cols = gaussian_profile(patch_size.1, sigma_scale);

    let mut weights = Array2::from_shape_fn(patch_size, |(y, x)| rows[y] * cols[x]);
    let max = weights.iter().copied().fold(f32::MIN, f32::max);
    if max > 0.0 {
        weights.mapv_inplace(|v| v / max);
    }
    weights.mapv_inplace(|v| v.max(MIN_WEIGHT));
    weights
}
