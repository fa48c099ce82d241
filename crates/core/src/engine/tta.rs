//! Test-time augmentation: augmented variants, their inverses and the
//! incremental mean across variants.

use ndarray::{Array3, ArrayView3, Zip};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::engine::transform::{flip, FlipAxis};
use crate::error::{InferenceError, Result};

pub const DEFAULT_NOISE_STD: f32 = 0.001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtaConfig {
    pub enabled: bool,
    pub noise_std: f32,
    pub flip_axes: Vec<FlipAxis>,
    /// Noise + flip rounds after the identity pass; each draws fresh noise.
    pub rounds: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for TtaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            noise_std: DEFAULT_NOISE_STD,
            flip_axes: vec![FlipAxis::Height, FlipAxis::Width],
            rounds: 1,
            seed: None,
        }
    }
}

impl TtaConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.noise_std.is_finite() || self.noise_std < 0.0 {
            return Err(InferenceError::config(format!(
                "noise std must be a finite value >= 0, got {}",
                self.noise_std
            )));
        }
        if self.enabled && self.rounds == 0 {
            return Err(InferenceError::config("tta rounds must be at least 1"));
        }
        Ok(())
    }
}

/// One augmented view of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Identity,
    /// Fresh noise draw; later flips in the same round reuse it.
    Noise,
    /// Flip of the current round's noised image.
    Flip(FlipAxis),
}

impl Variant {
    /// Inverse transform applied to the network output of this variant.
    pub fn invert(self, prediction: Array3<f32>) -> Array3<f32> {
        match self {
            Self::Identity | Self::Noise => prediction,
            Self::Flip(axis) => flip(prediction.view(), axis),
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::Noise => write!(f, "noise"),
            Self::Flip(axis) => write!(f, "flip-{axis}"),
        }
    }
}

/// Ordered variant list: identity, then per round noise followed by flips.
pub fn variant_schedule(config: &TtaConfig) -> Vec<Variant> {
    let mut schedule = vec![Variant::Identity];
    if !config.enabled {
        return schedule;
    }

    let mut axes: Vec<FlipAxis> = Vec::with_capacity(config.flip_axes.len());
    for axis in &config.flip_axes {
        if !axes.contains(axis) {
            axes.push(*axis);
        }
    }

    for _ in 0..config.rounds {
        schedule.push(Variant::Noise);
        schedule.extend(axes.iter().map(|&axis| Variant::Flip(axis)));
    }
    schedule
}

pub fn noise_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// `image + N(0, std)` as a new array; the input is untouched.
pub fn add_gaussian_noise(
    image: ArrayView3<'_, f32>,
    std: f32,
    rng: &mut StdRng,
) -> Result<Array3<f32>> {
    let mut noised = image.as_standard_layout().into_owned();
    if std == 0.0 {
        return Ok(noised);
    }
    let normal = Normal::new(0.0f32, std)
        .map_err(|e| InferenceError::config(format!("invalid noise std {std}: {e}")))?;
    noised.mapv_inplace(|v| v + normal.sample(&mut *rng));
    Ok(noised)
}

/// Incremental mean over predictions: `mean += (p - mean) / n`.
#[derive(Debug, Default)]
pub struct RunningMean {
    mean: Option<Array3<f32>>,
    count: usize,
}

impl RunningMean {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn push(&mut self, prediction: Array3<f32>) -> Result<()> {
        let Some(mean) = self.mean.as_mut() else {
            self.mean = Some(prediction);
            self.count = 1;
            return Ok(());
        };

        if mean.dim() != prediction.dim() {
            return Err(InferenceError::model_output(format!(
                "variant prediction {:?} differs from previous {:?}",
                prediction.dim(),
                mean.dim()
            )));
        }
        self.count += 1;
        let n = self.count as f32;
        Zip::from(mean)
            .and(&prediction)
            .for_each(|m, &p| *m += (p - *m) / n);
        Ok(())
    }

    pub fn finish(self) -> Option<Array3<f32>> {
        self.mean
    }
}
