//! Sliding-window inference with Gaussian blending and test-time augmentation.
//!
//! One [`SlidingWindowInferer`] holds a validated configuration and the blend
//! weights for its patch size. Every `infer*` call plans windows, pads,
//! accumulates and crops with state that is dropped when the call returns.

pub mod batch;
pub mod blend;
pub mod transform;
pub mod tta;
pub mod window;

use ndarray::{Array2, Array3, ArrayView3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{InferenceError, Result};
use crate::model::SegmentationModel;

pub use batch::{run_batches, Accumulator, BatchProgress, BatchSettings};
pub use blend::{gaussian_weight_map, weight_map, BlendMode, DEFAULT_SIGMA_SCALE};
pub use transform::{crop, flip, replicate_pad, FlipAxis};
pub use tta::{variant_schedule, RunningMean, TtaConfig, Variant};
pub use window::{plan_windows, Window, WindowPlan};

pub const DEFAULT_PATCH_SIZE: (usize, usize) = (512, 512);
pub const DEFAULT_OVERLAP: f32 = 0.5;
pub const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub patch_size: (usize, usize),
    pub overlap: f32,
    pub batch_size: usize,
    pub blend_mode: BlendMode,
    pub sigma_scale: f32,
    /// Extract the next batches on a producer thread while the model runs.
    pub pipelined: bool,
    pub tta: TtaConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            patch_size: DEFAULT_PATCH_SIZE,
            overlap: DEFAULT_OVERLAP,
            batch_size: DEFAULT_BATCH_SIZE,
            blend_mode: BlendMode::Gaussian,
            sigma_scale: DEFAULT_SIGMA_SCALE,
            pipelined: true,
            tta: TtaConfig::default(),
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<()> {
        let (h, w) = self.patch_size;
        if h == 0 || w == 0 {
            return Err(InferenceError::config(format!(
                "patch size must be positive, got {h}x{w}"
            )));
        }
        window::validate_overlap(self.overlap)?;
        if self.batch_size == 0 {
            return Err(InferenceError::config("batch size must be at least 1"));
        }
        self.tta.validate()
    }

    fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            batch_size: self.batch_size,
            pipelined: self.pipelined,
        }
    }
}

/// Progress of one `infer*` call, reported after every accumulated batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceProgress {
    pub variant: Variant,
    /// 1-based position of `variant` in the schedule.
    pub variant_index: usize,
    pub variants: usize,
    pub batch: usize,
    pub batches: usize,
}

pub struct SlidingWindowInferer {
    config: InferenceConfig,
    weights: Array2<f32>,
}

impl SlidingWindowInferer {
    pub fn new(config: InferenceConfig) -> Result<Self> {
        config.validate()?;
        let weights = weight_map(config.patch_size, config.blend_mode, config.sigma_scale)?;
        Ok(Self { config, weights })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn plan(&self, image_size: (usize, usize)) -> Result<WindowPlan> {
        plan_windows(image_size, self.config.patch_size, self.config.overlap)
    }

    /// Single blended pass over `image` with no augmentation.
    pub fn infer(
        &self,
        image: ArrayView3<'_, f32>,
        model: &dyn SegmentationModel,
    ) -> Result<Array3<f32>> {
        let plan = self.plan_for(image)?;
        self.run_pass(image, &plan, model, &mut |_| {})
    }

    pub fn infer_with_tta(
        &self,
        image: ArrayView3<'_, f32>,
        model: &dyn SegmentationModel,
    ) -> Result<Array3<f32>> {
        self.infer_with_progress(image, model, &mut |_| {})
    }

    /// Run every variant of the TTA schedule and return their mean
    /// `(classes, height, width)` prediction.
    pub fn infer_with_progress(
        &self,
        image: ArrayView3<'_, f32>,
        model: &dyn SegmentationModel,
        on_progress: &mut dyn FnMut(InferenceProgress),
    ) -> Result<Array3<f32>> {
        let plan = self.plan_for(image)?;
        let tta = &self.config.tta;
        let schedule = variant_schedule(tta);
        let mut rng = tta::noise_rng(tta.seed);

        info!(
            height = plan.image_size.0,
            width = plan.image_size.1,
            windows = plan.len(),
            padded = plan.needs_padding(),
            variants = schedule.len(),
            "Starting sliding-window inference"
        );

        let mut mean = RunningMean::default();
        let mut noised: Option<Array3<f32>> = None;

        for (index, &variant) in schedule.iter().enumerate() {
            let mut report = |p: BatchProgress| {
                on_progress(InferenceProgress {
                    variant,
                    variant_index: index + 1,
                    variants: schedule.len(),
                    batch: p.batch,
                    batches: p.batches,
                })
            };

            let prediction = match variant {
                Variant::Identity => self.run_pass(image, &plan, model, &mut report)?,
                Variant::Noise => {
                    let current = tta::add_gaussian_noise(image, tta.noise_std, &mut rng)?;
                    let prediction = self.run_pass(current.view(), &plan, model, &mut report)?;
                    noised = Some(current);
                    prediction
                }
                Variant::Flip(axis) => {
                    let source = noised.as_ref().map_or(image, |n| n.view());
                    let flipped = flip(source, axis);
                    let prediction = self.run_pass(flipped.view(), &plan, model, &mut report)?;
                    variant.invert(prediction)
                }
            };

            mean.push(prediction)?;
            debug!(%variant, count = mean.count(), "Variant accumulated");
        }

        mean.finish()
            .ok_or_else(|| InferenceError::geometry("no variants were run"))
    }

    fn plan_for(&self, image: ArrayView3<'_, f32>) -> Result<WindowPlan> {
        let (channels, height, width) = image.dim();
        if channels == 0 {
            return Err(InferenceError::config("image has no channels"));
        }
        self.plan((height, width))
    }

    fn run_pass(
        &self,
        image: ArrayView3<'_, f32>,
        plan: &WindowPlan,
        model: &dyn SegmentationModel,
        on_batch: &mut dyn FnMut(BatchProgress),
    ) -> Result<Array3<f32>> {
        let padded = replicate_pad(image, plan.padding);
        let accumulator = run_batches(
            padded.view(),
            &plan.windows,
            &self.weights,
            model,
            self.config.batch_settings(),
            on_batch,
        )?;
        crop(accumulator.normalize()?, plan.image_size)
    }
}
