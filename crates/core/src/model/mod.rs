//! Model seam: anything that maps a patch batch to per-class predictions.

pub mod backend;
pub mod onnx;

use anyhow::Result;
use ndarray::{Array4, ArrayView4};

pub use backend::{InferenceBackend, ModelConfig};
pub use onnx::OnnxModel;

/// A trained segmentation network.
///
/// `predict` receives `(batch, channels, patch_h, patch_w)` and must return
/// `(batch, classes, patch_h, patch_w)`. It is called with fixed weights and
/// must be deterministic for a given input; multi-device sharding, if any,
/// stays behind this call.
pub trait SegmentationModel {
    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>>;
}

impl<F> SegmentationModel for F
where
    F: Fn(ArrayView4<'_, f32>) -> Result<Array4<f32>>,
{
    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        self(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negate(batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        Ok(batch.mapv(|v| -v))
    }

    #[test]
    fn plain_functions_are_models() {
        let model: &dyn SegmentationModel = &negate;
        let batch = Array4::<f32>::ones((2, 1, 3, 3));
        let out = model.predict(batch.view()).unwrap();
        assert!(out.iter().all(|&v| v == -1.0));
    }
}
