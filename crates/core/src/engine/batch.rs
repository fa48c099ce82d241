//! Patch batch inferer: stacks windows into batches, runs the model and
//! accumulates weighted predictions over the padded image.

use std::sync::mpsc::sync_channel;
use std::thread;

use ndarray::{s, Array2, Array3, Array4, ArrayView3, Axis, Zip};
use tracing::{debug, trace};

use crate::engine::window::Window;
use crate::error::{InferenceError, Result};
use crate::model::SegmentationModel;

/// Batches extracted ahead of the model when pipelining is enabled.
pub const PREFETCH_DEPTH: usize = 2;

/// Running weighted sums over the padded image for one pass.
///
/// The weight total is stored once per pixel since every class receives the
/// same blend weight.
#[derive(Debug)]
pub struct Accumulator {
    weighted_sum: Array3<f32>,
    weight_total: Array2<f32>,
}

impl Accumulator {
    pub fn new(num_classes: usize, (height, width): (usize, usize)) -> Self {
        Self {
            weighted_sum: Array3::zeros((num_classes, height, width)),
            weight_total: Array2::zeros((height, width)),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.weighted_sum.len_of(Axis(0))
    }

    pub fn size(&self) -> (usize, usize) {
        self.weight_total.dim()
    }

    /// Add `prediction * weights` into the window's region.
    pub fn add(
        &mut self,
        window: &Window,
        prediction: ArrayView3<'_, f32>,
        weights: &Array2<f32>,
    ) -> Result<()> {
        if !window.fits_within(self.size()) {
            let (h, w) = self.size();
            return Err(InferenceError::geometry(format!(
                "window {window:?} lies outside the {h}x{w} accumulator"
            )));
        }
        let expected = (self.num_classes(), window.height, window.width);
        if prediction.dim() != expected {
            return Err(InferenceError::model_output(format!(
                "expected patch prediction of shape {expected:?}, got {:?}",
                prediction.dim()
            )));
        }
        if weights.dim() != (window.height, window.width) {
            return Err(InferenceError::geometry(format!(
                "weight map {:?} does not match window {}x{}",
                weights.dim(),
                window.height,
                window.width
            )));
        }

        let mut region = self
            .weighted_sum
            .slice_mut(s![.., window.rows(), window.cols()]);
        Zip::from(&mut region)
            .and(&prediction)
            .and_broadcast(weights)
            .for_each(|acc, &p, &w| *acc += p * w);

        let mut total = self.weight_total.slice_mut(s![window.rows(), window.cols()]);
        total += weights;
        Ok(())
    }

    /// `weighted_sum / weight_total`; every pixel must have been touched.
    pub fn normalize(self) -> Result<Array3<f32>> {
        let Self {
            mut weighted_sum,
            weight_total,
        } = self;

        if let Some(((y, x), _)) = weight_total.indexed_iter().find(|(_, w)| **w <= 0.0) {
            return Err(InferenceError::geometry(format!(
                "pixel ({y}, {x}) was not covered by any window"
            )));
        }

        Zip::from(&mut weighted_sum)
            .and_broadcast(&weight_total)
            .for_each(|sum, &w| *sum /= w);
        Ok(weighted_sum)
    }
}

/// Batch progress within a single pass (1-based `batch`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub pipelined: bool,
}

/// Stack the windows of one batch into a `(B, C, patch_h, patch_w)` tensor.
pub fn extract_batch(padded: ArrayView3<'_, f32>, windows: &[Window]) -> Result<Array4<f32>> {
    let (channels, height, width) = padded.dim();
    let Some(first) = windows.first() else {
        return Err(InferenceError::geometry("cannot extract an empty batch"));
    };
    let patch = (first.height, first.width);

    for window in windows {
        if (window.height, window.width) != patch {
            return Err(InferenceError::geometry(format!(
                "window {window:?} differs from batch patch size {patch:?}"
            )));
        }
        if !window.fits_within((height, width)) {
            return Err(InferenceError::geometry(format!(
                "window {window:?} lies outside the {height}x{width} padded image"
            )));
        }
    }

    let mut batch = Array4::<f32>::zeros((windows.len(), channels, patch.0, patch.1));

    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        batch
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(windows.par_iter())
            .for_each(|(mut slot, window)| {
                slot.assign(&padded.slice(s![.., window.rows(), window.cols()]));
            });
    }
    #[cfg(not(feature = "rayon"))]
    {
        for (mut slot, window) in batch.axis_iter_mut(Axis(0)).zip(windows) {
            slot.assign(&padded.slice(s![.., window.rows(), window.cols()]));
        }
    }

    Ok(batch)
}

struct PassState<'a> {
    padded_size: (usize, usize),
    weights: &'a Array2<f32>,
    accumulator: Option<Accumulator>,
}

impl PassState<'_> {
    fn consume(
        &mut self,
        model: &dyn SegmentationModel,
        windows: &[Window],
        batch: Array4<f32>,
    ) -> Result<()> {
        let output = model
            .predict(batch.view())
            .map_err(InferenceError::Model)?;

        let (n, classes, h, w) = output.dim();
        if n != windows.len() {
            return Err(InferenceError::model_output(format!(
                "batch of {} patches produced {n} predictions",
                windows.len()
            )));
        }
        if (h, w) != self.weights.dim() {
            return Err(InferenceError::model_output(format!(
                "prediction spatial size {h}x{w} differs from patch size {:?}",
                self.weights.dim()
            )));
        }
        if classes == 0 {
            return Err(InferenceError::model_output("prediction has zero classes"));
        }

        let padded_size = self.padded_size;
        let accumulator = self
            .accumulator
            .get_or_insert_with(|| Accumulator::new(classes, padded_size));
        if accumulator.num_classes() != classes {
            return Err(InferenceError::model_output(format!(
                "class count changed between batches ({} then {classes})",
                accumulator.num_classes()
            )));
        }

        for (window, prediction) in windows.iter().zip(output.outer_iter()) {
            accumulator.add(window, prediction, self.weights)?;
        }
        Ok(())
    }
}

/// Run the model over `windows` of `padded` and return the filled accumulator.
///
/// Batches are consumed in planned order on the calling thread, which is the
/// only writer of the accumulator. With `pipelined` set, batch extraction runs
/// on a producer thread up to [`PREFETCH_DEPTH`] batches ahead.
pub fn run_batches(
    padded: ArrayView3<'_, f32>,
    windows: &[Window],
    weights: &Array2<f32>,
    model: &dyn SegmentationModel,
    settings: BatchSettings,
    on_batch: &mut dyn FnMut(BatchProgress),
) -> Result<Accumulator> {
    if settings.batch_size == 0 {
        return Err(InferenceError::config("batch size must be at least 1"));
    }
    if windows.is_empty() {
        return Err(InferenceError::geometry("no windows to run"));
    }

    let (_, height, width) = padded.dim();
    let batch_size = settings.batch_size;
    let batches = windows.len().div_ceil(batch_size);
    let mut state = PassState {
        padded_size: (height, width),
        weights,
        accumulator: None,
    };

    debug!(
        windows = windows.len(),
        batches,
        batch_size,
        pipelined = settings.pipelined,
        padded_h = height,
        padded_w = width,
        "Starting patch batches"
    );

    if settings.pipelined && batches > 1 {
        thread::scope(|scope| -> Result<()> {
            let (tx, rx) = sync_channel::<Result<Array4<f32>>>(PREFETCH_DEPTH);
            scope.spawn(move || {
                for chunk in windows.chunks(batch_size) {
                    let batch = extract_batch(padded, chunk);
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                }
            });

            let mut consumed = 0;
            for (chunk, batch) in windows.chunks(batch_size).zip(rx) {
                state.consume(model, chunk, batch?)?;
                consumed += 1;
                trace!(batch = consumed, batches, "Batch accumulated");
                on_batch(BatchProgress {
                    batch: consumed,
                    batches,
                });
            }
            if consumed != batches {
                return Err(InferenceError::geometry(format!(
                    "batch producer stopped after {consumed} of {batches} batches"
                )));
            }
            Ok(())
        })?;
    } else {
        for (index, chunk) in windows.chunks(batch_size).enumerate() {
            let batch = extract_batch(padded, chunk)?;
            state.consume(model, chunk, batch)?;
            trace!(batch = index + 1, batches, "Batch accumulated");
            on_batch(BatchProgress {
                batch: index + 1,
                batches,
            });
        }
    }

    state
        .accumulator
        .ok_or_else(|| InferenceError::geometry("no batches were accumulated"))
}
