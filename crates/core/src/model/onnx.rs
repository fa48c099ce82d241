//! ONNX Runtime implementation of [`SegmentationModel`].
//!
//! Supports FP32 models directly and FP16 models via `half` conversion on
//! both sides of `session.run()`.

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, ArrayView4, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use super::backend::{build_session, ModelConfig};
use super::SegmentationModel;

pub struct OnnxModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OnnxModel {
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let session = build_session(config)?;

        let input = session
            .inputs()
            .first()
            .context("ONNX model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("ONNX model declares no outputs")?;

        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
        })
    }

    pub fn is_fp16(&self) -> bool {
        self.is_fp16
    }

    fn run_f32(&self, session: &mut Session, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(input)?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }

    fn run_f16(&self, session: &mut Session, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let f32_data = input.into_raw_vec_and_offset().0;
        let mut fp16_data = vec![f16::ZERO; f32_data.len()];
        fp16_data.convert_from_f32_slice(&f32_data);

        let input_tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, fp16_data)?)?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;

        let standard = output_view.as_standard_layout();
        let fp16_slice = standard
            .as_slice()
            .context("FP16 output is not contiguous")?;
        let mut out = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut out);
        Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), out)?)
    }
}

impl SegmentationModel for OnnxModel {
    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        let input = batch.as_standard_layout().into_owned();
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session mutex poisoned"))?;

        let output = if self.is_fp16 {
            self.run_f16(&mut session, input)?
        } else {
            self.run_f32(&mut session, input)?
        };

        output
            .into_dimensionality::<Ix4>()
            .context("model output is not a 4-D (batch, classes, h, w) tensor")
    }
}
