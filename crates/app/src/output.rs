//! Decoding of `(K, H, W)` network output into label maps, masks and
//! probability images.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{GrayImage, ImageBuffer, Luma};
use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use neuronflow_core::config::{Activation, AxisOrder, OutputConfig};
use tracing::info;

/// Per-pixel class probabilities, `(K, H, W)`, in output orientation.
#[derive(Debug, Clone, PartialEq)]
pub struct Probabilities {
    data: Array3<f32>,
}

/// Files to write for one image. Any field may be absent.
#[derive(Debug, Clone, Default)]
pub struct OutputRequest {
    pub segmentation: Option<PathBuf>,
    pub binary: Option<PathBuf>,
    pub threshold: Option<f32>,
    pub background: Option<PathBuf>,
    pub foreground: Option<PathBuf>,
    pub classes: Vec<(usize, PathBuf)>,
}

impl OutputRequest {
    pub fn is_empty(&self) -> bool {
        self.segmentation.is_none()
            && self.binary.is_none()
            && self.background.is_none()
            && self.foreground.is_none()
            && self.classes.is_empty()
    }
}

pub fn decode(raw: Array3<f32>, config: &OutputConfig) -> Result<Probabilities> {
    let (classes, _, _) = raw.dim();
    if classes == 0 {
        bail!("prediction has no class channels");
    }

    // a one-class softmax is constant 1
    let mut data = match config.activation {
        Activation::None => raw,
        Activation::Sigmoid => sigmoid(raw),
        Activation::Softmax if classes == 1 => sigmoid(raw),
        Activation::Softmax => softmax(raw),
    };
    if config.axis_order == AxisOrder::Wh {
        data = data.permuted_axes([0, 2, 1]).as_standard_layout().into_owned();
    }
    Ok(Probabilities { data })
}

fn sigmoid(logits: Array3<f32>) -> Array3<f32> {
    logits.mapv(|v| 1.0 / (1.0 + (-v).exp()))
}

fn softmax(mut logits: Array3<f32>) -> Array3<f32> {
    for mut lane in logits.lanes_mut(Axis(0)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    logits
}

impl Probabilities {
    pub fn num_classes(&self) -> usize {
        self.data.dim().0
    }

    /// `(height, width)` of the decoded maps.
    pub fn size(&self) -> (usize, usize) {
        let (_, h, w) = self.data.dim();
        (h, w)
    }

    pub fn class(&self, k: usize) -> Result<ArrayView2<'_, f32>> {
        if k >= self.num_classes() {
            bail!(
                "class {k} requested but the model produced {} classes",
                self.num_classes()
            );
        }
        Ok(self.data.index_axis(Axis(0), k))
    }

    /// Foreground probability: `1 - background` for multi-class output, the
    /// single channel itself for one-class output.
    pub fn foreground(&self) -> Array2<f32> {
        let first = self.data.index_axis(Axis(0), 0);
        if self.num_classes() == 1 {
            first.to_owned()
        } else {
            first.mapv(|v| 1.0 - v)
        }
    }

    pub fn background(&self) -> Array2<f32> {
        let first = self.data.index_axis(Axis(0), 0);
        if self.num_classes() == 1 {
            first.mapv(|v| 1.0 - v)
        } else {
            first.to_owned()
        }
    }

    /// Argmax label per pixel. One-class output is split at 0.5.
    pub fn labels(&self) -> Result<Array2<u8>> {
        let classes = self.num_classes();
        if classes > usize::from(u8::MAX) + 1 {
            bail!("{classes} classes do not fit an 8-bit label map");
        }
        if classes == 1 {
            return Ok(self.foreground().mapv(|p| u8::from(p > 0.5)));
        }

        let (h, w) = self.size();
        let mut labels = Array2::<u8>::zeros((h, w));
        Zip::from(&mut labels)
            .and(self.data.lanes(Axis(0)))
            .for_each(|label, lane| {
                let mut best = 0;
                for (k, &p) in lane.iter().enumerate() {
                    if p > lane[best] {
                        best = k;
                    }
                }
                *label = best as u8;
            });
        Ok(labels)
    }

    /// `foreground > threshold`, or `label != 0` without a threshold.
    pub fn binary_mask(&self, threshold: Option<f32>) -> Result<Array2<bool>> {
        match threshold {
            Some(t) => Ok(self.foreground().mapv(|p| p > t)),
            None => Ok(self.labels()?.mapv(|label| label != 0)),
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    Ok(())
}

fn dims_u32(map: (usize, usize)) -> Result<(u32, u32)> {
    let (h, w) = map;
    Ok((u32::try_from(w)?, u32::try_from(h)?))
}

pub fn write_label_map(path: &Path, labels: ArrayView2<'_, u8>) -> Result<()> {
    let (width, height) = dims_u32(labels.dim())?;
    let raw: Vec<u8> = labels.iter().copied().collect();
    let img = GrayImage::from_raw(width, height, raw).context("label buffer size mismatch")?;
    ensure_parent(path)?;
    img.save(path)
        .with_context(|| format!("failed to write label map: {}", path.display()))
}

pub fn write_mask(path: &Path, mask: ArrayView2<'_, bool>) -> Result<()> {
    write_label_map(path, mask.mapv(|m| if m { u8::MAX } else { 0 }).view())
}

/// 16-bit grayscale, `p * 65535` rounded, clamped to `[0, 1]` first.
pub fn write_probability_map(path: &Path, probabilities: ArrayView2<'_, f32>) -> Result<()> {
    let (width, height) = dims_u32(probabilities.dim())?;
    let raw: Vec<u16> = probabilities
        .iter()
        .map(|&p| (p.clamp(0.0, 1.0) * f32::from(u16::MAX)).round() as u16)
        .collect();
    let img = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(width, height, raw)
        .context("probability buffer size mismatch")?;
    ensure_parent(path)?;
    img.save(path)
        .with_context(|| format!("failed to write probability map: {}", path.display()))
}

/// Write every requested file and return the paths written.
pub fn write_outputs(
    probabilities: &Probabilities,
    request: &OutputRequest,
) -> Result<Vec<PathBuf>> {
    for (k, _) in &request.classes {
        probabilities.class(*k)?;
    }

    let mut written = Vec::new();
    if let Some(path) = &request.segmentation {
        write_label_map(path, probabilities.labels()?.view())?;
        written.push(path.clone());
    }
    if let Some(path) = &request.binary {
        write_mask(path, probabilities.binary_mask(request.threshold)?.view())?;
        written.push(path.clone());
    }
    if let Some(path) = &request.background {
        write_probability_map(path, probabilities.background().view())?;
        written.push(path.clone());
    }
    if let Some(path) = &request.foreground {
        write_probability_map(path, probabilities.foreground().view())?;
        written.push(path.clone());
    }
    for (k, path) in &request.classes {
        write_probability_map(path, probabilities.class(*k)?)?;
        written.push(path.clone());
    }

    for path in &written {
        info!(path = %path.display(), "Output written");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn output_config(activation: Activation, axis_order: AxisOrder) -> OutputConfig {
        OutputConfig {
            activation,
            axis_order,
            threshold: None,
        }
    }

    fn three_class_logits() -> Array3<f32> {
        // (3, 2, 2): pixel (0,0) background, (0,1) class 1, (1,0) class 2, (1,1) class 1
        array![
            [[5.0, 0.0], [0.0, 0.0]],
            [[0.0, 4.0], [0.0, 3.0]],
            [[0.0, 0.0], [6.0, 1.0]],
        ]
    }

    #[test]
    fn softmax_sums_to_one_per_pixel() {
        let probs = decode(three_class_logits(), &OutputConfig::default()).unwrap();
        for lane in probs.data.lanes(Axis(0)) {
            assert!((lane.sum() - 1.0).abs() < 1e-6);
        }
        assert!(probs.class(0).unwrap()[[0, 0]] > 0.9);
    }

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let probs = decode(Array3::from_elem((2, 1, 1), 1000.0), &OutputConfig::default()).unwrap();
        assert!(probs.data.iter().all(|&p| (p - 0.5).abs() < 1e-6));
    }

    #[test]
    fn labels_take_the_argmax() {
        let probs = decode(three_class_logits(), &OutputConfig::default()).unwrap();
        assert_eq!(probs.labels().unwrap(), array![[0u8, 1], [2, 1]]);
    }

    #[test]
    fn binary_mask_uses_threshold_or_argmax() {
        let probs = decode(
            three_class_logits(),
            &output_config(Activation::None, AxisOrder::Hw),
        )
        .unwrap();
        assert_eq!(probs.binary_mask(None).unwrap(), array![[false, true], [true, true]]);

        let soft = decode(three_class_logits(), &OutputConfig::default()).unwrap();
        // background probability at (1,1) is about 0.04, so foreground is about 0.96
        let mask = soft.binary_mask(Some(0.5)).unwrap();
        assert_eq!(mask, array![[false, true], [true, true]]);
        let strict = soft.binary_mask(Some(0.99)).unwrap();
        assert!(!strict[[1, 1]]);
    }

    #[test]
    fn wh_axis_order_transposes_spatial_axes() {
        let raw = Array3::from_shape_fn((1, 2, 3), |(_, y, x)| (y * 3 + x) as f32);
        let probs = decode(raw.clone(), &output_config(Activation::None, AxisOrder::Wh)).unwrap();
        assert_eq!(probs.size(), (3, 2));
        assert_eq!(probs.class(0).unwrap()[[2, 1]], raw[[0, 1, 2]]);
    }

    #[test]
    fn single_class_sigmoid_output() {
        let raw = array![[[-10.0f32, 10.0]]];
        let probs = decode(raw, &output_config(Activation::Sigmoid, AxisOrder::Hw)).unwrap();
        assert_eq!(probs.labels().unwrap(), array![[0u8, 1]]);
        assert!(probs.foreground()[[0, 1]] > 0.99);
        assert!(probs.background()[[0, 1]] < 0.01);
    }

    #[test]
    fn single_class_output_with_default_activation() {
        let probs = decode(array![[[-10.0f32, 10.0]]], &OutputConfig::default()).unwrap();
        assert_eq!(probs.labels().unwrap(), array![[0u8, 1]]);
        assert_eq!(probs.binary_mask(Some(0.5)).unwrap(), array![[false, true]]);
        assert!(probs.foreground()[[0, 0]] < 0.01);
    }

    #[test]
    fn unknown_class_is_rejected() {
        let probs = decode(three_class_logits(), &OutputConfig::default()).unwrap();
        assert!(probs.class(3).is_err());
    }

    #[test]
    fn written_files_round_trip_through_png() {
        let dir = tempfile::tempdir().unwrap();
        let probs = decode(three_class_logits(), &OutputConfig::default()).unwrap();
        let request = OutputRequest {
            segmentation: Some(dir.path().join("labels.png")),
            binary: Some(dir.path().join("nested/mask.png")),
            foreground: Some(dir.path().join("fg.png")),
            classes: vec![(2, dir.path().join("class2.png"))],
            ..Default::default()
        };

        let written = write_outputs(&probs, &request).unwrap();
        assert_eq!(written.len(), 4);

        let labels = image::open(dir.path().join("labels.png")).unwrap().to_luma8();
        assert_eq!(labels.get_pixel(0, 1).0, [2]);
        assert_eq!(labels.get_pixel(1, 0).0, [1]);

        let mask = image::open(dir.path().join("nested/mask.png")).unwrap().to_luma8();
        assert_eq!(mask.get_pixel(0, 0).0, [0]);
        assert_eq!(mask.get_pixel(1, 1).0, [255]);

        let fg = image::open(dir.path().join("fg.png")).unwrap().to_luma16();
        let expected = (probs.foreground()[[0, 1]] * 65535.0).round() as u16;
        assert_eq!(fg.get_pixel(1, 0).0, [expected]);
    }

    #[test]
    fn invalid_class_request_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let probs = decode(three_class_logits(), &OutputConfig::default()).unwrap();
        let request = OutputRequest {
            segmentation: Some(dir.path().join("labels.png")),
            classes: vec![(7, dir.path().join("class7.png"))],
            ..Default::default()
        };
        assert!(write_outputs(&probs, &request).is_err());
        assert!(!dir.path().join("labels.png").exists());
    }
}
