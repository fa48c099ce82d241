//! Array transforms used around a pass: replicate padding, cropping and flips.

use ndarray::{s, Array3, ArrayView3, Axis, CowArray, Ix3};
use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, Result};

/// Spatial axis of a `(channels, height, width)` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipAxis {
    Height,
    Width,
}

impl FlipAxis {
    /// Accepts `height`/`h`/`y`/`2` and `width`/`w`/`x`/`3` (case-insensitive);
    /// the numeric forms are the NCHW batch dims.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "height" | "h" | "y" | "2" => Ok(Self::Height),
            "width" | "w" | "x" | "3" => Ok(Self::Width),
            other => Err(InferenceError::config(format!(
                "unsupported flip axis '{other}' (expected height or width)"
            ))),
        }
    }

    /// Index of this axis in a `(C, H, W)` array.
    pub fn chw_axis(self) -> Axis {
        match self {
            Self::Height => Axis(1),
            Self::Width => Axis(2),
        }
    }
}

impl std::fmt::Display for FlipAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Height => write!(f, "height"),
            Self::Width => write!(f, "width"),
        }
    }
}

/// Mirror a `(C, H, W)` array along `axis`, returning a standard-layout copy.
pub fn flip(array: ArrayView3<'_, f32>, axis: FlipAxis) -> Array3<f32> {
    let mut view = array;
    view.invert_axis(axis.chw_axis());
    view.as_standard_layout().into_owned()
}

/// Extend `image` on the trailing side of each spatial axis by repeating the
/// last row/column. Borrows the input unchanged when no padding is needed.
pub fn replicate_pad<'a>(
    image: ArrayView3<'a, f32>,
    (pad_h, pad_w): (usize, usize),
) -> CowArray<'a, f32, Ix3> {
    if pad_h == 0 && pad_w == 0 {
        return CowArray::from(image);
    }

    let (c, h, w) = image.dim();
    let mut padded = Array3::<f32>::zeros((c, h + pad_h, w + pad_w));
    padded.slice_mut(s![.., ..h, ..w]).assign(&image);

    if pad_h > 0 {
        let last_row = image.slice(s![.., h - 1..h, ..]);
        padded.slice_mut(s![.., h.., ..w]).assign(&last_row);
    }
    if pad_w > 0 {
        let last_col = padded.slice(s![.., .., w - 1..w]).to_owned();
        padded.slice_mut(s![.., .., w..]).assign(&last_col);
    }

    CowArray::from(padded)
}

/// Drop trailing padding so the result is `(C, height, width)`.
pub fn crop(array: Array3<f32>, (height, width): (usize, usize)) -> Result<Array3<f32>> {
    let (_, h, w) = array.dim();
    if height > h || width > w {
        return Err(InferenceError::geometry(format!(
            "cannot crop {h}x{w} prediction to {height}x{width}"
        )));
    }
    if (h, w) == (height, width) {
        return Ok(array);
    }
    Ok(array.slice(s![.., ..height, ..width]).to_owned())
}
