//! Window planner: overlapping patch origins covering an image.

use std::ops::Range;

use serde::Serialize;

use crate::error::{InferenceError, Result};

/// Axis-aligned patch location inside the padded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Window {
    pub y: usize,
    pub x: usize,
    pub height: usize,
    pub width: usize,
}

impl Window {
    pub fn rows(&self) -> Range<usize> {
        self.y..self.y + self.height
    }

    pub fn cols(&self) -> Range<usize> {
        self.x..self.x + self.width
    }

    /// Whether the window lies entirely inside an image of `(height, width)`.
    pub fn fits_within(&self, (height, width): (usize, usize)) -> bool {
        self.y + self.height <= height && self.x + self.width <= width
    }
}

/// Result of planning: the windows plus the padding needed to fit them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowPlan {
    pub image_size: (usize, usize),
    pub patch_size: (usize, usize),
    pub stride: (usize, usize),
    pub padded_size: (usize, usize),
    /// Trailing-side replicate padding per axis, cropped after blending.
    pub padding: (usize, usize),
    /// Number of window rows and columns in the raster grid.
    pub grid: (usize, usize),
    pub windows: Vec<Window>,
}

impl WindowPlan {
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn needs_padding(&self) -> bool {
        self.padding != (0, 0)
    }

    pub fn batch_count(&self, batch_size: usize) -> usize {
        self.windows.len().div_ceil(batch_size.max(1))
    }
}

pub fn validate_overlap(overlap: f32) -> Result<()> {
    if !overlap.is_finite() || !(0.0..1.0).contains(&overlap) {
        return Err(InferenceError::config(format!(
            "overlap fraction must be in [0, 1), got {overlap}"
        )));
    }
    Ok(())
}

/// Stride for one axis: `round(patch * (1 - overlap))`, never below 1.
pub fn stride_for(patch: usize, overlap: f32) -> usize {
    let stride = (patch as f64 * (1.0 - f64::from(overlap))).round() as usize;
    stride.max(1)
}

/// Window offsets along one axis of length `extent >= patch`.
///
/// The last offset is clamped to `extent - patch` so the final window ends
/// exactly on the edge.
fn axis_offsets(extent: usize, patch: usize, stride: usize) -> Vec<usize> {
    let last = extent - patch;
    let mut offsets: Vec<usize> = (0..last).step_by(stride).collect();
    offsets.push(last);
    offsets
}

/// Plan raster-ordered windows over an image of `image_size = (height, width)`.
pub fn plan_windows(
    image_size: (usize, usize),
    patch_size: (usize, usize),
    overlap: f32,
) -> Result<WindowPlan> {
    let (image_h, image_w) = image_size;
    let (patch_h, patch_w) = patch_size;

    if patch_h == 0 || patch_w == 0 {
        return Err(InferenceError::config(format!(
            "patch size must be positive, got {patch_h}x{patch_w}"
        )));
    }
    if image_h == 0 || image_w == 0 {
        return Err(InferenceError::config(format!(
            "image must have a positive extent, got {image_h}x{image_w}"
        )));
    }
    validate_overlap(overlap)?;

    let padding = (
        patch_h.saturating_sub(image_h),
        patch_w.saturating_sub(image_w),
    );
    let padded_size = (image_h + padding.0, image_w + padding.1);
    let stride = (stride_for(patch_h, overlap), stride_for(patch_w, overlap));

    let ys = axis_offsets(padded_size.0, patch_h, stride.0);
    let xs = axis_offsets(padded_size.1, patch_w, stride.1);

    let windows: Vec<Window> = ys
        .iter()
        .flat_map(|&y| {
            xs.iter().map(move |&x| Window {
                y,
                x,
                height: patch_h,
                width: patch_w,
            })
        })
        .collect();

    if let Some(outside) = windows.iter().find(|w| !w.fits_within(padded_size)) {
        return Err(InferenceError::geometry(format!(
            "planned window {outside:?} exceeds padded image {}x{}",
            padded_size.0, padded_size.1
        )));
    }

    Ok(WindowPlan {
        image_size,
        patch_size,
        stride,
        padded_size,
        padding,
        grid: (ys.len(), xs.len()),
        windows,
    })
}
