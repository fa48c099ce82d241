//! Image decoding into `(C, H, W)` f32 arrays.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array3;
use tracing::debug;

/// Decode `path` into a `(C, H, W)` array.
///
/// Grayscale images (with or without alpha) yield one channel, anything with
/// color yields three. Integer samples are scaled to `[0, 1]` by their type's
/// maximum; float samples are kept as stored.
pub fn load_image(path: &Path) -> Result<Array3<f32>> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to decode image: {}", path.display()))?;
    let (width, height) = (decoded.width() as usize, decoded.height() as usize);
    let color = decoded.color();

    let image = if color.has_color() {
        let rgb = decoded.to_rgb32f().into_raw();
        Array3::from_shape_vec((height, width, 3), rgb)?
            .permuted_axes([2, 0, 1])
            .as_standard_layout()
            .into_owned()
    } else {
        let luma = decoded.to_luma32f().into_raw();
        Array3::from_shape_vec((1, height, width), luma)?
    };

    debug!(
        path = %path.display(),
        color = ?color,
        channels = image.dim().0,
        height,
        width,
        "Image decoded"
    );
    Ok(image)
}
