//! Resampling of high-resolution image-plane intensity onto camera pixels.

use crate::{camera::Extent, error::Error};
use log::debug;
use ndarray::{Array2, ArrayView2, Axis, s};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uom::si::{f64::Length, length::micron, ratio::ratio};

/// How an image was brought onto the camera pixel grid.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ResampleStrategy {
    /// Averages `factor` x `factor` blocks.
    Bin { factor: usize },
    /// Linear interpolation scaling the pixel count by `zoom`.
    Interpolate { zoom: f64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resampled {
    image: Array2<f64>,
    extent: Extent,
    strategy: ResampleStrategy,
}

impl Resampled {
    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn strategy(&self) -> ResampleStrategy {
        self.strategy
    }

    pub fn into_parts(self) -> (Array2<f64>, Extent, ResampleStrategy) {
        (self.image, self.extent, self.strategy)
    }
}

fn square_side(image: &Array2<f64>) -> Result<usize, Error> {
    let (rows, cols) = image.dim();
    Error::check_shape((rows, rows), (rows, cols))?;
    match rows {
        0 => Err(Error::ShapeMismatch {
            expected: (1, 1),
            found: (rows, cols),
        }),
        _ => Ok(rows),
    }
}

/// Resamples a square `image` spanning `extent` to camera pixels of
/// `pixel_size`.
///
/// Pixels at least twice the current pitch are formed by binning, everything
/// else by linear interpolation that keeps the extent. Either way the axis
/// sample `N / 2` maps onto the center pixel `M / 2` of the result.
pub fn resample(
    image: &Array2<f64>,
    extent: &Extent,
    pixel_size: Length,
) -> Result<Resampled, Error> {
    let target = pixel_size.get::<micron>();
    if !(target.is_finite() && target > 0.0) {
        return Err(Error::InvalidPixelSize);
    }

    let n = square_side(image)?;
    let pitch = extent.pitch(n);
    let scale = (pixel_size / pitch).get::<ratio>();

    if scale >= 2.0 {
        // A block cannot be larger than the image.
        let factor = (scale.round() as usize).min(n);
        let image = bin(image.view(), factor);
        let extent = Extent::centered(pixel_size * image.nrows() as f64);

        debug!(
            "binning {n}x{n} pixels of {:.4} um by {factor} onto {:.2} um pixels",
            pitch.get::<micron>(),
            target
        );

        Ok(Resampled {
            image,
            extent,
            strategy: ResampleStrategy::Bin { factor },
        })
    } else {
        let zoom = 1.0 / scale;
        let m = ((n as f64 * zoom).round() as usize).max(1);

        debug!(
            "interpolating {n}x{n} pixels of {:.4} um onto {m}x{m} (zoom {zoom:.3})",
            pitch.get::<micron>()
        );

        Ok(Resampled {
            image: interpolate(image.view(), m),
            extent: *extent,
            strategy: ResampleStrategy::Interpolate { zoom },
        })
    }
}

/// First row (or column) and number of blocks of `factor` samples such that
/// the axis sample `n / 2` is the center of block `blocks / 2`.
///
/// For an even factor the axis sample is the one just past the block midpoint.
/// Blocks that would run past either end are dropped.
fn block_layout(n: usize, factor: usize) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }
    let factor = factor.clamp(1, n);
    let axis = n / 2;

    // A single block always fits once the factor is clamped to `n`.
    (1..=n / factor)
        .rev()
        .find_map(|blocks| {
            let start = axis.checked_sub((blocks / 2) * factor + factor / 2)?;
            (start + blocks * factor <= n).then_some((start, blocks))
        })
        .unwrap_or((0, 0))
}

/// Averages `factor` x `factor` blocks laid out about the optical axis.
///
/// The axis sample `(rows / 2, cols / 2)` ends up in the center block
/// `(out_rows / 2, out_cols / 2)`; samples outside whole blocks are dropped.
pub fn bin(image: ArrayView2<f64>, factor: usize) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let factor = factor.clamp(1, rows.min(cols).max(1));
    let (top, out_rows) = block_layout(rows, factor);
    let (left, out_cols) = block_layout(cols, factor);
    let area = (factor * factor) as f64;

    let mut binned = Array2::zeros((out_rows, out_cols));
    binned
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(row, mut out)| {
            let first_row = top + row * factor;
            for (col, value) in out.iter_mut().enumerate() {
                let first_col = left + col * factor;
                let block = image.slice(s![
                    first_row..first_row + factor,
                    first_col..first_col + factor
                ]);
                *value = block.sum() / area;
            }
        });
    binned
}

/// Neighbor index and weight of the upper neighbor for every output sample.
///
/// Output sample `output / 2` lands on input sample `input / 2` and the
/// spacing is `input / output`, so the extent is kept. Samples beyond the
/// input are clamped to its first or last sample.
fn linear_taps(input: usize, output: usize) -> Vec<(usize, f64)> {
    let last = input.saturating_sub(1);
    let (axis_in, axis_out) = ((input / 2) as f64, (output / 2) as f64);
    let step = input as f64 / output.max(1) as f64;
    (0..output)
        .map(|i| {
            let coord = (axis_in + (i as f64 - axis_out) * step).clamp(0.0, last as f64);
            let lo = (coord.floor() as usize).min(last);
            (lo, coord - lo as f64)
        })
        .collect()
}

/// Order-one resampling of a square image to `size` x `size` samples.
pub fn interpolate(image: ArrayView2<f64>, size: usize) -> Array2<f64> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return Array2::zeros((size, size));
    }

    let row_taps = linear_taps(rows, size);
    let col_taps = linear_taps(cols, size);
    let at = |row: usize, col: usize| image[(row.min(rows - 1), col.min(cols - 1))];

    let mut out = Array2::zeros((size, size));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(row_taps.par_iter())
        .for_each(|(mut line, &(r, fr))| {
            for (value, &(c, fc)) in line.iter_mut().zip(col_taps.iter()) {
                let top = at(r, c) * (1.0 - fc) + at(r, c + 1) * fc;
                let bottom = at(r + 1, c) * (1.0 - fc) + at(r + 1, c + 1) * fc;
                *value = top * (1.0 - fr) + bottom * fr;
            }
        });
    out
}

/// Keeps the central `floor(field_of_view / pitch)` pixels of a square image.
///
/// The pixel count is clamped to `[1, N]`, so a field of view beyond the
/// image returns it unchanged. The axis pixel `N / 2` becomes pixel
/// `kept / 2` of the crop.
pub fn crop_to_field_of_view(
    image: &Array2<f64>,
    extent: &Extent,
    field_of_view: Length,
) -> Result<(Array2<f64>, Extent), Error> {
    let n = square_side(image)?;
    let pitch = extent.pitch(n);
    let wanted = (field_of_view / pitch).get::<ratio>().floor();
    let kept = match wanted.is_nan() {
        true => 1,
        false => (wanted.max(1.0) as usize).min(n),
    };
    let start = n / 2 - kept / 2;

    debug!(
        "cropping {n}x{n} image to the central {kept}x{kept} pixels for a {:.2} um field of view",
        field_of_view.get::<micron>()
    );

    Ok((
        image
            .slice(s![start..start + kept, start..start + kept])
            .to_owned(),
        Extent::centered(pitch * kept as f64),
    ))
}
