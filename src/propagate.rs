//! Propagation from the pupil to the image plane.

use crate::{config::OpticalConfig, error::Error};
use ndarray::{Array2, ArrayView2, s};
use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use uom::si::f64::Length;

/// A fixed number of same-shape complex pupil or image fields.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldBatch<const B: usize> {
    fields: [Array2<Complex64>; B],
}

impl<const B: usize> FieldBatch<B> {
    /// Fails unless every field has the shape of the first.
    pub fn new(fields: [Array2<Complex64>; B]) -> Result<Self, Error> {
        if let Some(first) = fields.first() {
            for field in fields.iter() {
                Error::check_shape(first.dim(), field.dim())?;
            }
        }

        Ok(Self { fields })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.fields.first().map_or((0, 0), |field| field.dim())
    }

    pub fn fields(&self) -> &[Array2<Complex64>; B] {
        &self.fields
    }

    /// Multiplies every field by the same pupil `factor`.
    pub fn apply_factor(&mut self, factor: &Array2<Complex64>) -> Result<(), Error> {
        Error::check_shape(self.shape(), factor.dim())?;
        self.fields
            .as_mut_slice()
            .par_iter_mut()
            .for_each(|field| *field *= factor);
        Ok(())
    }

    /// Incoherent sum of `|E|^2` over the batch.
    pub fn intensity(&self) -> Array2<f64> {
        self.fields
            .iter()
            .fold(Array2::zeros(self.shape()), |acc, field| {
                acc + field.mapv(|e| e.norm_sqr())
            })
    }
}

/// Zero-padded, centered Fourier transform from the pupil to the image plane.
///
/// Padding by the oversampling factor keeps the field of view fixed while
/// shrinking the image-plane sample pitch by the same factor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FourierPropagator {
    oversampling: usize,
}

impl FourierPropagator {
    pub fn new(oversampling: usize) -> Result<Self, Error> {
        match oversampling {
            0 => Err(Error::InvalidOversampling(oversampling)),
            _ => Ok(Self { oversampling }),
        }
    }

    pub fn oversampling(&self) -> usize {
        self.oversampling
    }

    /// Propagates every field of `batch`, in parallel across fields.
    pub fn propagate_batch<const B: usize>(&self, batch: &FieldBatch<B>) -> FieldBatch<B> {
        let (rows, cols) = batch.shape();
        let plans = Plans::new(rows * self.oversampling, cols * self.oversampling);

        let mut fields: [Array2<Complex64>; B] = std::array::from_fn(|_| Array2::zeros((0, 0)));
        fields
            .as_mut_slice()
            .par_iter_mut()
            .zip(batch.fields().as_slice().par_iter())
            .for_each(|(out, field)| {
                *out = centered_fft2(&zero_pad(field.view(), self.oversampling), &plans)
            });

        FieldBatch { fields }
    }

    pub fn propagate(&self, field: &Array2<Complex64>) -> Array2<Complex64> {
        let (rows, cols) = field.dim();
        let plans = Plans::new(rows * self.oversampling, cols * self.oversampling);
        centered_fft2(&zero_pad(field.view(), self.oversampling), &plans)
    }
}

struct Plans {
    rows: Arc<dyn Fft<f64>>,
    cols: Arc<dyn Fft<f64>>,
}

impl Plans {
    fn new(rows: usize, cols: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            // Transforms along a row have the length of the column count.
            rows: planner.plan_fft_forward(cols),
            cols: planner.plan_fft_forward(rows),
        }
    }
}

/// Embeds `field` in the center of a zero array `oversampling` times larger.
///
/// When the padding along an axis is odd the extra zero goes after the field.
pub fn zero_pad(field: ArrayView2<Complex64>, oversampling: usize) -> Array2<Complex64> {
    let (rows, cols) = field.dim();
    let (padded_rows, padded_cols) = (rows * oversampling, cols * oversampling);
    let (top, left) = ((padded_rows - rows) / 2, (padded_cols - cols) / 2);

    let mut padded = Array2::zeros((padded_rows, padded_cols));
    padded
        .slice_mut(s![top..top + rows, left..left + cols])
        .assign(&field);
    padded
}

fn roll<T: Clone>(array: &Array2<T>, shift: (usize, usize)) -> Array2<T> {
    let (rows, cols) = array.dim();
    Array2::from_shape_fn((rows, cols), |(row, col)| {
        array[(
            (row + rows - shift.0 % rows) % rows,
            (col + cols - shift.1 % cols) % cols,
        )]
        .clone()
    })
}

/// Moves the zero-frequency sample from the corner to `(rows / 2, cols / 2)`.
pub fn fftshift<T: Clone>(array: &Array2<T>) -> Array2<T> {
    let (rows, cols) = array.dim();
    roll(array, (rows / 2, cols / 2))
}

/// Inverse of [`fftshift`], also for odd lengths.
pub fn ifftshift<T: Clone>(array: &Array2<T>) -> Array2<T> {
    let (rows, cols) = array.dim();
    roll(array, (rows - rows / 2, cols - cols / 2))
}

fn fft2(field: &Array2<Complex64>, plans: &Plans) -> Array2<Complex64> {
    let (rows, cols) = field.dim();
    if rows == 0 || cols == 0 {
        return field.clone();
    }

    let mut by_row: Vec<Complex64> = field.iter().copied().collect();
    plans.rows.process(&mut by_row);

    let mut by_col: Vec<Complex64> = (0..rows * cols)
        .map(|idx| by_row[(idx % rows) * cols + idx / rows])
        .collect();
    plans.cols.process(&mut by_col);

    Array2::from_shape_fn((rows, cols), |(row, col)| by_col[col * rows + row])
}

/// Unnormalized forward DFT mapping the array center to the array center.
fn centered_fft2(field: &Array2<Complex64>, plans: &Plans) -> Array2<Complex64> {
    fftshift(&fft2(&ifftshift(field), plans))
}

/// Field of view in the object plane, `lambda N / (2 NA)`.
pub fn object_field_of_view(config: &OpticalConfig) -> Length {
    config.wavelength() * config.pupil_resolution() as f64 / (2.0 * config.numerical_aperture())
}

/// Field of view on the camera, the object field of view times the total
/// magnification.
pub fn camera_field_of_view(config: &OpticalConfig) -> Length {
    object_field_of_view(config) * config.total_magnification()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use quickcheck_macros::quickcheck;
    use rstest::rstest;
    use uom::si::length::micron;

    fn c(re: f64) -> Complex64 {
        Complex64::new(re, 0.0)
    }

    #[rstest]
    #[case(4, 1, 0)]
    #[case(4, 3, 4)]
    #[case(3, 2, 1)]
    #[case(5, 4, 7)]
    fn padding_is_centered(#[case] n: usize, #[case] oversampling: usize, #[case] before: usize) {
        let field = Array2::from_elem((n, n), c(1.0));
        let padded = zero_pad(field.view(), oversampling);

        assert_eq!(padded.dim(), (n * oversampling, n * oversampling));
        assert_eq!(padded[(before, before)], c(1.0));
        assert_eq!(padded[(before + n - 1, before + n - 1)], c(1.0));
        if before > 0 {
            assert_eq!(padded[(before - 1, before)], c(0.0));
        }
        assert_eq!(padded.iter().filter(|e| e.re == 1.0).count(), n * n);
    }

    #[rstest]
    #[case(4, 4)]
    #[case(5, 5)]
    #[case(3, 6)]
    fn shifts_are_inverse(#[case] rows: usize, #[case] cols: usize) {
        let array = Array2::from_shape_fn((rows, cols), |(r, c)| r * cols + c);

        assert_eq!(ifftshift(&fftshift(&array)), array);
        assert_eq!(fftshift(&ifftshift(&array)), array);
        assert_eq!(fftshift(&array)[(rows / 2, cols / 2)], 0);
    }

    #[quickcheck]
    fn shift_moves_origin_to_center(rows: u8, cols: u8) -> bool {
        let (rows, cols) = (rows as usize % 9 + 1, cols as usize % 9 + 1);
        let mut array = Array2::zeros((rows, cols));
        array[(0, 0)] = 1;

        let shifted = fftshift(&array);
        shifted[(rows / 2, cols / 2)] == 1 && ifftshift(&shifted) == array
    }

    #[rstest]
    #[case(8)]
    #[case(7)]
    fn uniform_pupil_focuses_to_center(#[case] n: usize) {
        let propagator = FourierPropagator::new(1).unwrap();
        let image = propagator.propagate(&Array2::from_elem((n, n), c(1.0)));
        let center = (n / 2, n / 2);
        let power = (n * n) as f64;

        assert_relative_eq!(image[center].norm(), power, epsilon = 1e-9);
        for ((row, col), value) in image.indexed_iter() {
            if (row, col) != center {
                assert_relative_eq!(value.norm(), 0.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn batch_conserves_energy() {
        let n = 6;
        let oversampling = 3;
        let fields: [Array2<Complex64>; 2] = [
            Array2::from_shape_fn((n, n), |(r, c)| Complex64::new(r as f64, c as f64 * 0.5)),
            Array2::from_shape_fn((n, n), |(r, c)| Complex64::from_polar(1.0, (r * c) as f64)),
        ];
        let batch = FieldBatch::new(fields).unwrap();
        let propagator = FourierPropagator::new(oversampling).unwrap();
        let image = propagator.propagate_batch(&batch);

        // Parseval for the unnormalized DFT.
        let m = (n * oversampling * n * oversampling) as f64;
        assert_eq!(image.shape(), (n * oversampling, n * oversampling));
        assert_relative_eq!(
            image.intensity().sum(),
            m * batch.intensity().sum(),
            max_relative = 1e-9
        );
    }

    #[test]
    fn batch_matches_single_fields() {
        let fields: [Array2<Complex64>; 2] = [
            Array2::from_shape_fn((5, 5), |(r, c)| Complex64::new((r + c) as f64, 1.0)),
            Array2::from_shape_fn((5, 5), |(r, _)| Complex64::new(0.0, r as f64)),
        ];
        let propagator = FourierPropagator::new(2).unwrap();
        let batch = propagator.propagate_batch(&FieldBatch::new(fields.clone()).unwrap());

        for (single, batched) in fields.iter().zip(batch.fields()) {
            assert_eq!(&propagator.propagate(single), batched);
        }
    }

    #[test]
    fn batch_rejects_mixed_shapes() {
        let fields = [Array2::zeros((4, 4)), Array2::zeros((4, 3))];
        assert_eq!(
            FieldBatch::new(fields),
            Err(Error::ShapeMismatch {
                expected: (4, 4),
                found: (4, 3)
            })
        );
    }

    #[test]
    fn zero_oversampling_is_rejected() {
        assert_eq!(
            FourierPropagator::new(0),
            Err(Error::InvalidOversampling(0))
        );
    }

    #[test]
    fn field_of_view() {
        let config = OpticalConfig::builder()
            .pupil_resolution(128)
            .build()
            .unwrap();

        let object = 0.6 * 128.0 / (2.0 * 1.49);
        assert_relative_eq!(
            object_field_of_view(&config).get::<micron>(),
            object,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            camera_field_of_view(&config).get::<micron>(),
            object * 100.0 * 2.0 / 3.0,
            epsilon = 1e-6
        );
    }
}
