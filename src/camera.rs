//! Pixel grids and the physical extent they cover.

use crate::error::Error;
use ndarray::Array2;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uom::{
    ConstZero,
    si::{f64::Length, ratio::ratio},
};

/// A square region centered on the optical axis.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Extent {
    half_width: Length,
}

impl Extent {
    /// Region of full `width` centered on the origin.
    pub fn centered(width: Length) -> Self {
        Self {
            half_width: width / 2.0,
        }
    }

    pub fn half_width(&self) -> Length {
        self.half_width
    }

    pub fn width(&self) -> Length {
        self.half_width * 2.0
    }

    /// Left, right, bottom and top edges.
    pub fn bounds(&self) -> [Length; 4] {
        [
            -self.half_width,
            self.half_width,
            -self.half_width,
            self.half_width,
        ]
    }

    /// Sample pitch when `samples` pixels span the extent.
    pub fn pitch(&self, samples: usize) -> Length {
        match samples {
            0 => Length::ZERO,
            _ => self.width() / samples as f64,
        }
    }
}

/// Position in the image plane relative to the optical axis.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SensorCoordinate {
    x: Length,
    y: Length,
}

impl SensorCoordinate {
    pub fn new(x: Length, y: Length) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> Length {
        self.x
    }

    pub fn y(&self) -> Length {
        self.y
    }

    /// Distance from the optical axis.
    pub fn radius(&self) -> Length {
        self.x.hypot(self.y)
    }
}

/// Pixel grid of a simulated camera image.
///
/// Pixel `(row, col)` is centered at `x = (col - cols / 2) * pitch` and
/// `y = (row - rows / 2) * pitch`, the layout of a centered Fourier transform.
/// The optical axis is therefore pixel `(rows / 2, cols / 2)` for odd and even
/// pixel counts alike.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImageSensor {
    pixel_size: Length,
    rows: usize,
    cols: usize,
}

impl ImageSensor {
    pub fn new(pixel_size: Length, rows: usize, cols: usize) -> Self {
        Self {
            pixel_size,
            rows,
            cols,
        }
    }

    /// The grid of `image` when its columns span `extent`.
    pub fn covering(extent: &Extent, image: &Array2<f64>) -> Self {
        let (rows, cols) = image.dim();
        Self::new(extent.pitch(cols), rows, cols)
    }

    pub fn pixel_size(&self) -> Length {
        self.pixel_size
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Extent spanned by the columns.
    pub fn extent(&self) -> Extent {
        Extent::centered(self.pixel_size * self.cols as f64)
    }

    /// The pixel on the optical axis.
    pub fn axis_pixel(&self) -> (usize, usize) {
        (self.rows / 2, self.cols / 2)
    }

    /// Center of pixel `(row, col)`, or `None` off the grid.
    pub fn position(&self, (row, col): (usize, usize)) -> Option<SensorCoordinate> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let (axis_row, axis_col) = self.axis_pixel();
        Some(SensorCoordinate::new(
            self.pixel_size * (col as f64 - axis_col as f64),
            self.pixel_size * (row as f64 - axis_row as f64),
        ))
    }

    /// The pixel containing `coord`, or `None` off the grid.
    pub fn pixel_at(&self, coord: &SensorCoordinate) -> Option<(usize, usize)> {
        let (axis_row, axis_col) = self.axis_pixel();
        let row = (coord.y() / self.pixel_size).get::<ratio>().round() + axis_row as f64;
        let col = (coord.x() / self.pixel_size).get::<ratio>().round() + axis_col as f64;

        // A negative index would saturate onto the first pixel.
        let on_grid = (0.0..self.rows as f64).contains(&row) && (0.0..self.cols as f64).contains(&col);
        on_grid.then_some((row as usize, col as usize))
    }

    /// Intensity-weighted mean position of `image`.
    ///
    /// Returns `None` when the image carries no intensity.
    pub fn centroid(&self, image: &Array2<f64>) -> Result<Option<SensorCoordinate>, Error> {
        Ok(self.moments(image)?.map(|moments| {
            SensorCoordinate::new(self.pixel_size * moments.col, self.pixel_size * moments.row)
        }))
    }

    /// Root-mean-square distance of the intensity from its centroid.
    ///
    /// Returns `None` when the image carries no intensity.
    pub fn rms_radius(&self, image: &Array2<f64>) -> Result<Option<Length>, Error> {
        Ok(self.moments(image)?.map(|moments| {
            let spread = moments.squared - moments.row * moments.row - moments.col * moments.col;
            self.pixel_size * spread.max(0.0).sqrt()
        }))
    }

    fn moments(&self, image: &Array2<f64>) -> Result<Option<Moments>, Error> {
        Error::check_shape(self.shape(), image.dim())?;

        let total = image.sum();
        if total <= 0.0 || !total.is_finite() {
            return Ok(None);
        }

        let (axis_row, axis_col) = self.axis_pixel();
        let moments = image.indexed_iter().fold(
            Moments::default(),
            |acc, ((row, col), &value)| {
                let (dy, dx) = (row as f64 - axis_row as f64, col as f64 - axis_col as f64);
                let weight = value / total;
                Moments {
                    row: acc.row + dy * weight,
                    col: acc.col + dx * weight,
                    squared: acc.squared + (dx * dx + dy * dy) * weight,
                }
            },
        );
        Ok(Some(moments))
    }
}

/// First and second intensity moments in pixel units about the axis pixel.
#[derive(Clone, Copy, Debug, Default)]
struct Moments {
    row: f64,
    col: f64,
    squared: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use quickcheck::quickcheck;
    use rstest::rstest;
    use uom::si::length::micron;

    fn um(value: f64) -> Length {
        Length::new::<micron>(value)
    }

    #[test]
    fn extent_bounds() {
        let extent = Extent::centered(um(100.0));

        assert_relative_eq!(extent.half_width().get::<micron>(), 50.0);
        assert_relative_eq!(extent.bounds()[0].get::<micron>(), -50.0);
        assert_relative_eq!(extent.bounds()[3].get::<micron>(), 50.0);
        assert_relative_eq!(extent.pitch(20).get::<micron>(), 5.0);
        assert_eq!(extent.pitch(0), Length::ZERO);
    }

    #[rstest]
    #[case(8, 8, (4, 4))]
    #[case(7, 7, (3, 3))]
    #[case(4, 9, (2, 4))]
    #[case(1, 1, (0, 0))]
    fn axis_pixel_sits_at_origin(#[case] rows: usize, #[case] cols: usize, #[case] axis: (usize, usize)) {
        let sensor = ImageSensor::new(um(6.5), rows, cols);

        assert_eq!(sensor.axis_pixel(), axis);
        assert_eq!(
            sensor.position(axis),
            Some(SensorCoordinate::new(Length::ZERO, Length::ZERO))
        );
    }

    #[rstest]
    #[case(-30.0, 0.0, None)]
    #[case(26.0, 0.0, None)]
    #[case(-26.0, 0.0, Some((4, 0)))]
    #[case(0.0, 19.5, Some((7, 4)))]
    #[case(3.0, -3.0, Some((4, 4)))]
    fn pixel_containing_coordinate(
        #[case] x_um: f64,
        #[case] y_um: f64,
        #[case] expected: Option<(usize, usize)>,
    ) {
        let sensor = ImageSensor::new(um(6.5), 8, 8);
        assert_eq!(sensor.pixel_at(&SensorCoordinate::new(um(x_um), um(y_um))), expected);
    }

    #[test]
    fn position_off_grid() {
        let sensor = ImageSensor::new(um(1.0), 3, 5);
        assert_eq!(sensor.position((3, 0)), None);
        assert_eq!(sensor.position((0, 5)), None);
    }

    #[test]
    fn sensor_covering_extent() {
        let extent = Extent::centered(um(65.0));
        let sensor = ImageSensor::covering(&extent, &Array2::zeros((10, 10)));

        assert_relative_eq!(sensor.pixel_size().get::<micron>(), 6.5, epsilon = 1e-12);
        assert_eq!(sensor.shape(), (10, 10));
        assert_relative_eq!(sensor.extent().width().get::<micron>(), 65.0, epsilon = 1e-12);
    }

    #[test]
    fn centroid_of_mirrored_image_is_on_axis() {
        let sensor = ImageSensor::new(um(2.0), 9, 9);
        let image = Array2::from_shape_fn((9, 9), |(r, c)| {
            1.0 / (1.0 + (r as f64 - 4.0).powi(2) + 2.0 * (c as f64 - 4.0).powi(2))
        });
        let centroid = sensor.centroid(&image).unwrap().unwrap();

        assert_relative_eq!(centroid.x().get::<micron>(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(centroid.y().get::<micron>(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn rms_radius_of_ring() {
        let sensor = ImageSensor::new(um(0.5), 7, 7);
        let mut image = Array2::zeros((7, 7));
        for at in [(1, 3), (5, 3), (3, 1), (3, 5)] {
            image[at] = 2.0;
        }

        assert_relative_eq!(
            sensor.rms_radius(&image).unwrap().unwrap().get::<micron>(),
            1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn dark_image_has_no_moments() {
        let sensor = ImageSensor::new(um(1.0), 4, 4);
        assert_eq!(sensor.centroid(&Array2::zeros((4, 4))), Ok(None));
        assert_eq!(sensor.rms_radius(&Array2::zeros((4, 4))), Ok(None));
    }

    #[test]
    fn centroid_rejects_wrong_shape() {
        let sensor = ImageSensor::new(um(1.0), 4, 4);
        assert_eq!(
            sensor.centroid(&Array2::zeros((4, 5))),
            Err(Error::ShapeMismatch {
                expected: (4, 4),
                found: (4, 5)
            })
        );
    }

    quickcheck! {
        fn single_lit_pixel_is_its_own_centroid(row_seed: u8, col_seed: u8) -> bool {
            let sensor = ImageSensor::new(um(2.0), 9, 6);
            let pixel = (row_seed as usize % 9, col_seed as usize % 6);

            let mut image = Array2::zeros((9, 6));
            image[pixel] = 3.0;

            let centroid = sensor
                .centroid(&image)
                .expect("shapes match")
                .expect("image is lit");
            let expected = sensor.position(pixel).expect("pixel is on the grid");
            (centroid.x() - expected.x()).abs() < um(1e-9)
                && (centroid.y() - expected.y()).abs() < um(1e-9)
                && sensor.pixel_at(&centroid) == Some(pixel)
                && sensor.rms_radius(&image).expect("shapes match") == Some(Length::ZERO)
        }
    }
}
