//! Sampling of the objective pupil and the ray angles it maps to.

use crate::{config::OpticalConfig, error::Error};
use ndarray::{Array2, Zip};
use num_complex::Complex64;

/// Normalized coordinates of the back focal plane.
///
/// The grid spans `[-1, 1]` along both axes with `resolution` samples per
/// axis. Rows run along y and columns along x. A normalized radius of one
/// corresponds to the numerical aperture of the objective.
#[derive(Clone, Debug, PartialEq)]
pub struct PupilGrid {
    x: Array2<f64>,
    y: Array2<f64>,
    rho: Array2<f64>,
    phi: Array2<f64>,
    aperture: Array2<bool>,
}

impl PupilGrid {
    pub fn new(resolution: usize) -> Result<Self, Error> {
        if resolution < 2 {
            return Err(Error::Configuration(format!(
                "expected a pupil resolution of at least 2 but got: {resolution}"
            )));
        }

        let step = 2.0 / (resolution - 1) as f64;
        let coord = |i: usize| -1.0 + i as f64 * step;
        let shape = (resolution, resolution);

        let x = Array2::from_shape_fn(shape, |(_, col)| coord(col));
        let y = Array2::from_shape_fn(shape, |(row, _)| coord(row));
        let rho = Zip::from(&x).and(&y).map_collect(|x, y| x.hypot(*y));
        let phi = Zip::from(&x).and(&y).map_collect(|x, y| y.atan2(*x));
        let aperture = rho.mapv(|r| r <= 1.0);

        Ok(Self {
            x,
            y,
            rho,
            phi,
            aperture,
        })
    }

    pub fn resolution(&self) -> usize {
        self.x.nrows()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.x.dim()
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array2<f64> {
        &self.y
    }

    /// Normalized radius.
    pub fn rho(&self) -> &Array2<f64> {
        &self.rho
    }

    /// Azimuth measured counter-clockwise from +x.
    pub fn phi(&self) -> &Array2<f64> {
        &self.phi
    }

    /// True where the radius is at most one.
    pub fn aperture(&self) -> &Array2<bool> {
        &self.aperture
    }
}

/// Incidence angles at every pupil sample on both sides of the interface.
///
/// Medium 1 is the immersion medium on the objective side and medium 2 is the
/// sample. Outside the aperture both angles are zero.
#[derive(Clone, Debug, PartialEq)]
pub struct AngleField {
    sin_theta1: Array2<f64>,
    cos_theta1: Array2<f64>,
    sin_theta2: Array2<f64>,
    cos_theta2: Array2<Complex64>,
}

impl AngleField {
    /// Applies Snell's law `n1 sin(theta1) = n2 sin(theta2)` over `grid`.
    pub fn new(
        grid: &PupilGrid,
        numerical_aperture: f64,
        n_immersion: f64,
        n_sample: f64,
    ) -> Result<Self, Error> {
        for (name, value) in [
            ("numerical aperture", numerical_aperture),
            ("immersion index", n_immersion),
            ("sample index", n_sample),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::Configuration(format!(
                    "expected {name} to be positive and finite but got: {value}"
                )));
            }
        }

        let sin_theta1 = Zip::from(grid.rho())
            .and(grid.aperture())
            .map_collect(|rho, inside| match inside {
                true => (rho * numerical_aperture / n_immersion).min(1.0),
                false => 0.0,
            });
        let cos_theta1 = sin_theta1.mapv(|s| (1.0 - s * s).max(0.0).sqrt());
        let sin_theta2 = sin_theta1.mapv(|s| s * n_immersion / n_sample);
        let cos_theta2 = sin_theta2.mapv(transmitted_cosine);

        Ok(Self {
            sin_theta1,
            cos_theta1,
            sin_theta2,
            cos_theta2,
        })
    }

    pub fn sin_theta1(&self) -> &Array2<f64> {
        &self.sin_theta1
    }

    pub fn cos_theta1(&self) -> &Array2<f64> {
        &self.cos_theta1
    }

    /// May exceed one for supercritical rays.
    pub fn sin_theta2(&self) -> &Array2<f64> {
        &self.sin_theta2
    }

    /// Purely imaginary for supercritical rays.
    pub fn cos_theta2(&self) -> &Array2<Complex64> {
        &self.cos_theta2
    }

    /// True where the ray couples evanescently from the sample.
    pub fn supercritical(&self) -> Array2<bool> {
        self.cos_theta2.mapv(|c| c.im != 0.0)
    }
}

/// Returns `sqrt(1 - sin_theta^2)` on the branch of decaying evanescent waves.
///
/// A real argument gives the ordinary non-negative cosine. A negative argument
/// gives `+i * sqrt(sin_theta^2 - 1)` so that `exp(i k z cos_theta)` decays as
/// `z` grows into the sample.
pub fn transmitted_cosine(sin_theta: f64) -> Complex64 {
    let arg = 1.0 - sin_theta * sin_theta;
    match arg >= 0.0 {
        true => Complex64::new(arg.sqrt(), 0.0),
        false => Complex64::new(0.0, (-arg).sqrt()),
    }
}

/// The pupil grid together with its angle field for one configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PupilGeometry {
    grid: PupilGrid,
    angles: AngleField,
}

impl PupilGeometry {
    pub fn new(config: &OpticalConfig) -> Result<Self, Error> {
        let grid = PupilGrid::new(config.pupil_resolution())?;
        let angles = AngleField::new(
            &grid,
            config.numerical_aperture(),
            config.n_immersion(),
            config.n_sample(),
        )?;

        Ok(Self { grid, angles })
    }

    pub fn grid(&self) -> &PupilGrid {
        &self.grid
    }

    pub fn angles(&self) -> &AngleField {
        &self.angles
    }

    pub fn shape(&self) -> (usize, usize) {
        self.grid.shape()
    }
}
