//! Additive pupil phase contributions.
//!
//! Every contribution is a real phase in radians sampled on the pupil grid.
//! Contributions are summed and exponentiated once with
//! [`PhaseMask::to_factor`].

use crate::{config::OpticalConfig, error::Error, pupil::PupilGeometry};
use log::debug;
use ndarray::{Array2, Zip};
use num_complex::Complex64;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use uom::si::{
    f64::Length,
    length::{meter, millimeter},
};

/// A real phase in radians for every pupil sample.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseMask {
    phase: Array2<f64>,
}

impl PhaseMask {
    pub fn zeros(shape: (usize, usize)) -> Self {
        Self {
            phase: Array2::zeros(shape),
        }
    }

    pub fn from_array(phase: Array2<f64>) -> Self {
        Self { phase }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.phase.dim()
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.phase
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.phase
    }

    /// Returns an error unless the mask is sampled on a grid of `shape`.
    pub fn check_shape(&self, shape: (usize, usize)) -> Result<(), Error> {
        Error::check_shape(shape, self.shape())
    }

    /// The multiplicative pupil factor `exp(i * phase)`.
    pub fn to_factor(&self) -> Array2<Complex64> {
        self.phase.mapv(|p| Complex64::from_polar(1.0, p))
    }

    /// Maximum minus minimum phase over the samples where `aperture` is set.
    ///
    /// Zero if the aperture is empty.
    pub fn peak_to_valley(&self, aperture: &Array2<bool>) -> f64 {
        let mut bounds: Option<(f64, f64)> = None;
        Zip::from(&self.phase)
            .and(aperture)
            .for_each(|&p, &inside| {
                if inside {
                    bounds = Some(match bounds {
                        Some((lo, hi)) => (lo.min(p), hi.max(p)),
                        None => (p, p),
                    });
                }
            });

        bounds.map_or(0.0, |(lo, hi)| hi - lo)
    }

    /// Sum of two masks, failing unless they share a shape.
    pub fn combined(mut self, other: &PhaseMask) -> Result<PhaseMask, Error> {
        other.check_shape(self.shape())?;
        self += other;
        Ok(self)
    }
}

impl Add for PhaseMask {
    type Output = Self;

    /// # Panics
    ///
    /// Panics if the masks differ in shape. [`PhaseMask::combined`] returns an
    /// error instead.
    fn add(mut self, other: Self) -> Self::Output {
        self += &other;
        self
    }
}

impl AddAssign<&PhaseMask> for PhaseMask {
    /// # Panics
    ///
    /// Panics if the masks differ in shape.
    fn add_assign(&mut self, other: &PhaseMask) {
        self.phase += &other.phase;
    }
}

/// Cylindrical lens placed in the relayed pupil.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CylindricalLens {
    #[default]
    None,
    /// A -25 m lens.
    Weak,
    /// A -16 m lens.
    Strong,
}

impl CylindricalLens {
    pub fn focal_length(&self) -> Option<Length> {
        match self {
            CylindricalLens::None => None,
            CylindricalLens::Weak => Some(Length::new::<meter>(-25.0)),
            CylindricalLens::Strong => Some(Length::new::<meter>(-16.0)),
        }
    }
}

/// Produces phase masks on the pupil of one optical configuration.
#[derive(Clone, Copy, Debug)]
pub struct PhaseMaskGenerator<'a> {
    config: &'a OpticalConfig,
    geometry: &'a PupilGeometry,
}

impl<'a> PhaseMaskGenerator<'a> {
    pub fn new(config: &'a OpticalConfig, geometry: &'a PupilGeometry) -> Self {
        Self { config, geometry }
    }

    /// Thin cylindrical lens with power along the pupil y-axis.
    ///
    /// The phase is `-k0 * y^2 / (2 f)` with `y` the physical height in the
    /// relayed pupil. Returns `None` for a zero or infinite focal length.
    pub fn cylindrical(&self, focal_length: Length) -> Option<PhaseMask> {
        let f = focal_length.get::<meter>();
        if f == 0.0 || !f.is_finite() {
            return None;
        }

        let k_air = self.config.k0();
        let radius = self.config.pupil_radius().get::<meter>();
        let mask = PhaseMask::from_array(self.geometry.grid().y().mapv(|y| {
            let y = y * radius;
            -k_air * y * y / (2.0 * f)
        }));

        debug!(
            "cylindrical lens f={f} m over pupil radius {:.3} mm, peak-to-valley {:.2} rad",
            self.config.pupil_radius().get::<millimeter>(),
            mask.peak_to_valley(self.geometry.grid().aperture())
        );

        Some(mask)
    }

    /// Defocus by `z` seen through the immersion medium, `n1 k0 z cos(theta1)`.
    pub fn defocus(&self, z: Length) -> PhaseMask {
        let scale = self.config.k_immersion() * z.get::<meter>();
        PhaseMask::from_array(self.geometry.angles().cos_theta1().mapv(|c| scale * c))
    }

    /// Defocus that moves the focal plane onto the best focus for an emitter
    /// at `depth`.
    pub fn depth_correction(&self, depth: Length) -> PhaseMask {
        self.defocus(self.config.focal_shift(depth))
    }

    /// Phase the interface leaves on propagating rays from an emitter at
    /// `depth` once the focal shift has been corrected.
    ///
    /// Evanescent rays carry no propagation phase and only contribute the
    /// correction term.
    pub fn depth_aberration(&self, depth: Length) -> PhaseMask {
        let scale = self.config.k_sample() * depth.get::<meter>();
        let propagation = PhaseMask::from_array(
            self.geometry.angles().cos_theta2().mapv(|c| scale * c.re),
        );
        propagation + self.depth_correction(depth)
    }

    /// Vertical astigmatism `A rho^2 cos(2 phi)`.
    pub fn astigmatism(&self, coefficient: f64) -> PhaseMask {
        let grid = self.geometry.grid();
        PhaseMask::from_array(
            Zip::from(grid.rho())
                .and(grid.phi())
                .map_collect(|rho, phi| coefficient * rho * rho * (2.0 * phi).cos()),
        )
    }

    /// Primary spherical aberration `c (6 rho^4 - 6 rho^2 + 1)`, as applied by
    /// a correction collar.
    pub fn spherical_correction(&self, coefficient: f64) -> PhaseMask {
        PhaseMask::from_array(self.geometry.grid().rho().mapv(|rho| {
            let rho2 = rho * rho;
            coefficient * (6.0 * rho2 * rho2 - 6.0 * rho2 + 1.0)
        }))
    }
}
