//! Immutable description of the imaging system.

use crate::error::Error;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use uom::si::{
    f64::Length,
    length::{meter, millimeter, nanometer},
    ratio::ratio,
};

/// The optical train from the sample to the camera.
///
/// The objective images the emitter through an immersion medium of index
/// `n_immersion` while the emitter sits in a sample of index `n_sample`. The
/// back focal plane of the objective is relayed onto the camera by a tube lens
/// followed by a 4f relay.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OpticalConfig {
    numerical_aperture: f64,
    wavelength: Length,
    n_immersion: f64,
    n_sample: f64,
    objective_magnification: f64,
    tube_focal_length: Length,
    relay_focal_lengths: (Length, Length),
    pupil_resolution: usize,

    /// Exponent `p` of the empirical focal shift `-depth * (n1 / n2)^p`.
    focal_shift_exponent: f64,
}

impl OpticalConfig {
    pub fn builder() -> OpticalConfigBuilder {
        OpticalConfigBuilder::default()
    }

    pub fn numerical_aperture(&self) -> f64 {
        self.numerical_aperture
    }

    pub fn wavelength(&self) -> Length {
        self.wavelength
    }

    pub fn n_immersion(&self) -> f64 {
        self.n_immersion
    }

    pub fn n_sample(&self) -> f64 {
        self.n_sample
    }

    pub fn objective_magnification(&self) -> f64 {
        self.objective_magnification
    }

    pub fn tube_focal_length(&self) -> Length {
        self.tube_focal_length
    }

    pub fn relay_focal_lengths(&self) -> (Length, Length) {
        self.relay_focal_lengths
    }

    pub fn pupil_resolution(&self) -> usize {
        self.pupil_resolution
    }

    pub fn focal_shift_exponent(&self) -> f64 {
        self.focal_shift_exponent
    }

    /// Focal length of the objective, `f_tube / M`.
    pub fn objective_focal_length(&self) -> Length {
        self.tube_focal_length / self.objective_magnification
    }

    /// Magnification of the 4f relay, `f2 / f1`.
    pub fn relay_magnification(&self) -> f64 {
        (self.relay_focal_lengths.1 / self.relay_focal_lengths.0).get::<ratio>()
    }

    /// Magnification from the object plane to the camera.
    pub fn total_magnification(&self) -> f64 {
        self.objective_magnification * self.relay_magnification()
    }

    /// Vacuum wavenumber in radians per meter.
    pub fn k0(&self) -> f64 {
        2.0 * PI / self.wavelength.get::<meter>()
    }

    /// Wavenumber in the immersion medium in radians per meter.
    pub fn k_immersion(&self) -> f64 {
        self.k0() * self.n_immersion
    }

    /// Wavenumber in the sample in radians per meter.
    pub fn k_sample(&self) -> f64 {
        self.k0() * self.n_sample
    }

    /// Radius of the pupil where the relayed back focal plane is accessible.
    ///
    /// Uses the geometric radius `f_obj * NA` magnified by `f1 / f_tube`.
    pub fn pupil_radius(&self) -> Length {
        self.objective_focal_length()
            * self.numerical_aperture
            * (self.relay_focal_lengths.0 / self.tube_focal_length).get::<ratio>()
    }

    /// Axial shift of the best focus for an emitter `depth` past the interface.
    pub fn focal_shift(&self, depth: Length) -> Length {
        -depth * (self.n_immersion / self.n_sample).powf(self.focal_shift_exponent)
    }

    /// Returns true when part of the aperture collects supercritical light.
    pub fn collects_supercritical(&self) -> bool {
        self.numerical_aperture > self.n_sample
    }

    fn validate(self) -> Result<Self, Error> {
        fn positive(name: &str, value: f64) -> Result<(), Error> {
            match value.is_finite() && value > 0.0 {
                true => Ok(()),
                false => Err(Error::Configuration(format!(
                    "expected {name} to be positive and finite but got: {value}"
                ))),
            }
        }

        positive("numerical aperture", self.numerical_aperture)?;
        positive("wavelength", self.wavelength.get::<meter>())?;
        positive("immersion index", self.n_immersion)?;
        positive("sample index", self.n_sample)?;
        positive("objective magnification", self.objective_magnification)?;
        positive("tube focal length", self.tube_focal_length.get::<meter>())?;
        positive("relay focal length", self.relay_focal_lengths.0.get::<meter>())?;
        positive("relay focal length", self.relay_focal_lengths.1.get::<meter>())?;

        if self.pupil_resolution < 2 {
            return Err(Error::Configuration(format!(
                "expected a pupil resolution of at least 2 but got: {}",
                self.pupil_resolution
            )));
        }

        if !self.focal_shift_exponent.is_finite() {
            return Err(Error::Configuration(format!(
                "expected a finite focal shift exponent but got: {}",
                self.focal_shift_exponent
            )));
        }

        Ok(self)
    }
}

/// Builds a validated [`OpticalConfig`].
///
/// Starts from a 100x 1.49 NA oil objective imaging into water at 600 nm.
#[derive(Clone, Copy, Debug)]
pub struct OpticalConfigBuilder {
    inner: OpticalConfig,
}

impl Default for OpticalConfigBuilder {
    fn default() -> Self {
        Self {
            inner: OpticalConfig {
                numerical_aperture: 1.49,
                wavelength: Length::new::<nanometer>(600.0),
                n_immersion: 1.518,
                n_sample: 1.33,
                objective_magnification: 100.0,
                tube_focal_length: Length::new::<millimeter>(180.0),
                relay_focal_lengths: (
                    Length::new::<millimeter>(300.0),
                    Length::new::<millimeter>(200.0),
                ),
                pupil_resolution: 256,
                focal_shift_exponent: 2.0,
            },
        }
    }
}

impl OpticalConfigBuilder {
    pub fn numerical_aperture(mut self, numerical_aperture: f64) -> Self {
        self.inner.numerical_aperture = numerical_aperture;
        self
    }

    pub fn wavelength(mut self, wavelength: Length) -> Self {
        self.inner.wavelength = wavelength;
        self
    }

    pub fn n_immersion(mut self, n_immersion: f64) -> Self {
        self.inner.n_immersion = n_immersion;
        self
    }

    pub fn n_sample(mut self, n_sample: f64) -> Self {
        self.inner.n_sample = n_sample;
        self
    }

    pub fn objective_magnification(mut self, magnification: f64) -> Self {
        self.inner.objective_magnification = magnification;
        self
    }

    pub fn tube_focal_length(mut self, focal_length: Length) -> Self {
        self.inner.tube_focal_length = focal_length;
        self
    }

    pub fn relay_focal_lengths(mut self, first: Length, second: Length) -> Self {
        self.inner.relay_focal_lengths = (first, second);
        self
    }

    pub fn pupil_resolution(mut self, resolution: usize) -> Self {
        self.inner.pupil_resolution = resolution;
        self
    }

    /// Sets the focal shift exponent.
    ///
    /// The default of 2 is a calibration against measured best focus for an
    /// oil objective imaging into water. It is not derived from first
    /// principles and other immersion/sample pairs may need a different value.
    pub fn focal_shift_exponent(mut self, exponent: f64) -> Self {
        self.inner.focal_shift_exponent = exponent;
        self
    }

    pub fn build(self) -> Result<OpticalConfig, Error> {
        self.inner.validate()
    }
}
