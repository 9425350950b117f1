//! End-to-end image formation for a configured microscope.

use crate::{
    camera::{Extent, ImageSensor},
    config::OpticalConfig,
    error::Error,
    greens::{DipoleAxis, GreensTensor, Polarization, TensorCache, sub_field_index},
    phase::{PhaseMask, PhaseMaskGenerator},
    propagate::{FieldBatch, FourierPropagator, camera_field_of_view},
    pupil::PupilGeometry,
    resample::{ResampleStrategy, crop_to_field_of_view, resample},
};
use log::debug;
use nalgebra::Vector3;
use ndarray::{Array2, Zip};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uom::{
    ConstZero,
    si::{
        angle::radian,
        f64::{Angle, Length},
        length::{micron, millimeter, nanometer},
    },
};

/// Orientation of a dipole moment in the sample frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DipoleOrientation {
    /// Polar angle from the optical axis and azimuth from +x.
    Angles { polar: Angle, azimuth: Angle },
    /// Any non-zero moment vector.
    Vector(Vector3<f64>),
}

impl DipoleOrientation {
    pub fn unit_vector(&self) -> Result<Vector3<f64>, Error> {
        let moment = match self {
            DipoleOrientation::Angles { polar, azimuth } => {
                let (st, ct) = polar.get::<radian>().sin_cos();
                let (sp, cp) = azimuth.get::<radian>().sin_cos();
                Vector3::new(st * cp, st * sp, ct)
            }
            DipoleOrientation::Vector(moment) => *moment,
        };

        let norm = moment.norm();
        match norm.is_finite() && norm > 0.0 {
            true => Ok(moment / norm),
            false => Err(Error::InvalidOrientation([moment.x, moment.y, moment.z])),
        }
    }
}

/// Image of a single fixed dipole at the full propagation resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct DipoleImage {
    image: Array2<f64>,
    pupil_intensity: Array2<f64>,
    camera_extent: Extent,
    pupil_extent: Extent,
}

impl DipoleImage {
    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn pupil_intensity(&self) -> &Array2<f64> {
        &self.pupil_intensity
    }

    pub fn camera_extent(&self) -> Extent {
        self.camera_extent
    }

    /// Pixel grid of [`DipoleImage::image`] on the camera.
    pub fn sensor(&self) -> ImageSensor {
        ImageSensor::covering(&self.camera_extent, &self.image)
    }

    pub fn pupil_extent(&self) -> Extent {
        self.pupil_extent
    }
}

/// Per-frame parameters of an isotropic emitter simulation.
#[derive(Clone, Debug, PartialEq)]
pub struct IsotropicRequest {
    z_defocus: Length,
    phase_mask: Option<PhaseMask>,
    astigmatism: f64,
    oversampling: usize,
    camera_pixel_size: Length,
    depth: Length,
    spherical_correction: f64,
    display_field_of_view: Option<Length>,
}

impl Default for IsotropicRequest {
    fn default() -> Self {
        Self {
            z_defocus: Length::ZERO,
            phase_mask: None,
            astigmatism: 0.0,
            oversampling: 8,
            camera_pixel_size: Length::new::<micron>(6.5),
            depth: Length::ZERO,
            spherical_correction: 0.0,
            display_field_of_view: None,
        }
    }
}

impl IsotropicRequest {
    /// Defocus relative to the best focus for the emitter depth.
    pub fn with_z_defocus(mut self, z_defocus: Length) -> Self {
        self.z_defocus = z_defocus;
        self
    }

    pub fn with_phase_mask(mut self, phase_mask: PhaseMask) -> Self {
        self.phase_mask = Some(phase_mask);
        self
    }

    /// Vertical astigmatism coefficient in radians.
    pub fn with_astigmatism(mut self, astigmatism: f64) -> Self {
        self.astigmatism = astigmatism;
        self
    }

    pub fn with_oversampling(mut self, oversampling: usize) -> Self {
        self.oversampling = oversampling;
        self
    }

    pub fn with_camera_pixel_size(mut self, pixel_size: Length) -> Self {
        self.camera_pixel_size = pixel_size;
        self
    }

    /// Distance of the emitter past the interface.
    pub fn with_depth(mut self, depth: Length) -> Self {
        self.depth = depth;
        self
    }

    /// Correction collar setting in radians of primary spherical aberration.
    pub fn with_spherical_correction(mut self, coefficient: f64) -> Self {
        self.spherical_correction = coefficient;
        self
    }

    /// Full width of the centered region to keep on the camera.
    pub fn with_display_field_of_view(mut self, field_of_view: Length) -> Self {
        self.display_field_of_view = Some(field_of_view);
        self
    }

    pub fn z_defocus(&self) -> Length {
        self.z_defocus
    }

    pub fn phase_mask(&self) -> Option<&PhaseMask> {
        self.phase_mask.as_ref()
    }

    pub fn astigmatism(&self) -> f64 {
        self.astigmatism
    }

    pub fn oversampling(&self) -> usize {
        self.oversampling
    }

    pub fn camera_pixel_size(&self) -> Length {
        self.camera_pixel_size
    }

    pub fn depth(&self) -> Length {
        self.depth
    }

    pub fn spherical_correction(&self) -> f64 {
        self.spherical_correction
    }

    pub fn display_field_of_view(&self) -> Option<Length> {
        self.display_field_of_view
    }
}

/// Peak-to-valley phase over the aperture, in radians.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AberrationStats {
    /// Residual interface aberration at the emitter depth.
    pub depth: f64,
    /// Defocus relative to the best focus.
    pub defocus: f64,
    /// Supplied mask plus the astigmatism term.
    pub astigmatism: f64,
    /// Correction collar.
    pub collar: f64,
}

/// Camera image of an isotropic emitter with its pupil diagnostics.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationResult {
    image: Array2<f64>,
    camera_extent: Extent,
    pupil_intensity: Array2<f64>,
    pupil_phase: Array2<f64>,
    pupil_extent: Extent,
    stats: AberrationStats,
    supercritical_fraction: f64,
    strategy: ResampleStrategy,
}

impl SimulationResult {
    /// Intensity on camera pixels.
    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn camera_extent(&self) -> Extent {
        self.camera_extent
    }

    /// Camera pixel grid of [`SimulationResult::image`], with the optical
    /// axis on its center pixel.
    pub fn sensor(&self) -> ImageSensor {
        ImageSensor::covering(&self.camera_extent, &self.image)
    }

    pub fn pupil_intensity(&self) -> &Array2<f64> {
        &self.pupil_intensity
    }

    /// Phase of the x-polarized field of the axial dipole.
    pub fn pupil_phase(&self) -> &Array2<f64> {
        &self.pupil_phase
    }

    pub fn pupil_extent(&self) -> Extent {
        self.pupil_extent
    }

    pub fn stats(&self) -> AberrationStats {
        self.stats
    }

    /// Share of the pupil energy carried by supercritical rays.
    pub fn supercritical_fraction(&self) -> f64 {
        self.supercritical_fraction
    }

    pub fn strategy(&self) -> ResampleStrategy {
        self.strategy
    }
}

/// A configured microscope that forms images of dipole emitters.
///
/// Owns the pupil geometry and a one-slot cache of the Green's tensor keyed by
/// emitter depth. Single dipoles at the interface keep their own slot so they
/// never evict the tensor of an isotropic request.
#[derive(Debug)]
pub struct Microscope {
    config: OpticalConfig,
    geometry: PupilGeometry,
    cache: TensorCache,
    surface: TensorCache,
}

impl Microscope {
    pub fn new(config: OpticalConfig) -> Result<Self, Error> {
        let geometry = PupilGeometry::new(&config)?;

        debug!(
            "microscope NA {} at {} nm, n1 {} n2 {}, total magnification {:.2}, pupil {}x{}",
            config.numerical_aperture(),
            config.wavelength().get::<nanometer>(),
            config.n_immersion(),
            config.n_sample(),
            config.total_magnification(),
            config.pupil_resolution(),
            config.pupil_resolution(),
        );

        Ok(Self {
            config,
            geometry,
            cache: TensorCache::new(),
            surface: TensorCache::new(),
        })
    }

    pub fn config(&self) -> &OpticalConfig {
        &self.config
    }

    pub fn geometry(&self) -> &PupilGeometry {
        &self.geometry
    }

    pub fn phase_masks(&self) -> PhaseMaskGenerator<'_> {
        PhaseMaskGenerator::new(&self.config, &self.geometry)
    }

    /// Phase of a cylindrical lens of `focal_length` in the relayed pupil.
    pub fn cylindrical_phase(&self, focal_length: Length) -> Option<PhaseMask> {
        self.phase_masks().cylindrical(focal_length)
    }

    /// The tensor at `depth`, computed only if the cache holds another depth.
    pub fn tensor(&self, depth: Length) -> Arc<GreensTensor> {
        self.cache.get_or_compute(depth, || {
            GreensTensor::compute(&self.config, &self.geometry, depth)
        })
    }

    /// Tensor at the interface used by [`Microscope::simulate_dipole`].
    fn surface_tensor(&self) -> Arc<GreensTensor> {
        self.surface.get_or_compute(Length::ZERO, || {
            GreensTensor::compute(&self.config, &self.geometry, Length::ZERO)
        })
    }

    /// Number of tensor evaluations so far, over both slots.
    pub fn tensor_computations(&self) -> usize {
        self.cache.computations() + self.surface.computations()
    }

    /// Physical extent of the relayed pupil.
    pub fn pupil_extent(&self) -> Extent {
        Extent::centered(self.config.pupil_radius() * 2.0)
    }

    /// Extent of the propagated image on the camera, before resampling.
    pub fn camera_extent(&self) -> Extent {
        Extent::centered(camera_field_of_view(&self.config))
    }

    /// Images a single dipole at the interface.
    pub fn simulate_dipole(
        &self,
        orientation: &DipoleOrientation,
        z_defocus: Length,
        phase_mask: Option<&PhaseMask>,
        oversampling: usize,
    ) -> Result<DipoleImage, Error> {
        let propagator = FourierPropagator::new(oversampling)?;
        let moment = orientation.unit_vector()?;
        let mut phase = self.base_phase(phase_mask)?;
        phase += &self.phase_masks().defocus(z_defocus);

        let tensor = self.surface_tensor();
        let mut batch = FieldBatch::new(tensor.field_for(&moment))?;
        batch.apply_factor(&phase.to_factor())?;

        Ok(DipoleImage {
            image: propagator.propagate_batch(&batch).intensity(),
            pupil_intensity: batch.intensity(),
            camera_extent: self.camera_extent(),
            pupil_extent: self.pupil_extent(),
        })
    }

    /// Images a freely rotating emitter as the incoherent sum of three
    /// orthogonal dipoles and resamples it onto camera pixels.
    pub fn simulate_isotropic(&self, request: &IsotropicRequest) -> Result<SimulationResult, Error> {
        let propagator = FourierPropagator::new(request.oversampling())?;
        let pixel_size = request.camera_pixel_size().get::<micron>();
        if !(pixel_size.is_finite() && pixel_size > 0.0) {
            return Err(Error::InvalidPixelSize);
        }

        let masks = self.phase_masks();
        let aperture = self.geometry.grid().aperture();
        let depth = request.depth();

        let supplied = self.base_phase(request.phase_mask())?;
        let defocus = masks.defocus(request.z_defocus());
        let astigmatism = supplied.combined(&masks.astigmatism(request.astigmatism()))?;
        let collar = masks.spherical_correction(request.spherical_correction());

        let stats = AberrationStats {
            depth: masks.depth_aberration(depth).peak_to_valley(aperture),
            defocus: defocus.peak_to_valley(aperture),
            astigmatism: astigmatism.peak_to_valley(aperture),
            collar: collar.peak_to_valley(aperture),
        };

        let mut phase = astigmatism;
        phase += &defocus;
        phase += &masks.depth_correction(depth);
        phase += &collar;

        let tensor = self.tensor(depth);
        let mut batch = FieldBatch::new(tensor.sub_fields())?;
        batch.apply_factor(&phase.to_factor())?;

        let pupil_intensity = batch.intensity();
        let pupil_phase =
            batch.fields()[sub_field_index(DipoleAxis::Z, Polarization::X)].mapv(|e| e.arg());
        let supercritical_fraction =
            energy_fraction(&pupil_intensity, &self.geometry.angles().supercritical());

        let image = propagator.propagate_batch(&batch).intensity();
        let (mut image, mut camera_extent, strategy) =
            resample(&image, &self.camera_extent(), request.camera_pixel_size())?.into_parts();

        if let Some(field_of_view) = request.display_field_of_view() {
            if field_of_view > Length::ZERO {
                (image, camera_extent) = crop_to_field_of_view(&image, &camera_extent, field_of_view)?;
            }
        }

        debug!(
            "isotropic image {}x{} over {:.2} um, pupil {:.3} mm, supercritical fraction {:.4}, {stats:?}",
            image.nrows(),
            image.ncols(),
            camera_extent.width().get::<micron>(),
            self.pupil_extent().width().get::<millimeter>(),
            supercritical_fraction
        );

        Ok(SimulationResult {
            image,
            camera_extent,
            pupil_intensity,
            pupil_phase,
            pupil_extent: self.pupil_extent(),
            stats,
            supercritical_fraction,
            strategy,
        })
    }

    fn base_phase(&self, phase_mask: Option<&PhaseMask>) -> Result<PhaseMask, Error> {
        match phase_mask {
            Some(mask) => {
                mask.check_shape(self.geometry.shape())?;
                Ok(mask.clone())
            }
            None => Ok(PhaseMask::zeros(self.geometry.shape())),
        }
    }
}

/// Share of the total of `intensity` that falls where `region` is set.
fn energy_fraction(intensity: &Array2<f64>, region: &Array2<bool>) -> f64 {
    let total = intensity.sum();
    if total <= 0.0 || !total.is_finite() {
        return 0.0;
    }

    let mut inside = 0.0;
    Zip::from(intensity).and(region).for_each(|&i, &r| {
        if r {
            inside += i;
        }
    });
    inside / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use num_complex::Complex64;
    use rstest::rstest;
    use std::f64::consts::FRAC_PI_2;
    use uom::si::angle::degree;

    fn microscope(resolution: usize) -> Microscope {
        let config = OpticalConfig::builder()
            .pupil_resolution(resolution)
            .build()
            .unwrap();
        Microscope::new(config).unwrap()
    }

    #[rstest]
    #[case(0.0, 0.0, [0.0, 0.0, 1.0])]
    #[case(90.0, 0.0, [1.0, 0.0, 0.0])]
    #[case(90.0, 90.0, [0.0, 1.0, 0.0])]
    #[case(60.0, 180.0, [-0.75f64.sqrt(), 0.0, 0.5])]
    fn orientation_from_angles(#[case] polar: f64, #[case] azimuth: f64, #[case] expected: [f64; 3]) {
        let orientation = DipoleOrientation::Angles {
            polar: Angle::new::<degree>(polar),
            azimuth: Angle::new::<degree>(azimuth),
        };
        let unit = orientation.unit_vector().unwrap();

        for (found, want) in unit.iter().zip(expected) {
            assert_relative_eq!(*found, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn orientation_vector_is_normalized() {
        let unit = DipoleOrientation::Vector(Vector3::new(3.0, 0.0, 4.0))
            .unit_vector()
            .unwrap();
        assert_relative_eq!(unit, Vector3::new(0.6, 0.0, 0.8), epsilon = 1e-12);
    }

    #[rstest]
    #[case([0.0, 0.0, 0.0])]
    #[case([f64::NAN, 1.0, 0.0])]
    #[case([f64::INFINITY, 0.0, 0.0])]
    fn invalid_orientation(#[case] moment: [f64; 3]) {
        let orientation = DipoleOrientation::Vector(Vector3::from(moment));
        assert!(matches!(
            orientation.unit_vector(),
            Err(Error::InvalidOrientation(_))
        ));
    }

    #[test]
    fn angles_with_nan_are_rejected() {
        let orientation = DipoleOrientation::Angles {
            polar: Angle::new::<radian>(f64::NAN),
            azimuth: Angle::new::<radian>(FRAC_PI_2),
        };
        assert!(orientation.unit_vector().is_err());
    }

    #[test]
    fn dipole_image_shapes_and_extents() {
        let scope = microscope(24);
        let result = scope
            .simulate_dipole(
                &DipoleOrientation::Vector(Vector3::x()),
                Length::ZERO,
                None,
                2,
            )
            .unwrap();

        assert_eq!(result.image().dim(), (48, 48));
        assert_eq!(result.pupil_intensity().dim(), (24, 24));
        assert_eq!(result.camera_extent(), scope.camera_extent());
        assert_relative_eq!(
            result.pupil_extent().width().get::<millimeter>(),
            2.0 * 4.47,
            epsilon = 1e-9
        );
        assert!(result.image().iter().all(|i| i.is_finite() && *i >= 0.0));
    }

    #[test]
    fn dipole_leaves_deeper_tensor_cached() {
        let scope = microscope(16);
        let deep = Length::new::<micron>(0.4);
        let z = DipoleOrientation::Vector(Vector3::z());

        scope.tensor(deep);
        scope.simulate_dipole(&z, Length::ZERO, None, 1).unwrap();
        scope.simulate_dipole(&z, Length::ZERO, None, 1).unwrap();

        assert_eq!(scope.cache.cached_depth(), Some(deep));
        assert_eq!(scope.surface.cached_depth(), Some(Length::ZERO));
        assert_eq!(scope.tensor_computations(), 2);
    }

    #[test]
    fn dipole_image_sensor_is_centered() {
        let scope = microscope(16);
        let result = scope
            .simulate_dipole(&DipoleOrientation::Vector(Vector3::z()), Length::ZERO, None, 2)
            .unwrap();
        let sensor = result.sensor();

        assert_eq!(sensor.shape(), (32, 32));
        assert_eq!(sensor.axis_pixel(), (16, 16));
        assert_relative_eq!(
            sensor.extent().width().get::<micron>(),
            scope.camera_extent().width().get::<micron>(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn dipole_rejects_mismatched_mask() {
        let scope = microscope(16);
        let mask = PhaseMask::zeros((8, 8));
        assert_eq!(
            scope.simulate_dipole(
                &DipoleOrientation::Vector(Vector3::z()),
                Length::ZERO,
                Some(&mask),
                1,
            ),
            Err(Error::ShapeMismatch {
                expected: (16, 16),
                found: (8, 8)
            })
        );
    }

    #[test]
    fn dipole_rejects_zero_oversampling() {
        let scope = microscope(16);
        assert_eq!(
            scope.simulate_dipole(
                &DipoleOrientation::Vector(Vector3::z()),
                Length::ZERO,
                None,
                0,
            ),
            Err(Error::InvalidOversampling(0))
        );
    }

    #[rstest]
    #[case(0.0)]
    #[case(-1.0)]
    #[case(f64::NAN)]
    fn isotropic_rejects_pixel_size(#[case] pixel_um: f64) {
        let scope = microscope(16);
        let request = IsotropicRequest::default()
            .with_oversampling(1)
            .with_camera_pixel_size(Length::new::<micron>(pixel_um));

        assert_eq!(
            scope.simulate_isotropic(&request),
            Err(Error::InvalidPixelSize)
        );
        assert_eq!(scope.tensor_computations(), 0);
    }

    #[test]
    fn unaberrated_stats_are_zero() {
        let scope = microscope(17);
        let result = scope
            .simulate_isotropic(&IsotropicRequest::default().with_oversampling(2))
            .unwrap();

        assert_eq!(result.stats(), AberrationStats::default());
    }

    #[test]
    fn stats_track_each_term() {
        let scope = microscope(33);
        let request = IsotropicRequest::default()
            .with_oversampling(1)
            .with_astigmatism(1.5)
            .with_spherical_correction(2.0)
            .with_z_defocus(Length::new::<micron>(0.5))
            .with_depth(Length::new::<micron>(2.0));
        let stats = scope.simulate_isotropic(&request).unwrap().stats();

        assert_relative_eq!(stats.astigmatism, 3.0, epsilon = 1e-9);
        assert!(stats.collar > 0.0 && stats.collar <= 3.0 + 1e-12);
        assert!(stats.defocus > 0.0);
        assert!(stats.depth > 0.0);
    }

    #[test]
    fn pupil_phase_is_from_axial_dipole() {
        let scope = microscope(17);
        let result = scope
            .simulate_isotropic(&IsotropicRequest::default().with_oversampling(1))
            .unwrap();
        let expected = scope
            .tensor(Length::ZERO)
            .component(Polarization::X, DipoleAxis::Z)
            .mapv(|e| e.arg());

        // Compared on the unit circle since a signed zero flips the angle by 2 pi.
        Zip::from(result.pupil_phase())
            .and(&expected)
            .for_each(|a, b| {
                let difference = Complex64::from_polar(1.0, *a) - Complex64::from_polar(1.0, *b);
                assert_relative_eq!(difference.norm(), 0.0, epsilon = 1e-9)
            });
    }

    #[test]
    fn energy_fraction_of_region() {
        let intensity = Array2::from_shape_vec((2, 2), vec![1.0, 3.0, 0.0, 4.0]).unwrap();
        let region = Array2::from_shape_vec((2, 2), vec![false, true, true, false]).unwrap();

        assert_relative_eq!(energy_fraction(&intensity, &region), 3.0 / 8.0);
        assert_eq!(energy_fraction(&Array2::zeros((2, 2)), &region), 0.0);
    }
}
