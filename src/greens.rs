//! Dipole-to-pupil field mapping through the sample/immersion interface.
//!
//! For every pupil sample the tensor `M` maps a dipole moment `mu` in the
//! sample to the transverse field `(Ex, Ey) = M mu` in the back focal plane.
//! The field is projected onto p- and s-polarization in the sample, carried
//! across the interface with the Fresnel transmission coefficients and
//! rotated back into x/y in the pupil.

use crate::{config::OpticalConfig, pupil::PupilGeometry};
use log::debug;
use nalgebra::Vector3;
use ndarray::Array2;
use num_complex::Complex64;
use rayon::prelude::*;
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};
use uom::{
    ConstZero,
    si::{f64::Length, length::meter},
};

/// Floor applied to `cos(theta1)` in the apodization at grazing incidence.
pub const COS_THETA_FLOOR: f64 = 1e-9;

/// Transverse field component in the pupil.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Polarization {
    X,
    Y,
}

impl Polarization {
    pub const ALL: [Polarization; 2] = [Polarization::X, Polarization::Y];

    fn index(self) -> usize {
        self as usize
    }
}

/// Axis of a dipole moment in the sample frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DipoleAxis {
    X,
    Y,
    Z,
}

impl DipoleAxis {
    pub const ALL: [DipoleAxis; 3] = [DipoleAxis::X, DipoleAxis::Y, DipoleAxis::Z];

    fn index(self) -> usize {
        self as usize
    }
}

/// Number of sub-fields of an isotropic emitter, one per axis and polarization.
pub const SUB_FIELDS: usize = 6;

/// Fresnel field transmission coefficients for s- and p-polarization.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fresnel {
    pub ts: Complex64,
    pub tp: Complex64,
}

impl Fresnel {
    /// Transmission between the immersion medium `n1` and the sample `n2`.
    ///
    /// Complex whenever `cos_theta2` is, ie. for supercritical rays.
    pub fn transmission(n1: f64, n2: f64, cos_theta1: f64, cos_theta2: Complex64) -> Self {
        let numerator = Complex64::from(2.0 * n1 * cos_theta1);
        Self {
            ts: numerator / (n1 * cos_theta1 + n2 * cos_theta2),
            tp: numerator / (n2 * cos_theta1 + n1 * cos_theta2),
        }
    }
}

type PointTensor = [[Complex64; 3]; 2];

const ZERO_TENSOR: PointTensor = [[Complex64::new(0.0, 0.0); 3]; 2];

/// The pupil-plane Green's tensor for an emitter at a fixed depth.
#[derive(Clone, Debug, PartialEq)]
pub struct GreensTensor {
    depth: Length,
    components: [[Array2<Complex64>; 3]; 2],
}

impl GreensTensor {
    /// Evaluates the tensor for an emitter `depth` past the interface.
    pub fn compute(config: &OpticalConfig, geometry: &PupilGeometry, depth: Length) -> Self {
        let (rows, cols) = geometry.shape();
        let grid = geometry.grid();
        let angles = geometry.angles();
        let (n1, n2) = (config.n_immersion(), config.n_sample());
        let kz_depth = config.k_sample() * depth.get::<meter>();
        let apply_depth = depth != Length::ZERO;

        debug!(
            "computing Green's tensor on {rows}x{cols} pupil at depth {:e} m",
            depth.get::<meter>()
        );

        let points: Vec<PointTensor> = (0..rows * cols)
            .into_par_iter()
            .map(|idx| {
                let at = (idx / cols, idx % cols);
                if !grid.aperture()[at] {
                    return ZERO_TENSOR;
                }

                let ct1 = angles.cos_theta1()[at];
                let st2 = angles.sin_theta2()[at];
                let ct2 = angles.cos_theta2()[at];
                let (sp, cp) = grid.phi()[at].sin_cos();
                let Fresnel { ts, tp } = Fresnel::transmission(n1, n2, ct1, ct2);
                let mut apodization = Complex64::from(1.0 / ct1.max(COS_THETA_FLOOR).sqrt());
                if apply_depth {
                    apodization *= (Complex64::i() * kz_depth * ct2).exp();
                }

                let mxy = (tp * ct2 - ts) * sp * cp;
                [
                    [
                        tp * ct2 * cp * cp + ts * sp * sp,
                        mxy,
                        -tp * st2 * cp,
                    ],
                    [
                        mxy,
                        tp * ct2 * sp * sp + ts * cp * cp,
                        -tp * st2 * sp,
                    ],
                ]
                .map(|row| row.map(|m| m * apodization))
            })
            .collect();

        let components = std::array::from_fn(|pol| {
            std::array::from_fn(|axis| {
                Array2::from_shape_fn((rows, cols), |(row, col)| points[row * cols + col][pol][axis])
            })
        });

        Self { depth, components }
    }

    /// Depth the tensor was evaluated at.
    pub fn depth(&self) -> Length {
        self.depth
    }

    pub fn shape(&self) -> (usize, usize) {
        self.components[0][0].dim()
    }

    /// The field in `polarization` radiated by a unit dipole along `axis`.
    pub fn component(&self, polarization: Polarization, axis: DipoleAxis) -> &Array2<Complex64> {
        &self.components[polarization.index()][axis.index()]
    }

    /// Contracts the tensor with a dipole moment into the `(Ex, Ey)` pupil field.
    pub fn field_for(&self, moment: &Vector3<f64>) -> [Array2<Complex64>; 2] {
        Polarization::ALL.map(|pol| {
            DipoleAxis::ALL
                .iter()
                .fold(Array2::zeros(self.shape()), |acc, &axis| {
                    acc + self.component(pol, axis).mapv(|m| m * moment[axis.index()])
                })
        })
    }

    /// The six fields of three orthogonal unit dipoles in both polarizations.
    ///
    /// Ordered axis-major, see [`sub_field_index`].
    pub fn sub_fields(&self) -> [Array2<Complex64>; SUB_FIELDS] {
        std::array::from_fn(|idx| {
            let axis = DipoleAxis::ALL[idx / 2];
            let pol = Polarization::ALL[idx % 2];
            self.component(pol, axis).clone()
        })
    }
}

/// Position of the (`axis`, `polarization`) field in [`GreensTensor::sub_fields`].
pub fn sub_field_index(axis: DipoleAxis, polarization: Polarization) -> usize {
    axis.index() * 2 + polarization.index()
}

/// Holds the tensor for the most recently requested depth.
///
/// The depth comparison and replacement happen under one lock so concurrent
/// callers never receive a tensor for a depth they did not ask for.
#[derive(Debug, Default)]
pub struct TensorCache {
    slot: Mutex<Option<Arc<GreensTensor>>>,
    computations: AtomicUsize,
}

impl TensorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached tensor if it was evaluated at `depth`, otherwise
    /// replaces it with the result of `compute`.
    pub fn get_or_compute<F>(&self, depth: Length, compute: F) -> Arc<GreensTensor>
    where
        F: FnOnce() -> GreensTensor,
    {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(tensor) if tensor.depth() == depth => Arc::clone(tensor),
            _ => {
                let tensor = Arc::new(compute());
                self.computations.fetch_add(1, Ordering::Relaxed);
                *slot = Some(Arc::clone(&tensor));
                tensor
            }
        }
    }

    /// Depth of the cached tensor, if any.
    pub fn cached_depth(&self) -> Option<Length> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tensor| tensor.depth())
    }

    /// Number of tensors computed over the lifetime of the cache.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}
