//! Vectorial point spread functions of dipole emitters
//!
//! Models a high numerical aperture objective imaging a fluorescent dipole
//! through the interface between the immersion medium and the sample,
//! including supercritical-angle fluorescence, depth-dependent focal shift,
//! pupil phase masks and resampling onto camera pixels.

pub mod camera;
pub mod config;
#[allow(missing_docs)]
pub mod error;
pub mod greens;
pub mod microscope;
pub mod phase;
pub mod propagate;
pub mod pupil;
pub mod resample;

pub use config::{OpticalConfig, OpticalConfigBuilder};
pub use error::Error;
pub use microscope::{
    AberrationStats, DipoleImage, DipoleOrientation, IsotropicRequest, Microscope,
    SimulationResult,
};
pub use phase::{CylindricalLens, PhaseMask};
