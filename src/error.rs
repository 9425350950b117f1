use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid optical configuration: {0}")]
    Configuration(String),
    #[error("expected array of shape {expected:?} but got: {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("expected a finite non-zero dipole orientation but got: {0:?}")]
    InvalidOrientation([f64; 3]),
    #[error("expected an oversampling factor of at least 1 but got: {0}")]
    InvalidOversampling(usize),
    #[error("expected a positive finite camera pixel size")]
    InvalidPixelSize,
}

impl Error {
    pub(crate) fn check_shape(
        expected: (usize, usize),
        found: (usize, usize),
    ) -> Result<(), Error> {
        match expected == found {
            true => Ok(()),
            false => Err(Error::ShapeMismatch { expected, found }),
        }
    }
}
