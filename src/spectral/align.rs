//! Alignment of raw frames onto the canonical wavelength grid.

use thiserror::Error;

use crate::config::GridConfig;

/// Reasons a frame cannot be aligned. Such frames are discarded, never propagated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    /// Axis and intensity lengths differ.
    #[error("axis has {axis} points but {intensities} intensities")]
    LengthMismatch {
        /// Axis length.
        axis: usize,
        /// Intensity count.
        intensities: usize,
    },

    /// Not enough points to interpolate.
    #[error("axis has fewer than two points")]
    TooShort,

    /// Axis values are not strictly increasing.
    #[error("axis is not strictly increasing")]
    NonMonotonic,

    /// Axis endpoints moved beyond tolerance.
    #[error("axis drifted {drift_nm:.3} nm (tolerance {tolerance_nm:.3} nm)")]
    Drift {
        /// Largest endpoint shift.
        drift_nm: f64,
        /// Configured tolerance.
        tolerance_nm: f64,
    },
}

/// Uniform wavelength grid.
#[derive(Clone, Debug, PartialEq)]
pub struct WavelengthGrid {
    axis: Vec<f64>,
}

impl WavelengthGrid {
    /// Evenly spaced grid described by `config`.
    pub fn new(config: &GridConfig) -> Self {
        let step = (config.end_nm - config.start_nm) / (config.points.max(2) - 1) as f64;
        let axis = (0..config.points)
            .map(|i| config.start_nm + step * i as f64)
            .collect();
        Self { axis }
    }

    /// Grid wavelengths in nm.
    pub fn axis(&self) -> &[f64] {
        &self.axis
    }

    /// Number of grid points.
    pub fn len(&self) -> usize {
        self.axis.len()
    }

    /// True for a grid without points.
    pub fn is_empty(&self) -> bool {
        self.axis.is_empty()
    }

    fn start(&self) -> f64 {
        self.axis.first().copied().unwrap_or_default()
    }

    fn end(&self) -> f64 {
        self.axis.last().copied().unwrap_or_default()
    }

    /// Interpolate `intensities` sampled at `wavelengths` onto this grid.
    ///
    /// # Errors
    ///
    /// Fails when the axis is malformed or either endpoint differs from the grid's by more
    /// than `tolerance_nm`.
    pub fn align(
        &self,
        wavelengths: &[f64],
        intensities: &[f64],
        tolerance_nm: f64,
    ) -> Result<Vec<f64>, AlignmentError> {
        if wavelengths.len() != intensities.len() {
            return Err(AlignmentError::LengthMismatch {
                axis: wavelengths.len(),
                intensities: intensities.len(),
            });
        }
        let (first, last) = match (wavelengths.first(), wavelengths.last()) {
            (Some(&first), Some(&last)) if wavelengths.len() >= 2 => (first, last),
            _ => return Err(AlignmentError::TooShort),
        };
        if wavelengths.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(AlignmentError::NonMonotonic);
        }

        let drift_nm = (first - self.start()).abs().max((last - self.end()).abs());
        if drift_nm > tolerance_nm {
            return Err(AlignmentError::Drift {
                drift_nm,
                tolerance_nm,
            });
        }

        Ok(self
            .axis
            .iter()
            .map(|&x| interpolate(wavelengths, intensities, x))
            .collect())
    }
}

/// Linear interpolation on a strictly increasing axis, clamped at both ends.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let upper = xs.partition_point(|&v| v < x);
    if upper == 0 {
        return ys[0];
    }
    if upper >= xs.len() {
        return ys[ys.len() - 1];
    }
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}
