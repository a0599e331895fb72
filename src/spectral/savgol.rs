//! Savitzky-Golay smoothing.
//!
//! Each output sample is the value at that position of a least-squares polynomial of
//! degree `polyorder` fitted to the `window_length` samples around it. Near the edges the
//! polynomial fitted to the first (or last) full window is evaluated at the edge positions,
//! so the output always has the same length as the input.

use nalgebra::DMatrix;

use crate::error::{AppResult, SynthError};

/// Precomputed Savitzky-Golay filter.
#[derive(Clone, Debug)]
pub struct SavitzkyGolay {
    window_length: usize,
    polyorder: usize,
    /// `weights[t]` evaluates the window fit at window position `t` (0..window_length).
    weights: Vec<Vec<f64>>,
}

impl SavitzkyGolay {
    /// Build a filter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSmoothingConfig` unless `window_length` is odd and at least
    /// `polyorder + 2`.
    pub fn new(window_length: usize, polyorder: usize) -> AppResult<Self> {
        let invalid = |reason: &str| SynthError::InvalidSmoothingConfig {
            window_length,
            polyorder,
            reason: reason.to_string(),
        };

        if window_length % 2 == 0 {
            return Err(invalid("window length must be odd"));
        }
        if window_length < polyorder + 2 {
            return Err(invalid("window length must be at least polyorder + 2"));
        }

        let half = (window_length / 2) as f64;
        let vandermonde = DMatrix::from_fn(window_length, polyorder + 1, |i, k| {
            (i as f64 - half).powi(k as i32)
        });
        let normal = vandermonde.transpose() * &vandermonde;
        let inverse = normal
            .try_inverse()
            .ok_or_else(|| invalid("least-squares system is singular"))?;
        // Rows: polynomial coefficient k; columns: window sample j.
        let projection = inverse * vandermonde.transpose();

        let weights = (0..window_length)
            .map(|t| {
                let x = t as f64 - half;
                (0..window_length)
                    .map(|j| {
                        (0..=polyorder)
                            .map(|k| x.powi(k as i32) * projection[(k, j)])
                            .sum()
                    })
                    .collect()
            })
            .collect();

        Ok(Self {
            window_length,
            polyorder,
            weights,
        })
    }

    /// Number of samples per fit.
    pub fn window_length(&self) -> usize {
        self.window_length
    }

    /// Degree of the fitted polynomial.
    pub fn polyorder(&self) -> usize {
        self.polyorder
    }

    /// Coefficients applied to an interior window.
    pub fn central_weights(&self) -> &[f64] {
        &self.weights[self.window_length / 2]
    }

    /// Smooth `data`. The output has exactly `data.len()` samples.
    ///
    /// Inputs shorter than the window are smoothed with the largest valid window that
    /// fits; inputs too short for any fit are returned unchanged.
    pub fn apply(&self, data: &[f64]) -> Vec<f64> {
        let n = data.len();
        if n < self.window_length {
            return self.apply_short(data);
        }

        let w = self.window_length;
        let half = w / 2;
        let mut out = Vec::with_capacity(n);

        let dot = |weights: &[f64], window: &[f64]| -> f64 {
            weights.iter().zip(window).map(|(a, b)| a * b).sum()
        };

        let head = &data[..w];
        for t in 0..half {
            out.push(dot(&self.weights[t], head));
        }

        let central = self.central_weights();
        for window in data.windows(w) {
            out.push(dot(central, window));
        }

        let tail = &data[n - w..];
        for t in half + 1..w {
            out.push(dot(&self.weights[t], tail));
        }

        out
    }

    fn apply_short(&self, data: &[f64]) -> Vec<f64> {
        let n = data.len();
        let window = if n % 2 == 0 { n.saturating_sub(1) } else { n };
        if window < 3 {
            return data.to_vec();
        }
        let polyorder = self.polyorder.min(window - 2);
        match SavitzkyGolay::new(window, polyorder) {
            Ok(filter) => filter.apply(data),
            Err(_) => data.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_coefficients() {
        let filter = SavitzkyGolay::new(5, 2).unwrap();
        let expected = [-3.0, 12.0, 17.0, 12.0, -3.0].map(|c| c / 35.0);
        for (got, want) in filter.central_weights().iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{got} != {want}");
        }
    }

    #[test]
    fn test_rejects_even_window() {
        assert!(matches!(
            SavitzkyGolay::new(10, 2),
            Err(SynthError::InvalidSmoothingConfig { .. })
        ));
    }

    #[test]
    fn test_rejects_window_too_small_for_order() {
        assert!(SavitzkyGolay::new(5, 4).is_err());
        assert!(SavitzkyGolay::new(7, 5).is_ok());
    }

    #[test]
    fn test_preserves_polynomials_including_edges() {
        let filter = SavitzkyGolay::new(7, 2).unwrap();
        let data: Vec<f64> = (0..30)
            .map(|i| {
                let x = i as f64;
                0.5 * x * x - 3.0 * x + 7.0
            })
            .collect();
        let smoothed = filter.apply(&data);
        assert_eq!(smoothed.len(), data.len());
        for (a, b) in smoothed.iter().zip(&data) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn test_reduces_noise() {
        let filter = SavitzkyGolay::new(11, 2).unwrap();
        let data: Vec<f64> = (0..200)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let smoothed = filter.apply(&data);
        let interior_max = smoothed[20..180]
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));
        assert!(interior_max < 0.2);
    }

    #[test]
    fn test_short_input_keeps_length() {
        let filter = SavitzkyGolay::new(11, 3).unwrap();
        for n in 0..11 {
            let data: Vec<f64> = (0..n).map(|i| i as f64).collect();
            assert_eq!(filter.apply(&data).len(), n);
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn output_length_matches_input(
            half_window in 1usize..12,
            polyorder in 0usize..6,
            data in prop::collection::vec(-1.0e3_f64..1.0e3, 0..120),
        ) {
            let window = 2 * half_window + 1;
            if let Ok(filter) = SavitzkyGolay::new(window, polyorder) {
                let once = filter.apply(&data);
                prop_assert_eq!(once.len(), data.len());
                prop_assert_eq!(filter.apply(&once).len(), data.len());
            }
        }
    }
}
