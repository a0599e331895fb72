//! Sliding stability window over recent spectral features.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::SpectralFeature;
use crate::plan::StabilityCondition;

/// Fixed-capacity FIFO of the most recent features.
#[derive(Clone, Debug)]
pub struct StabilityWindow {
    capacity: usize,
    features: VecDeque<SpectralFeature>,
}

/// Drift of the newest feature relative to the oldest one still in the window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StabilityMetric {
    /// Features in the window after this update.
    pub samples: usize,
    /// Whether the window is at capacity.
    pub window_full: bool,
    /// Peak shift, newest minus oldest.
    pub delta_peak_nm: f64,
    /// `None` while either end of the window lacks a linewidth.
    pub delta_fwhm_mev: Option<f64>,
}

impl StabilityMetric {
    /// Whether this update meets `condition`. A partially filled window never does.
    pub fn satisfies(&self, condition: &StabilityCondition) -> bool {
        if !self.window_full {
            return false;
        }
        let peak_ok = self.delta_peak_nm.abs() < condition.max_peak_shift_nm;
        let fwhm_ok = self
            .delta_fwhm_mev
            .is_some_and(|delta| delta.abs() < condition.max_fwhm_change_mev);
        peak_ok && fwhm_ok
    }
}

impl StabilityWindow {
    /// Capacity is clamped to at least two samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            features: VecDeque::with_capacity(capacity),
        }
    }

    /// Maximum number of retained features.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Features currently retained.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// True before the first push.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Retained features, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SpectralFeature> {
        self.features.iter()
    }

    /// Push a feature, evicting the oldest when full, and return the updated metric.
    pub fn push(&mut self, feature: SpectralFeature) -> StabilityMetric {
        if self.features.len() == self.capacity {
            self.features.pop_front();
        }
        self.features.push_back(feature);
        self.metric()
    }

    fn metric(&self) -> StabilityMetric {
        let (oldest, newest) = match (self.features.front(), self.features.back()) {
            (Some(oldest), Some(newest)) => (oldest, newest),
            _ => {
                return StabilityMetric {
                    samples: 0,
                    window_full: false,
                    delta_peak_nm: 0.0,
                    delta_fwhm_mev: None,
                }
            }
        };

        let delta_fwhm_mev = match (newest.fwhm_ev, oldest.fwhm_ev) {
            (Some(new), Some(old)) => Some((new - old) * 1000.0),
            _ => None,
        };

        StabilityMetric {
            samples: self.features.len(),
            window_full: self.features.len() == self.capacity,
            delta_peak_nm: newest.peak_wavelength_nm - oldest.peak_wavelength_nm,
            delta_fwhm_mev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    pub(super) fn feature(index: u64, peak_nm: f64, fwhm_ev: Option<f64>) -> SpectralFeature {
        SpectralFeature {
            timestamp: Utc::now(),
            frame_index: index,
            peak_wavelength_nm: peak_nm,
            peak_energy_ev: crate::spectral::features::wavelength_to_energy(peak_nm),
            peak_intensity: 1000.0,
            fwhm_nm: None,
            fwhm_ev,
        }
    }

    fn condition() -> StabilityCondition {
        StabilityCondition {
            max_peak_shift_nm: 0.5,
            max_fwhm_change_mev: 2.0,
            consecutive_updates: 3,
        }
    }

    #[test]
    fn test_metric_compares_against_oldest() {
        let mut window = StabilityWindow::new(3);
        window.push(feature(0, 600.0, Some(0.100)));
        window.push(feature(1, 601.0, Some(0.101)));
        let metric = window.push(feature(2, 603.0, Some(0.104)));
        assert!(metric.window_full);
        assert!((metric.delta_peak_nm - 3.0).abs() < 1e-12);
        assert!((metric.delta_fwhm_mev.unwrap() - 4.0).abs() < 1e-9);

        // Oldest (600 nm) evicted; now compared against 601 nm.
        let metric = window.push(feature(3, 603.0, Some(0.104)));
        assert!((metric.delta_peak_nm - 2.0).abs() < 1e-12);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_partial_window_never_satisfies() {
        let mut window = StabilityWindow::new(4);
        let metric = window.push(feature(0, 600.0, Some(0.1)));
        assert!(!metric.window_full);
        assert!(!metric.satisfies(&condition()));
    }

    #[test]
    fn test_missing_width_never_satisfies() {
        let mut window = StabilityWindow::new(2);
        window.push(feature(0, 600.0, None));
        let metric = window.push(feature(1, 600.0, Some(0.1)));
        assert_eq!(metric.delta_fwhm_mev, None);
        assert!(!metric.satisfies(&condition()));
    }

    #[test]
    fn test_steady_features_satisfy() {
        let mut window = StabilityWindow::new(3);
        let mut last = None;
        for i in 0..3 {
            last = Some(window.push(feature(i, 650.0 + 0.01 * i as f64, Some(0.117))));
        }
        assert!(last.unwrap().satisfies(&condition()));
    }
}
