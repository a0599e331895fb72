//! Spectral acquisition and analysis.
//!
//! Frames flow through four stages, each in its own module:
//!
//! 1. [`align`]: interpolate the raw readout onto the canonical wavelength grid, rejecting
//!    frames whose axis has drifted.
//! 2. [`savgol`]: Savitzky-Golay smoothing of the aligned intensities.
//! 3. [`features`]: peak position and FWHM, converted to energy at the peak.
//! 4. [`stability`]: sliding window producing the [`StabilityMetric`] the controller
//!    consumes.
//!
//! [`acquisition`] runs the capture loop as a background task and streams the results.

pub mod acquisition;
pub mod align;
pub mod features;
pub mod savgol;
pub mod stability;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AcquisitionConfig, SmoothingConfig, StabilityConfig};
use crate::error::AppResult;
use crate::hardware::RawSpectrum;

pub use acquisition::{AcquisitionEvent, AcquisitionFault, AcquisitionWorker};
pub use align::{AlignmentError, WavelengthGrid};
pub use savgol::SavitzkyGolay;
pub use stability::{StabilityMetric, StabilityWindow};

/// One captured spectrum.
#[derive(Clone, Debug, PartialEq)]
pub struct SpectralFrame {
    index: u64,
    timestamp: DateTime<Utc>,
    wavelengths_nm: Vec<f64>,
    intensities: Vec<f64>,
}

impl SpectralFrame {
    /// Wrap one readout.
    pub fn new(index: u64, timestamp: DateTime<Utc>, raw: RawSpectrum) -> Self {
        Self {
            index,
            timestamp,
            wavelengths_nm: raw.wavelengths_nm,
            intensities: raw.intensities,
        }
    }

    /// Capture sequence number.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Capture time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Axis as reported by the device.
    pub fn wavelengths_nm(&self) -> &[f64] {
        &self.wavelengths_nm
    }

    /// Raw counts.
    pub fn intensities(&self) -> &[f64] {
        &self.intensities
    }
}

/// Features extracted from one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectralFeature {
    /// Capture time of the source frame.
    pub timestamp: DateTime<Utc>,
    /// Sequence number of the source frame.
    pub frame_index: u64,
    /// Peak position.
    pub peak_wavelength_nm: f64,
    /// Peak position in energy.
    pub peak_energy_ev: f64,
    /// Smoothed peak height.
    pub peak_intensity: f64,
    /// Linewidth in wavelength, if both half-max crossings were found.
    pub fwhm_nm: Option<f64>,
    /// Linewidth in energy via the Jacobian at the peak.
    pub fwhm_ev: Option<f64>,
}

/// Why a frame produced no feature.
#[derive(Clone, Debug, PartialEq)]
pub enum DiscardReason {
    /// The axis could not be mapped onto the grid.
    Misaligned(AlignmentError),
    /// The smoothed maximum is below `min_peak_intensity`.
    NoSignal {
        /// Smoothed maximum of the frame.
        peak_intensity: f64,
    },
}

/// Result of pushing one frame through the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineOutput {
    /// A feature was extracted and pushed into the window.
    Updated {
        /// Feature extracted from the frame.
        feature: SpectralFeature,
        /// Stability metric after pushing it.
        metric: StabilityMetric,
    },
    /// The frame was dropped.
    Discarded(DiscardReason),
}

/// Stateful clean → smooth → extract → stability chain.
#[derive(Debug)]
pub struct SpectralPipeline {
    grid: WavelengthGrid,
    drift_tolerance_nm: f64,
    min_peak_intensity: f64,
    filter: SavitzkyGolay,
    window: StabilityWindow,
}

impl SpectralPipeline {
    /// # Errors
    ///
    /// Returns `InvalidSmoothingConfig` for an unusable smoothing configuration.
    pub fn new(
        acquisition: &AcquisitionConfig,
        smoothing: &SmoothingConfig,
        stability: &StabilityConfig,
    ) -> AppResult<Self> {
        Ok(Self {
            grid: WavelengthGrid::new(&acquisition.grid),
            drift_tolerance_nm: acquisition.axis_drift_tolerance_nm,
            min_peak_intensity: acquisition.min_peak_intensity,
            filter: SavitzkyGolay::new(smoothing.window_length, smoothing.polyorder)?,
            window: StabilityWindow::new(stability.window_size),
        })
    }

    /// Canonical grid frames are aligned to.
    pub fn grid(&self) -> &WavelengthGrid {
        &self.grid
    }

    /// Stability window contents.
    pub fn window(&self) -> &StabilityWindow {
        &self.window
    }

    /// Push one frame through every stage.
    pub fn process(&mut self, frame: &SpectralFrame) -> PipelineOutput {
        let aligned = match self.grid.align(
            frame.wavelengths_nm(),
            frame.intensities(),
            self.drift_tolerance_nm,
        ) {
            Ok(aligned) => aligned,
            Err(err) => return PipelineOutput::Discarded(DiscardReason::Misaligned(err)),
        };

        let smoothed = self.filter.apply(&aligned);

        let peak = match features::find_peak(self.grid.axis(), &smoothed) {
            Some(peak) if peak.intensity >= self.min_peak_intensity => peak,
            Some(peak) => {
                return PipelineOutput::Discarded(DiscardReason::NoSignal {
                    peak_intensity: peak.intensity,
                })
            }
            None => {
                return PipelineOutput::Discarded(DiscardReason::NoSignal {
                    peak_intensity: f64::NAN,
                })
            }
        };

        let feature = SpectralFeature {
            timestamp: frame.timestamp(),
            frame_index: frame.index(),
            peak_wavelength_nm: peak.wavelength_nm,
            peak_energy_ev: features::wavelength_to_energy(peak.wavelength_nm),
            peak_intensity: peak.intensity,
            fwhm_nm: peak.fwhm_nm,
            fwhm_ev: peak
                .fwhm_nm
                .map(|width| features::fwhm_wavelength_to_energy(width, peak.wavelength_nm)),
        };
        let metric = self.window.push(feature.clone());

        PipelineOutput::Updated { feature, metric }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;

    fn gaussian_frame(index: u64, axis: &[f64], center: f64, fwhm: f64) -> SpectralFrame {
        let sigma = fwhm / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt());
        let intensities = axis
            .iter()
            .map(|x| 1000.0 * (-(x - center).powi(2) / (2.0 * sigma * sigma)).exp())
            .collect();
        SpectralFrame::new(
            index,
            Utc::now(),
            RawSpectrum {
                wavelengths_nm: axis.to_vec(),
                intensities,
            },
        )
    }

    fn pipeline() -> SpectralPipeline {
        let acquisition = AcquisitionConfig {
            grid: GridConfig {
                start_nm: 400.0,
                end_nm: 800.0,
                points: 401,
            },
            ..AcquisitionConfig::default()
        };
        SpectralPipeline::new(
            &acquisition,
            &SmoothingConfig::default(),
            &StabilityConfig { window_size: 3 },
        )
        .unwrap()
    }

    #[test]
    fn test_extracts_gaussian_features() {
        let mut pipeline = pipeline();
        let axis = pipeline.grid().axis().to_vec();
        let output = pipeline.process(&gaussian_frame(0, &axis, 600.0, 40.0));
        let PipelineOutput::Updated { feature, metric } = output else {
            panic!("expected update, got {output:?}");
        };
        assert_eq!(feature.peak_wavelength_nm, 600.0);
        let fwhm = feature.fwhm_nm.unwrap();
        assert!((fwhm - 40.0).abs() < 0.5, "fwhm {fwhm}");
        let expected_ev = features::fwhm_wavelength_to_energy(fwhm, 600.0);
        assert!((feature.fwhm_ev.unwrap() - expected_ev).abs() < 1e-12);
        assert_eq!(metric.samples, 1);
    }

    #[test]
    fn test_discards_drifted_axis() {
        let mut pipeline = pipeline();
        let axis: Vec<f64> = pipeline.grid().axis().iter().map(|x| x + 10.0).collect();
        let output = pipeline.process(&gaussian_frame(0, &axis, 600.0, 40.0));
        assert!(matches!(
            output,
            PipelineOutput::Discarded(DiscardReason::Misaligned(AlignmentError::Drift { .. }))
        ));
        assert!(pipeline.window().is_empty());
    }

    #[test]
    fn test_discards_dark_frame() {
        let mut pipeline = pipeline();
        let axis = pipeline.grid().axis().to_vec();
        let frame = SpectralFrame::new(
            0,
            Utc::now(),
            RawSpectrum {
                wavelengths_nm: axis.clone(),
                intensities: vec![1.0; axis.len()],
            },
        );
        assert!(matches!(
            pipeline.process(&frame),
            PipelineOutput::Discarded(DiscardReason::NoSignal { .. })
        ));
    }

    #[test]
    fn test_same_width_is_wider_in_energy_at_shorter_wavelength() {
        let mut pipeline = pipeline();
        let axis = pipeline.grid().axis().to_vec();
        let PipelineOutput::Updated { feature: blue, .. } =
            pipeline.process(&gaussian_frame(0, &axis, 500.0, 30.0))
        else {
            panic!("expected update");
        };
        let PipelineOutput::Updated { feature: red, .. } =
            pipeline.process(&gaussian_frame(1, &axis, 700.0, 30.0))
        else {
            panic!("expected update");
        };
        assert!(blue.fwhm_ev.unwrap() > red.fwhm_ev.unwrap() * 1.9);
    }
}
