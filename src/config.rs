//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (default `config/synth.toml`)
//! 2. Environment variables prefixed with `RUST_SYNTH_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! RUST_SYNTH_APPLICATION__LOG_LEVEL=debug
//! RUST_SYNTH_SMOOTHING__WINDOW_LENGTH=15
//! RUST_SYNTH_ACQUISITION__CAPTURE_TIMEOUT=10s
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_synth::config::Settings;
//!
//! let settings = Settings::load_from("config/synth.toml")?;
//! println!("Channels: {}", settings.channels.len());
//! # Ok::<(), rust_synth::error::SynthError>(())
//! ```
//!
//! The stability debounce count and the monitor cap are not configured here. They are
//! required inputs of every reaction plan.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, SynthError};
use crate::hardware::{ChannelConfig, ChannelKind};
use crate::spectral::savgol::SavitzkyGolay;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Logging and output locations.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Spectrometer capture settings.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Savitzky-Golay parameters.
    #[serde(default)]
    pub smoothing: SmoothingConfig,
    /// Stability window settings.
    #[serde(default)]
    pub stability: StabilityConfig,
    /// Flow engine settings.
    #[serde(default)]
    pub flow: FlowConfig,
    /// Physical channels available to reaction plans
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output
    #[serde(default)]
    pub json_logs: bool,
    /// Directory receiving run records
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Canonical wavelength grid every frame is interpolated onto
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// First grid wavelength.
    pub start_nm: f64,
    /// Last grid wavelength.
    pub end_nm: f64,
    /// Number of grid points.
    pub points: usize,
}

/// Spectrometer acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Maximum wait for one spectrometer readout
    #[serde(with = "humantime_serde", default = "default_capture_timeout")]
    pub capture_timeout: Duration,
    /// Interval between capture starts
    #[serde(with = "humantime_serde", default = "default_cadence")]
    pub cadence: Duration,
    /// Depth of the queue between acquisition and controller (oldest dropped on overflow)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Canonical wavelength grid.
    #[serde(default = "default_grid")]
    pub grid: GridConfig,
    /// Largest tolerated shift of the reported axis endpoints
    #[serde(default = "default_drift_tolerance")]
    pub axis_drift_tolerance_nm: f64,
    /// Frames whose smoothed maximum is below this are discarded as no-signal
    #[serde(default = "default_min_peak_intensity")]
    pub min_peak_intensity: f64,
}

/// Savitzky-Golay filter parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothingConfig {
    /// Samples per fit, odd and at least polyorder + 2
    #[serde(default = "default_window_length")]
    pub window_length: usize,
    /// Degree of the fitted polynomial
    #[serde(default = "default_polyorder")]
    pub polyorder: usize,
}

/// Sliding stability window settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Features retained by the sliding stability window
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

/// Flow control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Drive pressure for valve lines without a calibration
    #[serde(default = "default_drive_mbar")]
    pub default_drive_mbar: f64,
    /// Wait after commanding a non-zero pressure
    #[serde(with = "humantime_serde", default = "default_pressure_settle")]
    pub pressure_settle: Duration,
    /// Wait after moving a valve
    #[serde(with = "humantime_serde", default = "default_valve_settle")]
    pub valve_settle: Duration,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "rust_synth".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/runs")
}

fn default_capture_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_cadence() -> Duration {
    Duration::from_secs(1)
}

fn default_queue_depth() -> usize {
    4
}

fn default_grid() -> GridConfig {
    GridConfig {
        start_nm: 400.0,
        end_nm: 1100.0,
        points: 701,
    }
}

fn default_drift_tolerance() -> f64 {
    2.0
}

fn default_min_peak_intensity() -> f64 {
    50.0
}

fn default_window_length() -> usize {
    11
}

fn default_polyorder() -> usize {
    2
}

fn default_window_size() -> usize {
    5
}

fn default_drive_mbar() -> f64 {
    1000.0
}

fn default_pressure_settle() -> Duration {
    Duration::from_secs(5)
}

fn default_valve_settle() -> Duration {
    Duration::from_millis(50)
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            json_logs: false,
            data_dir: default_data_dir(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            capture_timeout: default_capture_timeout(),
            cadence: default_cadence(),
            queue_depth: default_queue_depth(),
            grid: default_grid(),
            axis_drift_tolerance_nm: default_drift_tolerance(),
            min_peak_intensity: default_min_peak_intensity(),
        }
    }
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            window_length: default_window_length(),
            polyorder: default_polyorder(),
        }
    }
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            default_drive_mbar: default_drive_mbar(),
            pressure_settle: default_pressure_settle(),
            valve_settle: default_valve_settle(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/synth.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/synth.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables (`RUST_SYNTH_` prefix) take precedence over the file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be parsed, `InvalidSmoothingConfig` or
    /// `Configuration` if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_SYNTH_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - Smoothing parameters form a valid Savitzky-Golay filter
    /// - Grid, queue depth and stability window are usable
    /// - Channel IDs are unique and valve `pressure_source` references resolve
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SynthError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        SavitzkyGolay::new(self.smoothing.window_length, self.smoothing.polyorder)?;

        let grid = &self.acquisition.grid;
        if grid.points < 3 || !(grid.end_nm > grid.start_nm) || grid.start_nm <= 0.0 {
            return Err(SynthError::Configuration(format!(
                "Invalid wavelength grid {:.1}..{:.1} nm with {} points",
                grid.start_nm, grid.end_nm, grid.points
            )));
        }
        if self.acquisition.queue_depth == 0 {
            return Err(SynthError::Configuration(
                "acquisition.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.acquisition.capture_timeout.is_zero() || self.acquisition.cadence.is_zero() {
            return Err(SynthError::Configuration(
                "acquisition.capture_timeout and acquisition.cadence must be non-zero".to_string(),
            ));
        }
        if self.stability.window_size < 2 {
            return Err(SynthError::Configuration(format!(
                "stability.window_size must be at least 2, got {}",
                self.stability.window_size
            )));
        }

        let drive = self.flow.default_drive_mbar;
        if !drive.is_finite() || drive <= 0.0 {
            return Err(SynthError::Configuration(format!(
                "flow.default_drive_mbar must be a positive pressure, got {drive}"
            )));
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(&channel.id) {
                return Err(SynthError::Configuration(format!(
                    "Duplicate channel ID: '{}'",
                    channel.id
                )));
            }
        }

        for channel in self.channels.iter().filter(|c| c.kind == ChannelKind::Pressure) {
            if let Some(limit) = channel.max_pressure_mbar {
                if !limit.is_finite() || limit <= 0.0 {
                    return Err(SynthError::Configuration(format!(
                        "Pressure channel '{}' max_pressure_mbar must be positive, got {limit}",
                        channel.id
                    )));
                }
            }
        }

        for channel in self.channels.iter().filter(|c| c.kind == ChannelKind::Valve) {
            if let Some(source) = &channel.pressure_source {
                let resolved = self
                    .channels
                    .iter()
                    .any(|c| &c.id == source && c.kind == ChannelKind::Pressure);
                if !resolved {
                    return Err(SynthError::Configuration(format!(
                        "Valve '{}' references unknown pressure channel '{}'",
                        channel.id, source
                    )));
                }
            }
            if let Some(calibration) = &channel.calibration {
                let slope = calibration.ul_per_s_per_mbar;
                let dead = calibration.dead_volume_ul;
                if !slope.is_finite() || slope <= 0.0 || !dead.is_finite() || dead < 0.0 {
                    return Err(SynthError::Configuration(format!(
                        "Valve '{}' calibration needs a positive ul_per_s_per_mbar and a non-negative dead_volume_ul",
                        channel.id
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
log_level = "debug"
data_dir = "/tmp/runs"

[acquisition]
capture_timeout = "3s"
cadence = "500ms"

[smoothing]
window_length = 15
polyorder = 3

[[channels]]
id = "p1"
kind = "pressure"
max_pressure_mbar = 2000.0

[[channels]]
id = "v_ag"
kind = "valve"
pressure_source = "p1"
calibration = { ul_per_s_per_mbar = 0.04, dead_volume_ul = 5.0 }
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.acquisition.capture_timeout, Duration::from_secs(3));
        assert_eq!(settings.acquisition.cadence, Duration::from_millis(500));
        assert_eq!(settings.acquisition.queue_depth, 4);
        assert_eq!(settings.smoothing.window_length, 15);
        assert_eq!(settings.stability.window_size, 5);
        assert_eq!(settings.channels.len(), 2);
        assert_eq!(
            settings.channels[1].calibration.map(|c| c.dead_volume_ul),
            Some(5.0)
        );
    }

    #[test]
    fn test_defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_even_window_is_invalid_smoothing() {
        let mut settings = Settings::default();
        settings.smoothing.window_length = 10;
        assert!(matches!(
            settings.validate(),
            Err(SynthError::InvalidSmoothingConfig { .. })
        ));
    }

    #[test]
    fn test_dangling_pressure_source() {
        let mut settings = Settings::default();
        settings.channels = vec![ChannelConfig::valve("v1", "p9")];
        assert!(matches!(
            settings.validate(),
            Err(SynthError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_channel_ids() {
        let mut settings = Settings::default();
        settings.channels = vec![ChannelConfig::pressure("p1"), ChannelConfig::pressure("p1")];
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate channel ID"));
    }

    #[test]
    fn test_pressure_limits_must_be_positive() {
        for limit in [0.0, -5.0, f64::INFINITY, f64::NAN] {
            let mut settings = Settings::default();
            settings.channels = vec![
                ChannelConfig::pressure("p1").with_max_pressure(limit),
                ChannelConfig::valve("v1", "p1"),
            ];
            assert!(
                matches!(settings.validate(), Err(SynthError::Configuration(_))),
                "limit {limit}"
            );
        }

        let mut settings = Settings::default();
        settings.flow.default_drive_mbar = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(SynthError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }
}
