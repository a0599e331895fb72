//! Hardware collaborator interface and channel vocabulary.
//!
//! The vendor bindings (pressure controller, valve multiplexer, stirrer, spectrometer) live
//! outside this crate. The controller only sees the capability traits defined here:
//!
//! - [`ChannelDriver`]: synchronous actuation of pressure, valve and stirrer channels.
//!   Physical actuation must complete before the next command is safe, so every call blocks
//!   until the device acknowledges it.
//! - [`Spectrometer`]: asynchronous spectrum readout, polled by the acquisition worker.
//!
//! Exclusive ownership and fail-safe teardown are provided by [`session::HardwareSession`].

pub mod mock;
pub mod session;

pub use session::{ChannelRegistry, HardwareSession};

use crate::error::{AppResult, DriverError, SynthError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifier of one physical channel (e.g. "p1", "v_ag", "stirrer").
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wrap a channel name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of physical channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Pressure controller output.
    Pressure,
    /// Switching or distribution valve.
    Valve,
    /// Magnetic stirrer.
    Stirrer,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Pressure => f.write_str("pressure"),
            ChannelKind::Valve => f.write_str("valve"),
            ChannelKind::Stirrer => f.write_str("stirrer"),
        }
    }
}

/// Commanded valve position.
///
/// `Port` addresses one outlet of a distribution valve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValvePosition {
    /// No flow.
    #[default]
    Closed,
    /// Flow through the line.
    Open,
    /// Outlet `n` of a distribution valve.
    Port(u8),
}

/// Opaque handle returned by the driver when a channel is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u32);

/// Linear flow calibration of one valve line at its driving pressure.
///
/// Volume delivered is modelled as `rate * t + dead_volume_ul`, where the rate scales
/// with the source pressure by `ul_per_s_per_mbar`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowCalibration {
    /// Flow rate gained per mbar of source pressure.
    pub ul_per_s_per_mbar: f64,
    /// Volume already in the line when the valve opens.
    #[serde(default)]
    pub dead_volume_ul: f64,
}

/// Static description of one channel, loaded from configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Unique channel id.
    pub id: ChannelId,
    /// What the channel drives.
    pub kind: ChannelKind,
    /// Position a valve is returned to during teardown.
    #[serde(default)]
    pub safe_position: ValvePosition,
    /// Setpoint ceiling for pressure channels.
    #[serde(default)]
    pub max_pressure_mbar: Option<f64>,
    /// Pressure channel that drives a valve line.
    #[serde(default)]
    pub pressure_source: Option<ChannelId>,
    /// Flow calibration of a valve line.
    #[serde(default)]
    pub calibration: Option<FlowCalibration>,
}

impl ChannelConfig {
    /// A pressure channel with no ceiling.
    pub fn pressure(id: &str) -> Self {
        Self {
            id: ChannelId::from(id),
            kind: ChannelKind::Pressure,
            safe_position: ValvePosition::Closed,
            max_pressure_mbar: None,
            pressure_source: None,
            calibration: None,
        }
    }

    /// A valve closed at rest, driven by `pressure_source`.
    pub fn valve(id: &str, pressure_source: &str) -> Self {
        Self {
            id: ChannelId::from(id),
            kind: ChannelKind::Valve,
            safe_position: ValvePosition::Closed,
            max_pressure_mbar: None,
            pressure_source: Some(ChannelId::from(pressure_source)),
            calibration: None,
        }
    }

    /// A stirrer channel.
    pub fn stirrer(id: &str) -> Self {
        Self {
            id: ChannelId::from(id),
            kind: ChannelKind::Stirrer,
            safe_position: ValvePosition::Closed,
            max_pressure_mbar: None,
            pressure_source: None,
            calibration: None,
        }
    }

    /// Set the setpoint ceiling.
    pub fn with_max_pressure(mut self, mbar: f64) -> Self {
        self.max_pressure_mbar = Some(mbar);
        self
    }

    /// Attach a flow calibration.
    pub fn with_calibration(mut self, calibration: FlowCalibration) -> Self {
        self.calibration = Some(calibration);
        self
    }
}

/// Configured channels indexed by id.
#[derive(Clone, Debug, Default)]
pub struct ChannelTable {
    channels: HashMap<ChannelId, ChannelConfig>,
}

impl ChannelTable {
    /// Index `configs` by id. Later duplicates win.
    pub fn from_configs(configs: &[ChannelConfig]) -> Self {
        Self {
            channels: configs
                .iter()
                .map(|config| (config.id.clone(), config.clone()))
                .collect(),
        }
    }

    /// Configuration of a channel, if known.
    pub fn get(&self, id: &ChannelId) -> Option<&ChannelConfig> {
        self.channels.get(id)
    }

    /// Look up a channel a plan step refers to.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPlan` if the channel is not configured or is of another kind.
    pub fn require(&self, id: &ChannelId, kind: ChannelKind) -> AppResult<&ChannelConfig> {
        let config = self
            .get(id)
            .ok_or_else(|| SynthError::InvalidPlan(format!("unknown channel '{id}'")))?;
        if config.kind != kind {
            return Err(SynthError::InvalidPlan(format!(
                "channel '{id}' is a {} channel, expected {kind}",
                config.kind
            )));
        }
        Ok(config)
    }

    /// Number of configured channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channel is configured.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// One raw readout from the spectrometer.
#[derive(Clone, Debug, PartialEq)]
pub struct RawSpectrum {
    /// Wavelength axis as reported by the device.
    pub wavelengths_nm: Vec<f64>,
    /// Counts, one per axis point.
    pub intensities: Vec<f64>,
}

/// Capability for pressure, valve and stirrer channels.
///
/// All calls are blocking: they return once the device has acknowledged the command.
/// Implementations must be safe to call from teardown paths (including `Drop`).
pub trait ChannelDriver: Send + Sync {
    /// Acquire a handle for `id`.
    fn open_channel(&self, id: &ChannelId, kind: ChannelKind) -> Result<ChannelHandle, DriverError>;
    /// Command a pressure setpoint.
    fn set_pressure(&self, handle: ChannelHandle, mbar: f64) -> Result<(), DriverError>;
    /// Move a valve.
    fn set_valve(&self, handle: ChannelHandle, position: ValvePosition) -> Result<(), DriverError>;
    /// Set stirrer speed.
    fn set_stirrer(&self, handle: ChannelHandle, rpm: u32) -> Result<(), DriverError>;
    /// Release a handle. Never fails.
    fn close_channel(&self, handle: ChannelHandle);
}

/// Capability for spectrometers.
#[async_trait]
pub trait Spectrometer: Send + Sync {
    /// Read one spectrum.
    async fn read_spectrum(&self) -> Result<RawSpectrum, DriverError>;
}
