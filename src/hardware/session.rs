//! Scoped ownership of physical channels.
//!
//! A [`HardwareSession`] holds exclusive handles for every channel a run uses. It guarantees
//! that on every exit path (explicit [`HardwareSession::shutdown`], early return, `?`
//! propagation, panic unwinding) stirrers are stopped, valves are returned to their safe
//! position and every pressure channel is vented to 0 mbar before the handles are closed.
//!
//! Exclusivity is enforced by a [`ChannelRegistry`] shared by everything that may open a
//! session: a channel can be held by at most one session, and only one session may be open
//! at a time.
//!
//! The session is `Send + Sync` and is shared behind an `Arc` with the blocking tasks that
//! issue driver calls. Once shut down it refuses further commands, so a command queued
//! behind a hung call cannot re-pressurize a vented line.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, DriverError, SynthError};
use crate::hardware::{ChannelConfig, ChannelDriver, ChannelHandle, ChannelId, ChannelKind, ValvePosition};

#[derive(Default)]
struct RegistryState {
    held: HashSet<ChannelId>,
    session_open: bool,
}

/// Process-level record of which channels are held.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ChannelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while any session is open.
    pub fn session_open(&self) -> bool {
        self.state.lock().session_open
    }

    /// Returns true while `id` is held by an open session.
    pub fn is_held(&self, id: &ChannelId) -> bool {
        self.state.lock().held.contains(id)
    }

    fn claim(&self, ids: &[ChannelId]) -> AppResult<RegistryClaim> {
        let mut state = self.state.lock();

        if let Some(id) = ids.iter().find(|id| state.held.contains(*id)) {
            return Err(SynthError::DeviceUnavailable {
                channel: id.clone(),
                reason: "channel is held by another session".to_string(),
            });
        }
        if state.session_open {
            let channel = ids.first().cloned().unwrap_or_else(|| ChannelId::from(""));
            return Err(SynthError::DeviceUnavailable {
                channel,
                reason: "another hardware session is open".to_string(),
            });
        }

        state.session_open = true;
        state.held.extend(ids.iter().cloned());
        Ok(RegistryClaim {
            registry: self.clone(),
            ids: ids.to_vec(),
        })
    }
}

/// Releases claimed channels when dropped.
struct RegistryClaim {
    registry: ChannelRegistry,
    ids: Vec<ChannelId>,
}

impl Drop for RegistryClaim {
    fn drop(&mut self) {
        let mut state = self.registry.state.lock();
        for id in &self.ids {
            state.held.remove(id);
        }
        state.session_open = false;
    }
}

struct OwnedChannel {
    config: ChannelConfig,
    handle: ChannelHandle,
}

/// Exclusive, fail-safe ownership of a set of channels for one run.
pub struct HardwareSession {
    driver: Arc<dyn ChannelDriver>,
    channels: Vec<OwnedChannel>,
    setpoints: Mutex<HashMap<ChannelId, f64>>,
    valve_positions: Mutex<HashMap<ChannelId, ValvePosition>>,
    claim: Mutex<Option<RegistryClaim>>,
    released: AtomicBool,
}

impl HardwareSession {
    /// Acquire exclusive handles for `configs`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if any channel is already held, another session is open,
    /// or the driver cannot open a channel. Channels opened before the failure are vented
    /// and closed again.
    pub fn open(
        driver: Arc<dyn ChannelDriver>,
        registry: &ChannelRegistry,
        configs: &[ChannelConfig],
    ) -> AppResult<Self> {
        let ids: Vec<ChannelId> = configs.iter().map(|c| c.id.clone()).collect();
        let claim = registry.claim(&ids)?;

        let mut session = Self {
            driver,
            channels: Vec::with_capacity(configs.len()),
            setpoints: Mutex::new(HashMap::new()),
            valve_positions: Mutex::new(HashMap::new()),
            claim: Mutex::new(Some(claim)),
            released: AtomicBool::new(false),
        };

        for config in configs {
            let handle = session
                .driver
                .open_channel(&config.id, config.kind)
                .map_err(|err| SynthError::DeviceUnavailable {
                    channel: config.id.clone(),
                    reason: err.to_string(),
                })?;
            debug!(channel = %config.id, kind = %config.kind, "Channel acquired");
            session.channels.push(OwnedChannel {
                config: config.clone(),
                handle,
            });
        }

        info!(channels = session.channels.len(), "Hardware session opened");
        Ok(session)
    }

    /// Ids of every owned channel, in acquisition order.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|c| c.config.id.clone()).collect()
    }

    /// Static configuration of an owned channel.
    pub fn channel(&self, id: &ChannelId) -> Option<&ChannelConfig> {
        self.channels
            .iter()
            .find(|c| &c.config.id == id)
            .map(|c| &c.config)
    }

    /// Last pressure successfully commanded on a channel.
    pub fn pressure_setpoint(&self, id: &ChannelId) -> Option<f64> {
        self.setpoints.lock().get(id).copied()
    }

    /// Last position successfully commanded on a valve.
    pub fn valve_position(&self, id: &ChannelId) -> Option<ValvePosition> {
        self.valve_positions.lock().get(id).copied()
    }

    /// Returns true once the session has been shut down or dropped.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, id: &ChannelId) -> AppResult<()> {
        if self.is_released() {
            return Err(SynthError::DeviceUnavailable {
                channel: id.clone(),
                reason: "hardware session has been shut down".to_string(),
            });
        }
        Ok(())
    }

    fn owned(&self, id: &ChannelId, kind: ChannelKind) -> AppResult<&OwnedChannel> {
        let channel = self
            .channels
            .iter()
            .find(|c| &c.config.id == id)
            .ok_or_else(|| SynthError::DeviceUnavailable {
                channel: id.clone(),
                reason: "channel is not held by this session".to_string(),
            })?;
        if channel.config.kind != kind {
            return Err(SynthError::DeviceFault {
                channel: id.clone(),
                source: DriverError::Other(format!(
                    "{} channel addressed as {}",
                    channel.config.kind, kind
                )),
            });
        }
        Ok(channel)
    }

    /// Set the pressure of an owned pressure channel.
    ///
    /// Setpoints above the channel's configured ceiling are refused as an overpressure
    /// fault without reaching the driver. Driver failures are surfaced as `DeviceFault`.
    pub fn set_pressure(&self, id: &ChannelId, mbar: f64) -> AppResult<()> {
        self.ensure_open(id)?;
        self.drive_pressure(id, mbar)
    }

    /// Move an owned valve.
    pub fn set_valve(&self, id: &ChannelId, position: ValvePosition) -> AppResult<()> {
        self.ensure_open(id)?;
        self.drive_valve(id, position)
    }

    /// Set the speed of an owned stirrer (0 stops it).
    pub fn set_stirrer(&self, id: &ChannelId, rpm: u32) -> AppResult<()> {
        self.ensure_open(id)?;
        self.drive_stirrer(id, rpm)
    }

    fn drive_pressure(&self, id: &ChannelId, mbar: f64) -> AppResult<()> {
        let channel = self.owned(id, ChannelKind::Pressure)?;

        if let Some(limit) = channel.config.max_pressure_mbar {
            if mbar > limit {
                return Err(SynthError::DeviceFault {
                    channel: id.clone(),
                    source: DriverError::Overpressure {
                        requested_mbar: mbar,
                        limit_mbar: limit,
                    },
                });
            }
        }

        self.driver
            .set_pressure(channel.handle, mbar)
            .map_err(|source| SynthError::DeviceFault {
                channel: id.clone(),
                source,
            })?;
        self.setpoints.lock().insert(id.clone(), mbar);
        debug!(channel = %id, mbar, "Pressure set");
        Ok(())
    }

    fn drive_valve(&self, id: &ChannelId, position: ValvePosition) -> AppResult<()> {
        let channel = self.owned(id, ChannelKind::Valve)?;
        self.driver
            .set_valve(channel.handle, position)
            .map_err(|source| SynthError::DeviceFault {
                channel: id.clone(),
                source,
            })?;
        self.valve_positions.lock().insert(id.clone(), position);
        debug!(channel = %id, ?position, "Valve set");
        Ok(())
    }

    fn drive_stirrer(&self, id: &ChannelId, rpm: u32) -> AppResult<()> {
        let channel = self.owned(id, ChannelKind::Stirrer)?;
        self.driver
            .set_stirrer(channel.handle, rpm)
            .map_err(|source| SynthError::DeviceFault {
                channel: id.clone(),
                source,
            })?;
        debug!(channel = %id, rpm, "Stirrer set");
        Ok(())
    }

    /// Vent, return valves to safe positions, and release every handle.
    ///
    /// Every teardown call is attempted even if earlier ones fail. Calling it again is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownFailed` with every failing call if any part of the safe-state
    /// sequence could not be confirmed. Handles are released regardless.
    pub fn shutdown(&self) -> AppResult<()> {
        let errors = self.release();
        if errors.is_empty() {
            info!("Hardware session vented and released");
            Ok(())
        } else {
            Err(SynthError::ShutdownFailed(errors))
        }
    }

    fn release(&self) -> Vec<SynthError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let mut errors = Vec::new();

        for channel in self.channels.iter().filter(|c| c.config.kind == ChannelKind::Stirrer) {
            if let Err(err) = self.drive_stirrer(&channel.config.id, 0) {
                error!(channel = %channel.config.id, error = %err, "Failed to stop stirrer");
                errors.push(err);
            }
        }

        for channel in self.channels.iter().filter(|c| c.config.kind == ChannelKind::Valve) {
            if let Err(err) = self.drive_valve(&channel.config.id, channel.config.safe_position) {
                error!(channel = %channel.config.id, error = %err, "Failed to return valve to safe position");
                errors.push(err);
            }
        }

        for channel in self.channels.iter().filter(|c| c.config.kind == ChannelKind::Pressure) {
            if let Err(err) = self.drive_pressure(&channel.config.id, 0.0) {
                error!(channel = %channel.config.id, error = %err, "Failed to vent pressure channel");
                errors.push(err);
            }
        }

        for channel in &self.channels {
            self.driver.close_channel(channel.handle);
        }
        self.claim.lock().take();
        errors
    }
}

impl Drop for HardwareSession {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }
        warn!("Hardware session dropped without shutdown, venting now");
        for err in self.release() {
            error!(error = %err, "Teardown step failed during drop");
        }
    }
}
