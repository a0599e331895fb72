//! Flow control engine.
//!
//! Translates one [`ReactionStep`] into the ordered device calls that realise it and issues
//! them against a borrowed [`HardwareSession`]. The engine holds no state between steps and
//! never retries: the first failed call ends the step with the session's error unchanged.
//!
//! An inject, for example, becomes:
//!
//! ```text
//! set_pressure(source, setpoint) → settle → open valve → hold(volume / rate)
//!     → close valve → settle → set_pressure(source, 0)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::FlowConfig;
use crate::controller::AbortSignal;
use crate::error::{AppResult, SynthError};
use crate::hardware::{ChannelId, ChannelKind, ChannelTable, HardwareSession, ValvePosition};
use crate::plan::ReactionStep;

/// One primitive action.
#[derive(Clone, Debug, PartialEq)]
pub enum FlowCommand {
    /// Set a pressure channel.
    SetPressure {
        /// Pressure channel.
        channel: ChannelId,
        /// Setpoint.
        mbar: f64,
    },
    /// Move a valve.
    SetValve {
        /// Valve channel.
        channel: ChannelId,
        /// Target position.
        position: ValvePosition,
    },
    /// Set stirrer speed.
    SetStirrer {
        /// Stirrer channel.
        channel: ChannelId,
        /// Target speed, 0 stops.
        rpm: u32,
    },
    /// Wait without touching hardware.
    Hold(Duration),
}

/// How a command sequence ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Every command was issued.
    Completed,
    /// An abort request stopped the sequence.
    Aborted,
}

/// Stateless step translator.
#[derive(Clone, Debug)]
pub struct FlowEngine {
    config: FlowConfig,
}

impl FlowEngine {
    /// Engine using `config` for drive pressure and settle times.
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }

    /// Device calls realising `step`. Monitor steps need none.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPlan` if a referenced channel is missing, of the wrong kind, or the
    /// requested pressure exceeds the channel's limit.
    pub fn commands_for(
        &self,
        step: &ReactionStep,
        channels: &ChannelTable,
    ) -> AppResult<Vec<FlowCommand>> {
        let mut commands = Vec::new();
        match step {
            ReactionStep::Inject {
                channel,
                volume_ul,
                rate_ul_per_s,
                ..
            } => {
                let valve = channels.require(channel, ChannelKind::Valve)?;
                let source_id = valve.pressure_source.as_ref().ok_or_else(|| {
                    SynthError::InvalidPlan(format!("valve '{channel}' has no pressure_source"))
                })?;
                let source = channels.require(source_id, ChannelKind::Pressure)?;

                let (mut setpoint, mut rate, dead_volume) = match valve.calibration {
                    Some(calibration) => (
                        rate_ul_per_s / calibration.ul_per_s_per_mbar,
                        *rate_ul_per_s,
                        calibration.dead_volume_ul,
                    ),
                    None => (self.config.default_drive_mbar, *rate_ul_per_s, 0.0),
                };
                if let Some(limit) = source.max_pressure_mbar {
                    if setpoint > limit {
                        warn!(
                            channel = %source_id,
                            requested_mbar = setpoint,
                            limit_mbar = limit,
                            "Inject setpoint clamped to channel limit"
                        );
                        if let Some(calibration) = valve.calibration {
                            rate = limit * calibration.ul_per_s_per_mbar;
                        }
                        setpoint = limit;
                    }
                }
                let seconds = (volume_ul - dead_volume).max(0.0) / rate;
                let hold = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    SynthError::InvalidPlan(format!(
                        "inject on '{channel}' needs a hold of {seconds} s at {rate} µl/s"
                    ))
                })?;

                commands.push(FlowCommand::SetPressure {
                    channel: source_id.clone(),
                    mbar: setpoint,
                });
                self.push_hold(&mut commands, self.config.pressure_settle);
                commands.push(FlowCommand::SetValve {
                    channel: channel.clone(),
                    position: ValvePosition::Open,
                });
                commands.push(FlowCommand::Hold(hold));
                commands.push(FlowCommand::SetValve {
                    channel: channel.clone(),
                    position: ValvePosition::Closed,
                });
                self.push_hold(&mut commands, self.config.valve_settle);
                commands.push(FlowCommand::SetPressure {
                    channel: source_id.clone(),
                    mbar: 0.0,
                });
            }
            ReactionStep::SetPressure { channel, mbar, .. } => {
                let config = channels.require(channel, ChannelKind::Pressure)?;
                if let Some(limit) = config.max_pressure_mbar {
                    if *mbar > limit {
                        return Err(SynthError::InvalidPlan(format!(
                            "{mbar} mbar exceeds the {limit} mbar limit of '{channel}'"
                        )));
                    }
                }
                commands.push(FlowCommand::SetPressure {
                    channel: channel.clone(),
                    mbar: *mbar,
                });
                if *mbar > 0.0 {
                    self.push_hold(&mut commands, self.config.pressure_settle);
                }
            }
            ReactionStep::Mix {
                channel,
                rpm,
                duration,
                ..
            } => {
                channels.require(channel, ChannelKind::Stirrer)?;
                commands.push(FlowCommand::SetStirrer {
                    channel: channel.clone(),
                    rpm: *rpm,
                });
                commands.push(FlowCommand::Hold(*duration));
                commands.push(FlowCommand::SetStirrer {
                    channel: channel.clone(),
                    rpm: 0,
                });
            }
            ReactionStep::Wait { duration, .. } => commands.push(FlowCommand::Hold(*duration)),
            ReactionStep::Monitor { .. } => {}
        }
        Ok(commands)
    }

    fn push_hold(&self, commands: &mut Vec<FlowCommand>, duration: Duration) {
        if !duration.is_zero() {
            commands.push(FlowCommand::Hold(duration));
        }
    }

    /// Issue `commands` in order.
    ///
    /// Device calls block until the hardware acknowledges them, so each one runs on the
    /// blocking pool and the step's timer and abort signal stay live while it is in flight.
    /// The abort signal is checked before every device call and interrupts holds.
    ///
    /// # Errors
    ///
    /// The first failing device call's error, unchanged.
    pub async fn execute(
        &self,
        commands: &[FlowCommand],
        session: &Arc<HardwareSession>,
        abort: &AbortSignal,
    ) -> AppResult<StepOutcome> {
        for command in commands {
            if abort.is_aborted() {
                info!("Abort observed before device call");
                return Ok(StepOutcome::Aborted);
            }
            debug!(?command, "Issuing flow command");

            if let FlowCommand::Hold(duration) = command {
                tokio::select! {
                    _ = tokio::time::sleep(*duration) => {}
                    _ = abort.wait() => {
                        info!("Abort observed during hold");
                        return Ok(StepOutcome::Aborted);
                    }
                }
                continue;
            }

            let call = tokio::task::spawn_blocking({
                let session = Arc::clone(session);
                let command = command.clone();
                move || issue(&session, &command)
            });
            tokio::select! {
                joined = call => joined??,
                _ = abort.wait() => {
                    warn!(?command, "Abort observed while a device call was in flight");
                    return Ok(StepOutcome::Aborted);
                }
            }
        }
        Ok(StepOutcome::Completed)
    }
}

/// Issue one device command. Runs on the blocking pool.
fn issue(session: &HardwareSession, command: &FlowCommand) -> AppResult<()> {
    match command {
        FlowCommand::SetPressure { channel, mbar } => session.set_pressure(channel, *mbar),
        FlowCommand::SetValve { channel, position } => session.set_valve(channel, *position),
        FlowCommand::SetStirrer { channel, rpm } => session.set_stirrer(channel, *rpm),
        FlowCommand::Hold(_) => Ok(()),
    }
}
