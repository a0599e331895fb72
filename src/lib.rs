//! Core library for the rust_synth closed-loop synthesis controller.
//!
//! The controller drives microfluidic pressure, valve and stirrer channels through a
//! reaction plan while a spectrometer is read in real time, and decides without operator
//! input when the reaction has stabilized or must be aborted. Whatever the outcome, every
//! pressurized channel is vented before a run is reported complete.
//!
//! - [`controller`]: the run state machine.
//! - [`hardware`]: collaborator interfaces and the fail-safe [`hardware::HardwareSession`].
//! - [`spectral`]: capture, alignment, smoothing, feature extraction and stability metrics.
//! - [`flow`]: translation of plan steps into device calls.
//! - [`plan`], [`config`], [`record`], [`logging`], [`error`]: the surrounding plumbing.

pub mod config;
pub mod controller;
pub mod error;
pub mod flow;
pub mod hardware;
pub mod logging;
pub mod plan;
pub mod record;
pub mod spectral;
