//! Controller state machine.
//!
//! ```text
//! Idle ──► Executing(0) ──► Executing(i+1) ──► ... ──► Stabilized ──► Vented
//!               │   │                                    ▲    │
//!               │   └──► Monitoring ─────────────────────┘    └──► Failed
//!               │            │
//!               └────────────┴──► Aborting ──► Vented | Failed
//! ```
//!
//! `Stabilized` may also continue into a later `Executing(j)` when a monitor step is
//! followed by further steps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::hardware::ChannelId;

/// State of the current run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum ControllerState {
    /// No run started.
    Idle,
    /// Running the step at this index.
    Executing(usize),
    /// Evaluating stability metrics.
    Monitoring,
    /// Monitoring converged.
    Stabilized,
    /// Stopping and heading for teardown.
    Aborting,
    /// Hardware vented and released. Terminal.
    Vented,
    /// Venting failed. Terminal, needs an operator.
    Failed,
}

impl ControllerState {
    /// `Vented` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Vented | ControllerState::Failed)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: ControllerState) -> bool {
        use ControllerState::*;
        match (*self, next) {
            (Idle, Executing(0)) => true,
            (Executing(i), Executing(j)) => j == i + 1,
            (Executing(_), Monitoring | Stabilized | Aborting) => true,
            (Monitoring, Stabilized | Aborting) => true,
            (Stabilized, Executing(_) | Vented | Failed) => true,
            (Aborting, Vented | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => f.write_str("idle"),
            ControllerState::Executing(i) => write!(f, "executing({i})"),
            ControllerState::Monitoring => f.write_str("monitoring"),
            ControllerState::Stabilized => f.write_str("stabilized"),
            ControllerState::Aborting => f.write_str("aborting"),
            ControllerState::Vented => f.write_str("vented"),
            ControllerState::Failed => f.write_str("failed"),
        }
    }
}

/// Why a run ended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum RunCause {
    /// Every step completed and monitoring converged.
    Stabilized,
    /// A monitor step reached its cap without converging.
    MonitorTimeout {
        /// Index of the monitor step.
        step: usize,
    },
    /// A physical step exceeded its declared maximum execution time.
    StepTimeout {
        /// Index of the step.
        step: usize,
    },
    /// The plan's `max_total_duration` elapsed.
    PlanTimeout,
    /// Stopped by the operator.
    OperatorAbort,
    /// A device call failed.
    DeviceFault {
        /// Channel that failed.
        channel: ChannelId,
        /// Driver-reported cause.
        detail: String,
    },
    /// The spectrometer stopped answering while monitoring.
    AcquisitionTimeout {
        /// Index of the monitor step.
        step: usize,
    },
    /// The spectrometer reported an error.
    SpectrometerFault {
        /// Driver-reported cause.
        detail: String,
    },
    /// Unexpected controller error.
    Internal {
        /// Error message.
        detail: String,
    },
}

impl RunCause {
    /// Faults, as opposed to policy outcomes (timeouts, operator abort).
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            RunCause::DeviceFault { .. }
                | RunCause::AcquisitionTimeout { .. }
                | RunCause::SpectrometerFault { .. }
                | RunCause::Internal { .. }
        )
    }
}

impl fmt::Display for RunCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunCause::Stabilized => f.write_str("stabilized"),
            RunCause::MonitorTimeout { step } => write!(f, "monitor step {step} timed out"),
            RunCause::StepTimeout { step } => write!(f, "step {step} timed out"),
            RunCause::PlanTimeout => f.write_str("plan exceeded its total duration"),
            RunCause::OperatorAbort => f.write_str("aborted by operator"),
            RunCause::DeviceFault { channel, detail } => {
                write!(f, "device fault on '{channel}': {detail}")
            }
            RunCause::AcquisitionTimeout { step } => {
                write!(f, "spectral acquisition timed out during step {step}")
            }
            RunCause::SpectrometerFault { detail } => write!(f, "spectrometer fault: {detail}"),
            RunCause::Internal { detail } => write!(f, "internal error: {detail}"),
        }
    }
}

/// One recorded state change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// State left.
    pub from: ControllerState,
    /// State entered.
    pub to: ControllerState,
    /// Wall-clock time of the change.
    pub time: DateTime<Utc>,
}

/// Current state plus the ordered history of transitions for one run.
#[derive(Debug)]
pub struct RunState {
    current: ControllerState,
    history: Vec<Transition>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    /// Start in `Idle` with no history.
    pub fn new() -> Self {
        Self {
            current: ControllerState::Idle,
            history: Vec::new(),
        }
    }

    /// State the run is in.
    pub fn current(&self) -> ControllerState {
        self.current
    }

    /// Every accepted transition, oldest first.
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Apply a transition. Illegal transitions are rejected and leave the state unchanged.
    pub fn transition(&mut self, to: ControllerState) -> Result<Transition, ControllerState> {
        if !self.current.can_transition_to(to) {
            return Err(self.current);
        }
        let transition = Transition {
            from: self.current,
            to,
            time: Utc::now(),
        };
        info!(from = %transition.from, to = %transition.to, "Controller transition");
        self.current = to;
        self.history.push(transition.clone());
        Ok(transition)
    }

    /// Number of transitions into `state`.
    pub fn count(&self, state: ControllerState) -> usize {
        self.history.iter().filter(|t| t.to == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ControllerState::*;

    #[test]
    fn test_legal_paths() {
        let mut run = RunState::new();
        for next in [Executing(0), Executing(1), Monitoring, Stabilized, Vented] {
            run.transition(next).unwrap();
        }
        assert!(run.current().is_terminal());
        assert_eq!(run.count(Vented), 1);
    }

    #[test]
    fn test_stabilized_can_resume_execution() {
        assert!(Stabilized.can_transition_to(Executing(3)));
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut run = RunState::new();
        assert_eq!(run.transition(Monitoring), Err(Idle));
        run.transition(Executing(0)).unwrap();
        assert!(run.transition(Executing(2)).is_err());
        assert!(run.transition(Vented).is_err());
        run.transition(Aborting).unwrap();
        run.transition(Failed).unwrap();
        // Terminal states have no successors.
        assert!(run.transition(Vented).is_err());
        assert_eq!(run.history().len(), 3);
    }

    #[test]
    fn test_cause_classification() {
        assert!(!RunCause::MonitorTimeout { step: 1 }.is_fault());
        assert!(!RunCause::OperatorAbort.is_fault());
        assert!(RunCause::AcquisitionTimeout { step: 1 }.is_fault());
        assert!(RunCause::DeviceFault {
            channel: "p1".into(),
            detail: "comm timeout".into()
        }
        .is_fault());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&Executing(2)).unwrap();
        assert_eq!(json, r#"{"state":"executing","step":2}"#);
        let back: ControllerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Executing(2));
        assert_eq!(serde_json::to_string(&Vented).unwrap(), r#"{"state":"vented"}"#);
    }
}
