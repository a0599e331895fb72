//! Reaction plans.
//!
//! A plan is an ordered list of physical steps plus the stability thresholds that end the
//! run. Plans are loaded from TOML:
//!
//! ```toml
//! id = "ag-seed-01"
//! name = "Silver seed growth"
//!
//! [thresholds]
//! max_peak_shift_nm = 0.5
//! max_fwhm_change_mev = 2.0
//! consecutive_updates = 3
//! max_total_duration = "30m"
//!
//! [[steps]]
//! kind = "inject"
//! channel = "v_ag"
//! volume_ul = 50.0
//! rate_ul_per_s = 10.0
//! timeout = "30s"
//!
//! [[steps]]
//! kind = "monitor"
//! timeout = "120s"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, SynthError};
use crate::hardware::ChannelId;

/// Condition under which spectral monitoring declares the reaction stable.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StabilityCondition {
    /// Tolerance on |Δ peak position| across the stability window.
    pub max_peak_shift_nm: f64,
    /// Tolerance on |Δ FWHM| across the stability window.
    pub max_fwhm_change_mev: f64,
    /// Number of consecutive satisfying updates required.
    pub consecutive_updates: u32,
}

/// Plan-wide termination thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanThresholds {
    /// Default stability condition for monitor steps.
    #[serde(flatten)]
    pub stability: StabilityCondition,
    /// Wall-clock budget for the whole plan.
    #[serde(with = "humantime_serde")]
    pub max_total_duration: Duration,
}

/// One physical or observational step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReactionStep {
    /// Push `volume_ul` through a valve line at `rate_ul_per_s`.
    Inject {
        /// Valve line to inject through.
        channel: ChannelId,
        /// Volume to deliver.
        volume_ul: f64,
        /// Requested flow rate.
        rate_ul_per_s: f64,
        /// Maximum execution time.
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    /// Hold a pressure channel at `mbar`.
    SetPressure {
        /// Pressure channel to set.
        channel: ChannelId,
        /// Setpoint.
        mbar: f64,
        /// Maximum execution time.
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    /// Stir at `rpm` for `duration`.
    Mix {
        /// Stirrer to run.
        channel: ChannelId,
        /// Stirrer speed.
        rpm: u32,
        /// How long to stir.
        #[serde(with = "humantime_serde")]
        duration: Duration,
        /// Maximum execution time.
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    /// Do nothing for `duration`.
    Wait {
        /// How long to wait.
        #[serde(with = "humantime_serde")]
        duration: Duration,
        /// Maximum execution time.
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    /// Watch the spectrum until it stabilizes or `timeout` elapses.
    Monitor {
        /// Overrides the plan thresholds for this step.
        #[serde(default)]
        until: Option<StabilityCondition>,
        /// Hard cap on monitoring; always wins over waiting for stability.
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
}

impl ReactionStep {
    /// Declared maximum execution time.
    pub fn timeout(&self) -> Duration {
        match self {
            ReactionStep::Inject { timeout, .. }
            | ReactionStep::SetPressure { timeout, .. }
            | ReactionStep::Mix { timeout, .. }
            | ReactionStep::Wait { timeout, .. }
            | ReactionStep::Monitor { timeout, .. } => *timeout,
        }
    }

    /// Channels named directly by this step.
    pub fn channels(&self) -> Vec<&ChannelId> {
        match self {
            ReactionStep::Inject { channel, .. }
            | ReactionStep::SetPressure { channel, .. }
            | ReactionStep::Mix { channel, .. } => vec![channel],
            ReactionStep::Wait { .. } | ReactionStep::Monitor { .. } => Vec::new(),
        }
    }

    /// True for monitor steps.
    pub fn is_monitor(&self) -> bool {
        matches!(self, ReactionStep::Monitor { .. })
    }

    /// Step kind as written in plan files.
    pub fn name(&self) -> &'static str {
        match self {
            ReactionStep::Inject { .. } => "inject",
            ReactionStep::SetPressure { .. } => "set_pressure",
            ReactionStep::Mix { .. } => "mix",
            ReactionStep::Wait { .. } => "wait",
            ReactionStep::Monitor { .. } => "monitor",
        }
    }
}

/// Immutable description of one synthesis run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReactionPlan {
    /// Identity recorded with every run.
    pub id: String,
    /// Human-readable label.
    #[serde(default)]
    pub name: String,
    /// Plan-wide termination thresholds.
    pub thresholds: PlanThresholds,
    /// Steps in execution order.
    pub steps: Vec<ReactionStep>,
}

impl ReactionPlan {
    /// Parse and validate a plan from TOML text.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let plan: ReactionPlan = toml::from_str(text)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Read, parse and validate a plan file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Structural validation. Channel existence is checked by the controller against the
    /// configured channels.
    pub fn validate(&self) -> AppResult<()> {
        if self.id.trim().is_empty() {
            return Err(SynthError::InvalidPlan("plan id must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(SynthError::InvalidPlan(format!(
                "plan '{}' has no steps",
                self.id
            )));
        }
        if self.thresholds.max_total_duration.is_zero() {
            return Err(SynthError::InvalidPlan(
                "max_total_duration must be non-zero".into(),
            ));
        }
        validate_condition(&self.thresholds.stability, "thresholds")?;

        for (index, step) in self.steps.iter().enumerate() {
            let invalid = |reason: String| {
                SynthError::InvalidPlan(format!("step {index} ({}): {reason}", step.name()))
            };

            if step.timeout().is_zero() {
                return Err(invalid("timeout must be non-zero".into()));
            }
            match step {
                ReactionStep::Inject {
                    volume_ul,
                    rate_ul_per_s,
                    ..
                } => {
                    if !volume_ul.is_finite() || *volume_ul <= 0.0 {
                        return Err(invalid(format!("volume must be positive, got {volume_ul}")));
                    }
                    if !rate_ul_per_s.is_finite() || *rate_ul_per_s <= 0.0 {
                        return Err(invalid(format!(
                            "rate must be positive, got {rate_ul_per_s}"
                        )));
                    }
                }
                ReactionStep::SetPressure { mbar, .. } => {
                    if !mbar.is_finite() || *mbar < 0.0 {
                        return Err(invalid(format!("pressure must be >= 0, got {mbar}")));
                    }
                }
                ReactionStep::Mix {
                    duration, timeout, ..
                }
                | ReactionStep::Wait { duration, timeout } => {
                    if duration > timeout {
                        return Err(invalid(format!(
                            "duration {duration:?} exceeds timeout {timeout:?}"
                        )));
                    }
                }
                ReactionStep::Monitor { until, .. } => {
                    if let Some(condition) = until {
                        validate_condition(condition, "until").map_err(|err| {
                            invalid(err.to_string())
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Every channel named by any step, deduplicated, in order of first use.
    pub fn referenced_channels(&self) -> Vec<ChannelId> {
        let mut seen = Vec::new();
        for channel in self.steps.iter().flat_map(ReactionStep::channels) {
            if !seen.contains(channel) {
                seen.push(channel.clone());
            }
        }
        seen
    }

    /// Stability condition governing a monitor step.
    pub fn condition_for(&self, step: &ReactionStep) -> StabilityCondition {
        match step {
            ReactionStep::Monitor {
                until: Some(condition),
                ..
            } => *condition,
            _ => self.thresholds.stability,
        }
    }
}

fn validate_condition(condition: &StabilityCondition, section: &str) -> AppResult<()> {
    if condition.consecutive_updates == 0 {
        return Err(SynthError::InvalidPlan(format!(
            "{section}.consecutive_updates must be at least 1"
        )));
    }
    if !(condition.max_peak_shift_nm > 0.0) || !(condition.max_fwhm_change_mev > 0.0) {
        return Err(SynthError::InvalidPlan(format!(
            "{section} tolerances must be positive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
        id = "ag-seed-01"
        name = "Silver seed growth"

        [thresholds]
        max_peak_shift_nm = 0.5
        max_fwhm_change_mev = 2.0
        consecutive_updates = 3
        max_total_duration = "30m"

        [[steps]]
        kind = "set_pressure"
        channel = "p1"
        mbar = 200.0
        timeout = "10s"

        [[steps]]
        kind = "inject"
        channel = "v_ag"
        volume_ul = 50.0
        rate_ul_per_s = 10.0
        timeout = "30s"

        [[steps]]
        kind = "mix"
        channel = "stirrer"
        rpm = 600
        duration = "5s"
        timeout = "10s"

        [[steps]]
        kind = "monitor"
        timeout = "120s"
        until = { max_peak_shift_nm = 1.0, max_fwhm_change_mev = 5.0, consecutive_updates = 2 }
    "#;

    #[test]
    fn test_parse_plan() {
        let plan = ReactionPlan::from_toml_str(PLAN).unwrap();
        assert_eq!(plan.id, "ag-seed-01");
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.thresholds.stability.consecutive_updates, 3);
        assert_eq!(plan.thresholds.max_total_duration, Duration::from_secs(1800));
        assert_eq!(plan.steps[3].timeout(), Duration::from_secs(120));
        assert!(plan.steps[3].is_monitor());
        assert_eq!(
            plan.referenced_channels(),
            vec![
                ChannelId::from("p1"),
                ChannelId::from("v_ag"),
                ChannelId::from("stirrer")
            ]
        );
    }

    #[test]
    fn test_monitor_override() {
        let plan = ReactionPlan::from_toml_str(PLAN).unwrap();
        let condition = plan.condition_for(&plan.steps[3]);
        assert_eq!(condition.consecutive_updates, 2);
        assert_eq!(plan.condition_for(&plan.steps[0]), plan.thresholds.stability);
    }

    #[test]
    fn test_debounce_count_is_required() {
        let text = PLAN.replace("consecutive_updates = 3\n", "");
        assert!(matches!(
            ReactionPlan::from_toml_str(&text),
            Err(SynthError::PlanParse(_))
        ));
    }

    #[test]
    fn test_monitor_timeout_is_required() {
        let text = r#"
            id = "x"
            [thresholds]
            max_peak_shift_nm = 0.5
            max_fwhm_change_mev = 2.0
            consecutive_updates = 3
            max_total_duration = "1h"
            [[steps]]
            kind = "monitor"
        "#;
        assert!(matches!(
            ReactionPlan::from_toml_str(text),
            Err(SynthError::PlanParse(_))
        ));
    }

    #[test]
    fn test_rejects_bad_steps() {
        let mut plan = ReactionPlan::from_toml_str(PLAN).unwrap();
        plan.steps[1] = ReactionStep::Inject {
            channel: "v_ag".into(),
            volume_ul: 0.0,
            rate_ul_per_s: 10.0,
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(plan.validate(), Err(SynthError::InvalidPlan(_))));

        let mut plan = ReactionPlan::from_toml_str(PLAN).unwrap();
        plan.steps.push(ReactionStep::Wait {
            duration: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        });
        assert!(matches!(plan.validate(), Err(SynthError::InvalidPlan(_))));

        let mut plan = ReactionPlan::from_toml_str(PLAN).unwrap();
        plan.steps.clear();
        assert!(matches!(plan.validate(), Err(SynthError::InvalidPlan(_))));
    }

    #[test]
    fn test_rejects_non_finite_inject() {
        for (volume_ul, rate_ul_per_s) in [
            (f64::INFINITY, 10.0),
            (f64::NAN, 10.0),
            (20.0, f64::INFINITY),
        ] {
            let mut plan = ReactionPlan::from_toml_str(PLAN).unwrap();
            plan.steps[1] = ReactionStep::Inject {
                channel: "v_ag".into(),
                volume_ul,
                rate_ul_per_s,
                timeout: Duration::from_secs(5),
            };
            assert!(
                matches!(plan.validate(), Err(SynthError::InvalidPlan(_))),
                "volume {volume_ul}, rate {rate_ul_per_s}"
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        std::fs::write(&path, PLAN).unwrap();
        let plan = ReactionPlan::load(&path).unwrap();
        assert_eq!(plan.name, "Silver seed growth");
    }
}
