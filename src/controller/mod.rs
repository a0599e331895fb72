//! Closed-loop controller.
//!
//! The [`Controller`] runs one [`ReactionPlan`] at a time:
//!
//! 1. Validate the plan and translate every step into flow commands. Configuration and plan
//!    errors surface here, before any hardware is touched.
//! 2. Open a [`HardwareSession`] for every channel the plan references (plus the pressure
//!    sources of referenced valves). `DeviceUnavailable` ends the run in `Idle`.
//! 3. Execute the steps in order. Physical steps run under their declared timeout; monitor
//!    steps spawn an [`AcquisitionWorker`] and evaluate its stability metrics until the
//!    condition holds for the required number of consecutive updates or the step's cap
//!    elapses. The plan's `max_total_duration` bounds everything.
//! 4. Whatever happened, shut the session down. A clean shutdown ends in `Vented`, a
//!    failing one in `Failed`.
//!
//! Timeouts are policy outcomes and are logged at `warn` with `outcome = "policy"`; device
//! and acquisition failures are faults, logged at `error` with `outcome = "fault"`.

pub mod abort;
pub mod state;

pub use abort::{AbortHandle, AbortSignal};
pub use state::{ControllerState, RunCause, RunState, Transition};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{AppResult, SynthError};
use crate::flow::{FlowCommand, FlowEngine, StepOutcome};
use crate::hardware::{
    ChannelConfig, ChannelDriver, ChannelRegistry, ChannelTable, HardwareSession, Spectrometer,
};
use crate::plan::{ReactionPlan, ReactionStep, StabilityCondition};
use crate::record::RunRecorder;
use crate::spectral::acquisition::{AcquisitionEvent, AcquisitionFault, FeatureSink};
use crate::spectral::{AcquisitionWorker, SpectralPipeline};

/// Summary of a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Id shared with the run record.
    pub run_uid: Uuid,
    /// Plan that was run.
    pub plan_id: String,
    /// Why the run ended.
    pub cause: RunCause,
    /// `Vented` or `Failed`.
    pub final_state: ControllerState,
    /// Every state transition, oldest first.
    pub history: Vec<Transition>,
    /// Spectral features written to the run record.
    pub features_recorded: usize,
    /// Location of the run record.
    pub record_path: PathBuf,
    /// Teardown errors when the run ended in `Failed`.
    pub vent_errors: Vec<String>,
}

impl RunReport {
    /// True when every step completed, monitoring converged and the session vented cleanly.
    pub fn stabilized(&self) -> bool {
        self.cause == RunCause::Stabilized && self.final_state == ControllerState::Vented
    }

    /// Number of transitions into `state`.
    pub fn count(&self, state: ControllerState) -> usize {
        self.history.iter().filter(|t| t.to == state).count()
    }

    /// Whether the run ever passed through `state`.
    pub fn visited(&self, state: ControllerState) -> bool {
        self.count(state) > 0
    }

    /// Process exit code for the CLI.
    ///
    /// `0` stabilized, `2` vented after a policy stop (timeout or operator abort), `3`
    /// vented after a fault, `4` venting failed.
    pub fn exit_code(&self) -> i32 {
        match (self.final_state, &self.cause) {
            (ControllerState::Failed, _) => 4,
            (_, RunCause::Stabilized) => 0,
            (_, cause) if cause.is_fault() => 3,
            _ => 2,
        }
    }
}

/// Outcome of one step as seen by the plan loop.
enum StepResult {
    Completed,
    Stabilized,
    Stop(RunCause),
}

/// State of the run in progress, mirrored into the run record.
struct ActiveRun {
    state: RunState,
    recorder: Arc<RunRecorder>,
}

impl ActiveRun {
    fn enter(&mut self, to: ControllerState) {
        match self.state.transition(to) {
            Ok(transition) => {
                if let Err(err) = self.recorder.record_transition(&transition) {
                    warn!(error = %err, "Failed to append transition to run record");
                }
            }
            Err(from) => error!(%from, %to, "Illegal controller transition ignored"),
        }
    }

    fn current(&self) -> ControllerState {
        self.state.current()
    }
}

/// Executes reaction plans against the configured hardware.
pub struct Controller {
    settings: Arc<Settings>,
    driver: Arc<dyn ChannelDriver>,
    spectrometer: Arc<dyn Spectrometer>,
    registry: ChannelRegistry,
    channels: ChannelTable,
    engine: FlowEngine,
}

impl Controller {
    /// # Errors
    ///
    /// Fails if `settings` do not validate (including `InvalidSmoothingConfig`).
    pub fn new(
        settings: Settings,
        driver: Arc<dyn ChannelDriver>,
        spectrometer: Arc<dyn Spectrometer>,
    ) -> AppResult<Self> {
        Self::with_registry(settings, driver, spectrometer, ChannelRegistry::new())
    }

    /// Share a channel registry with other controllers in the process.
    pub fn with_registry(
        settings: Settings,
        driver: Arc<dyn ChannelDriver>,
        spectrometer: Arc<dyn Spectrometer>,
        registry: ChannelRegistry,
    ) -> AppResult<Self> {
        settings.validate()?;
        let channels = ChannelTable::from_configs(&settings.channels);
        let engine = FlowEngine::new(settings.flow.clone());
        Ok(Self {
            settings: Arc::new(settings),
            driver,
            spectrometer,
            registry,
            channels,
            engine,
        })
    }

    /// Validated settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Registry guarding channel ownership.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Run `plan` to a terminal state.
    ///
    /// Timeouts, faults and operator aborts are not errors: they end the run through the
    /// vent path and are reported in the returned [`RunReport`].
    ///
    /// # Errors
    ///
    /// Only for runs that never started: invalid plan or configuration, an I/O error
    /// creating the run record, or `DeviceUnavailable` while opening the session.
    #[instrument(skip_all, fields(plan = %plan.id))]
    pub async fn run(&self, plan: Arc<ReactionPlan>, abort: AbortSignal) -> AppResult<RunReport> {
        plan.validate()?;
        SpectralPipeline::new(
            &self.settings.acquisition,
            &self.settings.smoothing,
            &self.settings.stability,
        )?;
        let commands = plan
            .steps
            .iter()
            .map(|step| self.engine.commands_for(step, &self.channels))
            .collect::<AppResult<Vec<_>>>()?;
        let configs = self.session_channels(&plan)?;

        let session = Arc::new(HardwareSession::open(
            self.driver.clone(),
            &self.registry,
            &configs,
        )?);
        let recorder = match RunRecorder::create(&self.settings.application.data_dir, &plan.id) {
            Ok(recorder) => Arc::new(recorder),
            Err(err) => {
                if let Err(vent_err) = vent(&session).await {
                    error!(error = %vent_err, outcome = "fault", "Venting failed after record error");
                }
                return Err(err);
            }
        };
        if let Err(err) = recorder.record_start(&plan.id, &plan.name, plan.steps.len()) {
            warn!(error = %err, "Failed to append start document to run record");
        }
        info!(
            run_uid = %recorder.run_uid(),
            steps = plan.steps.len(),
            record = %recorder.path().display(),
            "Run started"
        );

        let mut run = ActiveRun {
            state: RunState::new(),
            recorder: recorder.clone(),
        };
        run.enter(ControllerState::Executing(0));

        let cause = self
            .execute_plan(&plan, &commands, &session, &mut run, &abort)
            .await;

        if cause != RunCause::Stabilized {
            run.enter(ControllerState::Aborting);
        }

        let vent_errors: Vec<String> = match vent(&session).await {
            Ok(()) => Vec::new(),
            Err(SynthError::ShutdownFailed(errors)) => {
                errors.iter().map(ToString::to_string).collect()
            }
            Err(other) => vec![other.to_string()],
        };
        let final_state = if vent_errors.is_empty() {
            ControllerState::Vented
        } else {
            ControllerState::Failed
        };
        run.enter(final_state);

        if let Err(err) = recorder.record_stop(final_state, &cause, vent_errors.clone()) {
            warn!(error = %err, "Failed to append stop document to run record");
        }

        if final_state == ControllerState::Failed {
            error!(
                %cause,
                errors = ?vent_errors,
                outcome = "fault",
                "Venting failed, operator intervention required"
            );
        } else {
            info!(%cause, features = recorder.feature_count(), "Run finished");
        }

        Ok(RunReport {
            run_uid: recorder.run_uid(),
            plan_id: plan.id.clone(),
            cause,
            final_state,
            history: run.state.history().to_vec(),
            features_recorded: recorder.feature_count(),
            record_path: recorder.path().to_path_buf(),
            vent_errors,
        })
    }

    /// Channels the plan references, followed by the pressure sources of referenced valves.
    fn session_channels(&self, plan: &ReactionPlan) -> AppResult<Vec<ChannelConfig>> {
        let mut ids = plan.referenced_channels();
        let sources: Vec<_> = ids
            .iter()
            .filter_map(|id| self.channels.get(id))
            .filter_map(|config| config.pressure_source.clone())
            .collect();
        for source in sources {
            if !ids.contains(&source) {
                ids.push(source);
            }
        }

        ids.iter()
            .map(|id| {
                self.channels
                    .get(id)
                    .cloned()
                    .ok_or_else(|| SynthError::InvalidPlan(format!("unknown channel '{id}'")))
            })
            .collect()
    }

    async fn execute_plan(
        &self,
        plan: &ReactionPlan,
        commands: &[Vec<FlowCommand>],
        session: &Arc<HardwareSession>,
        run: &mut ActiveRun,
        abort: &AbortSignal,
    ) -> RunCause {
        let deadline = Instant::now() + plan.thresholds.max_total_duration;

        for (index, (step, step_commands)) in plan.steps.iter().zip(commands).enumerate() {
            if index > 0 {
                run.enter(ControllerState::Executing(index));
            }
            if abort.is_aborted() {
                info!(step = index, "Abort requested");
                return RunCause::OperatorAbort;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(step = index, outcome = "policy", "Plan exceeded its total duration");
                return RunCause::PlanTimeout;
            }
            let plan_limited = remaining < step.timeout();
            let budget = step.timeout().min(remaining);
            let on_timeout = match (plan_limited, step) {
                (true, _) => RunCause::PlanTimeout,
                (false, ReactionStep::Monitor { .. }) => RunCause::MonitorTimeout { step: index },
                (false, _) => RunCause::StepTimeout { step: index },
            };

            info!(step = index, kind = step.name(), budget = ?budget, "Executing step");
            let result = if step.is_monitor() {
                run.enter(ControllerState::Monitoring);
                self.monitor(index, plan.condition_for(step), budget, on_timeout, run, abort)
                    .await
            } else {
                self.execute_step(index, step_commands, budget, on_timeout, session, abort)
                    .await
            };

            match result {
                StepResult::Completed => {}
                StepResult::Stabilized => run.enter(ControllerState::Stabilized),
                StepResult::Stop(cause) => return cause,
            }
        }

        if run.current() != ControllerState::Stabilized {
            run.enter(ControllerState::Stabilized);
        }
        RunCause::Stabilized
    }

    async fn execute_step(
        &self,
        index: usize,
        commands: &[FlowCommand],
        budget: Duration,
        on_timeout: RunCause,
        session: &Arc<HardwareSession>,
        abort: &AbortSignal,
    ) -> StepResult {
        match tokio::time::timeout(budget, self.engine.execute(commands, session, abort)).await {
            Ok(Ok(StepOutcome::Completed)) => {
                debug!(step = index, "Step completed");
                StepResult::Completed
            }
            Ok(Ok(StepOutcome::Aborted)) => {
                info!(step = index, "Step interrupted by abort");
                StepResult::Stop(RunCause::OperatorAbort)
            }
            Ok(Err(err)) => {
                error!(step = index, error = %err, outcome = "fault", "Step failed");
                StepResult::Stop(fault_cause(err))
            }
            Err(_) => {
                warn!(step = index, budget = ?budget, cause = %on_timeout, outcome = "policy", "Step timed out");
                StepResult::Stop(on_timeout)
            }
        }
    }

    async fn monitor(
        &self,
        index: usize,
        condition: StabilityCondition,
        budget: Duration,
        on_timeout: RunCause,
        run: &ActiveRun,
        abort: &AbortSignal,
    ) -> StepResult {
        let pipeline = match SpectralPipeline::new(
            &self.settings.acquisition,
            &self.settings.smoothing,
            &self.settings.stability,
        ) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                return StepResult::Stop(RunCause::Internal {
                    detail: err.to_string(),
                })
            }
        };
        let mut worker = AcquisitionWorker::spawn(
            self.spectrometer.clone(),
            pipeline,
            &self.settings.acquisition,
            Some(FeatureSink {
                recorder: run.recorder.clone(),
                step: index,
            }),
        );

        let cap = tokio::time::sleep(budget);
        tokio::pin!(cap);
        let mut consecutive = 0u32;

        let result = loop {
            tokio::select! {
                biased;

                _ = abort.wait() => {
                    info!(step = index, "Abort requested during monitoring");
                    break StepResult::Stop(RunCause::OperatorAbort);
                }
                _ = &mut cap => {
                    warn!(step = index, budget = ?budget, cause = %on_timeout, outcome = "policy", "Monitor cap reached without stability");
                    break StepResult::Stop(on_timeout);
                }
                event = worker.recv() => match event {
                    Some(AcquisitionEvent::Update { metric, .. }) => {
                        if metric.satisfies(&condition) {
                            consecutive += 1;
                        } else {
                            consecutive = 0;
                        }
                        debug!(
                            step = index,
                            consecutive,
                            delta_peak_nm = metric.delta_peak_nm,
                            delta_fwhm_mev = ?metric.delta_fwhm_mev,
                            "Stability evaluated"
                        );
                        if consecutive >= condition.consecutive_updates {
                            info!(step = index, consecutive, "Stability reached");
                            break StepResult::Stabilized;
                        }
                    }
                    Some(AcquisitionEvent::Fault(AcquisitionFault::Timeout(timeout))) => {
                        error!(step = index, timeout = ?timeout, outcome = "fault", "Spectrometer capture timed out");
                        break StepResult::Stop(RunCause::AcquisitionTimeout { step: index });
                    }
                    Some(AcquisitionEvent::Fault(AcquisitionFault::Device(err))) => {
                        error!(step = index, error = %err, outcome = "fault", "Spectrometer fault");
                        break StepResult::Stop(RunCause::SpectrometerFault { detail: err.to_string() });
                    }
                    None => {
                        error!(step = index, outcome = "fault", "Acquisition stopped unexpectedly");
                        break StepResult::Stop(RunCause::SpectrometerFault {
                            detail: "acquisition stream closed".to_string(),
                        });
                    }
                }
            }
        };

        worker.stop().await;
        result
    }
}

/// Shut the session down on the blocking pool.
async fn vent(session: &Arc<HardwareSession>) -> AppResult<()> {
    let session = Arc::clone(session);
    tokio::task::spawn_blocking(move || session.shutdown()).await?
}

fn fault_cause(err: SynthError) -> RunCause {
    match err {
        SynthError::DeviceFault { channel, source } => RunCause::DeviceFault {
            channel,
            detail: source.to_string(),
        },
        SynthError::DeviceUnavailable { channel, reason } => RunCause::DeviceFault {
            channel,
            detail: reason,
        },
        other => RunCause::Internal {
            detail: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmoothingConfig;
    use crate::hardware::mock::{MockChannelDriver, MockSpectrometer};
    use crate::hardware::{ChannelId, FlowCalibration};
    use crate::plan::PlanThresholds;
    use tracing_test::traced_test;

    fn settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.application.data_dir = dir.to_path_buf();
        settings.flow.pressure_settle = Duration::from_millis(100);
        settings.channels = vec![
            ChannelConfig::pressure("p1").with_max_pressure(2000.0),
            ChannelConfig::valve("v_ag", "p1").with_calibration(FlowCalibration {
                ul_per_s_per_mbar: 0.0625,
                dead_volume_ul: 0.0,
            }),
        ];
        settings
    }

    fn plan(monitor_cap: Duration) -> Arc<ReactionPlan> {
        Arc::new(ReactionPlan {
            id: "unit".into(),
            name: String::new(),
            thresholds: PlanThresholds {
                stability: StabilityCondition {
                    max_peak_shift_nm: 0.5,
                    max_fwhm_change_mev: 2.0,
                    consecutive_updates: 3,
                },
                max_total_duration: Duration::from_secs(3600),
            },
            steps: vec![
                ReactionStep::Inject {
                    channel: "v_ag".into(),
                    volume_ul: 20.0,
                    rate_ul_per_s: 10.0,
                    timeout: Duration::from_secs(30),
                },
                ReactionStep::Monitor {
                    until: None,
                    timeout: monitor_cap,
                },
            ],
        })
    }

    #[test]
    fn test_exit_codes() {
        let report = |cause, final_state| RunReport {
            run_uid: Uuid::new_v4(),
            plan_id: "p".into(),
            cause,
            final_state,
            history: Vec::new(),
            features_recorded: 0,
            record_path: PathBuf::new(),
            vent_errors: Vec::new(),
        };
        assert_eq!(report(RunCause::Stabilized, ControllerState::Vented).exit_code(), 0);
        assert_eq!(
            report(RunCause::MonitorTimeout { step: 1 }, ControllerState::Vented).exit_code(),
            2
        );
        assert_eq!(report(RunCause::OperatorAbort, ControllerState::Vented).exit_code(), 2);
        assert_eq!(
            report(RunCause::AcquisitionTimeout { step: 1 }, ControllerState::Vented).exit_code(),
            3
        );
        assert_eq!(report(RunCause::Stabilized, ControllerState::Failed).exit_code(), 4);
    }

    #[test]
    fn test_invalid_smoothing_rejected_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.smoothing = SmoothingConfig {
            window_length: 4,
            polyorder: 2,
        };
        let driver = Arc::new(MockChannelDriver::new());
        let result = Controller::new(
            settings,
            driver.clone(),
            Arc::new(MockSpectrometer::converging(650.0)),
        );
        assert!(matches!(result, Err(SynthError::InvalidSmoothingConfig { .. })));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_session_includes_valve_pressure_source() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(
            settings(dir.path()),
            Arc::new(MockChannelDriver::new()),
            Arc::new(MockSpectrometer::converging(650.0)),
        )
        .unwrap();
        let ids: Vec<_> = controller
            .session_channels(&plan(Duration::from_secs(10)))
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![ChannelId::from("v_ag"), ChannelId::from("p1")]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_monitor_timeout_is_logged_as_policy() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(
            settings(dir.path()),
            Arc::new(MockChannelDriver::new()),
            Arc::new(MockSpectrometer::drifting(600.0, 1.0)),
        )
        .unwrap();

        let report = controller
            .run(plan(Duration::from_secs(20)), AbortSignal::never())
            .await
            .unwrap();

        assert_eq!(report.cause, RunCause::MonitorTimeout { step: 1 });
        assert_eq!(report.final_state, ControllerState::Vented);
        assert!(logs_contain("Monitor cap reached without stability"));
        assert!(logs_contain("policy"));
        assert!(!logs_contain("Spectrometer fault"));
    }
}
