//! Capture loop.
//!
//! The [`AcquisitionWorker`] polls the spectrometer at a fixed cadence on its own task,
//! pushes every frame through the [`SpectralPipeline`] and broadcasts the results. The
//! queue to the controller is bounded: a slow consumer loses the oldest updates, never the
//! newest, and never blocks capture. Every extracted feature is written to the run record
//! before it is broadcast, so the record holds the complete series even when the
//! controller skips updates.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use super::{DiscardReason, PipelineOutput, SpectralFeature, SpectralFrame, SpectralPipeline};
use crate::config::AcquisitionConfig;
use crate::error::{AppResult, DriverError, SynthError};
use crate::hardware::Spectrometer;
use crate::record::RunRecorder;
use crate::spectral::StabilityMetric;

/// Capture one frame, giving up after `timeout`.
///
/// # Errors
///
/// `AcquisitionTimeout` if the spectrometer does not answer in time, `SpectrometerFault`
/// if it reports an error.
pub async fn capture(
    spectrometer: &dyn Spectrometer,
    timeout: Duration,
    index: u64,
) -> AppResult<SpectralFrame> {
    match tokio::time::timeout(timeout, spectrometer.read_spectrum()).await {
        Ok(Ok(raw)) => Ok(SpectralFrame::new(index, Utc::now(), raw)),
        Ok(Err(err)) => Err(SynthError::SpectrometerFault(err)),
        Err(_) => Err(SynthError::AcquisitionTimeout(timeout)),
    }
}

/// Capture failure that ends the stream.
#[derive(Clone, Debug, PartialEq)]
pub enum AcquisitionFault {
    /// The readout did not complete in time.
    Timeout(Duration),
    /// The spectrometer reported an error.
    Device(DriverError),
}

/// Item delivered to the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum AcquisitionEvent {
    /// A new feature and the stability metric it produced.
    Update {
        /// Feature extracted from the newest frame.
        feature: SpectralFeature,
        /// Stability metric after pushing it.
        metric: StabilityMetric,
    },
    /// Acquisition stopped. No further events follow.
    Fault(AcquisitionFault),
}

/// Where extracted features are persisted.
#[derive(Clone)]
pub struct FeatureSink {
    /// Run record receiving the features.
    pub recorder: Arc<RunRecorder>,
    /// Monitor step the features belong to.
    pub step: usize,
}

/// Background capture task plus the receiving end of its queue.
///
/// Dropping the worker stops the task.
pub struct AcquisitionWorker {
    events: broadcast::Receiver<AcquisitionEvent>,
    task: JoinHandle<()>,
}

impl AcquisitionWorker {
    /// Start capturing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        spectrometer: Arc<dyn Spectrometer>,
        pipeline: SpectralPipeline,
        config: &AcquisitionConfig,
        sink: Option<FeatureSink>,
    ) -> Self {
        let (tx, events) = broadcast::channel(config.queue_depth.max(1));
        let task = tokio::spawn(capture_loop(
            spectrometer,
            pipeline,
            config.cadence,
            config.capture_timeout,
            tx,
            sink,
        ));
        Self { events, task }
    }

    /// Next event, skipping over updates dropped by the bounded queue.
    ///
    /// Returns `None` once the capture task has stopped and every queued event has been
    /// delivered.
    pub async fn recv(&mut self) -> Option<AcquisitionEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    debug!(dropped, "Acquisition consumer lagged, oldest updates dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop the capture task and wait for it to exit.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn capture_loop(
    spectrometer: Arc<dyn Spectrometer>,
    mut pipeline: SpectralPipeline,
    cadence: Duration,
    capture_timeout: Duration,
    tx: broadcast::Sender<AcquisitionEvent>,
    sink: Option<FeatureSink>,
) {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut index = 0u64;

    loop {
        ticker.tick().await;

        let frame = match capture(spectrometer.as_ref(), capture_timeout, index).await {
            Ok(frame) => frame,
            Err(err) => {
                let fault = match err {
                    SynthError::AcquisitionTimeout(timeout) => AcquisitionFault::Timeout(timeout),
                    SynthError::SpectrometerFault(source) => AcquisitionFault::Device(source),
                    other => AcquisitionFault::Device(DriverError::Other(other.to_string())),
                };
                error!(frame = index, fault = ?fault, outcome = "fault", "Spectral capture failed");
                let _ = tx.send(AcquisitionEvent::Fault(fault));
                return;
            }
        };
        index += 1;

        match pipeline.process(&frame) {
            PipelineOutput::Updated { feature, metric } => {
                if let Some(sink) = &sink {
                    if let Err(err) = sink.recorder.record_feature(sink.step, &feature) {
                        warn!(error = %err, "Failed to append feature to run record");
                    }
                }
                debug!(
                    frame = frame.index(),
                    peak_nm = feature.peak_wavelength_nm,
                    delta_peak_nm = metric.delta_peak_nm,
                    delta_fwhm_mev = ?metric.delta_fwhm_mev,
                    "Stability metric updated"
                );
                if tx.send(AcquisitionEvent::Update { feature, metric }).is_err() {
                    debug!("No acquisition consumers left, stopping capture");
                    return;
                }
            }
            PipelineOutput::Discarded(DiscardReason::Misaligned(reason)) => {
                warn!(frame = frame.index(), %reason, "Discarding misaligned frame");
            }
            PipelineOutput::Discarded(DiscardReason::NoSignal { peak_intensity }) => {
                warn!(frame = frame.index(), peak_intensity, "Discarding frame without signal");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SmoothingConfig, StabilityConfig};
    use crate::hardware::mock::MockSpectrometer;

    fn pipeline(config: &AcquisitionConfig) -> SpectralPipeline {
        SpectralPipeline::new(
            config,
            &SmoothingConfig::default(),
            &StabilityConfig { window_size: 3 },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_times_out() {
        let spectrometer = MockSpectrometer::converging(650.0).stall_after(0);
        let result = capture(&spectrometer, Duration::from_secs(2), 0).await;
        assert!(matches!(result, Err(SynthError::AcquisitionTimeout(d)) if d == Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_maps_device_errors() {
        let spectrometer = MockSpectrometer::converging(650.0).fail_after(0);
        let result = capture(&spectrometer, Duration::from_secs(2), 0).await;
        assert!(matches!(
            result,
            Err(SynthError::SpectrometerFault(DriverError::CommTimeout))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_streams_updates() {
        let config = AcquisitionConfig::default();
        let spectrometer = Arc::new(MockSpectrometer::converging(650.0));
        let mut worker =
            AcquisitionWorker::spawn(spectrometer.clone(), pipeline(&config), &config, None);

        let mut samples = Vec::new();
        for _ in 0..4 {
            match worker.recv().await {
                Some(AcquisitionEvent::Update { metric, .. }) => samples.push(metric.samples),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(samples, vec![1, 2, 3, 3]);
        worker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_reports_fault_then_closes() {
        let config = AcquisitionConfig::default();
        let spectrometer = Arc::new(MockSpectrometer::converging(650.0).stall_after(1));
        let mut worker = AcquisitionWorker::spawn(spectrometer, pipeline(&config), &config, None);

        assert!(matches!(worker.recv().await, Some(AcquisitionEvent::Update { .. })));
        assert!(matches!(
            worker.recv().await,
            Some(AcquisitionEvent::Fault(AcquisitionFault::Timeout(_)))
        ));
        assert_eq!(worker.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_sees_newest_updates() {
        let config = AcquisitionConfig {
            queue_depth: 2,
            ..AcquisitionConfig::default()
        };
        let spectrometer = Arc::new(MockSpectrometer::converging(650.0));
        let mut worker =
            AcquisitionWorker::spawn(spectrometer.clone(), pipeline(&config), &config, None);

        // Let ten frames accumulate without consuming.
        tokio::time::sleep(config.cadence * 9 + Duration::from_millis(500)).await;
        assert!(spectrometer.frame_count() >= 10);

        let first = match worker.recv().await {
            Some(AcquisitionEvent::Update { feature, .. }) => feature.frame_index,
            other => panic!("unexpected event {other:?}"),
        };
        // Early frames were overwritten; only the newest survive.
        assert!(first >= 8, "first delivered frame {first}");
    }
}
