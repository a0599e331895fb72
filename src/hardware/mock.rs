//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockChannelDriver` - Simulated pressure/valve/stirrer controller with fault injection
//! - `MockSpectrometer` - Simulated spectrometer emitting a Gaussian emission peak
//!
//! # Fault Injection
//!
//! - `fail_on_pressure_call(n)`: the n-th `set_pressure` call (1-based) reports a
//!   communication timeout, once
//! - `fail_vent()`: every `set_pressure(0.0)` fails, modelling a stuck regulator
//! - `fail_vent_from_call(n)`: `set_pressure(0.0)` fails from the n-th pressure call on
//! - `hang_on_pressure_call(n, delay)`: the n-th `set_pressure` call blocks its thread for
//!   `delay` before reaching the device, modelling an unresponsive controller
//! - `unreachable(id)`: opening the channel fails
//! - `MockSpectrometer::stall_after(n)`: readouts after the n-th never return

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::DriverError;
use crate::hardware::{
    ChannelDriver, ChannelHandle, ChannelId, ChannelKind, RawSpectrum, Spectrometer,
    ValvePosition,
};

// =============================================================================
// MockChannelDriver - Simulated Pressure/Valve/Stirrer Controller
// =============================================================================

/// One call received by the mock driver, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum DriverCall {
    /// Channel opened.
    Open(ChannelId),
    /// Pressure commanded, in mbar.
    SetPressure(ChannelId, f64),
    /// Valve moved.
    SetValve(ChannelId, ValvePosition),
    /// Stirrer speed commanded.
    SetStirrer(ChannelId, u32),
    /// Channel closed.
    Close(ChannelId),
}

#[derive(Default)]
struct MockDriverState {
    next_handle: u32,
    open: HashMap<ChannelHandle, (ChannelId, ChannelKind)>,
    pressures: HashMap<ChannelId, f64>,
    valves: HashMap<ChannelId, ValvePosition>,
    stirrers: HashMap<ChannelId, u32>,
    pressure_calls: usize,
    calls: Vec<DriverCall>,
}

/// Mock multi-channel controller.
///
/// Keeps the last value applied to every channel so tests can assert on the physical
/// state left behind after a run.
///
/// # Example
///
/// ```rust,ignore
/// let driver = MockChannelDriver::new().fail_on_pressure_call(2);
/// let handle = driver.open_channel(&"p1".into(), ChannelKind::Pressure)?;
/// driver.set_pressure(handle, 500.0)?; // ok
/// assert!(driver.set_pressure(handle, 0.0).is_err()); // injected fault
/// ```
pub struct MockChannelDriver {
    state: Mutex<MockDriverState>,
    fail_pressure_call: Option<usize>,
    fail_vent_from: Option<usize>,
    hang_pressure_call: Option<(usize, Duration)>,
    unreachable: HashSet<ChannelId>,
}

impl MockChannelDriver {
    /// Create a mock driver with every channel reachable and no faults.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockDriverState::default()),
            fail_pressure_call: None,
            fail_vent_from: None,
            hang_pressure_call: None,
            unreachable: HashSet::new(),
        }
    }

    /// Fail the n-th `set_pressure` call (1-based) with a communication timeout.
    pub fn fail_on_pressure_call(mut self, n: usize) -> Self {
        self.fail_pressure_call = Some(n);
        self
    }

    /// Make every venting call (`set_pressure(0.0)`) fail.
    pub fn fail_vent(self) -> Self {
        self.fail_vent_from_call(1)
    }

    /// Make venting calls fail from the n-th `set_pressure` call (1-based) on.
    pub fn fail_vent_from_call(mut self, n: usize) -> Self {
        self.fail_vent_from = Some(n);
        self
    }

    /// Block the n-th `set_pressure` call (1-based) for `delay` before it reaches the
    /// device. The call then fails if its channel was closed in the meantime.
    pub fn hang_on_pressure_call(mut self, n: usize, delay: Duration) -> Self {
        self.hang_pressure_call = Some((n, delay));
        self
    }

    /// Make opening the given channel fail.
    pub fn unreachable(mut self, id: &str) -> Self {
        self.unreachable.insert(ChannelId::from(id));
        self
    }

    /// Last pressure applied to a channel, in mbar.
    pub fn pressure(&self, id: &str) -> Option<f64> {
        self.state.lock().pressures.get(&ChannelId::from(id)).copied()
    }

    /// Last position applied to a valve.
    pub fn valve(&self, id: &str) -> Option<ValvePosition> {
        self.state.lock().valves.get(&ChannelId::from(id)).copied()
    }

    /// Last speed applied to a stirrer.
    pub fn stirrer(&self, id: &str) -> Option<u32> {
        self.state.lock().stirrers.get(&ChannelId::from(id)).copied()
    }

    /// Number of channels currently open.
    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Number of `set_pressure` calls received, failed ones included.
    pub fn pressure_call_count(&self) -> usize {
        self.state.lock().pressure_calls
    }

    fn lookup(state: &MockDriverState, handle: ChannelHandle) -> Result<ChannelId, DriverError> {
        state
            .open
            .get(&handle)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| DriverError::Other(format!("handle {} is not open", handle.0)))
    }
}

impl Default for MockChannelDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelDriver for MockChannelDriver {
    fn open_channel(&self, id: &ChannelId, kind: ChannelKind) -> Result<ChannelHandle, DriverError> {
        if self.unreachable.contains(id) {
            return Err(DriverError::Unreachable(format!("no response from {}", id)));
        }

        let mut state = self.state.lock();
        if state.open.values().any(|(open_id, _)| open_id == id) {
            return Err(DriverError::Unreachable(format!("{} is already open", id)));
        }

        state.next_handle += 1;
        let handle = ChannelHandle(state.next_handle);
        state.open.insert(handle, (id.clone(), kind));
        state.calls.push(DriverCall::Open(id.clone()));
        debug!(channel = %id, %kind, "MockChannelDriver: channel opened");
        Ok(handle)
    }

    fn set_pressure(&self, handle: ChannelHandle, mbar: f64) -> Result<(), DriverError> {
        let call = {
            let mut state = self.state.lock();
            let id = Self::lookup(&state, handle)?;
            state.pressure_calls += 1;
            state.calls.push(DriverCall::SetPressure(id, mbar));
            state.pressure_calls
        };

        if let Some((n, delay)) = self.hang_pressure_call {
            if n == call {
                debug!(call, ?delay, "MockChannelDriver: pressure call hanging");
                std::thread::sleep(delay);
            }
        }

        let mut state = self.state.lock();
        let id = Self::lookup(&state, handle)?;
        if self.fail_pressure_call == Some(call) {
            debug!(channel = %id, mbar, "MockChannelDriver: injected pressure fault");
            return Err(DriverError::CommTimeout);
        }
        if mbar == 0.0 && self.fail_vent_from.is_some_and(|n| call >= n) {
            debug!(channel = %id, "MockChannelDriver: injected vent fault");
            return Err(DriverError::CommTimeout);
        }

        state.pressures.insert(id, mbar);
        Ok(())
    }

    fn set_valve(&self, handle: ChannelHandle, position: ValvePosition) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let id = Self::lookup(&state, handle)?;
        state.calls.push(DriverCall::SetValve(id.clone(), position));
        state.valves.insert(id, position);
        Ok(())
    }

    fn set_stirrer(&self, handle: ChannelHandle, rpm: u32) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let id = Self::lookup(&state, handle)?;
        state.calls.push(DriverCall::SetStirrer(id.clone(), rpm));
        state.stirrers.insert(id, rpm);
        Ok(())
    }

    fn close_channel(&self, handle: ChannelHandle) {
        let mut state = self.state.lock();
        if let Some((id, _)) = state.open.remove(&handle) {
            debug!(channel = %id, "MockChannelDriver: channel closed");
            state.calls.push(DriverCall::Close(id));
        }
    }
}

// =============================================================================
// MockSpectrometer - Simulated Emission Spectrometer
// =============================================================================

/// How the simulated peak center moves between frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PeakMotion {
    /// Offset from `center_nm` shrinks geometrically by `decay` per frame.
    Converging {
        /// Distance from the center on the first frame.
        initial_offset_nm: f64,
        /// Factor applied to the offset every frame.
        decay: f64,
    },
    /// Center moves by a constant amount per frame and never settles.
    Drifting {
        /// Shift per frame.
        nm_per_frame: f64,
    },
}

/// Mock spectrometer producing one Gaussian peak per readout.
///
/// # Example
///
/// ```rust,ignore
/// let spectrometer = MockSpectrometer::converging(850.0);
/// let raw = spectrometer.read_spectrum().await?;
/// assert_eq!(raw.wavelengths_nm.len(), raw.intensities.len());
/// ```
pub struct MockSpectrometer {
    axis: (f64, f64, usize),
    center_nm: f64,
    fwhm_nm: f64,
    amplitude: f64,
    noise: f64,
    axis_offset_nm: f64,
    motion: PeakMotion,
    stall_after: Option<usize>,
    fail_after: Option<usize>,
    frames: AtomicUsize,
}

impl MockSpectrometer {
    /// Peak converging toward `center_nm` from 20 nm away.
    pub fn converging(center_nm: f64) -> Self {
        Self::with_motion(
            center_nm,
            PeakMotion::Converging {
                initial_offset_nm: 20.0,
                decay: 0.5,
            },
        )
    }

    /// Peak starting at `center_nm` and drifting forever.
    pub fn drifting(center_nm: f64, nm_per_frame: f64) -> Self {
        Self::with_motion(center_nm, PeakMotion::Drifting { nm_per_frame })
    }

    fn with_motion(center_nm: f64, motion: PeakMotion) -> Self {
        Self {
            axis: (400.0, 1100.0, 701),
            center_nm,
            fwhm_nm: 40.0,
            amplitude: 1000.0,
            noise: 0.0,
            axis_offset_nm: 0.0,
            motion,
            stall_after: None,
            fail_after: None,
            frames: AtomicUsize::new(0),
        }
    }

    /// Wavelength axis reported by the device.
    pub fn with_axis(mut self, start_nm: f64, end_nm: f64, points: usize) -> Self {
        self.axis = (start_nm, end_nm, points);
        self
    }

    /// Linewidth of the simulated peak.
    pub fn with_fwhm(mut self, fwhm_nm: f64) -> Self {
        self.fwhm_nm = fwhm_nm;
        self
    }

    /// Height of the simulated peak.
    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }

    /// Uniform noise of the given amplitude added to every sample.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Shift the reported wavelength axis (calibration drift).
    pub fn with_axis_offset(mut self, offset_nm: f64) -> Self {
        self.axis_offset_nm = offset_nm;
        self
    }

    /// Readouts after the n-th never complete.
    pub fn stall_after(mut self, frames: usize) -> Self {
        self.stall_after = Some(frames);
        self
    }

    /// Readouts after the n-th report a communication timeout.
    pub fn fail_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Number of readouts started so far.
    pub fn frame_count(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }

    fn peak_center(&self, frame: usize) -> f64 {
        match self.motion {
            PeakMotion::Converging {
                initial_offset_nm,
                decay,
            } => self.center_nm + initial_offset_nm * decay.powi(frame as i32),
            PeakMotion::Drifting { nm_per_frame } => self.center_nm + nm_per_frame * frame as f64,
        }
    }

    fn render(&self, frame: usize) -> RawSpectrum {
        let (start, end, points) = self.axis;
        let step = if points > 1 {
            (end - start) / (points - 1) as f64
        } else {
            0.0
        };
        let center = self.peak_center(frame);
        let sigma = self.fwhm_nm / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt());
        let mut rng = rand::thread_rng();

        let wavelengths_nm: Vec<f64> = (0..points)
            .map(|i| start + step * i as f64 + self.axis_offset_nm)
            .collect();
        let intensities = (0..points)
            .map(|i| {
                let x = start + step * i as f64;
                let signal = self.amplitude * (-(x - center).powi(2) / (2.0 * sigma * sigma)).exp();
                if self.noise > 0.0 {
                    signal + rng.gen_range(-self.noise..self.noise)
                } else {
                    signal
                }
            })
            .collect();

        RawSpectrum {
            wavelengths_nm,
            intensities,
        }
    }
}

#[async_trait]
impl Spectrometer for MockSpectrometer {
    async fn read_spectrum(&self) -> Result<RawSpectrum, DriverError> {
        let frame = self.frames.fetch_add(1, Ordering::SeqCst);

        if self.stall_after.is_some_and(|n| frame >= n) {
            debug!(frame, "MockSpectrometer: stalled");
            std::future::pending::<()>().await;
        }
        if self.fail_after.is_some_and(|n| frame >= n) {
            return Err(DriverError::CommTimeout);
        }

        Ok(self.render(frame))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_driver_tracks_state() {
        let driver = MockChannelDriver::new();
        let p = driver
            .open_channel(&ChannelId::from("p1"), ChannelKind::Pressure)
            .unwrap();
        let v = driver
            .open_channel(&ChannelId::from("v1"), ChannelKind::Valve)
            .unwrap();

        driver.set_pressure(p, 750.0).unwrap();
        driver.set_valve(v, ValvePosition::Open).unwrap();

        assert_eq!(driver.pressure("p1"), Some(750.0));
        assert_eq!(driver.valve("v1"), Some(ValvePosition::Open));
        assert_eq!(driver.open_count(), 2);

        driver.close_channel(p);
        driver.close_channel(v);
        assert_eq!(driver.open_count(), 0);
    }

    #[test]
    fn test_mock_driver_rejects_double_open() {
        let driver = MockChannelDriver::new();
        driver
            .open_channel(&ChannelId::from("p1"), ChannelKind::Pressure)
            .unwrap();
        let second = driver.open_channel(&ChannelId::from("p1"), ChannelKind::Pressure);
        assert!(matches!(second, Err(DriverError::Unreachable(_))));
    }

    #[test]
    fn test_mock_driver_injected_pressure_fault_is_one_shot() {
        let driver = MockChannelDriver::new().fail_on_pressure_call(2);
        let p = driver
            .open_channel(&ChannelId::from("p1"), ChannelKind::Pressure)
            .unwrap();

        assert!(driver.set_pressure(p, 500.0).is_ok());
        assert_eq!(driver.set_pressure(p, 0.0), Err(DriverError::CommTimeout));
        assert!(driver.set_pressure(p, 0.0).is_ok());
        assert_eq!(driver.pressure_call_count(), 3);
        assert_eq!(driver.pressure("p1"), Some(0.0));
    }

    #[test]
    fn test_mock_driver_vent_fault() {
        let driver = MockChannelDriver::new().fail_vent();
        let p = driver
            .open_channel(&ChannelId::from("p1"), ChannelKind::Pressure)
            .unwrap();
        driver.set_pressure(p, 300.0).unwrap();
        assert!(driver.set_pressure(p, 0.0).is_err());
        assert_eq!(driver.pressure("p1"), Some(300.0));
    }

    #[tokio::test]
    async fn test_mock_spectrometer_converges() {
        let spectrometer = MockSpectrometer::converging(850.0);
        assert!((spectrometer.peak_center(0) - 870.0).abs() < 1e-9);
        assert!((spectrometer.peak_center(10) - 850.0).abs() < 0.05);

        let raw = spectrometer.read_spectrum().await.unwrap();
        assert_eq!(raw.wavelengths_nm.len(), 701);
        assert_eq!(raw.intensities.len(), 701);
        assert_eq!(spectrometer.frame_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_spectrometer_fails_after() {
        let spectrometer = MockSpectrometer::converging(850.0).fail_after(1);
        assert!(spectrometer.read_spectrum().await.is_ok());
        assert_eq!(
            spectrometer.read_spectrum().await,
            Err(DriverError::CommTimeout)
        );
    }
}
