//! In-process simulated driver host.
//!
//! Behaves like a vendor driver from the session's point of view: owns the
//! double buffers, calls back through the registered table, and can be told
//! to fail at any lifecycle stage. Tests drive buffer switches by hand with
//! [`SimulatedDevice::fire`]; the CLI's `--simulate` mode uses the clock
//! thread, which feeds a test tone into the input half at the real-time rate.

use std::f32::consts::TAU;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::driver::{
    AsioDriver, BufferInfo, BufferSizeRange, ChannelCounts, ChannelInfo, ChannelRole,
    ChannelSpec, DoubleBuffer, DriverCallbacks, DriverHost, DriverInfo, HandleLock, TimeInfo,
};
use crate::error::{DriverError, DriverResult};
use crate::sample;

/// Tone fed into the input channel by the clock thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestTone {
    pub frequency: f32,
    pub amplitude: f32,
}

impl Default for TestTone {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            amplitude: 0.25,
        }
    }
}

/// Static description of a simulated device, including injected failures.
#[derive(Debug, Clone)]
pub struct SimulatedDeviceConfig {
    pub name: String,
    pub channels: ChannelCounts,
    /// `None` makes the driver unable to report its rate.
    pub sample_rate: Option<f64>,
    /// `None` makes the driver unable to report buffer bounds.
    pub buffer_range: Option<BufferSizeRange>,
    pub fail_init: bool,
    pub fail_channels: bool,
    pub fail_set_sample_rate: bool,
    pub fail_create_buffers: bool,
    pub fail_start: bool,
    /// Hand out a null pointer for `(spec position, half)`.
    pub null_half: Option<(usize, usize)>,
    /// Run a clock thread while streaming.
    pub clock: Option<TestTone>,
}

impl SimulatedDeviceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: ChannelCounts {
                inputs: 2,
                outputs: 2,
            },
            sample_rate: Some(48_000.0),
            buffer_range: Some(BufferSizeRange {
                min: 32,
                max: 2048,
                preferred: 256,
                granularity: -1,
            }),
            fail_init: false,
            fail_channels: false,
            fail_set_sample_rate: false,
            fail_create_buffers: false,
            fail_start: false,
            null_half: None,
            clock: None,
        }
    }

    pub fn clocked(mut self, tone: TestTone) -> Self {
        self.clock = Some(tone);
        self
    }
}

struct Clock {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct SimState {
    config: SimulatedDeviceConfig,
    calls: Vec<&'static str>,
    rate: Option<f64>,
    buffers: Vec<DoubleBuffer>,
    callbacks: Option<Arc<dyn DriverCallbacks>>,
    streaming: bool,
    sample_position: u64,
    clock: Option<Clock>,
}

/// Shared handle to a simulated device, kept by tests to observe and drive it.
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    fn new(config: SimulatedDeviceConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                rate: config.sample_rate,
                config,
                calls: Vec::new(),
                buffers: Vec::new(),
                callbacks: None,
                streaming: false,
                sample_position: 0,
                clock: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A test that panicked mid-call must not hide the device from the rest.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> String {
        self.state().config.name.clone()
    }

    /// Driver calls in the order they were made.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    /// Number of live channel double buffers.
    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    /// Write raw words into the input channel's `half`.
    ///
    /// Refused while the clock thread owns the buffers.
    pub fn write_input(&self, half: usize, words: &[i32]) -> bool {
        let mut st = self.state();
        if st.clock.is_some() {
            return false;
        }
        match st
            .buffers
            .iter_mut()
            .find(|b| b.spec.role == ChannelRole::Input)
            .and_then(|b| b.halves.get_mut(half))
        {
            Some(buf) => {
                buf.fill_from(words);
                true
            }
            None => false,
        }
    }

    /// Read the raw words of output `channel`'s `half`.
    ///
    /// `None` while the clock thread owns the buffers.
    pub fn read_output(&self, channel: usize, half: usize) -> Option<Vec<i32>> {
        let st = self.state();
        if st.clock.is_some() {
            return None;
        }
        st.buffers
            .iter()
            .find(|b| b.spec == ChannelSpec::output(channel))
            .and_then(|b| b.halves.get(half))
            .map(|buf| buf.to_vec())
    }

    /// Deliver one buffer switch for `half`, as the driver thread would.
    ///
    /// The device lock is held for the whole callback, so `write_input` and
    /// `read_output` never overlap it. Returns `false` when the device is not
    /// streaming or its clock thread is delivering switches.
    pub fn fire(&self, half: usize) -> bool {
        let mut st = self.state();
        if !st.streaming || st.clock.is_some() {
            return false;
        }
        let Some(callbacks) = st.callbacks.clone() else {
            return false;
        };
        let time = TimeInfo {
            sample_position: st.sample_position,
            system_time_ns: 0,
        };
        let frames = st.buffers.first().map(|b| b.halves[0].len()).unwrap_or(0);
        st.sample_position += frames as u64;
        callbacks.buffer_switch(half, Some(&time));
        true
    }

    /// Send a capability query through the registered table.
    pub fn message(&self, selector: i64, value: i64) -> Option<i64> {
        let callbacks = self.state().callbacks.clone()?;
        Some(callbacks.message(selector, value))
    }
}

/// Registry of simulated devices.
#[derive(Default)]
pub struct SimulatedHost {
    devices: Vec<SimulatedDevice>,
    handle: HandleLock,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and return a handle for driving it.
    pub fn add_device(&mut self, config: SimulatedDeviceConfig) -> SimulatedDevice {
        let device = SimulatedDevice::new(config);
        self.devices.push(device.clone());
        device
    }
}

impl DriverHost for SimulatedHost {
    fn driver_names(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.devices.iter().map(SimulatedDevice::name).collect())
    }

    fn load_driver(&self, name: &str) -> Option<Box<dyn AsioDriver>> {
        let device = self.devices.iter().find(|d| d.name() == name)?.clone();
        device.state().calls.push("load");
        Some(Box::new(SimulatedDriver { device }))
    }

    fn handle_lock(&self) -> &HandleLock {
        &self.handle
    }
}

/// Driver instance handed to the session.
pub struct SimulatedDriver {
    device: SimulatedDevice,
}

impl SimulatedDriver {
    fn record(&self, call: &'static str) -> MutexGuard<'_, SimState> {
        let mut st = self.device.state();
        st.calls.push(call);
        st
    }
}

impl AsioDriver for SimulatedDriver {
    fn init(&mut self, api_version: i32) -> DriverResult<DriverInfo> {
        let st = self.record("init");
        if st.config.fail_init {
            return Err(DriverError::NotPresent);
        }
        Ok(DriverInfo {
            name: st.config.name.clone(),
            version: api_version,
        })
    }

    fn channels(&self) -> DriverResult<ChannelCounts> {
        let st = self.device.state();
        if st.config.fail_channels {
            return Err(DriverError::HwMalfunction);
        }
        Ok(st.config.channels)
    }

    fn channel_info(&self, role: ChannelRole, channel: usize) -> DriverResult<ChannelInfo> {
        let counts = self.device.state().config.channels;
        let (available, prefix) = match role {
            ChannelRole::Input => (counts.inputs, "In"),
            ChannelRole::Output => (counts.outputs, "Out"),
        };
        if channel >= available {
            return Err(DriverError::InvalidParameter);
        }
        Ok(ChannelInfo {
            role,
            channel,
            name: format!("Sim {prefix} {}", channel + 1),
        })
    }

    fn sample_rate(&self) -> DriverResult<f64> {
        self.record("sample_rate").rate.ok_or(DriverError::NoClock)
    }

    fn set_sample_rate(&mut self, rate: f64) -> DriverResult<()> {
        let mut st = self.record("set_sample_rate");
        if st.config.fail_set_sample_rate || !(rate.is_finite() && rate > 0.0) {
            return Err(DriverError::NoClock);
        }
        if st.rate.is_some() {
            st.rate = Some(rate);
        }
        Ok(())
    }

    fn buffer_size_range(&self) -> DriverResult<BufferSizeRange> {
        self.record("buffer_size_range")
            .config
            .buffer_range
            .ok_or(DriverError::NotPresent)
    }

    fn create_buffers(
        &mut self,
        specs: &[ChannelSpec],
        frame_count: usize,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> DriverResult<Vec<BufferInfo>> {
        let mut st = self.record("create_buffers");
        if st.config.fail_create_buffers {
            return Err(DriverError::NoMemory);
        }
        if !st.buffers.is_empty() {
            return Err(DriverError::InvalidMode);
        }
        let counts = st.config.channels;
        for spec in specs {
            let available = match spec.role {
                ChannelRole::Input => counts.inputs,
                ChannelRole::Output => counts.outputs,
            };
            if spec.channel >= available {
                return Err(DriverError::InvalidParameter);
            }
        }

        st.buffers = specs
            .iter()
            .map(|spec| DoubleBuffer::zeroed(*spec, frame_count))
            .collect();
        st.callbacks = Some(callbacks);
        st.sample_position = 0;

        let null_half = st.config.null_half;
        Ok(st
            .buffers
            .iter()
            .enumerate()
            .map(|(pos, buf)| {
                let mut info = buf.info();
                if let Some((null_pos, half)) = null_half {
                    if null_pos == pos && half < 2 {
                        info.halves[half] = None;
                    }
                }
                info
            })
            .collect())
    }

    fn start(&mut self) -> DriverResult<()> {
        let mut st = self.record("start");
        if st.config.fail_start {
            return Err(DriverError::HwMalfunction);
        }
        if st.buffers.is_empty() || st.callbacks.is_none() {
            return Err(DriverError::InvalidMode);
        }
        if st.streaming {
            return Ok(());
        }
        if let Some(tone) = st.config.clock {
            let clock = spawn_clock(&st, tone)?;
            st.clock = Some(clock);
        }
        st.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> DriverResult<()> {
        let mut st = self.record("stop");
        st.streaming = false;
        // The clock thread never takes the device lock, so joining under it
        // keeps buffer access shut out until the last switch has returned.
        if let Some(clock) = st.clock.take() {
            clock.running.store(false, Ordering::Release);
            if clock.handle.join().is_err() {
                tracing::warn!("simulated clock thread panicked");
            }
        }
        Ok(())
    }

    fn dispose_buffers(&mut self) -> DriverResult<()> {
        let mut st = self.record("dispose_buffers");
        if st.streaming {
            return Err(DriverError::InvalidMode);
        }
        st.callbacks = None;
        st.buffers.clear();
        Ok(())
    }

    fn exit(&mut self) {
        self.record("exit");
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        self.device.state().calls.push("unload");
    }
}

/// Input half pointers moved onto the clock thread.
struct InputHalves([NonNull<i32>; 2]);

// Valid until dispose_buffers, which the driver refuses while the clock runs.
unsafe impl Send for InputHalves {}

fn spawn_clock(st: &SimState, tone: TestTone) -> DriverResult<Clock> {
    let input = st
        .buffers
        .iter()
        .find(|b| b.spec.role == ChannelRole::Input)
        .ok_or(DriverError::InvalidMode)?;
    let callbacks = st.callbacks.clone().ok_or(DriverError::InvalidMode)?;
    let halves = InputHalves([input.halves[0].as_ptr(), input.halves[1].as_ptr()]);
    let frames = input.halves[0].len();
    let rate = st.rate.unwrap_or(48_000.0) as f32;
    let period = Duration::from_secs_f64(frames as f64 / rate as f64);

    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let handle = std::thread::Builder::new()
        .name("redbox-sim-clock".to_string())
        .spawn(move || {
            let halves = halves;
            let step = TAU * tone.frequency / rate;
            let mut phase = 0.0f32;
            let mut position = 0u64;
            let mut half = 0usize;
            let mut deadline = Instant::now();
            while running_thread.load(Ordering::Acquire) {
                let dst = halves.0[half].as_ptr();
                for i in 0..frames {
                    let word = sample::encode(tone.amplitude * phase.sin());
                    unsafe { dst.add(i).write(word) };
                    phase = (phase + step) % TAU;
                }
                let time = TimeInfo {
                    sample_position: position,
                    system_time_ns: 0,
                };
                callbacks.buffer_switch(half, Some(&time));
                position += frames as u64;
                half ^= 1;

                deadline += period;
                if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
                    std::thread::sleep(wait);
                }
            }
        })
        .map_err(|_| DriverError::NoMemory)?;

    Ok(Clock { running, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackHub, EngineStats};

    fn loaded(config: SimulatedDeviceConfig) -> (SimulatedDevice, Box<dyn AsioDriver>) {
        let mut host = SimulatedHost::new();
        let device = host.add_device(config);
        let driver = host.load_driver(&device.name()).expect("driver registered");
        (device, driver)
    }

    #[test]
    fn unknown_name_does_not_load() {
        let mut host = SimulatedHost::new();
        host.add_device(SimulatedDeviceConfig::new("Test Device"));
        assert!(host.load_driver("Other").is_none());
        assert_eq!(host.driver_names().unwrap(), vec!["Test Device".to_string()]);
    }

    #[test]
    fn create_buffers_rejects_missing_channels() {
        let (_device, mut driver) = loaded(SimulatedDeviceConfig::new("Test Device"));
        let hub = CallbackHub::new(EngineStats::shared());
        let err = driver
            .create_buffers(&[ChannelSpec::output(5)], 64, hub)
            .unwrap_err();
        assert_eq!(err, DriverError::InvalidParameter);
    }

    #[test]
    fn null_half_injection_blanks_one_pointer() {
        let mut config = SimulatedDeviceConfig::new("Test Device");
        config.null_half = Some((1, 0));
        let (_device, mut driver) = loaded(config);
        let hub = CallbackHub::new(EngineStats::shared());
        let infos = driver
            .create_buffers(&[ChannelSpec::input(0), ChannelSpec::output(0)], 16, hub)
            .unwrap();
        assert!(infos[0].halves[0].is_some());
        assert!(infos[1].halves[0].is_none());
        assert!(infos[1].halves[1].is_some());
    }

    #[test]
    fn fire_requires_streaming() {
        let (device, mut driver) = loaded(SimulatedDeviceConfig::new("Test Device"));
        let stats = EngineStats::shared();
        let hub = CallbackHub::new(stats.clone());
        driver
            .create_buffers(&[ChannelSpec::input(0), ChannelSpec::output(0)], 16, hub)
            .unwrap();
        assert!(!device.fire(0));
        driver.start().unwrap();
        assert!(device.fire(0));
        driver.stop().unwrap();
        assert!(!device.fire(1));
        assert_eq!(stats.snapshot().callbacks, 1);
    }

    #[test]
    fn clock_delivers_switches_until_stopped() {
        let config = SimulatedDeviceConfig::new("Test Device").clocked(TestTone::default());
        let (device, mut driver) = loaded(config);
        let stats = EngineStats::shared();
        let hub = CallbackHub::new(stats.clone());
        driver
            .create_buffers(&[ChannelSpec::input(0), ChannelSpec::output(0)], 32, hub)
            .unwrap();
        driver.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.snapshot().callbacks < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        driver.stop().unwrap();
        let after_stop = stats.snapshot().callbacks;
        assert!(after_stop >= 3);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.snapshot().callbacks, after_stop);
        assert!(device.read_output(0, 0).is_some());
        assert!(!device.is_streaming());
        driver.dispose_buffers().unwrap();
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn dispose_is_refused_while_streaming() {
        let (_device, mut driver) = loaded(SimulatedDeviceConfig::new("Test Device"));
        let hub = CallbackHub::new(EngineStats::shared());
        driver
            .create_buffers(&[ChannelSpec::input(0), ChannelSpec::output(0)], 16, hub)
            .unwrap();
        driver.start().unwrap();
        assert_eq!(driver.dispose_buffers(), Err(DriverError::InvalidMode));
        driver.stop().unwrap();
        assert_eq!(driver.dispose_buffers(), Ok(()));
    }

    #[test]
    fn buffers_are_off_limits_while_clocked() {
        let config = SimulatedDeviceConfig::new("Test Device").clocked(TestTone::default());
        let (device, mut driver) = loaded(config);
        let hub = CallbackHub::new(EngineStats::shared());
        driver
            .create_buffers(&[ChannelSpec::input(0), ChannelSpec::output(0)], 32, hub)
            .unwrap();
        assert!(device.write_input(0, &[1; 32]));

        driver.start().unwrap();
        assert!(!device.write_input(0, &[1; 32]));
        assert_eq!(device.read_output(0, 0), None);
        assert!(!device.fire(0));

        driver.stop().unwrap();
        assert!(device.write_input(0, &[1; 32]));
        assert!(device.read_output(0, 0).is_some());
    }
}
