//! Driver backed by a cpal device.
//!
//! Emulates the vendor driver contract on top of cpal streams:
//! - the input stream packs the selected input channel into an `rtrb` ring
//! - the output stream is the double-buffer clock: at the start of each half
//!   it drains the ring into the input half, fires `buffer_switch`, then
//!   unpacks the output halves into the device buffer frame by frame
//!
//! With the `asio` feature on Windows the cpal ASIO host is used, so device
//! names are ASIO driver names. Elsewhere the platform default host is used.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::driver::{
    AsioDriver, BufferInfo, BufferSizeRange, ChannelCounts, ChannelInfo, ChannelRole,
    ChannelSpec, DoubleBuffer, DriverCallbacks, DriverHost, DriverInfo, HandleLock, TimeInfo,
};
use crate::error::{DriverError, DriverResult};
use crate::message::Selector;
use crate::sample;

/// Buffer size offered as preferred when the device has no opinion.
const PREFERRED_FRAMES: usize = 256;
/// Upper bound on advertised buffer sizes.
const MAX_FRAMES: usize = 16_384;

/// Host registry over cpal devices.
pub struct CpalHost {
    host_id: cpal::HostId,
    handle: HandleLock,
}

impl CpalHost {
    /// Use the ASIO host when built with the `asio` feature on Windows, the
    /// platform default otherwise.
    pub fn new() -> Result<Self> {
        #[cfg(all(target_os = "windows", feature = "asio"))]
        let host_id = {
            cpal::host_from_id(cpal::HostId::Asio).context("ASIO host unavailable")?;
            cpal::HostId::Asio
        };
        #[cfg(not(all(target_os = "windows", feature = "asio")))]
        let host_id = cpal::default_host().id();

        tracing::debug!(host = ?host_id, "audio host selected");
        Ok(Self {
            host_id,
            handle: HandleLock::new(),
        })
    }

    fn host(&self) -> Result<cpal::Host> {
        cpal::host_from_id(self.host_id).with_context(|| format!("host {:?}", self.host_id))
    }
}

impl DriverHost for CpalHost {
    /// Names usable with `load_driver`: output devices whose name also
    /// matches an input device. A driver here is always duplex.
    fn driver_names(&self) -> Result<Vec<String>> {
        let host = self.host()?;
        let outputs: Vec<String> = host
            .output_devices()
            .context("No output devices")?
            .filter_map(|d| device_name(&d))
            .collect();
        let inputs: Vec<String> = host
            .input_devices()
            .context("No input devices")?
            .filter_map(|d| device_name(&d))
            .collect();
        Ok(duplex_names(outputs, &inputs))
    }

    fn load_driver(&self, name: &str) -> Option<Box<dyn AsioDriver>> {
        let host = match self.host() {
            Ok(host) => host,
            Err(e) => {
                tracing::warn!("audio host unavailable: {e:#}");
                return None;
            }
        };
        let output = host
            .output_devices()
            .ok()?
            .find(|d| device_name(d).is_some_and(|n| matches_device_name(&n, name)))?;
        let input = host
            .input_devices()
            .ok()?
            .find(|d| device_name(d).is_some_and(|n| matches_device_name(&n, name)))?;
        let name = device_name(&output).unwrap_or_else(|| name.to_string());
        Some(Box::new(CpalDriver::new(name, input, output)))
    }

    fn handle_lock(&self) -> &HandleLock {
        &self.handle
    }
}

struct Streams {
    input: cpal::Stream,
    output: cpal::Stream,
}

struct Registration {
    specs: Vec<ChannelSpec>,
    frame_count: usize,
    callbacks: Arc<dyn DriverCallbacks>,
}

/// A duplex cpal device presented as a vendor driver.
pub struct CpalDriver {
    name: String,
    input: cpal::Device,
    output: cpal::Device,
    rate: Option<u32>,
    buffers: Vec<DoubleBuffer>,
    registration: Option<Registration>,
    streams: Option<Streams>,
    /// Raised by `start`, lowered by `stop`. Gates the output callback on
    /// backends that run streams as soon as they are built.
    live: Arc<AtomicBool>,
}

impl CpalDriver {
    fn new(name: String, input: cpal::Device, output: cpal::Device) -> Self {
        Self {
            name,
            input,
            output,
            rate: None,
            buffers: Vec::new(),
            registration: None,
            streams: None,
            live: Arc::new(AtomicBool::new(false)),
        }
    }

    fn current_rate(&self) -> DriverResult<u32> {
        if let Some(rate) = self.rate {
            return Ok(rate);
        }
        self.output
            .default_output_config()
            .map(|c| c.sample_rate())
            .map_err(|_| DriverError::NoClock)
    }

    fn build_streams(&self) -> DriverResult<Streams> {
        let reg = self.registration.as_ref().ok_or(DriverError::InvalidMode)?;
        let rate = self.current_rate()?;

        let in_ranges = self
            .input
            .supported_input_configs()
            .map_err(|_| DriverError::NotPresent)?;
        let in_supported = pick_config(in_ranges, rate).ok_or(DriverError::InvalidMode)?;
        let out_ranges = self
            .output
            .supported_output_configs()
            .map_err(|_| DriverError::NotPresent)?;
        let out_supported = pick_config(out_ranges, rate).ok_or(DriverError::InvalidMode)?;

        let in_config = stream_config(&in_supported, reg.frame_count);
        let out_config = stream_config(&out_supported, reg.frame_count);

        let input_spec = reg
            .specs
            .iter()
            .find(|s| s.role == ChannelRole::Input)
            .ok_or(DriverError::InvalidParameter)?;
        let input_halves = self
            .buffers
            .iter()
            .find(|b| b.spec == *input_spec)
            .map(|b| [b.halves[0].as_ptr(), b.halves[1].as_ptr()])
            .ok_or(DriverError::InvalidMode)?;
        let outputs = self
            .buffers
            .iter()
            .filter(|b| b.spec.role == ChannelRole::Output)
            .map(|b| (b.spec.channel, [b.halves[0].as_ptr(), b.halves[1].as_ptr()]))
            .collect();

        let (producer, consumer) = rtrb::RingBuffer::new(reg.frame_count * 4);
        let clock = ClockState {
            ring: consumer,
            input: input_halves,
            outputs,
            frame_count: reg.frame_count,
            cursor: 0,
            half: 0,
            position: 0,
            callbacks: reg.callbacks.clone(),
            live: self.live.clone(),
        };

        let input = match in_supported.sample_format() {
            cpal::SampleFormat::F32 => {
                build_input::<f32>(&self.input, &in_config, input_spec.channel, producer)
            }
            cpal::SampleFormat::I16 => {
                build_input::<i16>(&self.input, &in_config, input_spec.channel, producer)
            }
            cpal::SampleFormat::I32 => {
                build_input::<i32>(&self.input, &in_config, input_spec.channel, producer)
            }
            cpal::SampleFormat::U16 => {
                build_input::<u16>(&self.input, &in_config, input_spec.channel, producer)
            }
            other => {
                tracing::warn!(format = ?other, "unsupported input sample format");
                return Err(DriverError::InvalidMode);
            }
        }
        .map_err(|e| map_build_error(&e))?;

        let output = match out_supported.sample_format() {
            cpal::SampleFormat::F32 => build_output::<f32>(&self.output, &out_config, clock),
            cpal::SampleFormat::I16 => build_output::<i16>(&self.output, &out_config, clock),
            cpal::SampleFormat::I32 => build_output::<i32>(&self.output, &out_config, clock),
            cpal::SampleFormat::U16 => build_output::<u16>(&self.output, &out_config, clock),
            other => {
                tracing::warn!(format = ?other, "unsupported output sample format");
                return Err(DriverError::InvalidMode);
            }
        }
        .map_err(|e| map_build_error(&e))?;

        tracing::info!(
            device = %self.name,
            rate_hz = rate,
            frames = reg.frame_count,
            input_format = ?in_supported.sample_format(),
            output_format = ?out_supported.sample_format(),
            "device streams built"
        );
        Ok(Streams { input, output })
    }
}

impl AsioDriver for CpalDriver {
    fn init(&mut self, api_version: i32) -> DriverResult<DriverInfo> {
        self.output
            .default_output_config()
            .map_err(|_| DriverError::NotPresent)?;
        self.input
            .default_input_config()
            .map_err(|_| DriverError::NotPresent)?;
        Ok(DriverInfo {
            name: self.name.clone(),
            version: api_version,
        })
    }

    fn channels(&self) -> DriverResult<ChannelCounts> {
        let inputs = self
            .input
            .default_input_config()
            .map_err(|_| DriverError::NotPresent)?
            .channels() as usize;
        let outputs = self
            .output
            .default_output_config()
            .map_err(|_| DriverError::NotPresent)?
            .channels() as usize;
        Ok(ChannelCounts { inputs, outputs })
    }

    fn channel_info(&self, role: ChannelRole, channel: usize) -> DriverResult<ChannelInfo> {
        let counts = self.channels()?;
        let (available, label) = match role {
            ChannelRole::Input => (counts.inputs, "In"),
            ChannelRole::Output => (counts.outputs, "Out"),
        };
        if channel >= available {
            return Err(DriverError::InvalidParameter);
        }
        Ok(ChannelInfo {
            role,
            channel,
            name: format!("{} {label} {}", self.name, channel + 1),
        })
    }

    fn sample_rate(&self) -> DriverResult<f64> {
        self.current_rate().map(f64::from)
    }

    fn set_sample_rate(&mut self, rate: f64) -> DriverResult<()> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(DriverError::InvalidParameter);
        }
        let rate = rate.round() as u32;
        let out_ok = self
            .output
            .supported_output_configs()
            .map_err(|_| DriverError::NotPresent)?
            .any(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate());
        let in_ok = self
            .input
            .supported_input_configs()
            .map_err(|_| DriverError::NotPresent)?
            .any(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate());
        if !(out_ok && in_ok) {
            return Err(DriverError::NoClock);
        }
        self.rate = Some(rate);
        Ok(())
    }

    fn buffer_size_range(&self) -> DriverResult<BufferSizeRange> {
        let config = self
            .output
            .default_output_config()
            .map_err(|_| DriverError::NotPresent)?;
        match config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, max } => {
                let min = (*min as usize).max(1);
                let max = (*max as usize).clamp(min, MAX_FRAMES.max(min));
                Ok(BufferSizeRange {
                    min,
                    max,
                    preferred: PREFERRED_FRAMES.clamp(min, max),
                    granularity: 1,
                })
            }
            cpal::SupportedBufferSize::Unknown => Err(DriverError::NotPresent),
        }
    }

    fn create_buffers(
        &mut self,
        specs: &[ChannelSpec],
        frame_count: usize,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> DriverResult<Vec<BufferInfo>> {
        if self.registration.is_some() || frame_count == 0 {
            return Err(DriverError::InvalidMode);
        }
        let counts = self.channels()?;
        for spec in specs {
            let available = match spec.role {
                ChannelRole::Input => counts.inputs,
                ChannelRole::Output => counts.outputs,
            };
            if spec.channel >= available {
                return Err(DriverError::InvalidParameter);
            }
        }

        let engine_version = callbacks.message(Selector::EngineVersion as i64, 0);
        tracing::debug!(engine_version, "host callbacks registered");

        self.buffers = specs
            .iter()
            .map(|spec| DoubleBuffer::zeroed(*spec, frame_count))
            .collect();
        self.registration = Some(Registration {
            specs: specs.to_vec(),
            frame_count,
            callbacks,
        });

        match self.build_streams() {
            Ok(streams) => {
                // Some backends start a stream on build; hold it until start().
                if let Err(e) = streams.output.pause().and(streams.input.pause()) {
                    tracing::debug!("streams not paused after build: {e}");
                }
                self.streams = Some(streams);
            }
            Err(e) => {
                self.registration = None;
                self.buffers.clear();
                return Err(e);
            }
        }
        Ok(self.buffers.iter().map(DoubleBuffer::info).collect())
    }

    fn start(&mut self) -> DriverResult<()> {
        if self.streams.is_none() {
            self.streams = Some(self.build_streams()?);
        }
        let streams = self.streams.as_ref().ok_or(DriverError::InvalidMode)?;
        self.live.store(true, Ordering::Release);
        let played = streams.input.play().and(streams.output.play());
        if played.is_err() {
            self.live.store(false, Ordering::Release);
        }
        played.map_err(|_| DriverError::HwMalfunction)
    }

    fn stop(&mut self) -> DriverResult<()> {
        self.live.store(false, Ordering::Release);
        // Dropping the streams joins their callbacks; start() rebuilds them.
        if let Some(streams) = self.streams.take() {
            let paused = streams.output.pause().and(streams.input.pause());
            drop(streams);
            paused.map_err(|_| DriverError::HwMalfunction)?;
        }
        Ok(())
    }

    fn dispose_buffers(&mut self) -> DriverResult<()> {
        self.live.store(false, Ordering::Release);
        self.streams = None;
        self.registration = None;
        self.buffers.clear();
        Ok(())
    }

    fn exit(&mut self) {
        self.streams = None;
        self.registration = None;
        self.buffers.clear();
        self.rate = None;
    }
}

/// State owned by the output callback.
struct ClockState {
    ring: rtrb::Consumer<i32>,
    input: [NonNull<i32>; 2],
    outputs: Vec<(usize, [NonNull<i32>; 2])>,
    frame_count: usize,
    cursor: usize,
    half: usize,
    position: u64,
    callbacks: Arc<dyn DriverCallbacks>,
    live: Arc<AtomicBool>,
}

// The half pointers outlive the stream: buffers are only freed after the
// streams are dropped.
unsafe impl Send for ClockState {}

impl ClockState {
    /// Prepare the next device frame. `false` until the driver is started,
    /// in which case the frame is left silent and no switch is fired.
    fn tick(&mut self) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        if self.cursor == 0 {
            self.begin_half();
        }
        true
    }

    /// Fill the input half from the ring and hand the half to the host.
    fn begin_half(&mut self) {
        let dst = self.input[self.half].as_ptr();
        for i in 0..self.frame_count {
            let word = self.ring.pop().unwrap_or(0);
            unsafe { dst.add(i).write(word) };
        }
        let time = TimeInfo {
            sample_position: self.position,
            system_time_ns: 0,
        };
        self.callbacks.buffer_switch(self.half, Some(&time));
    }

    fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor == self.frame_count {
            self.cursor = 0;
            self.half ^= 1;
            self.position += self.frame_count as u64;
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channel: usize,
    mut ring: rtrb::Producer<i32>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = (config.channels as usize).max(1);
    let err_fn = |err| tracing::warn!("input stream error: {err}");
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                if let Some(x) = frame.get(channel) {
                    let word = sample::encode(<f32 as cpal::Sample>::from_sample(*x));
                    // A full ring means the output side stalled; drop the sample.
                    let _ = ring.push(word);
                }
            }
        },
        err_fn,
        None,
    )
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut clock: ClockState,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = (config.channels as usize).max(1);
    let err_fn = |err| tracing::warn!("output stream error: {err}");
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let silence = <T as cpal::Sample>::EQUILIBRIUM;
            for frame in data.chunks_mut(channels) {
                frame.fill(silence);
                if !clock.tick() {
                    continue;
                }
                for (device_ch, halves) in &clock.outputs {
                    if let Some(slot) = frame.get_mut(*device_ch) {
                        let word = unsafe { halves[clock.half].as_ptr().add(clock.cursor).read() };
                        *slot = <T as cpal::Sample>::from_sample::<f32>(sample::decode(word));
                    }
                }
                clock.advance();
            }
        },
        err_fn,
        None,
    )
}

fn stream_config(supported: &cpal::SupportedStreamConfig, frames: usize) -> cpal::StreamConfig {
    let mut config: cpal::StreamConfig = supported.config();
    if let cpal::SupportedBufferSize::Range { min, max } = supported.buffer_size() {
        let frames = frames as u32;
        if frames >= *min && frames <= *max {
            config.buffer_size = cpal::BufferSize::Fixed(frames);
        }
    }
    config
}

/// Pick the supported config at `rate` with the best sample format.
fn pick_config(
    ranges: impl Iterator<Item = cpal::SupportedStreamConfigRange>,
    rate: u32,
) -> Option<cpal::SupportedStreamConfig> {
    ranges
        .filter(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
        .min_by_key(|r| sample_format_rank(r.sample_format()))
        .map(|r| r.with_sample_rate(rate))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I32 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn map_build_error(err: &cpal::BuildStreamError) -> DriverError {
    tracing::warn!("stream build failed: {err}");
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => DriverError::NotPresent,
        cpal::BuildStreamError::StreamConfigNotSupported => DriverError::InvalidMode,
        _ => DriverError::HwMalfunction,
    }
}

fn device_name(device: &cpal::Device) -> Option<String> {
    device.description().ok().map(|d| d.name().to_string())
}

fn duplex_names(outputs: Vec<String>, inputs: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in outputs {
        let has_input = inputs.iter().any(|i| matches_device_name(i, &name));
        if has_input && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("Focusrite USB ASIO", "focusrite usb"));
        assert!(matches_device_name("focusrite usb asio", "ASIO"));
        assert!(!matches_device_name("Focusrite USB ASIO", "RME"));
        assert!(!matches_device_name("Focusrite USB ASIO", "  "));
    }

    #[test]
    fn integer_formats_rank_first() {
        assert!(sample_format_rank(cpal::SampleFormat::I32) < sample_format_rank(cpal::SampleFormat::F32));
        assert!(sample_format_rank(cpal::SampleFormat::F32) < sample_format_rank(cpal::SampleFormat::I16));
        assert!(sample_format_rank(cpal::SampleFormat::U16) < sample_format_rank(cpal::SampleFormat::U8));
    }

    struct Recorder {
        switches: std::sync::Mutex<Vec<usize>>,
    }

    impl DriverCallbacks for Recorder {
        fn buffer_switch(&self, half: usize, _time: Option<&TimeInfo>) {
            self.switches.lock().unwrap().push(half);
        }

        fn message(&self, _selector: i64, _value: i64) -> i64 {
            0
        }
    }

    fn clock_state(
        input: &DoubleBuffer,
        ring: rtrb::Consumer<i32>,
        live: bool,
    ) -> (ClockState, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            switches: std::sync::Mutex::new(Vec::new()),
        });
        let state = ClockState {
            ring,
            input: [input.halves[0].as_ptr(), input.halves[1].as_ptr()],
            outputs: Vec::new(),
            frame_count: input.halves[0].len(),
            cursor: 0,
            half: 0,
            position: 0,
            callbacks: recorder.clone(),
            live: Arc::new(AtomicBool::new(live)),
        };
        (state, recorder)
    }

    #[test]
    fn duplex_names_need_a_matching_input() {
        let outputs = vec![
            "Speakers".to_string(),
            "Focusrite USB ASIO".to_string(),
            "Focusrite USB ASIO".to_string(),
        ];
        let inputs = vec!["Microphone".to_string(), "Focusrite USB ASIO".to_string()];
        assert_eq!(duplex_names(outputs, &inputs), vec!["Focusrite USB ASIO"]);
    }

    #[test]
    fn clock_alternates_halves_and_drains_ring() {
        let input = DoubleBuffer::zeroed(ChannelSpec::input(0), 2);
        let (mut producer, consumer) = rtrb::RingBuffer::new(8);
        for w in [10, 20, 30] {
            producer.push(w).unwrap();
        }
        let (mut clock, recorder) = clock_state(&input, consumer, true);

        for _ in 0..4 {
            assert!(clock.tick());
            clock.advance();
        }

        assert_eq!(*recorder.switches.lock().unwrap(), vec![0, 1]);
        assert_eq!(input.halves[0].to_vec(), vec![10, 20]);
        // Ring ran dry half way through the second half.
        assert_eq!(input.halves[1].to_vec(), vec![30, 0]);
        assert_eq!(clock.position, 4);
    }

    #[test]
    fn clock_holds_switches_until_started() {
        let input = DoubleBuffer::zeroed(ChannelSpec::input(0), 2);
        let (mut producer, consumer) = rtrb::RingBuffer::new(8);
        producer.push(42).unwrap();
        let (mut clock, recorder) = clock_state(&input, consumer, false);

        for _ in 0..4 {
            assert!(!clock.tick());
        }
        assert!(recorder.switches.lock().unwrap().is_empty());
        assert_eq!(input.halves[0].to_vec(), vec![0, 0]);

        clock.live.store(true, Ordering::Release);
        assert!(clock.tick());
        assert_eq!(*recorder.switches.lock().unwrap(), vec![0]);
        assert_eq!(input.halves[0].to_vec(), vec![42, 0]);
    }
}
