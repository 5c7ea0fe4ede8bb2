//! Driver session manager.
//!
//! Owns the driver handle and walks it through the lifecycle:
//!
//! ```text
//! Unloaded → Loaded → Initialized → FormatNegotiated → BuffersCreated ⇄ Streaming
//!                                                            ↑            ↓
//!                                                            └─ Stopped ←─┘
//! any state ──release()──► Released (terminal)
//! ```
//!
//! Everything the real-time callback reads is published once, at buffer
//! creation, before `start()`. Teardown runs in reverse order of acquisition
//! (stop, dispose buffers, exit, drop handle) so no callback can observe freed
//! buffer memory.

use std::fmt;
use std::sync::Arc;

use crate::buffers::{ChannelBufferSet, ChannelTopology};
use crate::callback::{CallbackHub, EngineStats, StatsSnapshot, StreamEngine};
use crate::driver::{
    API_VERSION, AsioDriver, BufferSizeRange, ChannelInfo, ChannelRole, DriverHost, DriverInfo,
};
use crate::error::SessionError;
use crate::message;
use crate::transform::{Identity, SampleTransform};

/// Rate assumed when the driver cannot report one.
pub const DEFAULT_SAMPLE_RATE: f64 = 48_000.0;

/// Lifecycle position of a [`DriverSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Unloaded,
    Loaded,
    Initialized,
    FormatNegotiated,
    BuffersCreated,
    Streaming,
    Stopped,
    Released,
}

/// Where the negotiated sample rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSource {
    Reported,
    /// The driver could not report a rate; [`DEFAULT_SAMPLE_RATE`] is in use.
    Default,
}

/// Result of [`DriverSession::negotiate_format`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiatedFormat {
    pub sample_rate: f64,
    pub rate_source: RateSource,
    pub buffer_range: BufferSizeRange,
}

/// One open connection to a named driver.
pub struct DriverSession {
    host: Arc<dyn DriverHost>,
    driver: Option<Box<dyn AsioDriver>>,
    leased: bool,
    state: SessionState,
    driver_name: Option<String>,
    format: Option<NegotiatedFormat>,
    frame_count: usize,
    buffer_sets: Vec<ChannelBufferSet>,
    transform: Option<Box<dyn SampleTransform>>,
    hub: Option<Arc<CallbackHub>>,
    stats: Arc<EngineStats>,
}

impl fmt::Debug for DriverSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverSession")
            .field("state", &self.state)
            .field("driver_name", &self.driver_name)
            .field("format", &self.format)
            .field("frame_count", &self.frame_count)
            .finish_non_exhaustive()
    }
}

impl DriverSession {
    pub fn new(host: Arc<dyn DriverHost>) -> Self {
        Self {
            host,
            driver: None,
            leased: false,
            state: SessionState::Unloaded,
            driver_name: None,
            format: None,
            frame_count: 0,
            buffer_sets: Vec::new(),
            transform: Some(Box::new(Identity)),
            hub: None,
            stats: EngineStats::shared(),
        }
    }

    /// Replace the passthrough with `transform`. Takes effect at buffer creation.
    pub fn with_transform(mut self, transform: impl SampleTransform + 'static) -> Self {
        self.transform = Some(Box::new(transform));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn driver_name(&self) -> Option<&str> {
        self.driver_name.as_deref()
    }

    pub fn sample_rate(&self) -> Option<f64> {
        self.format.map(|f| f.sample_rate)
    }

    pub fn buffer_range(&self) -> Option<BufferSizeRange> {
        self.format.map(|f| f.buffer_range)
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Number of channels with allocated buffers.
    pub fn channel_count(&self) -> usize {
        self.buffer_sets.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn has_handle(&self) -> bool {
        self.driver.is_some()
    }

    fn require(&self, op: &'static str, allowed: &[SessionState]) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn driver_mut(
        &mut self,
        op: &'static str,
    ) -> Result<&mut (dyn AsioDriver + 'static), SessionError> {
        let state = self.state;
        self.driver
            .as_deref_mut()
            .ok_or(SessionError::InvalidState { op, state })
    }

    /// Acquire the host's driver handle and load `name`.
    pub fn load(&mut self, name: &str) -> Result<(), SessionError> {
        self.require("load", &[SessionState::Unloaded])?;
        if !self.host.handle_lock().try_acquire() {
            return Err(SessionError::HandleBusy);
        }
        self.leased = true;

        match self.host.load_driver(name) {
            Some(driver) => {
                self.driver = Some(driver);
                self.driver_name = Some(name.to_string());
                self.state = SessionState::Loaded;
                tracing::info!(driver = %name, "driver loaded");
                Ok(())
            }
            None => {
                tracing::error!(driver = %name, "failed to load driver");
                self.release();
                Err(SessionError::DriverNotFound {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Handshake with the driver.
    pub fn initialize(&mut self) -> Result<DriverInfo, SessionError> {
        self.require("initialize", &[SessionState::Loaded])?;
        let result = self.driver_mut("initialize")?.init(API_VERSION);
        match result {
            Ok(info) => {
                tracing::info!(driver = %info.name, version = info.version, "driver initialized");
                self.state = SessionState::Initialized;
                Ok(info)
            }
            Err(source) => {
                tracing::error!(code = source.code(), "driver init failed: {source}");
                self.release();
                Err(SessionError::InitializationFailed { source })
            }
        }
    }

    /// Settle the sample rate and query buffer bounds.
    ///
    /// A driver that cannot set or report its rate is tolerated: the session
    /// falls back to [`DEFAULT_SAMPLE_RATE`]. A driver that cannot report
    /// buffer bounds is not, since buffer creation has no safe default.
    pub fn negotiate_format(
        &mut self,
        desired_rate: Option<f64>,
    ) -> Result<NegotiatedFormat, SessionError> {
        self.require("negotiate_format", &[SessionState::Initialized])?;
        let driver = self.driver_mut("negotiate_format")?;

        if let Some(rate) = desired_rate {
            if let Err(e) = driver.set_sample_rate(rate) {
                tracing::warn!(rate_hz = rate, code = e.code(), "set sample rate failed: {e}");
            }
        }

        let (sample_rate, rate_source) = match driver.sample_rate() {
            Ok(rate) => (rate, RateSource::Reported),
            Err(e) => {
                tracing::warn!(
                    fallback_hz = DEFAULT_SAMPLE_RATE,
                    code = e.code(),
                    "sample rate unreported, using default"
                );
                (DEFAULT_SAMPLE_RATE, RateSource::Default)
            }
        };

        let buffer_range = match driver.buffer_size_range() {
            Ok(range) => range,
            Err(source) => {
                tracing::error!(code = source.code(), "buffer size range query failed: {source}");
                self.release();
                return Err(SessionError::BufferRangeUnavailable { source });
            }
        };

        tracing::info!(
            rate_hz = sample_rate,
            min = buffer_range.min,
            max = buffer_range.max,
            preferred = buffer_range.preferred,
            granularity = buffer_range.granularity,
            "format negotiated"
        );
        let format = NegotiatedFormat {
            sample_rate,
            rate_source,
            buffer_range,
        };
        self.format = Some(format);
        self.state = SessionState::FormatNegotiated;
        Ok(format)
    }

    /// Names of the channels the driver exposes. Valid once initialized.
    pub fn channel_infos(&self) -> Result<Vec<ChannelInfo>, SessionError> {
        let state = self.state;
        let invalid = SessionError::InvalidState {
            op: "channel_infos",
            state,
        };
        if state < SessionState::Initialized || state == SessionState::Released {
            return Err(invalid);
        }
        let driver = self.driver.as_ref().ok_or(invalid)?;
        let counts = driver.channels().map_err(|source| {
            tracing::error!(code = source.code(), "channel count query failed: {source}");
            SessionError::ChannelQueryFailed { source }
        })?;
        let mut infos = Vec::with_capacity(counts.inputs + counts.outputs);
        for (role, count) in [
            (ChannelRole::Input, counts.inputs),
            (ChannelRole::Output, counts.outputs),
        ] {
            for channel in 0..count {
                match driver.channel_info(role, channel) {
                    Ok(info) => infos.push(info),
                    Err(e) => tracing::warn!(?role, channel, "channel info unavailable: {e}"),
                }
            }
        }
        Ok(infos)
    }

    /// Allocate the driver's double buffers for `topology` and publish the
    /// callback engine.
    ///
    /// `frame_count` must lie within the negotiated range and is passed to
    /// the driver unchanged.
    pub fn create_buffers(
        &mut self,
        topology: &ChannelTopology,
        frame_count: usize,
    ) -> Result<(), SessionError> {
        self.require("create_buffers", &[SessionState::FormatNegotiated])?;
        match self.try_create_buffers(topology, frame_count) {
            Ok(()) => {
                tracing::info!(
                    channels = self.buffer_sets.len(),
                    frames = frame_count,
                    "buffers created"
                );
                self.state = SessionState::BuffersCreated;
                Ok(())
            }
            Err(reason) => {
                tracing::error!(frames = frame_count, "buffer creation failed: {reason}");
                self.release();
                Err(SessionError::BufferCreationFailed { reason })
            }
        }
    }

    fn try_create_buffers(
        &mut self,
        topology: &ChannelTopology,
        frame_count: usize,
    ) -> Result<(), String> {
        let range = self
            .format
            .map(|f| f.buffer_range)
            .ok_or_else(|| "format not negotiated".to_string())?;
        if !range.contains(frame_count) {
            return Err(format!(
                "{frame_count} frames outside driver range {}..={}",
                range.min, range.max
            ));
        }
        if let Err(selector) = message::validate_table() {
            return Err(format!("message table has no single entry for {selector:?}"));
        }
        let transform = self
            .transform
            .take()
            .ok_or_else(|| "sample transform already consumed".to_string())?;

        let hub = CallbackHub::new(self.stats.clone());
        let specs = topology.specs();
        let driver = self
            .driver
            .as_mut()
            .ok_or_else(|| "driver not loaded".to_string())?;
        let infos = driver
            .create_buffers(&specs, frame_count, hub.clone())
            .map_err(|e| format!("driver refused: {e} ({})", e.code()))?;

        // Buffers exist from here on; record them so release disposes them.
        self.hub = Some(hub.clone());
        self.buffer_sets = infos.into_iter().map(ChannelBufferSet::from).collect();
        if self.buffer_sets.len() != specs.len() {
            return Err(format!(
                "driver returned {} buffers for {} channels",
                self.buffer_sets.len(),
                specs.len()
            ));
        }
        for (set, spec) in self.buffer_sets.iter().zip(&specs) {
            if set.role() != spec.role || set.channel() != spec.channel {
                return Err(format!(
                    "driver returned {:?} {} for requested {:?} {}",
                    set.role(),
                    set.channel(),
                    spec.role,
                    spec.channel
                ));
            }
        }

        let input = self.buffer_sets[0];
        let outputs = self.buffer_sets[1..].to_vec();
        let engine = StreamEngine::new(input, outputs, frame_count, transform, self.stats.clone());
        if hub.publish(engine).is_err() {
            return Err("callback engine already published".to_string());
        }

        self.frame_count = frame_count;
        Ok(())
    }

    /// Start streaming.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.require("start", &[SessionState::BuffersCreated, SessionState::Stopped])?;
        let result = self.driver_mut("start")?.start();
        match result {
            Ok(()) => {
                self.state = SessionState::Streaming;
                tracing::info!(frames = self.frame_count, "stream started");
                Ok(())
            }
            Err(source) => {
                tracing::error!(code = source.code(), "stream start failed: {source}");
                self.release();
                Err(SessionError::StreamStartFailed { source })
            }
        }
    }

    /// Stop streaming. A no-op unless the stream is live.
    pub fn stop(&mut self) {
        if self.state != SessionState::Streaming {
            return;
        }
        if let Some(driver) = self.driver.as_mut() {
            if let Err(e) = driver.stop() {
                tracing::warn!(code = e.code(), "driver stop reported: {e}");
            }
        }
        self.state = SessionState::Stopped;
        let stats = self.stats.snapshot();
        tracing::info!(
            callbacks = stats.callbacks,
            processed = stats.processed_halves,
            skipped = stats.skipped_halves,
            frames = stats.frames,
            "stream stopped"
        );
    }

    /// Tear everything down in reverse order of acquisition. Idempotent.
    pub fn release(&mut self) {
        if self.state == SessionState::Released {
            return;
        }
        self.stop();

        if let Some(driver) = self.driver.as_mut() {
            if self.hub.is_some() || !self.buffer_sets.is_empty() {
                if let Err(e) = driver.dispose_buffers() {
                    tracing::warn!(code = e.code(), "dispose buffers reported: {e}");
                }
            }
            if self.state >= SessionState::Initialized {
                driver.exit();
            }
        }
        self.buffer_sets.clear();
        self.hub = None;

        if self.driver.take().is_some() {
            tracing::debug!(driver = ?self.driver_name, "driver handle released");
        }
        if self.leased {
            self.host.handle_lock().release();
            self.leased = false;
        }
        self.state = SessionState::Released;
    }
}

impl Drop for DriverSession {
    fn drop(&mut self) {
        self.release();
    }
}
