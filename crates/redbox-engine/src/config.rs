use crate::buffers::ChannelTopology;
use crate::driver::BufferSizeRange;

/// Driver loaded when none is named.
pub const DEFAULT_DRIVER_NAME: &str = "Focusrite USB ASIO";

/// Routing parameters for one run.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Driver to load, by registry name.
    pub driver_name: String,
    /// Rate to request from the driver; `None` keeps the driver's current rate.
    pub sample_rate: Option<f64>,
    /// Frames per buffer half; `None` uses the driver's preferred size.
    pub buffer_frames: Option<usize>,
    pub topology: ChannelTopology,
}

impl RouterConfig {
    /// Frames to request given the driver's reported bounds.
    pub fn frames_for(&self, range: &BufferSizeRange) -> usize {
        self.buffer_frames.unwrap_or(range.preferred)
    }
}

impl Default for RouterConfig {
    /// Stereo passthrough at 48 kHz on the default driver.
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            sample_rate: Some(48_000.0),
            buffer_frames: None,
            topology: ChannelTopology::stereo(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_default_to_preferred() {
        let range = BufferSizeRange {
            min: 64,
            max: 1024,
            preferred: 256,
            granularity: 1,
        };
        let mut config = RouterConfig::default();
        assert_eq!(config.frames_for(&range), 256);
        config.buffer_frames = Some(128);
        assert_eq!(config.frames_for(&range), 128);
    }
}
