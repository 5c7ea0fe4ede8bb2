use clap::Parser;
use redbox_engine::config::DEFAULT_DRIVER_NAME;
use redbox_engine::session::DEFAULT_SAMPLE_RATE;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

/// Route one input channel of an ASIO driver to its outputs.
#[derive(Parser, Debug)]
#[command(name = "redbox", version = VERSION)]
pub struct Args {
    /// Driver to load, by registry name
    #[arg(long, default_value = DEFAULT_DRIVER_NAME)]
    pub driver: String,

    /// Sample rate to request from the driver (Hz)
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: f64,

    /// Frames per buffer half (defaults to the driver's preferred size)
    #[arg(long)]
    pub buffer_frames: Option<usize>,

    /// Route input 1 to output 1 only instead of outputs 1 and 2
    #[arg(long)]
    pub mono: bool,

    /// Use the built-in simulated driver instead of hardware
    #[arg(long)]
    pub simulate: bool,

    /// List installed drivers and exit
    #[arg(long)]
    pub list_drivers: bool,

    /// List the selected driver's channels and exit
    #[arg(long)]
    pub list_channels: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_router_defaults() {
        let args = Args::try_parse_from(["redbox"]).unwrap();
        assert_eq!(args.driver, "Focusrite USB ASIO");
        assert_eq!(args.sample_rate, 48_000.0);
        assert_eq!(args.buffer_frames, None);
        assert!(!args.mono && !args.simulate);
    }

    #[test]
    fn parses_routing_flags() {
        let args = Args::try_parse_from([
            "redbox",
            "--driver",
            "ASIO4ALL v2",
            "--sample-rate",
            "44100",
            "--buffer-frames",
            "128",
            "--mono",
            "--simulate",
        ])
        .unwrap();
        assert_eq!(args.driver, "ASIO4ALL v2");
        assert_eq!(args.sample_rate, 44_100.0);
        assert_eq!(args.buffer_frames, Some(128));
        assert!(args.mono);
        assert!(args.simulate);
    }

    #[test]
    fn rejects_non_numeric_frames() {
        assert!(Args::try_parse_from(["redbox", "--buffer-frames", "lots"]).is_err());
    }
}
