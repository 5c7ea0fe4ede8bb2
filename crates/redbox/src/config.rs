use anyhow::{Result, bail};
use redbox_engine::config::DEFAULT_DRIVER_NAME;
use redbox_engine::{ChannelTopology, RouterConfig};

use crate::cli::Args;

/// Everything a run needs, resolved from the command line.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub router: RouterConfig,
    pub simulate: bool,
}

impl RunConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        if !(args.sample_rate.is_finite() && args.sample_rate > 0.0) {
            bail!("invalid sample rate {}", args.sample_rate);
        }
        if args.buffer_frames == Some(0) {
            bail!("buffer frames must be positive");
        }
        let topology = if args.mono {
            ChannelTopology::mono()
        } else {
            ChannelTopology::stereo()
        };
        Ok(Self {
            router: RouterConfig {
                driver_name: normalize_driver_name(&args.driver),
                sample_rate: Some(args.sample_rate),
                buffer_frames: args.buffer_frames,
                topology,
            },
            simulate: args.simulate,
        })
    }
}

fn normalize_driver_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        DEFAULT_DRIVER_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}
