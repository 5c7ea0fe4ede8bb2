//! redbox: route one input channel of an ASIO driver to one or two outputs.
//!
//! ## Lifecycle
//! 1. **Load** the named driver, holding the host's single driver handle.
//! 2. **Initialize** and **negotiate** the sample rate and buffer bounds.
//! 3. **Create buffers** for the input and outputs and publish the callback engine.
//! 4. **Start**; the driver thread calls back once per buffer half, and each
//!    half is decoded, transformed and re-encoded onto every output.
//! 5. On ENTER or Ctrl-C, **stop** and **release** in reverse order.
//!
//! Any stage failure releases the driver and exits with status 1.

use std::process::ExitCode;

use clap::Parser;
use redbox::{cli, runtime};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,redbox=info")),
        )
        .init();

    match runtime::run_cli(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("redbox: {e:#}");
            ExitCode::from(1)
        }
    }
}
