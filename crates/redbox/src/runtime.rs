//! Router runtime.
//!
//! Drives one session through its lifecycle, waits for a shutdown signal,
//! then stops and releases. Also hosts the listing commands.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use redbox_engine::callback::StatsSnapshot;
use redbox_engine::cpal_driver::CpalHost;
use redbox_engine::driver::{ChannelRole, DriverHost};
use redbox_engine::sim::{SimulatedDeviceConfig, SimulatedHost, TestTone};
use redbox_engine::{DriverSession, RouterConfig};

use crate::cli::Args;
use crate::config::RunConfig;

/// Entry point for the binary once logging is up.
pub fn run_cli(args: Args) -> Result<()> {
    let config = RunConfig::from_args(&args)?;
    let host = make_host(&config)?;

    if args.list_drivers {
        return list_drivers(host.as_ref());
    }
    if args.list_channels {
        return list_channels(host, &config.router.driver_name);
    }

    let shutdown = shutdown_signal();
    let stats = run_router(host, &config.router, &shutdown)?;
    tracing::info!(
        callbacks = stats.callbacks,
        processed = stats.processed_halves,
        skipped = stats.skipped_halves,
        frames = stats.frames,
        "router stopped"
    );
    Ok(())
}

fn make_host(config: &RunConfig) -> Result<Arc<dyn DriverHost>> {
    if config.simulate {
        return Ok(simulated_host(&config.router.driver_name, true));
    }
    Ok(Arc::new(CpalHost::new().context("open audio host")?))
}

/// A host with one simulated device registered under `name`.
pub fn simulated_host(name: &str, clocked: bool) -> Arc<dyn DriverHost> {
    let mut config = SimulatedDeviceConfig::new(name);
    if clocked {
        config = config.clocked(TestTone::default());
    }
    let mut host = SimulatedHost::new();
    host.add_device(config);
    Arc::new(host)
}

/// Print the names of installed drivers to stdout.
pub fn list_drivers(host: &dyn DriverHost) -> Result<()> {
    let names = host.driver_names().context("enumerate drivers")?;
    if names.is_empty() {
        println!("no drivers found");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

/// Print every channel of driver `name` to stdout.
pub fn list_channels(host: Arc<dyn DriverHost>, name: &str) -> Result<()> {
    let mut session = DriverSession::new(host);
    session
        .load(name)
        .with_context(|| format!("load driver {name:?}"))?;
    let info = session.initialize().context("initialize driver")?;
    println!("{} (version {})", info.name, info.version);
    for ch in session.channel_infos().context("query channels")? {
        let role = match ch.role {
            ChannelRole::Input => "in ",
            ChannelRole::Output => "out",
        };
        println!("  {role} {:>2}  {}", ch.channel + 1, ch.name);
    }
    session.release();
    Ok(())
}

/// Run the full lifecycle and block until `shutdown` fires.
///
/// Any stage failure leaves the session released before the error is
/// returned.
pub fn run_router(
    host: Arc<dyn DriverHost>,
    config: &RouterConfig,
    shutdown: &Receiver<()>,
) -> Result<StatsSnapshot> {
    let mut session = DriverSession::new(host);

    session
        .load(&config.driver_name)
        .with_context(|| format!("load driver {:?}", config.driver_name))?;
    session.initialize().context("initialize driver")?;

    let format = session
        .negotiate_format(config.sample_rate)
        .context("negotiate format")?;
    let frames = config.frames_for(&format.buffer_range);
    session
        .create_buffers(&config.topology, frames)
        .with_context(|| format!("create buffers ({frames} frames)"))?;
    tracing::info!(
        input = config.topology.input(),
        outputs = ?config.topology.outputs(),
        frames,
        rate_hz = format.sample_rate,
        "routing ready"
    );

    session.start().context("start stream")?;
    println!("stream started, press ENTER to stop");

    if shutdown.recv().is_err() {
        tracing::warn!("shutdown channel closed");
    }

    session.stop();
    let stats = session.stats();
    session.release();
    Ok(stats)
}

/// Fires once on a line from stdin or on Ctrl-C.
pub fn shutdown_signal() -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(2);
    spawn_stdin_watcher(tx.clone());
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }
    rx
}

fn spawn_stdin_watcher(tx: Sender<()>) {
    let spawned = std::thread::Builder::new()
        .name("redbox-stdin".to_string())
        .spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            let _ = tx.try_send(());
        });
    if let Err(e) = spawned {
        tracing::warn!("stdin watcher not started: {e}");
    }
}
