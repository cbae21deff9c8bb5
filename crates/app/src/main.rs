use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver};
use render_host_core::{
    ChannelObserver, EngineConfig, EngineController, EngineError, EngineRegistry, HostKind,
    Notification, NotificationId, SimulatedEngine,
};
use tracing_subscriber::EnvFilter;

fn main() -> render_host_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration_ms,
            emulated,
            record,
            fail_first,
        } => {
            let mut config = match config {
                Some(path) => EngineConfig::load(path)?,
                None => EngineConfig::default(),
            };
            if emulated {
                config.host = HostKind::Emulated;
            }
            run(config, Duration::from_millis(duration_ms), record, fail_first)
        }
        Commands::Config => {
            println!("{}", EngineConfig::default().to_json_pretty()?);
            Ok(())
        }
    }
}

fn run(
    config: EngineConfig,
    duration: Duration,
    record: Option<PathBuf>,
    fail_first: u32,
) -> render_host_core::Result<()> {
    tracing::info!(?duration, ?record, "starting render host");

    let engine = Arc::new(SimulatedEngine::new());
    engine.fail_next_runs(fail_first);

    let registry = EngineRegistry::new();
    let (tx, rx) = unbounded();
    let controller =
        EngineController::with_observer(&registry, engine.clone(), Arc::new(ChannelObserver::new(tx)))?;
    controller.create(config)?;

    if let Some(sequencer) = controller.sequencer()? {
        sequencer.set_playing(true)?;
    }
    if let Some(path) = &record {
        controller.start_output_recording(path)?;
    }
    controller.start()?;

    handle_notifications(&controller, &rx, Instant::now() + duration)?;

    if record.is_some() {
        controller.stop_output_recording();
    }

    let (done_tx, done_rx) = unbounded();
    controller.run_when_idle(move || {
        tracing::info!("releasing scheduled events between buffers");
        let _ = done_tx.send(());
    })?;
    if done_rx.recv_timeout(Duration::from_secs(1)).is_err() {
        tracing::warn!("engine did not report idle before shutdown");
    }

    controller.pause()?;
    controller.dispose()?;
    tracing::info!(
        render_calls = controller.render_calls(),
        buffers = engine.buffers_rendered(),
        "render host finished"
    );
    Ok(())
}

/// Handles notifications on the main thread until `deadline`, restarting the
/// engine after hardware errors while retries remain.
fn handle_notifications(
    controller: &EngineController,
    rx: &Receiver<Notification>,
    deadline: Instant,
) -> render_host_core::Result<()> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Ok(notification) = rx.recv_timeout(remaining) else {
            return Ok(());
        };

        match notification {
            Notification::Bare {
                id: NotificationId::HardwareUnavailable,
            } => {
                if !controller.can_restart()? {
                    return Err(EngineError::msg(
                        "audio hardware unavailable and restart attempts are exhausted",
                    ));
                }
                tracing::warn!("audio hardware unavailable; restarting engine");
                controller.start()?;
            }
            Notification::Bare {
                id: NotificationId::ThreadStartFailed,
            } => tracing::warn!("render thread failed to start in time"),
            Notification::WithValue {
                id: NotificationId::RecordedSnippetReady,
                value,
            } => controller.save_recorded_snippet(value),
            Notification::WithValue {
                id: NotificationId::SequencerPositionUpdated,
                value,
            } => tracing::trace!(buffer_offset = value, "sequencer step"),
            other => tracing::info!(notification = ?other, "engine notification"),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drives the audio render engine lifecycle", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine against the simulated native layer.
    Run {
        /// JSON configuration file; defaults apply to missing fields.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// How long to keep the engine playing.
        #[arg(short, long, default_value_t = 2_000)]
        duration_ms: u64,
        /// Pretend to run on an emulated host.
        #[arg(long)]
        emulated: bool,
        /// Record the engine output to this file.
        #[arg(short, long)]
        record: Option<PathBuf>,
        /// Number of render calls that fail with a hardware error.
        #[arg(long, default_value_t = 0)]
        fail_first: u32,
    },
    /// Print the default configuration as JSON.
    Config,
}
