//! # Grievance Call Client - Console Entry Point
//!
//! Starts the call session against the configured grievance service and drives
//! it from the terminal.
//!
//! ## Startup:
//! 1. **Environment**: `.env` is loaded if present
//! 2. **Logging**: `tracing` to stderr, filtered by `RUST_LOG`
//! 3. **Configuration**: defaults, `config.toml`, then `APP__*` variables (validated)
//! 4. **Session**: spawned with the `cpal` audio backend and the WebSocket dialer
//! 5. **Console**: commands read from stdin; changes printed as they happen
//!
//! ## Shutdown:
//! `quit`, end of input, or Ctrl-C. Any active call is hung up first.

use anyhow::Result;
use grievance_call_client::audio::backend::CpalBackend;
use grievance_call_client::channel::WebSocketDialer;
use grievance_call_client::console::{self, ConsoleCommand};
use grievance_call_client::{dialpad, session, AppConfig, CallSettings, SessionHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting grievance-call-client v{}", env!("CARGO_PKG_VERSION"));
    let settings = CallSettings::from_config(&config)?;
    info!("Service channel: {}", settings.channel_url);

    let backend = Arc::new(CpalBackend::new(
        config.audio.input_device.clone(),
        config.audio.output_device.clone(),
    ));
    let dialer = Arc::new(WebSocketDialer::new(
        config.connect_timeout(),
        config.audio.outbound_queue_frames,
    ));
    let (handle, session_task) = session::spawn(settings, backend, dialer);
    let renderer = tokio::spawn(console::render(handle.subscribe()));

    println!("{}", console::help_text(&config.dialpad.hotline));

    let mut lines = spawn_stdin_reader();
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    if !run_command(&line, &handle, &config)? {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    handle.shutdown()?;
    session_task.await?;
    renderer.abort();

    info!("Call client stopped");
    Ok(())
}

/// Execute one console line. Returns `false` when the user asked to quit.
fn run_command(line: &str, handle: &SessionHandle, config: &AppConfig) -> Result<bool> {
    let command = match ConsoleCommand::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(true),
        Err(message) => {
            println!("{}", message);
            return Ok(true);
        }
    };

    match command {
        ConsoleCommand::Dial(number) => match dialpad::check_dialed(&number, &config.dialpad.hotline) {
            Ok(()) => handle.start()?,
            Err(rejected) => {
                warn!(dialed = %rejected.dialed, "Rejected dial");
                println!("{}", rejected);
            }
        },
        ConsoleCommand::Inbound => handle.simulate_inbound()?,
        ConsoleCommand::Hangup => handle.end()?,
        ConsoleCommand::Status => {
            for line in console::status_lines(&handle.snapshot()) {
                println!("{}", line);
            }
        }
        ConsoleCommand::Config => print!("{}", config.to_toml()?),
        ConsoleCommand::Help => println!("{}", console::help_text(&config.dialpad.hotline)),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

/// Read stdin on a plain thread so a pending read never holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Initialize `tracing` with `RUST_LOG`, defaulting to debug output for this crate.
///
/// Logs go to stderr so they do not interleave with the console view on stdout.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grievance_call_client=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
