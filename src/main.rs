//! EchoLink - A voice recorder whose playback stays in sync across instances
//!
//! This is the main entry point for the EchoLink binary.

mod app;
mod audio;
mod cli;
mod denoise;
mod error;
mod notify;
mod runtime;
mod settings;
mod state;
mod sync;

use anyhow::{Context, Result};
use app::{Command, EchoLink, InstanceConfig};
use audio::{AudioOutput, CaptureDevice, SilentOutput, SyntheticDevice};
use clap::Parser;
use cli::{Args, InputBackend};
use denoise::{CommandReducer, NoiseGate, NoiseReducer};
use log::{info, warn};
use notify::Level;
use std::sync::Arc;
use sync::SocketChannel;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = Args::parse();
    cli::init_logging(&args);

    info!("Starting EchoLink");

    let runtime = runtime::build()?;
    let result = runtime.block_on(run(args));
    // The stdin reader may still be parked on a blocking read
    runtime.shutdown_background();
    result
}

async fn run(args: Args) -> Result<()> {
    let (device, output) = backends(args.input)?;
    let reducer = reducer(&args);
    let channel = SocketChannel::open(&args.channel)
        .with_context(|| format!("Failed to join sync channel {:?}", args.channel))?;

    let config = InstanceConfig {
        artifact_dir: args.artifact_dir.clone(),
        tick: args.tick(),
        sync_interval: args.sync_interval(),
        volume_percent: args.volume.or_else(settings::get_volume).unwrap_or(100),
    };
    let instance = EchoLink::new(config, device, output, Box::new(channel), reducer);
    info!("Instance {} ready", instance.id());

    let mut notifications = instance.subscribe_notifications();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(n) if n.level == Level::Error => eprintln!("{}", n),
                Ok(n) => println!("{}", n),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(read_commands(tx.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(Command::Quit).await;
        }
    });

    println!("EchoLink ready. Type help for commands.");
    let last = instance.run(rx).await;
    settings::set_volume((last.volume * 100.0).round() as i64);
    Ok(())
}

/// Capture device and output for the chosen backend
fn backends(input: InputBackend) -> Result<(Arc<dyn CaptureDevice>, Box<dyn AudioOutput>)> {
    match input {
        InputBackend::Synthetic => Ok((
            Arc::new(SyntheticDevice::default()),
            Box::new(SilentOutput::new()),
        )),
        #[cfg(feature = "pipewire")]
        InputBackend::Pipewire => Ok((
            Arc::new(audio::PipeWireDevice::new(48000)),
            Box::new(audio::PipeWireOutput::new()),
        )),
        #[cfg(not(feature = "pipewire"))]
        InputBackend::Pipewire => {
            anyhow::bail!("Built without PipeWire support; rebuild with --features pipewire")
        }
    }
}

/// External command if one is configured, otherwise the built-in gate
fn reducer(args: &Args) -> Arc<dyn NoiseReducer> {
    if let Some(command) = args.denoise_command.as_deref() {
        settings::set_noise_command(command);
    }
    let command = args.denoise_command.clone().or_else(settings::get_noise_command);

    match command.as_deref().and_then(CommandReducer::parse) {
        Some(reducer) => {
            info!("Noise reduction via {:?}", command);
            Arc::new(reducer)
        }
        None => {
            info!("Noise reduction via built-in gate");
            Arc::new(NoiseGate::default())
        }
    }
}

/// Forward stdin lines to the instance until quit or end of input
async fn read_commands(tx: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read command: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Command>() {
            Ok(command) => {
                let quit = command == Command::Quit;
                if tx.send(command).await.is_err() || quit {
                    return;
                }
            }
            Err(e) => eprintln!("{}", e),
        }
    }

    // End of input
    let _ = tx.send(Command::Quit).await;
}
