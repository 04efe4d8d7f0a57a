//! Command-line interface for EchoLink
//!
//! Handles argument parsing, logging configuration and the line commands
//! read from stdin.

use crate::app::Command;
use crate::sync::DEFAULT_CHANNEL;
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where recordings come from
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum InputBackend {
    /// Generated test tone; works without an audio server
    Synthetic,
    /// Default PipeWire source (needs the `pipewire` feature)
    Pipewire,
}

/// EchoLink - Voice recorder with playback synced across instances
#[derive(Parser, Debug)]
#[command(name = "echolink")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Name of the channel shared with other instances
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Milliseconds between position broadcasts while playing
    #[arg(long, default_value_t = 1000)]
    pub sync_interval_ms: u64,

    /// Milliseconds between timeline updates
    #[arg(long, default_value_t = 250)]
    pub tick_ms: u64,

    /// Directory for playable audio files (default: per-instance cache dir)
    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,

    /// Audio input backend
    #[arg(long, value_enum, default_value_t = InputBackend::Synthetic)]
    pub input: InputBackend,

    /// External noise reduction command; `{input}` and `{output}` are
    /// replaced with WAV paths. Uses the built-in noise gate when unset.
    #[arg(long)]
    pub denoise_command: Option<String>,

    /// Initial playback volume (0-100); defaults to the saved volume
    #[arg(long)]
    pub volume: Option<i64>,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    // Set echolink modules to requested verbosity level
    builder.filter_module("echolink", args.log_level());

    // Audio server internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("pipewire", args.log_level());
        builder.filter_module("tokio", args.log_level());
    }

    builder.format_timestamp_millis().init();
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "record" | "rec" | "r" => Command::Record,
            "stop" | "s" => Command::Stop,
            "play" => Command::Play,
            "pause" => Command::Pause,
            "toggle" | "t" => Command::Toggle,
            "seek" => {
                let seconds: f64 = rest
                    .parse()
                    .map_err(|_| format!("seek needs a number of seconds, got {:?}", rest))?;
                if !seconds.is_finite() {
                    return Err(format!("invalid seek target {:?}", rest));
                }
                // 0.1 s resolution
                Command::Seek((seconds * 10.0).round() / 10.0)
            }
            "volume" | "vol" => {
                let percent: i64 = rest
                    .parse()
                    .map_err(|_| format!("volume needs a whole number 0-100, got {:?}", rest))?;
                Command::Volume(percent)
            }
            "denoise" => Command::Denoise,
            "open" => {
                if rest.is_empty() {
                    return Err("open needs a file path".to_string());
                }
                Command::Open(PathBuf::from(rest))
            }
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            "" => return Err("empty command".to_string()),
            other => return Err(format!("unknown command {:?}, try help", other)),
        };
        Ok(command)
    }
}
