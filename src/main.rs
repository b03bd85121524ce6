//! Mount a directory as an emulated SD card, with Android-style derived permissions.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::{Config, ConfigError, Overrides};
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "Emulated SD card filesystem with derived ownership and permissions."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to an esdfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the filesystem and serve it until signalled.
    Run {
        /// Run the daemon in the background.
        #[arg(short, long, help = "Run the daemon in the background.")]
        daemonize: bool,

        /// Directory backing the emulated card.
        #[arg(long, value_name = "DIR")]
        lower: Option<PathBuf>,

        /// Where to mount the filesystem.
        #[arg(long, value_name = "DIR")]
        mount_point: Option<PathBuf>,

        /// Mount options, e.g. `derive=unified,confine,lower=1023:1023:0664:0775`.
        #[arg(short = 'o', long = "options", value_name = "OPTIONS")]
        mount_options: Option<String>,
    },

    /// Send a package list to a running daemon.
    PushPackages {
        /// File holding the list; standard input when omitted.
        file: Option<PathBuf>,
    },
}

fn exit_on_invalid(error: ConfigError) -> ! {
    match error {
        ConfigError::ValidationErrors(error_messages) => {
            eprintln!("Configuration is invalid.");
            for msg in &error_messages {
                eprintln!(" - {msg}");
            }
        }
        other => eprintln!("Configuration is invalid: {other}"),
    }
    std::process::exit(1);
}

fn init_tracing(trc: Trc) {
    trc.init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });
}

fn run(config: Config, daemonize: bool) {
    let options = match config.parsed_mount_options() {
        Ok(options) => options,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = fuse_check::ensure_fuse(&options) {
        error!("{e}");
        std::process::exit(1);
    }

    if !daemonize {
        if let Err(e) = daemon::spawn(config) {
            error!("Daemon failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    debug!(config = ?config, "Initializing daemon with configuration...");
    // Config.validate() guarantees pid_file has a parent.
    let Some(pid_file_parent) = config.daemon.pid_file.parent() else {
        error!("PID file has no parent directory.");
        return;
    };
    if let Err(e) = std::fs::create_dir_all(pid_file_parent) {
        error!("Failed to create PID file directory: {e}");
        return;
    }

    let log_file = match config.daemon.open_log_file() {
        Ok(f) => f,
        Err(e) => {
            error!("Failed to open log file: {e}");
            return;
        }
    };

    let mut daemonize = daemonize::Daemonize::new().pid_file(&config.daemon.pid_file);
    if let Some(file) = log_file {
        match file.try_clone() {
            Ok(clone) => {
                daemonize = daemonize.stdout(file).stderr(clone);
            }
            Err(e) => {
                error!("Failed to clone log file handle: {e}");
                return;
            }
        }
    }

    match daemonize.start() {
        Ok(()) => {
            if let Err(e) = daemon::spawn(config) {
                error!("Daemon failed: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Failed to spawn the daemon: {e}");
        }
    }
}

fn push_packages(config: &Config, file: Option<PathBuf>) -> std::io::Result<String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        match file {
            Some(path) => {
                let list = tokio::fs::File::open(&path).await?;
                esdfs::control::push(&config.control_socket, list).await
            }
            None => esdfs::control::push(&config.control_socket, tokio::io::stdin()).await,
        }
    })
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    match args.command {
        Command::Run {
            daemonize,
            lower,
            mount_point,
            mount_options,
        } => {
            let config = config
                .with_overrides(Overrides {
                    lower_path: lower,
                    mount_point,
                    mount_options,
                })
                .validated()
                .unwrap_or_else(|e| exit_on_invalid(e));

            let trc = if daemonize {
                Trc::default().daemon()
            } else {
                Trc::default()
            };
            init_tracing(trc);
            run(config, daemonize);
        }
        Command::PushPackages { file } => {
            init_tracing(Trc::default());
            match push_packages(&config, file) {
                Ok(status) => info!("{status}"),
                Err(e) => {
                    error!("Failed to push package list: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
