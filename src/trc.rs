//! Tracing configuration and initialization.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

struct FgConfig {
    no_spin: bool,
}

impl FgConfig {
    fn is_ugly(&self) -> bool {
        self.no_spin
    }

    pub fn pretty() -> Self {
        Self { no_spin: false }
    }

    pub fn ugly() -> Self {
        Self { no_spin: true }
    }
}

enum TrcMode {
    Foreground(FgConfig),
    Daemon,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env("ESDFS_LOG").or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            Ok(env_filter) => Self {
                // An explicit filter means someone is debugging; give them plain output with
                // span events rather than spinners.
                mode: TrcMode::Foreground(FgConfig::ugly()),
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Foreground(FgConfig::pretty()),
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    /// Switch to daemon output: plain lines without color, since stderr is a log file.
    #[must_use]
    pub fn daemon(self) -> Self {
        Self {
            mode: TrcMode::Daemon,
            ..self
        }
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match &self.mode {
            TrcMode::Daemon => self.init_daemon_mode(),
            TrcMode::Foreground(fg_config) => {
                if fg_config.is_ugly() {
                    self.init_ugly_mode()
                } else {
                    self.init_pretty_mode()
                }
            }
        }
    }

    fn init_daemon_mode(self) -> Result<(), TryInitError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_ansi(false)
            .finish()
            .try_init()
    }

    fn init_ugly_mode(self) -> Result<(), TryInitError> {
        // "Ugly mode" is the plain, verbose, rust logging mode.
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .finish()
            .try_init()
    }

    fn init_pretty_mode(self) -> Result<(), TryInitError> {
        // "Pretty mode" is the compact, colorful mode for interactive use.
        let indicatif_layer = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .with(indicatif_layer)
            .try_init()?;

        Ok(())
    }
}
