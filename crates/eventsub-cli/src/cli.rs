//! Command-line interface for the `eventsub` listener.
//!
//! Connects one session, prints every notification to stdout as a JSON line
//! and logs the session lifecycle to stderr.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use eventsub_session::{
    DedupConfig, HandlerError, ReconnectConfig, SessionClient, SessionConfig,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// eventsub - listen to an event-subscription session
///
/// Notifications go to stdout as JSON lines, logs go to stderr.
#[derive(Parser, Debug)]
#[command(
    name = "eventsub",
    version,
    about = "Listen to an event-subscription session and print notifications as JSON lines",
    author
)]
pub struct Cli {
    /// WebSocket endpoint (overrides the configuration file)
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Drop notifications whose message id was already delivered
    #[arg(long)]
    pub dedup: bool,

    /// Consecutive failed connection attempts before giving up
    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Stop when the connection is lost instead of reconnecting
    #[arg(long, conflicts_with = "max_retries")]
    pub no_reconnect: bool,

    /// Print session metrics as JSON to stderr on exit
    #[arg(long)]
    pub stats: bool,

    /// Enable verbose logging (-v, -vv, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all logs except errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log as JSON instead of human-readable text
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Run the listener until Ctrl-C or until the session gives up.
    ///
    /// # Errors
    ///
    /// Fails on an unusable configuration or when the session stops for any
    /// reason other than Ctrl-C.
    pub async fn execute(self) -> anyhow::Result<()> {
        self.init_tracing();

        let config = self.session_config()?;
        let client = SessionClient::with_websocket(config);
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

        client.on_session_welcome(|session_id| async move {
            info!("Session {} is ready for subscriptions", session_id);
            Ok(())
        });
        client.on_notification(|envelope| async move {
            let line = serde_json::to_string(&envelope)
                .map_err(|e| HandlerError::failed(e.to_string()))?;
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", line).map_err(|e| HandlerError::failed(e.to_string()))
        });
        client.on_revocation(|subscription_id, status| async move {
            warn!("Subscription {} revoked: {}", subscription_id, status);
            Ok(())
        });
        client.on_disconnected(move |reason| {
            let fatal_tx = fatal_tx.clone();
            async move {
                if !reason.is_requested() {
                    let _ = fatal_tx.send(reason);
                }
                Ok(())
            }
        });

        client
            .connect()
            .await
            .context("failed to start the session")?;

        let fatal = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Could not listen for Ctrl-C: {}", e);
                }
                info!("Interrupted, disconnecting");
                None
            }
            reason = fatal_rx.recv() => reason,
        };

        client.disconnect().await;

        if self.stats {
            let metrics = serde_json::to_string(&client.metrics())?;
            eprintln!("{}", metrics);
        }

        match fatal {
            Some(reason) => anyhow::bail!("session ended: {}", reason),
            None => Ok(()),
        }
    }

    /// Build the session configuration from the file and flags.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be loaded or the result does not validate.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => SessionConfig::default(),
        };

        if let Some(endpoint) = &self.endpoint {
            config.endpoint.clone_from(endpoint);
        }
        if self.dedup {
            config.dedup = DedupConfig::enabled();
        }
        if let Some(max_retries) = self.max_retries {
            config.reconnect.max_retries = max_retries;
        }
        if self.no_reconnect {
            config.reconnect = ReconnectConfig::disabled();
        }

        config.validate().context("invalid session configuration")?;
        Ok(config)
    }

    /// Log level implied by `-v`/`--quiet`
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    /// Initialize tracing; `RUST_LOG` takes precedence over the flags
    fn init_tracing(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.log_level()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false);

        if self.log_json {
            builder.json().init();
        } else {
            builder.init();
        }
    }
}
