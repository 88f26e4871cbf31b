//! Orchestrates the quokka-smtp application startup and lifecycle.
//!
//! This library crate loads configuration and runs the SMTP server until
//! either it fails or the process receives Ctrl-C, at which point the
//! listener is closed gracefully.

pub mod config;
pub mod sink;
pub mod smtp;

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};

use crate::config::Config;
use crate::sink::{LoggingSink, MailSink};
use crate::smtp::auth::{AcceptAllCredentials, Credentials};
use crate::smtp::server::Server;

/// Runs the SMTP server with the reference `AcceptAllCredentials` and
/// `LoggingSink` collaborators. Library consumers who need a real
/// credential store or delivery mechanism should construct their own
/// `Server` with `run_with` instead of calling this.
pub async fn run() -> Result<()> {
    run_with(Arc::new(AcceptAllCredentials), Arc::new(LoggingSink)).await
}

/// Runs the SMTP server with caller-supplied collaborators.
///
/// Loads configuration from the environment, starts the listener, and
/// blocks until either the listener fails or the process receives Ctrl-C
/// (at which point it closes the listener and returns `Ok(())`).
pub async fn run_with(credentials: Arc<dyn Credentials>, sink: Arc<dyn MailSink>) -> Result<()> {
    info!(
        "starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return Err(e);
        }
    };

    let server = Arc::new(Server::new(config, credentials, sink));

    let server_for_signal = Arc::clone(&server);
    tokio::select! {
        result = server.listen_and_serve() => {
            if let Err(e) = result {
                error!("SMTP server exited with an error: {e}");
                return Err(anyhow::anyhow!(e));
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, closing listener");
            server_for_signal.close().await;
        }
    }

    Ok(())
}
