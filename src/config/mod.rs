//! Manages application configuration loaded from environment variables.
//!
//! This module defines the `Config` struct which holds all runtime settings
//! and provides the `from_env` function to populate this struct. It supports
//! loading variables from a `.env` file via the `dotenv` crate and provides
//! default values for optional settings.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::smtp::session::Timeouts;

/// Certificate/key pair for a listener that offers TLS, either via STARTTLS
/// or as an implicit-TLS listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// Holds the application's runtime configuration settings.
///
/// One `Config` describes one listener role (relay, submission, or
/// submissions); `relay`/`submission`/`submissions` build the field
/// combination each role needs off the same type rather than three
/// duplicated structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The address the SMTP server should bind to, e.g. "0.0.0.0:2525".
    pub address: String,

    /// The domain name this server advertises in its greeting and EHLO
    /// response.
    pub domain: String,

    /// Certificate/key pair for TLS. Required if `implicit_tls` is set;
    /// optional (enables STARTTLS) otherwise.
    pub tls: Option<TlsConfig>,

    /// When true, the listener wraps every accepted connection in TLS
    /// immediately instead of offering STARTTLS (the "submissions" role).
    pub implicit_tls: bool,

    /// When true, AUTH is refused until the session is running over TLS.
    pub auth_encrypted: bool,

    /// When true, MAIL/RCPT/DATA are refused until the session has
    /// authenticated.
    pub auth_mandatory: bool,

    #[serde(skip, default)]
    pub timeouts: Timeouts,
}

impl Config {
    /// The zero-config defaults: a plaintext relay listener on 2525 with no
    /// TLS and no authentication requirement. Touches no environment
    /// variables; used by tests and as a base for role presets.
    pub fn default_config() -> Self {
        Config {
            address: "0.0.0.0:2525".to_string(),
            domain: "localhost".to_string(),
            tls: None,
            implicit_tls: false,
            auth_encrypted: true,
            auth_mandatory: false,
            timeouts: Timeouts::default(),
        }
    }

    /// An inbound relay listener: STARTTLS optional, authentication not
    /// required.
    pub fn relay(address: impl Into<String>, domain: impl Into<String>, tls: Option<TlsConfig>) -> Self {
        Config {
            address: address.into(),
            domain: domain.into(),
            tls,
            implicit_tls: false,
            auth_encrypted: true,
            auth_mandatory: false,
            ..Self::default_config()
        }
    }

    /// A submission listener (RFC 6409, port 587 by convention): STARTTLS
    /// required before AUTH, and AUTH required before mail can flow.
    pub fn submission(address: impl Into<String>, domain: impl Into<String>, tls: TlsConfig) -> Self {
        Config {
            address: address.into(),
            domain: domain.into(),
            tls: Some(tls),
            implicit_tls: false,
            auth_encrypted: true,
            auth_mandatory: true,
            ..Self::default_config()
        }
    }

    /// A submissions listener (implicit TLS, port 465 by convention): TLS is
    /// already in place at accept time, so `auth_encrypted` is moot.
    pub fn submissions(address: impl Into<String>, domain: impl Into<String>, tls: TlsConfig) -> Self {
        Config {
            address: address.into(),
            domain: domain.into(),
            tls: Some(tls),
            implicit_tls: true,
            auth_encrypted: false,
            auth_mandatory: true,
            ..Self::default_config()
        }
    }

    /// Loads configuration settings from environment variables.
    ///
    /// Reads variables prefixed with `QUOKKA_SMTP_`. Supports loading from a
    /// `.env` file if present. Provides default values for bind address,
    /// domain, and every timeout if not specified. Logs the configuration
    /// values being used.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if `QUOKKA_SMTP_TLS_CERT` is set without
    /// `QUOKKA_SMTP_TLS_KEY` (or vice versa), or if a timeout/bool variable
    /// is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let address =
            env::var("QUOKKA_SMTP_ADDRESS").unwrap_or_else(|_| "0.0.0.0:2525".to_string());
        log::info!("Config: Using address: {}", address);

        let domain = env::var("QUOKKA_SMTP_DOMAIN").unwrap_or_else(|_| "localhost".to_string());
        log::info!("Config: Using domain: {}", domain);

        let cert_path = env::var("QUOKKA_SMTP_TLS_CERT").ok();
        let key_path = env::var("QUOKKA_SMTP_TLS_KEY").ok();
        let tls = match (cert_path, key_path) {
            (Some(cert_path), Some(key_path)) => {
                log::info!("Config: TLS enabled, cert={cert_path} key={key_path}");
                Some(TlsConfig { cert_path, key_path })
            }
            (None, None) => {
                log::info!("Config: TLS not configured, STARTTLS unavailable");
                None
            }
            _ => {
                return Err(anyhow!(
                    "QUOKKA_SMTP_TLS_CERT and QUOKKA_SMTP_TLS_KEY must both be set, or neither"
                ))
            }
        };

        let implicit_tls = parse_bool_env("QUOKKA_SMTP_IMPLICIT_TLS", false)?;
        let auth_encrypted = parse_bool_env("QUOKKA_SMTP_AUTH_ENCRYPTED", true)?;
        let auth_mandatory = parse_bool_env("QUOKKA_SMTP_AUTH_MANDATORY", false)?;
        log::info!(
            "Config: implicit_tls={implicit_tls} auth_encrypted={auth_encrypted} auth_mandatory={auth_mandatory}"
        );

        let timeouts = Timeouts {
            banner: parse_timeout_env("QUOKKA_SMTP_TIMEOUT_BANNER_SECS")?,
            command: parse_timeout_env("QUOKKA_SMTP_TIMEOUT_COMMAND_SECS")?,
            data_block: parse_timeout_env("QUOKKA_SMTP_TIMEOUT_DATA_BLOCK_SECS")?,
            data_termination: parse_timeout_env("QUOKKA_SMTP_TIMEOUT_DATA_TERMINATION_SECS")?,
        };

        Ok(Config {
            address,
            domain,
            tls,
            implicit_tls,
            auth_encrypted,
            auth_mandatory,
            timeouts,
        })
    }
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(val) => val
            .parse::<bool>()
            .map_err(|e| anyhow!("{key} ('{val}') must be 'true' or 'false': {e}")),
        Err(_) => Ok(default),
    }
}

fn parse_timeout_env(key: &str) -> Result<Option<Duration>> {
    match env::var(key) {
        Ok(val) => {
            let secs: u64 = val
                .parse()
                .map_err(|e| anyhow!("{key} ('{val}') must be a valid u64 of seconds: {e}"))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

// The inline tests module has been moved to src/config/tests.rs
// and is included via `mod tests;` below.
