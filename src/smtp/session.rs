//! The per-connection SMTP finite-state machine (spec.md §4.3).
//!
//! Reads one line at a time from the transport, dispatches by command,
//! mutates session state, emits replies, handles the STARTTLS in-place
//! transport upgrade, and handles AUTH PLAIN.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_rustls::TlsAcceptor;

use crate::sink::{MailSink, Transaction};
use crate::smtp::auth::{self, Credentials};
use crate::smtp::command::{self, Command, ParseError};
use crate::smtp::reply::{self, Reply};
use crate::smtp::transport::Transport;

/// Per-phase read deadlines (spec.md §3 `timeouts`, §9 "Timeout surface").
/// `None` means no timeout, which is the spec's stated default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    pub banner: Option<Duration>,
    pub command: Option<Duration>,
    pub data_block: Option<Duration>,
    pub data_termination: Option<Duration>,
}

/// The read-only configuration a Session consults. Shared via `Arc` so a
/// Session never owns a back-reference into the Server (spec.md §9,
/// "Cyclic back-reference").
pub struct SessionContext {
    pub domain: String,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    pub auth_encrypted_required: bool,
    pub auth_mandatory: bool,
    pub timeouts: Timeouts,
    pub credentials: Arc<dyn Credentials>,
    pub sink: Arc<dyn MailSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopSignal {
    Continue,
    Stop,
}

/// A single client connection's SMTP conversation.
pub struct Session {
    id: String,
    // `None` only for the instant a STARTTLS upgrade is in flight; see
    // `upgrade_transport`. Never observed as `None` from any other method.
    reader: Option<BufReader<Transport>>,
    tls_active: bool,
    authenticated: bool,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    ctx: Arc<SessionContext>,
}

impl Session {
    pub fn new(transport: Transport, ctx: Arc<SessionContext>) -> Self {
        let tls_active = transport.is_tls();
        Self {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            reader: Some(BufReader::new(transport)),
            tls_active,
            authenticated: false,
            mail_from: None,
            rcpt_to: Vec::new(),
            ctx,
        }
    }

    fn reader_mut(&mut self) -> &mut BufReader<Transport> {
        self.reader.as_mut().expect("reader missing outside upgrade_transport")
    }

    /// Runs the command loop until QUIT, EOF, or a transport-fatal error.
    /// Transport-fatal errors are logged by the caller; this never writes a
    /// reply after one occurs (spec.md §7).
    pub async fn run(&mut self) -> io::Result<()> {
        debug!("session {}: sending greeting", self.id);
        let greeting = reply::ready(&self.ctx.domain.clone());
        match self.ctx.timeouts.banner {
            Some(duration) => with_timeout(duration, self.write_reply(&greeting)).await?,
            None => self.write_reply(&greeting).await?,
        }

        loop {
            let line = match self.read_command_line().await? {
                Some(line) => line,
                None => {
                    debug!("session {}: EOF, closing", self.id);
                    return Ok(());
                }
            };
            debug!("session {}: received {:?}", self.id, line);

            match self.dispatch(&line).await? {
                LoopSignal::Continue => continue,
                LoopSignal::Stop => return Ok(()),
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> io::Result<LoopSignal> {
        match command::parse(line) {
            Ok(Command::Ehlo(domain)) => {
                self.handle_ehlo(&domain).await?;
                Ok(LoopSignal::Continue)
            }
            Ok(Command::Helo(_domain)) => {
                self.write_reply(&reply::helo_ok()).await?;
                Ok(LoopSignal::Continue)
            }
            Ok(Command::Mail(path)) => {
                self.handle_mail(Some(path)).await?;
                Ok(LoopSignal::Continue)
            }
            Err(ParseError::MalformedMail) | Err(ParseError::EmptyReversePath) => {
                self.handle_mail(None).await?;
                Ok(LoopSignal::Continue)
            }
            Ok(Command::Rcpt(path)) => {
                self.handle_rcpt(Some(path)).await?;
                Ok(LoopSignal::Continue)
            }
            Err(ParseError::MalformedRcpt) | Err(ParseError::EmptyForwardPath) => {
                self.handle_rcpt(None).await?;
                Ok(LoopSignal::Continue)
            }
            Ok(Command::Data) => self.handle_data().await,
            Ok(Command::Quit) => {
                self.write_reply(&reply::closing(&self.ctx.domain.clone())).await?;
                Ok(LoopSignal::Stop)
            }
            Ok(Command::Rset) => {
                self.reset_envelope();
                self.write_reply(&reply::ok()).await?;
                Ok(LoopSignal::Continue)
            }
            Ok(Command::Noop) => {
                self.write_reply(&reply::ok()).await?;
                Ok(LoopSignal::Continue)
            }
            Ok(Command::StartTls) => self.handle_starttls().await,
            Ok(Command::Auth(mechanism, initial_response)) => {
                self.handle_auth(Some((mechanism, initial_response))).await?;
                Ok(LoopSignal::Continue)
            }
            Err(ParseError::MalformedAuth) => {
                self.handle_auth(None).await?;
                Ok(LoopSignal::Continue)
            }
            Ok(Command::Unknown(_)) => {
                self.write_reply(&reply::command_unrecognized()).await?;
                Ok(LoopSignal::Continue)
            }
        }
    }

    fn reset_envelope(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }

    fn auth_mandatory_violation(&self) -> bool {
        self.ctx.auth_mandatory && !self.authenticated
    }

    async fn handle_ehlo(&mut self, domain: &str) -> io::Result<()> {
        debug!("session {}: EHLO domain={:?}", self.id, domain);
        let mut extensions = vec![
            "AUTH PLAIN".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
            "PIPELINING".to_string(),
        ];
        if !self.tls_active {
            extensions.push("STARTTLS".to_string());
        }
        self.write_reply(&reply::ehlo_ok(&extensions)).await
    }

    async fn handle_mail(&mut self, parsed: Option<String>) -> io::Result<()> {
        if self.auth_mandatory_violation() {
            return self.write_reply(&reply::authentication_required()).await;
        }
        if self.mail_from.is_some() {
            return self.write_reply(&reply::bad_sequence()).await;
        }
        match parsed {
            Some(path) => {
                self.mail_from = Some(path);
                self.write_reply(&reply::mail_ok()).await
            }
            None => self.write_reply(&reply::syntax_error()).await,
        }
    }

    async fn handle_rcpt(&mut self, parsed: Option<String>) -> io::Result<()> {
        if self.auth_mandatory_violation() {
            return self.write_reply(&reply::authentication_required()).await;
        }
        if self.mail_from.is_none() {
            return self.write_reply(&reply::bad_sequence()).await;
        }
        match parsed {
            Some(path) => {
                self.rcpt_to.push(path);
                self.write_reply(&reply::rcpt_ok()).await
            }
            None => self.write_reply(&reply::syntax_error()).await,
        }
    }

    async fn handle_data(&mut self) -> io::Result<LoopSignal> {
        if self.auth_mandatory_violation() {
            self.write_reply(&reply::authentication_required()).await?;
            return Ok(LoopSignal::Continue);
        }
        if self.mail_from.is_none() || self.rcpt_to.is_empty() {
            self.write_reply(&reply::bad_sequence()).await?;
            return Ok(LoopSignal::Continue);
        }

        self.write_reply(&reply::start_mail_input()).await?;

        let body = match self.read_data_body().await? {
            Some(body) => body,
            None => {
                debug!("session {}: EOF mid-DATA, closing", self.id);
                return Ok(LoopSignal::Stop);
            }
        };

        let transaction = Transaction {
            mail_from: self.mail_from.clone().expect("checked above"),
            rcpt_to: self.rcpt_to.clone(),
            body,
        };
        self.ctx.sink.accept(transaction).await;

        self.reset_envelope();
        self.write_reply(&reply::ok()).await?;
        Ok(LoopSignal::Continue)
    }

    async fn handle_starttls(&mut self) -> io::Result<LoopSignal> {
        if self.tls_active {
            self.write_reply(&reply::bad_sequence()).await?;
            return Ok(LoopSignal::Continue);
        }
        let acceptor = match self.ctx.tls_acceptor.clone() {
            Some(acceptor) => acceptor,
            None => {
                self.write_reply(&reply::tls_not_available()).await?;
                return Ok(LoopSignal::Continue);
            }
        };
        if !self.reader_mut().buffer().is_empty() {
            warn!(
                "session {}: client pipelined data across STARTTLS, closing",
                self.id
            );
            return Ok(LoopSignal::Stop);
        }

        self.write_reply(&reply::ready_to_start_tls()).await?;

        match self.upgrade_transport(&acceptor).await {
            Ok(()) => {
                self.tls_active = true;
                self.authenticated = false;
                self.reset_envelope();
                debug!("session {}: TLS handshake complete", self.id);
                Ok(LoopSignal::Continue)
            }
            Err(e) => {
                // The underlying stream is consumed by a failed handshake
                // (tokio-rustls does not hand it back), so a 454 reply
                // cannot be written here; the session simply ends. See
                // DESIGN.md.
                warn!("session {}: TLS handshake failed: {e}", self.id);
                Ok(LoopSignal::Stop)
            }
        }
    }

    /// Swaps the plain transport for a TLS one in place, rebuilding the
    /// line-buffered reader on top (spec.md §9).
    async fn upgrade_transport(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        let old_reader = self.reader.take().expect("reader present before upgrade");
        let transport = old_reader.into_inner();
        let new_transport = transport.upgrade_to_tls(acceptor).await?;
        self.reader = Some(BufReader::new(new_transport));
        Ok(())
    }

    async fn handle_auth(&mut self, parsed: Option<(String, Option<String>)>) -> io::Result<()> {
        if self.ctx.auth_encrypted_required && !self.tls_active {
            return self.write_reply(&reply::must_starttls_first()).await;
        }
        if self.authenticated {
            return self.write_reply(&reply::bad_sequence()).await;
        }
        let (mechanism, initial_response) = match parsed {
            Some(pair) => pair,
            None => return self.write_reply(&reply::syntax_error()).await,
        };
        if mechanism != "PLAIN" {
            return self.write_reply(&reply::auth_mechanism_invalid()).await;
        }

        let response = match initial_response {
            Some(r) => r,
            None => {
                self.write_reply(&reply::auth_continue()).await?;
                match self.read_command_line().await? {
                    Some(line) => line,
                    None => return Ok(()),
                }
            }
        };

        let decoded = match auth::decode_plain(&response) {
            Ok(decoded) => decoded,
            Err(_) => return self.write_reply(&reply::cannot_decode_base64()).await,
        };

        if self.ctx.credentials.verify(&decoded.authcid, &decoded.passwd).await {
            self.authenticated = true;
            self.write_reply(&reply::auth_succeeded()).await
        } else {
            self.write_reply(&reply::auth_failed()).await
        }
    }

    // --- wire I/O helpers ---

    async fn write_reply(&mut self, reply: &Reply) -> io::Result<()> {
        let bytes = reply.encode();
        let reader = self.reader_mut();
        reader.write_all(&bytes).await?;
        reader.flush().await
    }

    /// Reads one CRLF-terminated line, stripped of its line ending.
    /// Returns `Ok(None)` on clean EOF.
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self.reader_mut().read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    async fn read_command_line(&mut self) -> io::Result<Option<String>> {
        match self.ctx.timeouts.command {
            Some(duration) => with_timeout(duration, self.read_line()).await,
            None => self.read_line().await,
        }
    }

    /// Reads the dot-terminated DATA body, un-stuffing leading dots.
    /// Returns `Ok(None)` on EOF mid-body (spec.md §4.3: ends the session
    /// silently).
    async fn read_data_body(&mut self) -> io::Result<Option<Vec<String>>> {
        let deadline = self
            .ctx
            .timeouts
            .data_termination
            .map(|d| tokio::time::Instant::now() + d);
        let block_timeout = self.ctx.timeouts.data_block;

        let mut body = Vec::new();
        loop {
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "DATA termination timeout"));
                }
            }
            let line = match block_timeout {
                Some(duration) => with_timeout(duration, self.read_line()).await?,
                None => self.read_line().await?,
            };
            match line {
                None => return Ok(None),
                Some(line) if line == "." => return Ok(Some(body)),
                Some(line) => {
                    let unstuffed = line.strip_prefix('.').map(str::to_string).unwrap_or(line);
                    body.push(unstuffed);
                }
            }
        }
    }
}

async fn with_timeout<T>(duration: Duration, fut: impl std::future::Future<Output = io::Result<T>>) -> io::Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
    }
}
