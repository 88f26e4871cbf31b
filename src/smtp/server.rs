//! The listener: accepts TCP connections, wraps each in implicit TLS when
//! configured, and spawns a [`Session`] per connection (spec.md §4.4).

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader as StdBufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::sink::MailSink;
use crate::smtp::auth::Credentials;
use crate::smtp::session::{Session, SessionContext};
use crate::smtp::transport::accept_transport;

/// Lifecycle failures distinct from ordinary transport I/O errors
/// (`original_source/smtp/server.go`'s sentinel errors).
#[derive(Debug)]
pub enum ServerError {
    ServerClosed,
    MissingAddress,
    MissingTlsConfig,
    Tls(io::Error),
    Bind(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::ServerClosed => write!(f, "server is closed"),
            ServerError::MissingAddress => write!(f, "config has no bind address"),
            ServerError::MissingTlsConfig => write!(f, "listener requires TLS but none is configured"),
            ServerError::Tls(e) => write!(f, "failed to load TLS materials: {e}"),
            ServerError::Bind(e) => write!(f, "failed to bind listener: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// One SMTP listener. A single `Server` type covers the relay, submission,
/// and submissions roles; the difference is entirely in the `Config` it is
/// built from (spec.md §9, "Duplicated server variants").
pub struct Server {
    config: Config,
    credentials: Arc<dyn Credentials>,
    sink: Arc<dyn MailSink>,
    shutting_down: AtomicBool,
    shutdown: Notify,
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: Config, credentials: Arc<dyn Credentials>, sink: Arc<dyn MailSink>) -> Self {
        Server {
            config,
            credentials,
            sink,
            shutting_down: AtomicBool::new(false),
            shutdown: Notify::new(),
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn build_tls_acceptor(&self) -> Result<Option<Arc<TlsAcceptor>>, ServerError> {
        let tls = match &self.config.tls {
            Some(tls) => tls,
            None => return Ok(None),
        };
        let cert_file = File::open(&tls.cert_path).map_err(ServerError::Tls)?;
        let mut cert_reader = StdBufReader::new(cert_file);
        let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ServerError::Tls)?;

        let key_file = File::open(&tls.key_path).map_err(ServerError::Tls)?;
        let mut key_reader = StdBufReader::new(key_file);
        let mut keys = pkcs8_private_keys(&mut key_reader).collect::<Result<Vec<_>, _>>().map_err(ServerError::Tls)?;
        let key = keys
            .pop()
            .ok_or_else(|| ServerError::Tls(io::Error::new(io::ErrorKind::InvalidData, "no private key found")))?;

        let server_config = RustlsServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, PrivateKeyDer::Pkcs8(key))
            .map_err(|e| ServerError::Tls(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(server_config)))))
    }

    fn session_context(&self, starttls_acceptor: Option<Arc<TlsAcceptor>>) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            domain: self.config.domain.clone(),
            tls_acceptor: starttls_acceptor,
            auth_encrypted_required: self.config.auth_encrypted,
            auth_mandatory: self.config.auth_mandatory,
            timeouts: self.config.timeouts,
            credentials: Arc::clone(&self.credentials),
            sink: Arc::clone(&self.sink),
        })
    }

    /// Binds and serves. If `config.implicit_tls` is set, every accepted
    /// connection is wrapped in TLS before the session starts; otherwise
    /// TLS (if configured) is only offered via STARTTLS inside the session.
    /// Returns once `close()` is called.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ServerError::ServerClosed);
        }
        if self.config.address.is_empty() {
            return Err(ServerError::MissingAddress);
        }
        if self.config.implicit_tls && self.config.tls.is_none() {
            return Err(ServerError::MissingTlsConfig);
        }

        let implicit_acceptor = if self.config.implicit_tls {
            self.build_tls_acceptor()?
        } else {
            None
        };
        // STARTTLS is offered whenever certs are configured, even for a
        // listener that isn't `implicit_tls`.
        let starttls_acceptor = if self.config.implicit_tls {
            implicit_acceptor.clone()
        } else {
            self.build_tls_acceptor()?
        };

        let listener = TcpListener::bind(&self.config.address).await.map_err(ServerError::Bind)?;
        info!("SMTP server listening on {} (implicit_tls={})", self.config.address, self.config.implicit_tls);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!("new connection from {peer}");
                            let ctx = self.session_context(starttls_acceptor.clone());
                            let implicit_acceptor = implicit_acceptor.clone();
                            let handle = tokio::spawn(async move {
                                let transport = match accept_transport(stream, implicit_acceptor.as_ref()).await {
                                    Ok(transport) => transport,
                                    Err(e) => {
                                        warn!("implicit TLS handshake with {peer} failed: {e}");
                                        return;
                                    }
                                };
                                let mut session = Session::new(transport, ctx);
                                if let Err(e) = session.run().await {
                                    warn!("session with {peer} ended with an error: {e}");
                                }
                            });
                            self.sessions.lock().await.push(handle);
                        }
                        Err(e) => {
                            error!("error accepting connection: {e}");
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("server on {} shutting down", self.config.address);
                    return Ok(());
                }
            }
        }
    }

    /// Stops accepting new connections and ends any sessions still running.
    /// Idempotent.
    pub async fn close(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let handles = std::mem::take(&mut *self.sessions.lock().await);
        for handle in handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LoggingSink;
    use crate::smtp::auth::AcceptAllCredentials;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn test_config(address: &str) -> Config {
        Config {
            address: address.to_string(),
            ..Config::default_config()
        }
    }

    async fn read_reply(stream: &mut TcpStream) -> String {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn accepts_a_connection_and_greets() {
        // bind to an ephemeral port ourselves so the test knows the address
        // before the server starts listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let server_with_addr = Arc::new(Server::new(
            test_config(&addr.to_string()),
            Arc::new(AcceptAllCredentials),
            Arc::new(LoggingSink),
        ));

        let server_task = {
            let server = Arc::clone(&server_with_addr);
            tokio::spawn(async move {
                let _ = server.listen_and_serve().await;
            })
        };

        // give the listener a moment to bind
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let greeting = read_reply(&mut client).await;
        assert!(greeting.starts_with("220"));

        client.write_all(b"QUIT\r\n").await.unwrap();
        let _ = read_reply(&mut client).await;

        server_with_addr.close().await;
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn listen_and_serve_after_close_returns_server_closed() {
        let server = Server::new(test_config("127.0.0.1:0"), Arc::new(AcceptAllCredentials), Arc::new(LoggingSink));
        server.close().await;
        let result = server.listen_and_serve().await;
        assert!(matches!(result, Err(ServerError::ServerClosed)));
    }

    #[tokio::test]
    async fn submissions_without_tls_config_is_rejected() {
        let config = Config::submissions("127.0.0.1:0", "quokka.test", crate::config::TlsConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
        });
        let server = Server::new(config, Arc::new(AcceptAllCredentials), Arc::new(LoggingSink));
        let result = server.listen_and_serve().await;
        // cert path doesn't exist, so this should fail to load TLS materials
        // rather than bind successfully.
        assert!(matches!(result, Err(ServerError::Tls(_))));
    }
}
