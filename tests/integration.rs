//! End-to-end SMTP protocol tests: a real `Server` bound to an ephemeral
//! port, driven over a real `tokio::net::TcpStream`, covering the session
//! scenarios a client would actually exercise (plain transactions,
//! sequencing errors, STARTTLS, and AUTH PLAIN).

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quokka_smtp::config::{Config, TlsConfig};
use quokka_smtp::sink::{LoggingSink, MailSink, Transaction};
use quokka_smtp::smtp::auth::AcceptAllCredentials;
use quokka_smtp::smtp::server::Server;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("failed to bind to port 0");
    listener.local_addr().unwrap().port()
}

async fn connect(addr: &str) -> (BufReader<tokio::net::tcp::OwnedReadHalf>, tokio::net::tcp::OwnedWriteHalf) {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            let (read_half, write_half) = stream.into_split();
            return (BufReader::new(read_half), write_half);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {addr}");
}

async fn read_reply_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line.trim_end().to_string()
}

async fn send_line(writer: &mut tokio::net::tcp::OwnedWriteHalf, line: &str) {
    writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
}

/// A sink that records every completed transaction, for assertions.
#[derive(Default, Clone)]
struct RecordingSink {
    transactions: Arc<Mutex<Vec<Transaction>>>,
}

#[async_trait::async_trait]
impl MailSink for RecordingSink {
    async fn accept(&self, transaction: Transaction) {
        self.transactions.lock().await.push(transaction);
    }
}

fn generate_tls_pair() -> TlsConfig {
    let dir = std::env::temp_dir().join(format!("quokka-smtp-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let cert_path = dir.join(format!("cert-{}.pem", uuid::Uuid::new_v4()));
    let key_path = dir.join(format!("key-{}.pem", uuid::Uuid::new_v4()));

    let generated = rcgen::generate_simple_self_signed(vec!["quokka.test".to_string()]).unwrap();
    std::fs::write(&cert_path, generated.cert.pem()).unwrap();
    std::fs::write(&key_path, generated.signing_key.serialize_pem()).unwrap();

    TlsConfig {
        cert_path: cert_path.to_string_lossy().into_owned(),
        key_path: key_path.to_string_lossy().into_owned(),
    }
}

#[tokio::test]
async fn full_transaction_reaches_the_sink() {
    let port = free_port();
    let address = format!("127.0.0.1:{port}");
    let sink = RecordingSink::default();
    let server = Arc::new(Server::new(
        Config { address: address.clone(), domain: "quokka.test".to_string(), ..Config::default_config() },
        Arc::new(AcceptAllCredentials),
        Arc::new(sink.clone()),
    ));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.listen_and_serve().await })
    };

    let (mut reader, mut writer) = connect(&address).await;
    assert!(read_reply_line(&mut reader).await.starts_with("220"));

    send_line(&mut writer, "EHLO client.example").await;
    // Hello line + AUTH PLAIN + ENHANCEDSTATUSCODES + PIPELINING + STARTTLS
    for _ in 0..5 {
        read_reply_line(&mut reader).await;
    }

    send_line(&mut writer, "MAIL FROM:<sender@example.com>").await;
    assert_eq!(read_reply_line(&mut reader).await, "250 2.1.0 Requested mail action okay, completed");

    send_line(&mut writer, "RCPT TO:<recipient@example.com>").await;
    assert_eq!(read_reply_line(&mut reader).await, "250 2.1.5 Requested mail action okay, completed");

    send_line(&mut writer, "DATA").await;
    assert!(read_reply_line(&mut reader).await.starts_with("354"));

    send_line(&mut writer, "Subject: hello").await;
    send_line(&mut writer, "").await;
    send_line(&mut writer, "..this line starts with a dot").await;
    send_line(&mut writer, "plain body line").await;
    send_line(&mut writer, ".").await;
    assert_eq!(read_reply_line(&mut reader).await, "250 2.0.0 Requested mail action okay, completed");

    send_line(&mut writer, "QUIT").await;
    assert!(read_reply_line(&mut reader).await.starts_with("221"));

    let transactions = sink.transactions.lock().await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].mail_from, "<sender@example.com>");
    assert_eq!(transactions[0].rcpt_to, vec!["<recipient@example.com>".to_string()]);
    assert_eq!(
        transactions[0].body,
        vec![
            "Subject: hello".to_string(),
            "".to_string(),
            ".this line starts with a dot".to_string(),
            "plain body line".to_string(),
        ]
    );

    server.close().await;
    let _ = server_task.await;
}

#[tokio::test]
async fn rejects_rcpt_before_mail_and_data_without_recipient() {
    let port = free_port();
    let address = format!("127.0.0.1:{port}");
    let server = Arc::new(Server::new(
        Config { address: address.clone(), domain: "quokka.test".to_string(), ..Config::default_config() },
        Arc::new(AcceptAllCredentials),
        Arc::new(LoggingSink),
    ));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.listen_and_serve().await })
    };

    let (mut reader, mut writer) = connect(&address).await;
    read_reply_line(&mut reader).await;

    send_line(&mut writer, "RCPT TO:<x@y.example>").await;
    assert_eq!(read_reply_line(&mut reader).await, "503 5.5.1 Bad sequence of commands");

    send_line(&mut writer, "MAIL FROM:<a@b.example>").await;
    read_reply_line(&mut reader).await;

    send_line(&mut writer, "DATA").await;
    assert_eq!(read_reply_line(&mut reader).await, "503 5.5.1 Bad sequence of commands");

    send_line(&mut writer, "QUIT").await;
    read_reply_line(&mut reader).await;

    server.close().await;
    let _ = server_task.await;
}

#[tokio::test]
async fn starttls_upgrades_the_session_and_hides_the_extension_afterward() {
    rustls::crypto::aws_lc_rs::default_provider().install_default().ok();
    let port = free_port();
    let address = format!("127.0.0.1:{port}");
    let tls = generate_tls_pair();
    let server = Arc::new(Server::new(
        Config::relay(&address, "quokka.test", Some(tls.clone())),
        Arc::new(AcceptAllCredentials),
        Arc::new(LoggingSink),
    ));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.listen_and_serve().await })
    };

    let (mut reader, mut writer) = connect(&address).await;
    read_reply_line(&mut reader).await;

    send_line(&mut writer, "EHLO client.example").await;
    let mut saw_starttls = false;
    for _ in 0..5 {
        if read_reply_line(&mut reader).await.contains("STARTTLS") {
            saw_starttls = true;
        }
    }
    assert!(saw_starttls, "plaintext EHLO should advertise STARTTLS");

    send_line(&mut writer, "STARTTLS").await;
    assert_eq!(read_reply_line(&mut reader).await, "220 Ready to start TLS");

    let plain_stream = reader.into_inner().reunite(writer).unwrap();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth(),
    ));
    let server_name = rustls::pki_types::ServerName::try_from("quokka.test").unwrap();
    let tls_stream = connector.connect(server_name, plain_stream).await.unwrap();
    let (tls_read, mut tls_write) = tokio::io::split(tls_stream);
    let mut tls_reader = BufReader::new(tls_read);

    tls_write.write_all(b"EHLO client.example\r\n").await.unwrap();
    let mut saw_starttls_again = false;
    let mut line = String::new();
    loop {
        line.clear();
        tls_reader.read_line(&mut line).await.unwrap();
        if line.contains("STARTTLS") {
            saw_starttls_again = true;
        }
        if line.starts_with("250 ") {
            break;
        }
    }
    assert!(!saw_starttls_again, "STARTTLS must not be offered once TLS is already active");

    tls_write.write_all(b"QUIT\r\n").await.unwrap();
    line.clear();
    tls_reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("221"));

    server.close().await;
    let _ = server_task.await;
}

#[tokio::test]
async fn auth_plain_with_initial_response_authenticates() {
    let port = free_port();
    let address = format!("127.0.0.1:{port}");
    let server = Arc::new(Server::new(
        Config {
            address: address.clone(),
            domain: "quokka.test".to_string(),
            auth_mandatory: true,
            auth_encrypted: false,
            ..Config::default_config()
        },
        Arc::new(AcceptAllCredentials),
        Arc::new(LoggingSink),
    ));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.listen_and_serve().await })
    };

    let (mut reader, mut writer) = connect(&address).await;
    read_reply_line(&mut reader).await;

    send_line(&mut writer, "MAIL FROM:<a@b.example>").await;
    assert_eq!(read_reply_line(&mut reader).await, "530 5.7.0 Authentication required");

    let response = BASE64.encode(b"\0alice\0hunter2");
    send_line(&mut writer, &format!("AUTH PLAIN {response}")).await;
    assert_eq!(read_reply_line(&mut reader).await, "235 2.7.0 Authentication succeeded");

    send_line(&mut writer, "MAIL FROM:<a@b.example>").await;
    assert_eq!(read_reply_line(&mut reader).await, "250 2.1.0 Requested mail action okay, completed");

    send_line(&mut writer, "QUIT").await;
    read_reply_line(&mut reader).await;

    server.close().await;
    let _ = server_task.await;
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms.supported_schemes()
    }
}
