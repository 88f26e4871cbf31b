//! The `MailSink` collaborator interface: where a fully-received mail
//! transaction goes once DATA completes. spec.md §1 is explicit that
//! delivery, queueing, and persistence are out of scope for this crate —
//! the sink is the seam where a caller plugs that in.

use log::info;

/// A fully-received envelope and body, handed to the sink exactly once per
/// successful DATA command (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub body: Vec<String>,
}

/// Receives completed transactions. Implementations must be safe to call
/// concurrently across sessions (spec.md §5): the server holds one shared
/// `Arc<dyn MailSink>`.
#[async_trait::async_trait]
pub trait MailSink: Send + Sync {
    async fn accept(&self, transaction: Transaction);
}

/// A reference sink that just logs the transaction. Useful as a default
/// and in tests; real deployments inject their own sink (queue, relay,
/// webhook, mailbox store, ...).
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

#[async_trait::async_trait]
impl MailSink for LoggingSink {
    async fn accept(&self, transaction: Transaction) {
        info!(
            "transaction complete: from={} to={:?} body_lines={}",
            transaction.mail_from,
            transaction.rcpt_to,
            transaction.body.len()
        );
    }
}
