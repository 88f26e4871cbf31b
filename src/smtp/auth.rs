//! SASL PLAIN (RFC 4954 §4 / RFC 4616) support: the `Credentials`
//! collaborator interface and the base64 payload decode.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Verifies a username/password pair. Injected into the `Server` so the
/// core protocol engine never hard-codes a credential store (spec.md §1:
/// "Credential verification ... is assumed; reference implementation
/// accepts any well-formed PLAIN response").
#[async_trait::async_trait]
pub trait Credentials: Send + Sync {
    async fn verify(&self, authcid: &str, passwd: &str) -> bool;
}

/// The reference collaborator: accepts any non-empty username. This is
/// spec.md's stated default behavior, not a security posture — real
/// deployments inject their own `Credentials` impl.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllCredentials;

#[async_trait::async_trait]
impl Credentials for AcceptAllCredentials {
    async fn verify(&self, _authcid: &str, _passwd: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlainAuthError {
    InvalidBase64,
    MalformedPayload,
}

/// The three NUL-separated fields of a decoded SASL PLAIN response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainAuth {
    pub authzid: String,
    pub authcid: String,
    pub passwd: String,
}

/// Decodes and splits a base64 SASL PLAIN response into its three fields.
pub fn decode_plain(base64_response: &str) -> Result<PlainAuth, PlainAuthError> {
    let raw = BASE64
        .decode(base64_response)
        .map_err(|_| PlainAuthError::InvalidBase64)?;
    let parts: Vec<&[u8]> = raw.splitn(3, |&b| b == 0).collect();
    if parts.len() != 3 {
        return Err(PlainAuthError::MalformedPayload);
    }
    let to_string = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();
    Ok(PlainAuth {
        authzid: to_string(parts[0]),
        authcid: to_string(parts[1]),
        passwd: to_string(parts[2]),
    })
}
