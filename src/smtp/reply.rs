//! Encodes a numeric SMTP reply code plus one or more text lines into the
//! hyphen/space continuation wire format (RFC 5321 §4.2.1).

/// A reply ready to be written to the wire. `code` is normative; `lines`
/// are advisory text but their *count* determines the continuation format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, lines: Vec<String>) -> Self {
        debug_assert!((200..600).contains(&code), "reply code out of range: {code}");
        Self { code, lines }
    }

    pub fn single(code: u16, line: impl Into<String>) -> Self {
        Self::new(code, vec![line.into()])
    }

    /// Encodes this reply as the bytes to write to the transport.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.lines.is_empty() {
            out.extend_from_slice(format!("{} \r\n", self.code).as_bytes());
            return out;
        }
        let (last, rest) = self.lines.split_last().expect("checked non-empty above");
        for line in rest {
            out.extend_from_slice(format!("{}-{}\r\n", self.code, line).as_bytes());
        }
        out.extend_from_slice(format!("{} {}\r\n", self.code, last).as_bytes());
        out
    }
}

// --- Named constructors used by the session, mirroring the vocabulary in
// spec.md §4.3/§8. Enhanced status codes (RFC 3463) are folded into the
// text per §8's scenarios; see DESIGN.md for the choices not pinned down
// by a concrete scenario. ---

pub fn ready(domain: &str) -> Reply {
    Reply::single(220, format!("{domain} Service ready"))
}

pub fn ready_to_start_tls() -> Reply {
    Reply::single(220, "Ready to start TLS")
}

pub fn closing(domain: &str) -> Reply {
    Reply::single(221, format!("2.0.0 {domain} Service closing transmission channel"))
}

pub fn ok() -> Reply {
    Reply::single(250, "2.0.0 Requested mail action okay, completed")
}

pub fn mail_ok() -> Reply {
    Reply::single(250, "2.1.0 Requested mail action okay, completed")
}

pub fn rcpt_ok() -> Reply {
    Reply::single(250, "2.1.5 Requested mail action okay, completed")
}

pub fn helo_ok() -> Reply {
    Reply::single(250, "Hello, nice to meet you")
}

/// `extensions` are appended verbatim as the `250-...`/`250 ...` continuation
/// lines, in the order the caller supplies (spec.md §6: AUTH PLAIN,
/// ENHANCEDSTATUSCODES, PIPELINING, conditionally STARTTLS).
pub fn ehlo_ok(extensions: &[String]) -> Reply {
    let mut lines = vec!["Hello, nice to meet you".to_string()];
    lines.extend(extensions.iter().cloned());
    Reply::new(250, lines)
}

pub fn start_mail_input() -> Reply {
    Reply::single(354, "Start mail input; end with <CRLF>.<CRLF>")
}

pub fn tls_not_available() -> Reply {
    Reply::single(454, "4.7.0 TLS not available due to temporary reason")
}

pub fn command_unrecognized() -> Reply {
    Reply::single(500, "5.5.2 Syntax error, command unrecognized")
}

pub fn syntax_error() -> Reply {
    Reply::single(501, "5.5.4 Syntax error in parameters or arguments")
}

pub fn cannot_decode_base64() -> Reply {
    Reply::single(501, "5.5.4 Cannot decode base64 authentication data")
}

pub fn bad_sequence() -> Reply {
    Reply::single(503, "5.5.1 Bad sequence of commands")
}

pub fn auth_mechanism_invalid() -> Reply {
    Reply::single(504, "5.5.4 Unrecognized authentication mechanism")
}

pub fn authentication_required() -> Reply {
    Reply::single(530, "5.7.0 Authentication required")
}

pub fn must_starttls_first() -> Reply {
    Reply::single(530, "5.7.0 Must issue a STARTTLS command first")
}

pub fn auth_succeeded() -> Reply {
    Reply::single(235, "2.7.0 Authentication succeeded")
}

pub fn auth_failed() -> Reply {
    Reply::single(535, "5.7.8 Authentication credentials invalid")
}

/// The empty-challenge `334 ` reply used when AUTH PLAIN has no initial
/// response and the server must prompt for one.
pub fn auth_continue() -> Reply {
    Reply::new(334, vec![])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_empty_lines_as_code_space_crlf() {
        assert_eq!(Reply::new(334, vec![]).encode(), b"334 \r\n");
    }

    #[test]
    fn encodes_single_line_with_space() {
        assert_eq!(Reply::single(250, "OK").encode(), b"250 OK\r\n");
    }

    #[test]
    fn encodes_multi_line_with_hyphen_continuation() {
        let reply = Reply::new(
            250,
            vec!["Hello".to_string(), "AUTH PLAIN".to_string(), "STARTTLS".to_string()],
        );
        assert_eq!(
            reply.encode(),
            b"250-Hello\r\n250-AUTH PLAIN\r\n250 STARTTLS\r\n".to_vec()
        );
    }

    #[test]
    fn ehlo_extensions_scenario() {
        let extensions = vec![
            "AUTH PLAIN".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
            "PIPELINING".to_string(),
            "STARTTLS".to_string(),
        ];
        let reply = ehlo_ok(&extensions);
        assert_eq!(
            reply.encode(),
            b"250-Hello, nice to meet you\r\n250-AUTH PLAIN\r\n250-ENHANCEDSTATUSCODES\r\n250-PIPELINING\r\n250 STARTTLS\r\n".to_vec()
        );
    }

    #[test]
    fn round_trips_code_and_line_count() {
        let reply = Reply::new(250, vec!["a".to_string(), "b".to_string()]);
        let encoded = reply.encode();
        let text = String::from_utf8(encoded).unwrap();
        let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), reply.lines.len());
        for line in lines.iter() {
            let (code_str, _) = line.split_at(3);
            assert_eq!(code_str.parse::<u16>().unwrap(), reply.code);
        }
    }
}
