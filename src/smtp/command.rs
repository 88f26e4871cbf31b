//! Tokenizes a single CRLF-stripped SMTP command line into a [`Command`].
//!
//! Pure functions only: no I/O, no policy. A parse failure here is a wire
//! syntax error (501); whether a syntactically valid command is allowed in
//! the current session state is decided by the session, not here.

/// One recognized (or unrecognized) SMTP command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ehlo(String),
    Helo(String),
    Mail(String),
    Rcpt(String),
    Data,
    Quit,
    Rset,
    Noop,
    StartTls,
    /// `(mechanism, initial_response)` — initial_response is the optional
    /// base64 token that may follow the mechanism on the same line.
    Auth(String, Option<String>),
    Unknown(String),
}

/// A structural parse failure. Distinct variants exist only so callers can
/// log precisely; the session maps all of them to a 501 reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    MalformedMail,
    EmptyReversePath,
    MalformedRcpt,
    EmptyForwardPath,
    MalformedAuth,
}

/// Splits `line` at its first whitespace run, returning `(verb, rest)` with
/// `rest` left-trimmed. `rest` is `""` if there is no whitespace in `line`.
fn split_verb(line: &str) -> (&str, &str) {
    match line.find(|c: char| c.is_whitespace()) {
        Some(idx) => (&line[..idx], line[idx..].trim_start()),
        None => (line, ""),
    }
}

/// Parses one command line (already stripped of its trailing CRLF).
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let (verb, rest) = split_verb(line);
    match verb.to_uppercase().as_str() {
        "EHLO" => Ok(Command::Ehlo(rest.to_string())),
        "HELO" => Ok(Command::Helo(rest.to_string())),
        "DATA" => Ok(Command::Data),
        "QUIT" => Ok(Command::Quit),
        "RSET" => Ok(Command::Rset),
        "NOOP" => Ok(Command::Noop),
        "STARTTLS" => Ok(Command::StartTls),
        "MAIL" => parse_mail(line),
        "RCPT" => parse_rcpt(line),
        "AUTH" => parse_auth(rest),
        _ => Ok(Command::Unknown(line.to_string())),
    }
}

/// First whitespace-separated token of `s`, or `None` if `s` is empty.
fn first_token(s: &str) -> Option<&str> {
    s.split_whitespace().next()
}

/// Checks `line` starts with the ASCII `prefix`, case-insensitively, by
/// comparing bytes. Never slices `line` on a non-ASCII char boundary:
/// a multibyte UTF-8 char anywhere in `line`, including straddling
/// `prefix.len()`, simply fails the byte comparison rather than panicking.
fn starts_with_ignore_ascii_case(line: &str, prefix: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn parse_mail(line: &str) -> Result<Command, ParseError> {
    const PREFIX: &str = "MAIL FROM:";
    if !starts_with_ignore_ascii_case(line, PREFIX) {
        return Err(ParseError::MalformedMail);
    }
    let remainder = line[PREFIX.len()..].trim_start_matches(' ');
    match first_token(remainder) {
        Some(path) if !path.is_empty() => Ok(Command::Mail(path.to_string())),
        _ => Err(ParseError::EmptyReversePath),
    }
}

fn parse_rcpt(line: &str) -> Result<Command, ParseError> {
    const PREFIX: &str = "RCPT TO:";
    if !starts_with_ignore_ascii_case(line, PREFIX) {
        return Err(ParseError::MalformedRcpt);
    }
    let remainder = line[PREFIX.len()..].trim_start_matches(' ');
    match first_token(remainder) {
        Some(path) if !path.is_empty() => Ok(Command::Rcpt(path.to_string())),
        _ => Err(ParseError::EmptyForwardPath),
    }
}

fn parse_auth(rest: &str) -> Result<Command, ParseError> {
    let mut tokens = rest.split_whitespace();
    let mechanism = tokens.next().ok_or(ParseError::MalformedAuth)?;
    if mechanism.is_empty() {
        return Err(ParseError::MalformedAuth);
    }
    let initial_response = tokens.next().map(|s| s.to_string());
    Ok(Command::Auth(mechanism.to_uppercase(), initial_response))
}
