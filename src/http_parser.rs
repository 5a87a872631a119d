//! Incremental HTTP/1.1 header parser shared by the SSDP datagram path (where a whole
//! UDP payload is fed at once) and the GENA/SOAP HTTP path (where bytes may arrive in
//! arbitrary chunks off a TCP stream).
//!
//! Only what the core needs is implemented: parsing stops once headers are complete.
//! Bodies are handed back as the unconsumed remainder of the buffer rather than parsed
//! further, since every caller in this crate already knows the body framing it wants
//! (SOAP envelope, raw XML, empty) once it has the headers.

use std::collections::HashMap;

use crate::error::HttpParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Request,
    Response,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, target: String },
    Response { status: u16, reason: String },
}

/// A fully parsed start line plus header block. Header lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct ParsedHeaders {
    pub method: Option<String>,
    pub target: Option<String>,
    pub status: Option<u16>,
    headers: HashMap<String, String>,
}

impl ParsedHeaders {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }
}

/// Result of feeding bytes into the parser.
pub enum ParseOutcome {
    /// Not enough bytes yet to complete the headers; `consumed` bytes were buffered.
    NeedMoreBytes { consumed: usize },
    /// Headers are complete. `consumed` is the number of bytes making up the header
    /// block (including the terminating blank line); anything after that is body.
    HeadersComplete {
        consumed: usize,
        headers: ParsedHeaders,
    },
}

/// Single-message incremental parser. A fresh instance is created per datagram/request;
/// `feed` may be called multiple times with successive chunks of the same message.
pub struct Parser {
    mode: Mode,
    buf: Vec<u8>,
    done: bool,
}

impl Parser {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            buf: Vec::new(),
            done: false,
        }
    }

    /// Feeds `bytes` into the parser. Returns the outcome; once `HeadersComplete` or an
    /// `Err` has been returned once, the parser must be discarded (further `feed` calls
    /// return `HeaderTooLarge`-free but dead state is explicitly not supported here,
    /// matching the spec's "on unrecoverable error the parser is unusable" contract).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<ParseOutcome, HttpParseError> {
        if self.done {
            return Err(HttpParseError::MalformedHeader(
                "parser already completed or errored".into(),
            ));
        }
        self.buf.extend_from_slice(bytes);

        let Some(header_end) = find_header_terminator(&self.buf) else {
            if self.buf.len() > 16 * 1024 {
                self.done = true;
                return Err(HttpParseError::HeaderTooLarge);
            }
            return Ok(ParseOutcome::NeedMoreBytes {
                consumed: bytes.len(),
            });
        };

        let head = &self.buf[..header_end];
        let text = std::str::from_utf8(head)
            .map_err(|_| HttpParseError::MalformedHeader("non-utf8 header block".into()))?;
        let headers = parse_head(text, self.mode)?;
        self.done = true;

        // `consumed` is reported relative to this call's `bytes`, which may only be a
        // suffix of the full accumulated buffer if headers completed over multiple feeds.
        let already_buffered_before_this_call = self.buf.len() - bytes.len();
        let consumed_total = header_end + 4; // +4 for the terminating CRLFCRLF
        let consumed_this_call = consumed_total.saturating_sub(already_buffered_before_this_call);
        Ok(ParseOutcome::HeadersComplete {
            consumed: consumed_this_call.min(bytes.len()),
            headers,
        })
    }
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(text: &str, mode: Mode) -> Result<ParsedHeaders, HttpParseError> {
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .ok_or_else(|| HttpParseError::MalformedStartLine("empty message".into()))?;

    let parsed_start = parse_start_line(start_line, mode)?;

    let mut headers = ParsedHeaders::default();
    match parsed_start {
        StartLine::Request { method, target } => {
            headers.method = Some(method);
            headers.target = Some(target);
        }
        StartLine::Response { status, .. } => {
            headers.status = Some(status);
        }
    }

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpParseError::MalformedHeader(line.to_string()))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim_start().to_string();
        headers.headers.insert(name, value);
    }

    Ok(headers)
}

fn parse_start_line(line: &str, mode: Mode) -> Result<StartLine, HttpParseError> {
    if let Some(rest) = line.strip_prefix("HTTP/") {
        if matches!(mode, Mode::Request) {
            return Err(HttpParseError::MalformedStartLine(line.to_string()));
        }
        // "1.1 200 OK"
        let mut parts = rest.splitn(2, ' ');
        let _version = parts.next();
        let rest = parts
            .next()
            .ok_or_else(|| HttpParseError::MalformedStartLine(line.to_string()))?;
        let (status, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let status: u16 = status
            .parse()
            .map_err(|_| HttpParseError::MalformedStartLine(line.to_string()))?;
        return Ok(StartLine::Response {
            status,
            reason: reason.to_string(),
        });
    }

    if matches!(mode, Mode::Response) {
        return Err(HttpParseError::MalformedStartLine(line.to_string()));
    }

    let mut parts = line.splitn(3, ' ');
    let method = parts
        .next()
        .ok_or_else(|| HttpParseError::MalformedStartLine(line.to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| HttpParseError::MalformedStartLine(line.to_string()))?;
    const KNOWN_METHODS: &[&str] = &[
        "NOTIFY",
        "M-SEARCH",
        "SUBSCRIBE",
        "UNSUBSCRIBE",
        "POST",
        "GET",
    ];
    if !KNOWN_METHODS.contains(&method) {
        return Err(HttpParseError::MalformedStartLine(line.to_string()));
    }
    Ok(StartLine::Request {
        method: method.to_string(),
        target: target.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFY_ALIVE: &str = "NOTIFY * HTTP/1.1\r\n\
HOST:239.255.255.250:1900\r\n\
CACHE-CONTROL:max-age=60\r\n\
LOCATION:http://192.168.1.1:5000/rootDesc.xml\r\n\
NT:urn:schemas-upnp-org:device:WANDevice:1\r\n\
NTS:ssdp:alive\r\n\
SERVER: Linux, UPnP/1.0, custom\r\n\
USN:uuid:A37351C5-8521-4c24-A43E-5C353B9982A9::urn:schemas-upnp-org:device:WANDevice:1\r\n\
\r\n";

    #[test]
    fn parses_full_notify_in_one_call() {
        let mut parser = Parser::new(Mode::Both);
        let outcome = parser.feed(NOTIFY_ALIVE.as_bytes()).unwrap();
        match outcome {
            ParseOutcome::HeadersComplete { consumed, headers } => {
                assert_eq!(consumed, NOTIFY_ALIVE.len());
                assert_eq!(headers.method.as_deref(), Some("NOTIFY"));
                assert_eq!(headers.header("cache-control"), Some("max-age=60"));
                assert_eq!(headers.header("Nts"), Some("ssdp:alive"));
            }
            ParseOutcome::NeedMoreBytes { .. } => panic!("expected headers complete"),
        }
    }

    #[test]
    fn chunked_parse_consumes_everything_and_completes_once() {
        let bytes = NOTIFY_ALIVE.as_bytes();
        let split = bytes.len() / 2;
        let mut parser = Parser::new(Mode::Both);

        let mut total_consumed = 0;
        let first = parser.feed(&bytes[..split]).unwrap();
        match first {
            ParseOutcome::NeedMoreBytes { consumed } => total_consumed += consumed,
            ParseOutcome::HeadersComplete { .. } => panic!("should not complete on first half"),
        }

        let second = parser.feed(&bytes[split..]).unwrap();
        match second {
            ParseOutcome::HeadersComplete { consumed, headers } => {
                total_consumed += consumed;
                assert_eq!(headers.method.as_deref(), Some("NOTIFY"));
            }
            ParseOutcome::NeedMoreBytes { .. } => panic!("expected headers complete on second feed"),
        }
        assert_eq!(total_consumed, bytes.len());
    }

    #[test]
    fn response_mode_parses_status_line() {
        let response = "HTTP/1.1 200 OK\r\nST:ssdp:all\r\n\r\n";
        let mut parser = Parser::new(Mode::Response);
        match parser.feed(response.as_bytes()).unwrap() {
            ParseOutcome::HeadersComplete { headers, .. } => {
                assert_eq!(headers.status, Some(200));
                assert_eq!(headers.header("st"), Some("ssdp:all"));
            }
            _ => panic!("expected headers complete"),
        }
    }

    #[test]
    fn malformed_start_line_is_unrecoverable() {
        let mut parser = Parser::new(Mode::Request);
        let garbage = "not a request line at all\r\n\r\n";
        assert!(parser.feed(garbage.as_bytes()).is_err());
    }
}
