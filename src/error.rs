//! Structured error types for the boundaries the spec calls out as needing a
//! distinguishable result rather than a plain propagated [`anyhow::Error`].

use thiserror::Error;

/// Distinguishes "need more bytes" from "the stream is unrecoverable" per the HTTP
/// parser's contract: on an unrecoverable error the parser must be discarded.
#[derive(Debug, Error)]
pub enum HttpParseError {
    #[error("malformed start line: {0}")]
    MalformedStartLine(String),
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("header line exceeds maximum size")]
    HeaderTooLarge,
}

/// Errors surfaced by the SSDP client/server that callers may want to branch on,
/// as opposed to the warn-and-drop handling protocol parse errors get internally.
#[derive(Debug, Error)]
pub enum SsdpError {
    #[error("failed to bind ssdp socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to join multicast group: {0}")]
    JoinMulticast(#[source] std::io::Error),
    #[error("socket send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("no usable local ipv4 address found")]
    NoLocalAddress,
}

/// Outcome of a GENA subscribe/renew/unsubscribe or SOAP action call against a
/// remote publisher, distinguishing transport failure from a semantic 412/5xx.
#[derive(Debug, Error)]
pub enum ActionCallError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("precondition failed (unknown or expired subscription)")]
    PreconditionFailed,
    #[error("remote fault {code}: {description:?}")]
    Fault { code: u16, description: Option<String> },
    #[error("failed to parse response: {0}")]
    Parse(#[source] anyhow::Error),
}
