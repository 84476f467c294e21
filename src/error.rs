// Copyright (c) 2025 jabberwock contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Detailed error types.

use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use crate::jid;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Invalid argument passed to an API (bad port, empty hostname, wrong
    /// IQ kind, …)
    Argument(String),
    /// API called before `connect()` completed
    NotConnected,
    /// I/O error
    Io(IoError),
    /// Connection closed
    Disconnected,
    /// TLS handshake or verification failure
    Tls(TlsError),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// An IQ request did not answer within its bound
    Timeout,
    /// Unrecoverable stream-management failure
    Sm(SmError),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Argument(s) => write!(fmt, "invalid argument: {}", s),
            Error::NotConnected => write!(fmt, "not connected"),
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Timeout => write!(fmt, "request timed out"),
            Error::Sm(e) => write!(fmt, "stream management error: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Tls(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Auth(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Tls(e)
    }
}

impl From<SmError> for Error {
    fn from(e: SmError) -> Self {
        Error::Sm(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// XML parser error
    Parser(String),
    /// Received an element whose name was not among the expected ones
    UnexpectedElement(String),
    /// A received stanza did not match its schema
    MalformedStanza(String),
    /// Invalid response to resource binding
    InvalidBindResponse,
    /// No id attribute in `<stream:stream>`
    NoStreamId,
    /// Peer closed the stream with `</stream:stream>`
    StreamClosed,
    /// Peer sent `<stream:error>` with the contained condition
    StreamError(String),
    /// Malformed XEP-0198 frame
    InvalidSmFrame(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::UnexpectedElement(name) => {
                write!(fmt, "unexpected element: <{}>", name)
            }
            ProtocolError::MalformedStanza(e) => write!(fmt, "malformed stanza: {}", e),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::NoStreamId => write!(fmt, "no id attribute in <stream:stream>"),
            ProtocolError::StreamClosed => write!(fmt, "stream closed by peer"),
            ProtocolError::StreamError(cond) => write!(fmt, "stream error: {}", cond),
            ProtocolError::InvalidSmFrame(e) => {
                write!(fmt, "malformed stream management frame: {}", e)
            }
        }
    }
}

impl StdError for ProtocolError {}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available
    NoMechanism,
    /// Local SASL implementation error
    Sasl(String),
    /// Failure condition reported by the server
    Fail(String),
    /// The server requires TLS but TLS was disabled locally
    TlsRequired,
    /// The server signature in `<success/>` did not verify
    ServerSignature,
}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(s) => write!(fmt, "local SASL implementation error: {}", s),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {}", c),
            AuthError::TlsRequired => write!(fmt, "TLS required"),
            AuthError::ServerSignature => write!(fmt, "server signature verification failed"),
        }
    }
}

impl StdError for AuthError {}

/// TLS error
#[derive(Debug)]
pub enum TlsError {
    /// Handshake or certificate failure from the TLS library
    Handshake(IoError),
    /// The server name could not be used for TLS
    InvalidName(String),
    /// The verification callback rejected the certificate chain
    Rejected,
}

impl fmt::Display for TlsError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsError::Handshake(e) => write!(fmt, "handshake failed: {}", e),
            TlsError::InvalidName(name) => write!(fmt, "invalid TLS server name: {}", name),
            TlsError::Rejected => write!(fmt, "certificate rejected by verification callback"),
        }
    }
}

impl StdError for TlsError {}

/// Unrecoverable stream-management failure
#[derive(Debug)]
pub enum SmError {
    /// The reconnect budget was exhausted
    ReconnectFailed,
    /// The server refused to enable stream management
    EnableFailed(String),
    /// The server refused to resume the stream for a reason other than
    /// a forgotten session
    ResumeFailed(String),
    /// The server acked more stanzas than were sent, or its counter went
    /// backwards
    AckOutOfRange {
        /// The remote `h` value
        h: u32,
        /// Our own send count
        outbound_seq: u32,
    },
}

impl fmt::Display for SmError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SmError::ReconnectFailed => write!(fmt, "reconnect budget exhausted"),
            SmError::EnableFailed(cond) => write!(fmt, "server refused enable: {}", cond),
            SmError::ResumeFailed(cond) => write!(fmt, "server refused resume: {}", cond),
            SmError::AckOutOfRange { h, outbound_seq } => write!(
                fmt,
                "remote acked out of range: h = {}, send count = {}",
                h, outbound_seq
            ),
        }
    }
}

impl StdError for SmError {}
