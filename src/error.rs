//! Error types for the SSTP client.
//!
//! Three layers:
//! - [`ParseError`]: a wire unit could not be decoded.
//! - [`Failure`]: the terminal outcome kind a phase reports to the orchestrator.
//! - [`Error`]: what the public API returns.

use thiserror::Error;

use crate::types::Phase;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Decoding failure of an SSTP or PPP unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer bytes available than the unit needs.
    #[error("{unit}: truncated, needed {needed} bytes but {available} available")]
    Truncated {
        unit: &'static str,
        needed: usize,
        available: usize,
    },

    /// Declared length is outside the unit's valid range.
    #[error("{unit}: declared length {length} outside {min}..={max}")]
    LengthOutOfRange {
        unit: &'static str,
        length: usize,
        min: usize,
        max: usize,
    },

    /// A constant or enumerated field holds an unexpected value.
    #[error("{unit}: invalid {field} 0x{value:X}")]
    InvalidField {
        unit: &'static str,
        field: &'static str,
        value: u32,
    },

    /// An option list did not end exactly at the declared length.
    #[error("{unit}: option list overruns declared length by {excess} bytes")]
    OptionOverrun { unit: &'static str, excess: usize },

    /// A message lacks an attribute it must carry.
    #[error("{unit}: missing {attribute} attribute")]
    MissingAttribute {
        unit: &'static str,
        attribute: &'static str,
    },
}

/// Terminal outcome kind of a phase.
///
/// Every phase task reports exactly one of these (or success) to the
/// orchestrator, which alone decides between abort and reconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    #[error("timed out")]
    Timeout,

    #[error("retry counter exhausted")]
    CountExhausted,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The server said success but its authenticator did not verify.
    #[error("server authenticator verification failed")]
    VerificationFailed,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("protocol 0x{0:04X} rejected by peer")]
    ProtocolRejected(u16),

    #[error("code {0} rejected by peer")]
    CodeRejected(u8),

    /// Peer rejected an option we cannot negotiate without.
    #[error("mandatory option {0} rejected by peer")]
    OptionRejected(u8),

    /// Peer insisted on a value we cannot accept.
    #[error("option {0} not acceptable: {1}")]
    OptionUnacceptable(u8, String),

    #[error("call connect refused by server: {0}")]
    ConnectNak(String),

    #[error("disconnect requested by server{}", status_suffix(.0))]
    DisconnectRequested(Option<String>),

    #[error("abort requested by server{}", status_suffix(.0))]
    AbortRequested(Option<String>),

    #[error("link terminated by peer")]
    TerminateRequested,

    #[error("connection closed by peer")]
    LinkClosed,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("disconnect requested by user")]
    UserDisconnect,
}

fn status_suffix(status: &Option<String>) -> String {
    match status {
        Some(text) => format!(" ({text})"),
        None => String::new(),
    }
}

impl Failure {
    /// Whether the orchestrator may schedule a reconnect after this outcome.
    ///
    /// Authentication problems are never retried silently.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::AuthenticationFailed(_) | Self::VerificationFailed | Self::UserDisconnect
        )
    }
}

impl From<ParseError> for Failure {
    fn from(err: ParseError) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Main error type for the SSTP client.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The HTTPS upgrade to SSTP was refused or garbled.
    #[error("SSTP upgrade failed: {0}")]
    Upgrade(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IP terminal error: {0}")]
    Terminal(String),

    /// A session phase ended with a failure.
    #[error("{phase} phase failed: {failure}")]
    Session { phase: Phase, failure: Failure },
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new TLS error.
    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Self::Tls(msg.into())
    }

    pub fn session(phase: Phase, failure: Failure) -> Self {
        Self::Session { phase, failure }
    }

    /// Check if this is a retriable error.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Tls(_) | Self::Upgrade(_) | Self::Terminal(_) => true,
            Self::Session { failure, .. } => failure.is_retriable(),
            Self::Config(_) | Self::Parse(_) | Self::Crypto(_) => false,
        }
    }
}
