/*!
Error handling for the BB84 protocol.

Errors are split along the recovery policy of the exchange: quantum-channel
failures (`EavesdropperDetected`, `KeyTooShort`) are retried internally, key
accounting failures (`KeyExhausted`, `NoActiveKey`) require a rotation, and
transport failures tear the connection down.
*/

use std::io;
use thiserror::Error;

/// Result type for the BB84 protocol
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the BB84 protocol
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Sampled error rate exceeded the configured threshold
    #[error("Eavesdropper detected: error rate {:.1}% exceeds threshold {:.1}%", .error_rate * 100.0, .threshold * 100.0)]
    EavesdropperDetected {
        /// Measured error rate over the disclosed sample
        error_rate: f64,
        /// Threshold in force for the exchange
        threshold: f64,
    },

    /// Reconciliation left fewer bits than the minimum key length
    #[error("Key too short: {length} bits, minimum is {minimum}")]
    KeyTooShort {
        /// Bits left after sample removal
        length: usize,
        /// Configured minimum
        minimum: usize,
    },

    /// Not enough keystream bits remain for the request
    #[error("Key exhausted: need {requested} bits but only {remaining} remain")]
    KeyExhausted {
        /// Bits requested
        requested: usize,
        /// Bits left on the current key
        remaining: usize,
    },

    /// No key is held (never established, cleared or compromised)
    #[error("No active key")]
    NoActiveKey,

    /// Peer ciphertext was produced from a different key position
    #[error("Key desynchronized: peer used key {peer_key}@{peer_offset}, local key is {local_key}@{local_offset}")]
    KeyDesynchronized {
        /// Key id announced by the peer
        peer_key: String,
        /// Keystream offset announced by the peer
        peer_offset: usize,
        /// Local key id
        local_key: String,
        /// Local keystream offset
        local_offset: usize,
    },

    /// Peer did not answer within the deadline of an awaiting state
    #[error("Exchange timed out in state {state} after {waited_ms} ms")]
    ExchangeTimeout {
        /// State that was waiting
        state: String,
        /// How long the state waited
        waited_ms: u64,
    },

    /// Peer aborted the running exchange
    #[error("Exchange aborted by peer: {0}")]
    ExchangeAborted(String),

    /// Local cancel or peer disconnect while waiting
    #[error("Exchange cancelled")]
    Cancelled,

    /// Bounded retry loop gave up
    #[error("Key exchange failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last: Box<Error>,
    },

    /// Send or receive failure on the connection
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Malformed or out-of-sequence message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid message or data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Operation not valid in the current state
    #[error("Session not in correct state: expected {expected}, but was {actual}")]
    InvalidState {
        expected: String,
        actual: String,
    },

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error leaves the connection usable.
    ///
    /// Recoverable errors are either retried by the exchange loop or fixed by
    /// a key rotation; the rest end the session.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::EavesdropperDetected { .. }
            | Error::KeyTooShort { .. }
            | Error::KeyExhausted { .. }
            | Error::NoActiveKey
            | Error::KeyDesynchronized { .. }
            | Error::ExchangeTimeout { .. }
            | Error::ExchangeAborted(_)
            | Error::RetriesExhausted { .. }
            | Error::ProtocolViolation(_)
            | Error::InvalidFormat(_) => true,
            Error::Io(_)
            | Error::Cancelled
            | Error::TransportFailure(_)
            | Error::InvalidState { .. }
            | Error::Serialization(_)
            | Error::Config(_) => false,
        }
    }

    /// Whether a fresh exchange attempt may succeed where this one failed.
    pub fn should_retry_exchange(&self) -> bool {
        matches!(
            self,
            Error::EavesdropperDetected { .. } | Error::KeyTooShort { .. }
        )
    }
}

/// Create a protocol violation error
#[macro_export]
macro_rules! protocol_err {
    ($msg:expr) => {
        Err($crate::core::error::Error::ProtocolViolation($msg.to_string()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        Err($crate::core::error::Error::ProtocolViolation(format!($fmt, $($arg)*)))
    };
}

/// Create an invalid state error
#[macro_export]
macro_rules! invalid_state_err {
    ($expected:expr, $actual:expr) => {
        Err($crate::core::error::Error::InvalidState {
            expected: $expected.to_string(),
            actual: $actual.to_string(),
        })
    };
}

/// Create an invalid format error
#[macro_export]
macro_rules! format_err {
    ($msg:expr) => {
        Err($crate::core::error::Error::InvalidFormat($msg.to_string()))
    };
    ($fmt:expr, $($arg:tt)*) => {
        Err($crate::core::error::Error::InvalidFormat(format!($fmt, $($arg)*)))
    };
}

/// Convert from Error to io::Error (for compatibility)
impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(io_error) => io_error,
            Error::ExchangeTimeout { state, waited_ms } => io::Error::new(
                io::ErrorKind::TimedOut,
                format!("Exchange timed out in state {} after {} ms", state, waited_ms),
            ),
            Error::TransportFailure(msg) => io::Error::new(io::ErrorKind::BrokenPipe, msg),
            Error::Cancelled => io::Error::new(io::ErrorKind::Interrupted, "Exchange cancelled"),
            Error::ProtocolViolation(msg) | Error::InvalidFormat(msg) => {
                io::Error::new(io::ErrorKind::InvalidData, msg)
            }
            Error::Serialization(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            Error::InvalidState { expected, actual } => io::Error::new(
                io::ErrorKind::NotConnected,
                format!("Invalid state: expected {}, but was {}", expected, actual),
            ),
            Error::Config(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
