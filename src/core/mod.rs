//! Core components for the BB84 protocol.
//!
//! This module contains the fundamental building blocks of the protocol,
//! including the quantum simulation, key management, message formats,
//! exchange sessions and error handling.

// Simulated quantum channel
pub mod quantum;

// Key lifecycle and pad cipher
pub mod crypto;

// Export message handling
pub mod message;

// Export session management
pub mod session;

// Protocol constants
pub mod constants;

// Configuration
pub mod config;

// Error handling
pub mod error;

// Re-exports for convenience
pub use self::error::{Error, Result};
pub use self::config::{NetworkConfig, ProtocolConfig, RetryPolicy};
pub use self::message::{types::MessageType, format::MessageHeader};
pub use self::session::{state::ExchangeState, state::Role};
