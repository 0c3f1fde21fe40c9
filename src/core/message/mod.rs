/*!
Message handling for the BB84 protocol.

This module provides types and utilities for working with protocol messages,
including message types, frame headers and typed payloads.
*/

pub mod types;
pub mod format;
pub mod payload;

// Re-export commonly used items
pub use types::MessageType;
pub use format::{Frame, MessageHeader};
pub use payload::{Envelope, WireMessage};
