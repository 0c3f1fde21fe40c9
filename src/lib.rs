/*!
# BB84 Protocol

A simulation of the BB84 quantum key distribution protocol between two peers,
Alice and Bob, with the resulting key used as a single-use pad for chat.

## Overview

This library provides:

- Photon encoding and measurement in the rectilinear and diagonal bases
- Basis sifting, sampled error estimation and eavesdropper detection
- An optional intercept-resend eavesdropper
- Key expansion with HKDF-SHA256, consumption accounting and rotation
- An interactive two-party exchange over TCP or an in-memory transport
- A local simulation running both parties in one process

## Key Material

Keys live only in memory. Key bits are zeroed when a key is replaced,
compromised, cleared or dropped, and nothing is ever written to storage.
*/

// Core protocol components
pub mod core;

// Protocol implementation
pub mod protocol;

// Re-export commonly used types for convenience
pub use core::error::{Error, Result};
pub use core::config::{NetworkConfig, ProtocolConfig, RetryPolicy};
pub use core::message::{MessageHeader, MessageType, WireMessage};
pub use core::session::{ExchangeState, Role};
pub use core::quantum::{Basis, Eavesdropper, Photon, SimulationResult, establish_local_key, simulate};
pub use core::crypto::{CryptoDetails, KeyInfo, KeyManager, KeyStatus, decrypt_message, encrypt_message};

// Re-export the interactive protocol
pub use protocol::{ChatSent, Coordinator, ExchangeReport, Peer, PeerEvent, TcpTransport, Transport};
