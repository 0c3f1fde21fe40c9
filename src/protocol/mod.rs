//! Protocol implementation for BB84.
//!
//! This module runs the interactive exchange between two peers: transports,
//! inbound routing, the exchange coordinator and the chat-facing peer.

// Transport abstraction and in-memory transport
pub mod transport;

// TCP transport
pub mod tcp;

// Inbound routing
pub mod router;

// Exchange coordinator
pub mod coordinator;

// Chat-facing peer
pub mod peer;

// Re-export for convenience
pub use coordinator::{Coordinator, ExchangeReport, abort_reason};
pub use peer::{ChatSent, Peer, PeerEvent};
pub use router::{AppInbound, CancelHandle, Inbound, Inbox, Router};
pub use tcp::TcpTransport;
pub use transport::{MemoryTransport, SequenceCounter, Transport};
