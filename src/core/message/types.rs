/*!
Message types for the BB84 protocol.

This module defines the different types of messages that can be
exchanged between the two peers.
*/

use std::fmt;

/// Protocol message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Encrypted chat message
    Chat = 0x01,
    /// Start of a key exchange
    ExchangeInit = 0x10,
    /// Photons sent over the simulated quantum channel
    PhotonBatch = 0x11,
    /// Receiver's measurement bases
    BasisBatch = 0x12,
    /// Matching positions and the chosen sample
    MatchPositions = 0x13,
    /// Receiver's bits at the sample positions
    SampleBits = 0x14,
    /// Exchange succeeded
    KeyComplete = 0x16,
    /// Exchange abandoned
    Abort = 0x17,
    /// Ask the peer to run a new exchange
    KeyRotateRequest = 0x20,
    /// Eavesdropper simulation switched on or off
    EveToggle = 0x50,
    /// Orderly shutdown
    Disconnect = 0xFE,
    /// Error report
    Error = 0xFF,
}

impl MessageType {
    /// Convert a u8 value to a MessageType
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MessageType::Chat),
            0x10 => Some(MessageType::ExchangeInit),
            0x11 => Some(MessageType::PhotonBatch),
            0x12 => Some(MessageType::BasisBatch),
            0x13 => Some(MessageType::MatchPositions),
            0x14 => Some(MessageType::SampleBits),
            0x16 => Some(MessageType::KeyComplete),
            0x17 => Some(MessageType::Abort),
            0x20 => Some(MessageType::KeyRotateRequest),
            0x50 => Some(MessageType::EveToggle),
            0xFE => Some(MessageType::Disconnect),
            0xFF => Some(MessageType::Error),
            _ => None,
        }
    }

    /// Get the u8 value of this MessageType
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the message belongs to a running key exchange
    pub fn is_exchange(self) -> bool {
        matches!(
            self,
            MessageType::ExchangeInit
                | MessageType::PhotonBatch
                | MessageType::BasisBatch
                | MessageType::MatchPositions
                | MessageType::SampleBits
                | MessageType::KeyComplete
                | MessageType::Abort
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Chat => write!(f, "Chat"),
            MessageType::ExchangeInit => write!(f, "ExchangeInit"),
            MessageType::PhotonBatch => write!(f, "PhotonBatch"),
            MessageType::BasisBatch => write!(f, "BasisBatch"),
            MessageType::MatchPositions => write!(f, "MatchPositions"),
            MessageType::SampleBits => write!(f, "SampleBits"),
            MessageType::KeyComplete => write!(f, "KeyComplete"),
            MessageType::Abort => write!(f, "Abort"),
            MessageType::KeyRotateRequest => write!(f, "KeyRotateRequest"),
            MessageType::EveToggle => write!(f, "EveToggle"),
            MessageType::Disconnect => write!(f, "Disconnect"),
            MessageType::Error => write!(f, "Error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(0x01), Some(MessageType::Chat));
        assert_eq!(MessageType::from_u8(0x10), Some(MessageType::ExchangeInit));
        assert_eq!(MessageType::from_u8(0x16), Some(MessageType::KeyComplete));
        assert_eq!(MessageType::from_u8(0x50), Some(MessageType::EveToggle));
        assert_eq!(MessageType::from_u8(0xFE), Some(MessageType::Disconnect));
        assert_eq!(MessageType::from_u8(0xFF), Some(MessageType::Error));
        assert_eq!(MessageType::from_u8(0x15), None);
        assert_eq!(MessageType::from_u8(0x30), None);

        assert_eq!(MessageType::Chat.as_u8(), 0x01);
        assert_eq!(MessageType::Abort.as_u8(), 0x17);
        assert_eq!(MessageType::KeyRotateRequest.as_u8(), 0x20);
    }

    #[test]
    fn test_exchange_classification() {
        assert!(MessageType::PhotonBatch.is_exchange());
        assert!(MessageType::Abort.is_exchange());
        assert!(!MessageType::Chat.is_exchange());
        assert!(!MessageType::Disconnect.is_exchange());
    }
}
