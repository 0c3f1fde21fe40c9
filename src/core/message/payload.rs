/*!
Typed message payloads.

Each message type carries a JSON object. `WireMessage` pairs the type tag with
its payload so dispatch is an exhaustive match.
*/

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::{
    error::Result,
    message::{format::Frame, types::MessageType},
    quantum::photon::{Basis, Photon},
};

/// Encrypted chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub sender: String,
    pub ciphertext: String,
    pub bits_used: usize,
    pub key_id: String,
    pub key_offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeInit {
    pub exchange_id: String,
    pub photon_count: usize,
    pub sample_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotonBatch {
    pub exchange_id: String,
    pub photons: Vec<Photon>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasisBatch {
    pub exchange_id: String,
    pub bases: Vec<Basis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPositions {
    pub exchange_id: String,
    /// Photon indices where both bases agree
    pub positions: Vec<usize>,
    /// Indices into the sifted key to disclose
    pub sample_positions: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBits {
    pub exchange_id: String,
    pub bits: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyComplete {
    pub exchange_id: String,
    pub key: Vec<u8>,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortPayload {
    pub exchange_id: String,
    pub reason: String,
    #[serde(default)]
    pub error_rate: Option<f64>,
    /// The initiator will start another attempt
    #[serde(default)]
    pub retrying: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EveToggle {
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Chat(ChatPayload),
    ExchangeInit(ExchangeInit),
    PhotonBatch(PhotonBatch),
    BasisBatch(BasisBatch),
    MatchPositions(MatchPositions),
    SampleBits(SampleBits),
    KeyComplete(KeyComplete),
    Abort(AbortPayload),
    KeyRotateRequest,
    EveToggle(EveToggle),
    Disconnect,
    Error(ErrorPayload),
}

const EMPTY_OBJECT: &[u8] = b"{}";

impl WireMessage {
    /// Type tag of this message
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Chat(_) => MessageType::Chat,
            WireMessage::ExchangeInit(_) => MessageType::ExchangeInit,
            WireMessage::PhotonBatch(_) => MessageType::PhotonBatch,
            WireMessage::BasisBatch(_) => MessageType::BasisBatch,
            WireMessage::MatchPositions(_) => MessageType::MatchPositions,
            WireMessage::SampleBits(_) => MessageType::SampleBits,
            WireMessage::KeyComplete(_) => MessageType::KeyComplete,
            WireMessage::Abort(_) => MessageType::Abort,
            WireMessage::KeyRotateRequest => MessageType::KeyRotateRequest,
            WireMessage::EveToggle(_) => MessageType::EveToggle,
            WireMessage::Disconnect => MessageType::Disconnect,
            WireMessage::Error(_) => MessageType::Error,
        }
    }

    /// Exchange the message belongs to, if any
    pub fn exchange_id(&self) -> Option<&str> {
        match self {
            WireMessage::ExchangeInit(m) => Some(&m.exchange_id),
            WireMessage::PhotonBatch(m) => Some(&m.exchange_id),
            WireMessage::BasisBatch(m) => Some(&m.exchange_id),
            WireMessage::MatchPositions(m) => Some(&m.exchange_id),
            WireMessage::SampleBits(m) => Some(&m.exchange_id),
            WireMessage::KeyComplete(m) => Some(&m.exchange_id),
            WireMessage::Abort(m) => Some(&m.exchange_id),
            _ => None,
        }
    }

    /// JSON payload bytes
    pub fn encode_payload(&self) -> Result<Bytes> {
        let json = match self {
            WireMessage::Chat(m) => serde_json::to_vec(m)?,
            WireMessage::ExchangeInit(m) => serde_json::to_vec(m)?,
            WireMessage::PhotonBatch(m) => serde_json::to_vec(m)?,
            WireMessage::BasisBatch(m) => serde_json::to_vec(m)?,
            WireMessage::MatchPositions(m) => serde_json::to_vec(m)?,
            WireMessage::SampleBits(m) => serde_json::to_vec(m)?,
            WireMessage::KeyComplete(m) => serde_json::to_vec(m)?,
            WireMessage::Abort(m) => serde_json::to_vec(m)?,
            WireMessage::EveToggle(m) => serde_json::to_vec(m)?,
            WireMessage::Error(m) => serde_json::to_vec(m)?,
            WireMessage::KeyRotateRequest | WireMessage::Disconnect => return Ok(Bytes::from_static(EMPTY_OBJECT)),
        };
        Ok(Bytes::from(json))
    }

    /// Decode a payload of the given type; an empty payload reads as `{}`
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self> {
        let payload = if payload.is_empty() { EMPTY_OBJECT } else { payload };
        let message = match msg_type {
            MessageType::Chat => WireMessage::Chat(serde_json::from_slice(payload)?),
            MessageType::ExchangeInit => WireMessage::ExchangeInit(serde_json::from_slice(payload)?),
            MessageType::PhotonBatch => WireMessage::PhotonBatch(serde_json::from_slice(payload)?),
            MessageType::BasisBatch => WireMessage::BasisBatch(serde_json::from_slice(payload)?),
            MessageType::MatchPositions => WireMessage::MatchPositions(serde_json::from_slice(payload)?),
            MessageType::SampleBits => WireMessage::SampleBits(serde_json::from_slice(payload)?),
            MessageType::KeyComplete => WireMessage::KeyComplete(serde_json::from_slice(payload)?),
            MessageType::Abort => WireMessage::Abort(serde_json::from_slice(payload)?),
            MessageType::EveToggle => WireMessage::EveToggle(serde_json::from_slice(payload)?),
            MessageType::Error => WireMessage::Error(serde_json::from_slice(payload)?),
            MessageType::KeyRotateRequest => {
                serde_json::from_slice::<serde_json::Value>(payload)?;
                WireMessage::KeyRotateRequest
            }
            MessageType::Disconnect => {
                serde_json::from_slice::<serde_json::Value>(payload)?;
                WireMessage::Disconnect
            }
        };
        Ok(message)
    }

    /// Frame this message with a sequence number
    pub fn to_frame(&self, sequence: i32, max_payload: usize) -> Result<Frame> {
        Frame::new(self.message_type(), sequence, self.encode_payload()?, max_payload)
    }
}

/// An inbound message with its sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sequence: i32,
    pub message: WireMessage,
}

impl Envelope {
    /// Decode the payload of a received frame
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(Self {
            sequence: frame.header.sequence,
            message: WireMessage::decode(frame.header.msg_type, &frame.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{constants::defaults::MAX_PAYLOAD_SIZE, quantum::photon};

    #[test]
    fn test_payload_json_shape() {
        let message = WireMessage::Abort(AbortPayload {
            exchange_id: "ab12cd34".into(),
            reason: "eavesdropper".into(),
            error_rate: Some(0.25),
            retrying: true,
        });
        let json: serde_json::Value = serde_json::from_slice(&message.encode_payload().unwrap()).unwrap();
        assert_eq!(json["exchange_id"], "ab12cd34");
        assert_eq!(json["error_rate"], 0.25);
        assert_eq!(json["retrying"], true);

        let bases = WireMessage::BasisBatch(BasisBatch {
            exchange_id: "x".into(),
            bases: vec![Basis::Rectilinear, Basis::Diagonal],
        });
        assert_eq!(
            bases.encode_payload().unwrap(),
            Bytes::from_static(br#"{"exchange_id":"x","bases":[0,1]}"#)
        );
    }

    #[test]
    fn test_frame_round_trip() {
        let photons = photon::encode_all(&[0, 1, 1], &[Basis::Rectilinear, Basis::Diagonal, Basis::Rectilinear]).unwrap();
        let message = WireMessage::PhotonBatch(PhotonBatch {
            exchange_id: "e1".into(),
            photons,
        });
        let frame = message.to_frame(3, MAX_PAYLOAD_SIZE).unwrap();
        let envelope = Envelope::from_frame(&frame).unwrap();
        assert_eq!(envelope.sequence, 3);
        assert_eq!(envelope.message, message);
        assert_eq!(envelope.message.exchange_id(), Some("e1"));
    }

    #[test]
    fn test_empty_payloads() {
        assert_eq!(
            WireMessage::decode(MessageType::Disconnect, b"").unwrap(),
            WireMessage::Disconnect
        );
        assert_eq!(
            WireMessage::decode(MessageType::KeyRotateRequest, b"{}").unwrap(),
            WireMessage::KeyRotateRequest
        );
        assert_eq!(WireMessage::Disconnect.encode_payload().unwrap(), Bytes::from_static(b"{}"));
        assert!(WireMessage::decode(MessageType::Chat, b"").is_err());
    }

    #[test]
    fn test_abort_defaults() {
        let message = WireMessage::decode(MessageType::Abort, br#"{"exchange_id":"e","reason":"timeout"}"#).unwrap();
        assert!(matches!(
            message,
            WireMessage::Abort(AbortPayload { error_rate: None, retrying: false, .. })
        ));
    }

    #[test]
    fn test_invalid_payload() {
        assert!(WireMessage::decode(MessageType::EveToggle, b"{\"active\":").is_err());
        assert!(WireMessage::decode(
            MessageType::PhotonBatch,
            br#"{"exchange_id":"e","photons":[{"bit":0,"basis":0,"angle":90}]}"#
        )
        .is_err());
    }
}
