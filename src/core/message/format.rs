/*!
Frame format for the BB84 protocol.

Every message is a 9-byte header followed by a UTF-8 JSON payload:

- Message Type (1 byte)
- Payload Length (4 bytes, big-endian)
- Sequence Number (4 bytes, big-endian, signed)
*/

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    core::{
        constants::sizes,
        error::{Error, Result},
        message::types::MessageType,
    },
    format_err,
};

/// Protocol message header (9 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type
    pub msg_type: MessageType,
    /// Payload length
    pub payload_len: u32,
    /// Sequence number
    pub sequence: i32,
}

impl MessageHeader {
    /// Create a new message header
    pub fn new(msg_type: MessageType, payload_len: u32, sequence: i32) -> Self {
        Self {
            msg_type,
            payload_len,
            sequence,
        }
    }

    /// Convert the header to bytes
    pub fn to_bytes(&self) -> [u8; sizes::HEADER_SIZE] {
        let mut bytes = [0u8; sizes::HEADER_SIZE];
        bytes[0] = self.msg_type.as_u8();
        BigEndian::write_u32(&mut bytes[1..5], self.payload_len);
        BigEndian::write_i32(&mut bytes[5..9], self.sequence);
        bytes
    }

    /// Parse a header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < sizes::HEADER_SIZE {
            return format_err!("Header too short");
        }

        let msg_type = match MessageType::from_u8(bytes[0]) {
            Some(t) => t,
            None => return format_err!("Invalid message type: {:#04x}", bytes[0]),
        };

        Ok(Self {
            msg_type,
            payload_len: BigEndian::read_u32(&bytes[1..5]),
            sequence: BigEndian::read_i32(&bytes[5..9]),
        })
    }

    /// Write the header to a writer
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    /// Read a header from a reader
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; sizes::HEADER_SIZE];
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

/// A complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, rejecting payloads over `max_payload`
    pub fn new(msg_type: MessageType, sequence: i32, payload: Bytes, max_payload: usize) -> Result<Self> {
        if payload.len() > max_payload {
            return format_err!("Payload of {} bytes exceeds the limit of {}", payload.len(), max_payload);
        }
        let header = MessageHeader::new(msg_type, payload.len() as u32, sequence);
        Ok(Self { header, payload })
    }

    /// Header and payload as one buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(sizes::HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Write the frame to a writer
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())?;
        writer.flush()
    }

    /// Read one frame
    ///
    /// An oversized length is `InvalidFormat` and leaves the stream unusable.
    /// An unknown message type is `ProtocolViolation`; its payload has been
    /// consumed, so the stream stays aligned.
    pub fn read<R: Read>(reader: &mut R, max_payload: usize) -> Result<Self> {
        let mut header_bytes = [0u8; sizes::HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;
        Self::read_after_header(&header_bytes, reader, max_payload)
    }

    /// Finish reading a frame whose header bytes are already in hand
    pub fn read_after_header<R: Read>(
        header_bytes: &[u8; sizes::HEADER_SIZE],
        reader: &mut R,
        max_payload: usize,
    ) -> Result<Self> {
        let payload_len = BigEndian::read_u32(&header_bytes[1..5]) as usize;
        if payload_len > max_payload {
            return format_err!("Frame payload of {} bytes exceeds the limit of {}", payload_len, max_payload);
        }

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;

        let header = MessageHeader::from_bytes(header_bytes).map_err(|e| match e {
            Error::InvalidFormat(msg) => Error::ProtocolViolation(msg),
            other => other,
        })?;
        Ok(Self {
            header,
            payload: Bytes::from(payload),
        })
    }
}
