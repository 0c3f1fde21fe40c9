/*!
Single-use pad over the BB84 keystream.

Messages are UTF-8 encoded, XORed bit by bit with fresh keystream bits and
carried as lowercase hex. Every bit of keystream is used once.
*/

use serde::{Deserialize, Serialize};

use crate::core::{
    constants::sizes::BITS_PER_BYTE,
    crypto::key_manager::KeyManager,
    error::{Error, Result},
};

/// Per-message encryption data for display collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoDetails {
    pub plaintext: String,
    pub ciphertext_hex: String,
    pub bits_used: usize,
    pub key_id: String,
    /// Keystream offset of the first bit used
    pub key_offset: usize,
}

/// XOR two bit sequences; the result is as long as the shorter one
pub fn xor_bits(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter().zip(key).map(|(d, k)| d ^ k).collect()
}

/// UTF-8 bytes of `text` as bits, most significant first
pub fn text_to_bits(text: &str) -> Vec<u8> {
    bytes_to_bits(text.as_bytes())
}

/// Decode bits as UTF-8; a trailing partial byte is ignored
pub fn bits_to_text(bits: &[u8]) -> Result<String> {
    let whole = bits.len() - bits.len() % BITS_PER_BYTE;
    String::from_utf8(bits_to_bytes(&bits[..whole]))
        .map_err(|e| Error::InvalidFormat(format!("Decrypted message is not UTF-8: {}", e)))
}

/// Lowercase hex of the bits, zero-padded to whole bytes
pub fn bits_to_hex(bits: &[u8]) -> String {
    hex::encode(bits_to_bytes(bits))
}

/// Bits of a hex string
pub fn hex_to_bits(hex_str: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| Error::InvalidFormat(format!("Invalid ciphertext hex: {}", e)))?;
    Ok(bytes_to_bits(&bytes))
}

/// Bits as `0`/`1` digits grouped by byte
pub fn bits_to_string(bits: &[u8]) -> String {
    bits.chunks(BITS_PER_BYTE)
        .map(|chunk| chunk.iter().map(|b| if *b == 0 { '0' } else { '1' }).collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

fn bytes_to_bits(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .flat_map(|byte| (0..BITS_PER_BYTE).rev().map(move |i| (byte >> i) & 1))
        .collect()
}

fn bits_to_bytes(bits: &[u8]) -> Vec<u8> {
    bits.chunks(BITS_PER_BYTE)
        .map(|chunk| {
            chunk
                .iter()
                .chain(std::iter::repeat(&0))
                .take(BITS_PER_BYTE)
                .fold(0u8, |acc, bit| (acc << 1) | (bit & 1))
        })
        .collect()
}

/// Encrypt `text` with the next keystream bits
pub fn encrypt_message(text: &str, key_manager: &mut KeyManager) -> Result<(String, CryptoDetails)> {
    let (key_id, key_offset) = key_manager.position().ok_or(Error::NoActiveKey)?;
    let message_bits = text_to_bits(text);
    let key_bits = key_manager.consume(message_bits.len())?;
    let ciphertext_hex = bits_to_hex(&xor_bits(&message_bits, &key_bits));

    let details = CryptoDetails {
        plaintext: text.to_string(),
        ciphertext_hex: ciphertext_hex.clone(),
        bits_used: message_bits.len(),
        key_id,
        key_offset,
    };
    Ok((ciphertext_hex, details))
}

/// Decrypt hex ciphertext with the next keystream bits
///
/// Malformed hex is rejected before any keystream is consumed.
pub fn decrypt_message(ciphertext_hex: &str, key_manager: &mut KeyManager) -> Result<(String, CryptoDetails)> {
    let cipher_bits = hex_to_bits(ciphertext_hex)?;
    let (key_id, key_offset) = key_manager.position().ok_or(Error::NoActiveKey)?;
    let key_bits = key_manager.consume(cipher_bits.len())?;
    let plaintext = bits_to_text(&xor_bits(&cipher_bits, &key_bits))?;

    let details = CryptoDetails {
        plaintext: plaintext.clone(),
        ciphertext_hex: ciphertext_hex.to_string(),
        bits_used: cipher_bits.len(),
        key_id,
        key_offset,
    };
    Ok((plaintext, details))
}
