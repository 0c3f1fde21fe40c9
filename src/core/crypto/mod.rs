/*!
Key material handling for the BB84 protocol.

This module provides the key lifecycle manager, which expands reconciled bits
into a keystream, and the single-use pad cipher that consumes it.
*/

pub mod key_manager;
pub mod cipher;

pub use key_manager::{EncryptionKey, KeyInfo, KeyManager, KeyStatus, expand_key_bits};
pub use cipher::{CryptoDetails, decrypt_message, encrypt_message};
