/*!
Key lifecycle management.

A reconciled BB84 key is short, so it is truncated to a seed and stretched with
HKDF-SHA256 into a keystream. The manager hands out keystream bits exactly
once, tracks usage for rotation, and wipes key material when a key is
replaced, compromised, cleared or dropped. Keys are never persisted.
*/

use std::{collections::VecDeque, fmt};

use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::core::{
    config::ProtocolConfig,
    constants::{sizes::BITS_PER_BYTE, HKDF_INFO_KEYSTREAM, HKDF_SALT},
    error::{Error, Result},
};

/// Stretch seed bits into `length` keystream bits with HKDF-SHA256
///
/// Each seed bit is one byte of input keying material, so seeds that differ
/// only in trailing zeros expand differently.
pub fn expand_key_bits(seed_bits: &[u8], length: usize) -> Result<Vec<u8>> {
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), seed_bits);
    let mut okm = Zeroizing::new(vec![0u8; length.div_ceil(BITS_PER_BYTE)]);

    hkdf.expand(HKDF_INFO_KEYSTREAM, &mut okm)
        .map_err(|e| Error::Config(format!("HKDF key expansion failed: {}", e)))?;

    Ok(okm
        .iter()
        .flat_map(|byte| (0..BITS_PER_BYTE).rev().map(move |i| (byte >> i) & 1))
        .take(length)
        .collect())
}

/// Lifecycle status of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStatus {
    /// Current key
    Active,
    /// Superseded by a newer key
    Replaced,
    /// Discarded after eavesdropping was detected
    Compromised,
    /// Wiped on request or shutdown
    Cleared,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStatus::Active => write!(f, "Active"),
            KeyStatus::Replaced => write!(f, "Replaced"),
            KeyStatus::Compromised => write!(f, "Compromised"),
            KeyStatus::Cleared => write!(f, "Cleared"),
        }
    }
}

/// Key metadata, without key bits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: String,
    pub seed_length: usize,
    pub length: usize,
    pub bits_used: usize,
    pub remaining: usize,
    pub error_rate: f64,
    pub generated_at: DateTime<Utc>,
    pub status: KeyStatus,
}

/// A BB84-derived keystream
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    #[zeroize(skip)]
    id: String,
    seed_bits: Vec<u8>,
    expanded_bits: Vec<u8>,
    bits_used: usize,
    #[zeroize(skip)]
    error_rate: f64,
    #[zeroize(skip)]
    generated_at: DateTime<Utc>,
}

impl EncryptionKey {
    /// Build a key from a seed, expanding it to `length` bits
    pub fn new(id: String, seed_bits: Vec<u8>, length: usize, error_rate: f64) -> Result<Self> {
        let expanded_bits = expand_key_bits(&seed_bits, length)?;
        Ok(Self {
            id,
            seed_bits,
            expanded_bits,
            bits_used: 0,
            error_rate,
            generated_at: Utc::now(),
        })
    }

    /// Key identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Keystream length in bits
    pub fn length(&self) -> usize {
        self.expanded_bits.len()
    }

    /// Bits already consumed
    pub fn bits_used(&self) -> usize {
        self.bits_used
    }

    /// Bits left
    pub fn remaining(&self) -> usize {
        self.length() - self.bits_used
    }

    /// Consumed share of the keystream, 0 to 100
    pub fn usage_percentage(&self) -> f64 {
        if self.length() == 0 {
            return 100.0;
        }
        self.bits_used as f64 / self.length() as f64 * 100.0
    }

    /// Take the next `n` keystream bits
    pub fn consume(&mut self, n: usize) -> Result<Zeroizing<Vec<u8>>> {
        if n > self.remaining() {
            return Err(Error::KeyExhausted {
                requested: n,
                remaining: self.remaining(),
            });
        }
        let bits = Zeroizing::new(self.expanded_bits[self.bits_used..self.bits_used + n].to_vec());
        self.bits_used += n;
        Ok(bits)
    }

    /// Metadata snapshot with the given status
    pub fn info(&self, status: KeyStatus) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            seed_length: self.seed_bits.len(),
            length: self.length(),
            bits_used: self.bits_used,
            remaining: self.remaining(),
            error_rate: self.error_rate,
            generated_at: self.generated_at,
            status,
        }
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .field("length", &self.length())
            .field("bits_used", &self.bits_used)
            .field("error_rate", &self.error_rate)
            .finish_non_exhaustive()
    }
}

/// First 8 hex characters of a v4 UUID
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Owner of the current key and the key history
pub struct KeyManager {
    current: Option<EncryptionKey>,
    history: VecDeque<KeyInfo>,
    keys_generated: u64,
    keys_compromised: u64,
    max_key_length: usize,
    expanded_key_bits: usize,
    rotation_threshold: f64,
    history_limit: usize,
}

impl KeyManager {
    /// Create a manager without a key
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            current: None,
            history: VecDeque::new(),
            keys_generated: 0,
            keys_compromised: 0,
            max_key_length: config.max_key_length,
            expanded_key_bits: config.expanded_key_bits,
            rotation_threshold: config.rotation_threshold,
            history_limit: config.history_limit,
        }
    }

    /// Install a new key from reconciled bits
    ///
    /// The bits are truncated to `max_key_length` and expanded. The previous
    /// key is archived as `Replaced` and wiped.
    pub fn set_key(&mut self, raw_bits: &[u8], error_rate: f64) -> Result<KeyInfo> {
        self.set_key_with_id(short_id(), raw_bits, error_rate)
    }

    /// Install a new key under an id agreed with the peer
    pub fn set_key_with_id(&mut self, id: String, raw_bits: &[u8], error_rate: f64) -> Result<KeyInfo> {
        if raw_bits.is_empty() {
            return Err(Error::KeyTooShort { length: 0, minimum: 1 });
        }
        let seed_len = raw_bits.len().min(self.max_key_length);
        let key = EncryptionKey::new(id, raw_bits[..seed_len].to_vec(), self.expanded_key_bits, error_rate)?;

        self.retire_current(KeyStatus::Replaced);
        let info = key.info(KeyStatus::Active);
        self.current = Some(key);
        self.keys_generated += 1;

        log::info!(
            "Installed key {} ({} seed bits, {} keystream bits, error rate {:.1}%)",
            info.id,
            info.seed_length,
            info.length,
            error_rate * 100.0
        );
        Ok(info)
    }

    /// Take the next `n` keystream bits of the current key
    pub fn consume(&mut self, n: usize) -> Result<Zeroizing<Vec<u8>>> {
        self.current.as_mut().ok_or(Error::NoActiveKey)?.consume(n)
    }

    /// Bits left on the current key, 0 without a key
    pub fn remaining(&self) -> usize {
        self.current.as_ref().map_or(0, EncryptionKey::remaining)
    }

    /// Usage of the current key, 0 to 100; 100 without a key
    pub fn usage_percentage(&self) -> f64 {
        self.current.as_ref().map_or(100.0, EncryptionKey::usage_percentage)
    }

    /// Whether a new exchange is due
    pub fn needs_rotation(&self) -> bool {
        match &self.current {
            Some(key) => key.usage_percentage() >= self.rotation_threshold * 100.0,
            None => true,
        }
    }

    /// Whether a key is held
    pub fn has_key(&self) -> bool {
        self.current.is_some()
    }

    /// Id and keystream offset of the current key
    pub fn position(&self) -> Option<(String, usize)> {
        self.current.as_ref().map(|key| (key.id.clone(), key.bits_used))
    }

    /// Metadata of the current key
    pub fn current(&self) -> Option<KeyInfo> {
        self.current.as_ref().map(|key| key.info(KeyStatus::Active))
    }

    /// Metadata of past keys, oldest first
    pub fn history(&self) -> impl Iterator<Item = &KeyInfo> {
        self.history.iter()
    }

    /// Keys installed so far
    pub fn keys_generated(&self) -> u64 {
        self.keys_generated
    }

    /// Keys discarded as compromised
    pub fn keys_compromised(&self) -> u64 {
        self.keys_compromised
    }

    /// Invalidate the current key after eavesdropping was detected
    pub fn mark_compromised(&mut self) {
        self.keys_compromised += 1;
        if let Some(info) = self.retire_current(KeyStatus::Compromised) {
            log::warn!("Key {} marked compromised", info.id);
        }
    }

    /// Wipe and drop the current key
    pub fn clear(&mut self) {
        if let Some(info) = self.retire_current(KeyStatus::Cleared) {
            log::debug!("Key {} cleared", info.id);
        }
    }

    fn retire_current(&mut self, status: KeyStatus) -> Option<KeyInfo> {
        let key = self.current.take()?;
        let info = key.info(status);
        drop(key);

        if self.history_limit > 0 {
            while self.history.len() >= self.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(info.clone());
        }
        Some(info)
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new(&ProtocolConfig::default())
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.current.take();
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("current", &self.current)
            .field("history", &self.history.len())
            .field("keys_generated", &self.keys_generated)
            .field("keys_compromised", &self.keys_compromised)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_length(bits: usize) -> KeyManager {
        KeyManager::new(&ProtocolConfig::default().with_expanded_key_bits(bits))
    }

    #[test]
    fn test_expand_key_bits() {
        let seed = [1, 0, 1, 1, 0, 1, 0, 0];
        let a = expand_key_bits(&seed, 1024).unwrap();
        let b = expand_key_bits(&seed, 1024).unwrap();
        assert_eq!(a.len(), 1024);
        assert_eq!(a, b);
        assert!(a.iter().all(|&bit| bit <= 1));

        let c = expand_key_bits(&seed[..7], 1024).unwrap();
        assert_ne!(a, c);

        assert_eq!(expand_key_bits(&seed, 3).unwrap(), a[..3].to_vec());
    }

    #[test]
    fn test_set_key_truncates_seed() {
        let mut manager = KeyManager::default();
        let info = manager.set_key(&vec![1; 200], 0.0).unwrap();
        assert_eq!(info.seed_length, 128);
        assert_eq!(info.length, 1024);
        assert_eq!(info.id.len(), 8);
        assert_eq!(info.status, KeyStatus::Active);
        assert_eq!(manager.keys_generated(), 1);
    }

    #[test]
    fn test_consume_and_exhaust() {
        let mut manager = manager_with_length(3);
        manager.set_key(&[1, 0, 1], 0.0).unwrap();

        assert_eq!(manager.consume(3).unwrap().len(), 3);
        assert!(matches!(
            manager.consume(1),
            Err(Error::KeyExhausted { requested: 1, remaining: 0 })
        ));
    }

    #[test]
    fn test_consume_without_key() {
        let mut manager = KeyManager::default();
        assert!(matches!(manager.consume(1), Err(Error::NoActiveKey)));
        assert!(manager.needs_rotation());
        assert_eq!(manager.remaining(), 0);
    }

    #[test]
    fn test_rotation_threshold() {
        let mut manager = manager_with_length(100);
        manager.set_key(&[1, 1, 0, 1], 0.0).unwrap();
        manager.consume(74).unwrap();
        assert!(!manager.needs_rotation());
        manager.consume(1).unwrap();
        assert!(manager.needs_rotation());
        assert_eq!(manager.usage_percentage(), 75.0);
    }

    #[test]
    fn test_history_and_status() {
        let mut manager = KeyManager::default();
        let first = manager.set_key(&[1, 0, 1, 0], 0.0).unwrap();
        manager.consume(10).unwrap();
        let second = manager.set_key(&[0, 1, 1, 0], 0.02).unwrap();
        manager.mark_compromised();
        manager.set_key(&[1, 1, 1, 0], 0.0).unwrap();
        manager.clear();

        let history: Vec<_> = manager.history().collect();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, first.id);
        assert_eq!(history[0].bits_used, 10);
        assert_eq!(history[0].status, KeyStatus::Replaced);
        assert_eq!(history[1].id, second.id);
        assert_eq!(history[1].status, KeyStatus::Compromised);
        assert_eq!(history[2].status, KeyStatus::Cleared);

        assert!(!manager.has_key());
        assert_eq!(manager.keys_generated(), 3);
        assert_eq!(manager.keys_compromised(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut config = ProtocolConfig::default();
        config.history_limit = 2;
        let mut manager = KeyManager::new(&config);
        for _ in 0..5 {
            manager.set_key(&[1, 0], 0.0).unwrap();
        }
        assert_eq!(manager.history().count(), 2);
    }

    #[test]
    fn test_consumed_bits_never_repeat() {
        let mut manager = KeyManager::default();
        manager.set_key(&[1, 0, 0, 1, 1], 0.0).unwrap();
        let expected = expand_key_bits(&[1, 0, 0, 1, 1], 1024).unwrap();

        let first = manager.consume(16).unwrap();
        let second = manager.consume(16).unwrap();
        assert_eq!(first.as_slice(), &expected[..16]);
        assert_eq!(second.as_slice(), &expected[16..32]);
        assert_eq!(manager.position().map(|(_, offset)| offset), Some(32));
    }

    #[test]
    fn test_shared_key_id() {
        let mut alice = KeyManager::default();
        let mut bob = KeyManager::default();
        alice.set_key_with_id("a1b2c3d4".into(), &[1, 0, 1], 0.0).unwrap();
        bob.set_key_with_id("a1b2c3d4".into(), &[1, 0, 1], 0.0).unwrap();
        assert_eq!(alice.position(), bob.position());
        assert_eq!(*alice.consume(64).unwrap(), *bob.consume(64).unwrap());
    }

    #[test]
    fn test_set_key_rejects_empty() {
        let mut manager = KeyManager::default();
        assert!(matches!(manager.set_key(&[], 0.0), Err(Error::KeyTooShort { .. })));
    }
}
