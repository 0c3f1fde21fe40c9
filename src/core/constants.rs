/*!
Constants for the BB84 protocol.

This module contains the polarization table, frame sizes, key derivation
labels and the configuration defaults.
*/

/// Size constants for the protocol
pub mod sizes {
    /// Size of the message header in bytes (type + payload length + sequence)
    pub const HEADER_SIZE: usize = 9;

    /// Bits per byte of message text
    pub const BITS_PER_BYTE: usize = 8;
}

/// Polarization angles in degrees
pub mod angles {
    /// bit 0, rectilinear basis
    pub const HORIZONTAL: u16 = 0;
    /// bit 0, diagonal basis
    pub const DIAGONAL_RIGHT: u16 = 45;
    /// bit 1, rectilinear basis
    pub const VERTICAL: u16 = 90;
    /// bit 1, diagonal basis
    pub const DIAGONAL_LEFT: u16 = 135;
}

/// Salt for HKDF keystream expansion
pub const HKDF_SALT: &[u8] = b"BB84-Protocol-v1-Key-Expansion";

/// Info string for HKDF keystream expansion
pub const HKDF_INFO_KEYSTREAM: &[u8] = b"BB84-Keystream";

/// Largest keystream HKDF-SHA256 can produce, in bits (255 blocks of 32 bytes)
pub const MAX_EXPANDED_KEY_BITS: usize = 255 * 32 * 8;

/// Configuration defaults
pub mod defaults {
    use std::time::Duration;

    /// Photons per key exchange
    pub const PHOTON_COUNT: usize = 256;

    /// Minimum acceptable final key length in bits
    pub const MIN_KEY_LENGTH: usize = 32;

    /// Maximum seed bits retained from a reconciled key
    pub const MAX_KEY_LENGTH: usize = 128;

    /// Error rate above which an eavesdropper is assumed
    pub const ERROR_THRESHOLD: f64 = 0.10;

    /// Fraction of reconciled bits disclosed for error estimation
    pub const SAMPLE_FRACTION: f64 = 0.10;

    /// Usage fraction at which rotation is recommended
    pub const ROTATION_THRESHOLD: f64 = 0.75;

    /// Keystream length derived from each seed
    pub const EXPANDED_KEY_BITS: usize = 1024;

    /// Past keys kept in the metadata history
    pub const HISTORY_LIMIT: usize = 32;

    /// Deadline for each awaiting state of the exchange
    pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(120);

    /// Exchange attempts before giving up
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Default bind/connect host
    pub const HOST: &str = "localhost";

    /// Default bind/connect port
    pub const PORT: u16 = 5000;

    /// Timeout for establishing a connection
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Connection attempts
    pub const CONNECT_RETRIES: u32 = 3;

    /// Backoff between connection attempts, in seconds
    pub const CONNECT_BACKOFF_SECS: [u64; 3] = [1, 2, 4];

    /// Socket read timeout of the receive loop
    pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

    /// Largest accepted payload
    pub const MAX_PAYLOAD_SIZE: usize = 1_048_576; // 1 MB

    /// Consecutive protocol violations tolerated before disconnecting
    pub const MAX_PROTOCOL_VIOLATIONS: u32 = 8;
}
