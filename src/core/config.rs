/*!
Protocol configuration for the BB84 exchange.

This module provides the tunable parameters of the quantum exchange, the key
lifecycle and the network layer, with presets and validation.
*/

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    constants::{defaults, MAX_EXPANDED_KEY_BITS},
    error::{Error, Result},
    quantum::reconciliation,
};

/// What the exchange loop does after an eavesdropper detection or a too-short key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// Restart immediately (with Eve disabled after a detection), up to `max_attempts`
    #[default]
    Automatic,
    /// Return the failure and let the user start the next attempt
    Manual,
}

/// Parameters of the quantum exchange and the key lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Photons sent per exchange
    pub photon_count: usize,
    /// Minimum final key length in bits
    pub min_key_length: usize,
    /// Seed bits retained from the reconciled key
    pub max_key_length: usize,
    /// Error rate above which the key is discarded
    pub error_threshold: f64,
    /// Fraction of reconciled bits disclosed for error estimation
    pub sample_fraction: f64,
    /// Usage fraction at which rotation is recommended
    pub rotation_threshold: f64,
    /// Keystream bits derived from each seed
    pub expanded_key_bits: usize,
    /// Past key entries kept in the metadata history
    pub history_limit: usize,
    /// Deadline of every awaiting state
    pub exchange_timeout: Duration,
    /// Exchange attempts before giving up
    pub max_attempts: u32,
    /// Behaviour after a recoverable exchange failure
    pub retry_policy: RetryPolicy,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            photon_count: defaults::PHOTON_COUNT,
            min_key_length: defaults::MIN_KEY_LENGTH,
            max_key_length: defaults::MAX_KEY_LENGTH,
            error_threshold: defaults::ERROR_THRESHOLD,
            sample_fraction: defaults::SAMPLE_FRACTION,
            rotation_threshold: defaults::ROTATION_THRESHOLD,
            expanded_key_bits: defaults::EXPANDED_KEY_BITS,
            history_limit: defaults::HISTORY_LIMIT,
            exchange_timeout: defaults::EXCHANGE_TIMEOUT,
            max_attempts: defaults::MAX_ATTEMPTS,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ProtocolConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with short timeouts, for tests and local demos
    pub fn testing() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Set the number of photons per exchange
    pub fn with_photon_count(mut self, photon_count: usize) -> Self {
        self.photon_count = photon_count;
        self
    }

    /// Set the eavesdropper detection threshold
    pub fn with_error_threshold(mut self, threshold: f64) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Set the disclosed sample fraction
    pub fn with_sample_fraction(mut self, fraction: f64) -> Self {
        self.sample_fraction = fraction;
        self
    }

    /// Set the minimum final key length
    pub fn with_min_key_length(mut self, bits: usize) -> Self {
        self.min_key_length = bits;
        self
    }

    /// Set the expanded keystream length
    pub fn with_expanded_key_bits(mut self, bits: usize) -> Self {
        self.expanded_key_bits = bits;
        self
    }

    /// Set the rotation threshold
    pub fn with_rotation_threshold(mut self, threshold: f64) -> Self {
        self.rotation_threshold = threshold;
        self
    }

    /// Set the deadline of every awaiting state
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Set the retry bound
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.photon_count == 0 {
            return Err(Error::Config("photon_count must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.error_threshold) {
            return Err(Error::Config(format!(
                "error_threshold {} is outside [0, 1]",
                self.error_threshold
            )));
        }
        if !(self.sample_fraction > 0.0 && self.sample_fraction < 1.0) {
            return Err(Error::Config(format!(
                "sample_fraction {} is outside (0, 1)",
                self.sample_fraction
            )));
        }
        if !(self.rotation_threshold > 0.0 && self.rotation_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "rotation_threshold {} is outside (0, 1]",
                self.rotation_threshold
            )));
        }
        if self.min_key_length == 0 || self.min_key_length > self.max_key_length {
            return Err(Error::Config(format!(
                "min_key_length {} must be in 1..={}",
                self.min_key_length, self.max_key_length
            )));
        }
        if self.expanded_key_bits == 0 || self.expanded_key_bits > MAX_EXPANDED_KEY_BITS {
            return Err(Error::Config(format!(
                "expanded_key_bits {} must be in 1..={}",
                self.expanded_key_bits, MAX_EXPANDED_KEY_BITS
            )));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be positive".into()));
        }
        if self.exchange_timeout.is_zero() {
            return Err(Error::Config("exchange_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Sample size for `reconciled` matching bits: `max(1, floor(n * fraction))`, capped at `n`
    pub fn sample_size(&self, reconciled: usize) -> usize {
        reconciliation::sample_size(reconciled, self.sample_fraction)
    }
}

/// Parameters of the point-to-point connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host to bind or connect to
    pub host: String,
    /// Port to bind or connect to
    pub port: u16,
    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,
    /// Connection attempts
    pub connect_retries: u32,
    /// Backoff between attempts; the last entry repeats
    pub connect_backoff: Vec<Duration>,
    /// Socket read timeout of the receive loop
    pub read_timeout: Duration,
    /// Largest accepted payload
    pub max_payload_size: usize,
    /// Consecutive violations tolerated before disconnecting
    pub max_protocol_violations: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            connect_timeout: defaults::CONNECT_TIMEOUT,
            connect_retries: defaults::CONNECT_RETRIES,
            connect_backoff: defaults::CONNECT_BACKOFF_SECS
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            read_timeout: defaults::READ_TIMEOUT,
            max_payload_size: defaults::MAX_PAYLOAD_SIZE,
            max_protocol_violations: defaults::MAX_PROTOCOL_VIOLATIONS,
        }
    }
}

impl NetworkConfig {
    /// Create a configuration for a host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Backoff to wait after failed attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self.connect_backoff.len() {
            0 => Duration::ZERO,
            len => self.connect_backoff[(attempt as usize).min(len - 1)],
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.connect_retries == 0 {
            return Err(Error::Config("connect_retries must be positive".into()));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::Config("read_timeout must be positive".into()));
        }
        if self.max_payload_size == 0 || self.max_payload_size > u32::MAX as usize {
            return Err(Error::Config(format!(
                "max_payload_size {} does not fit the frame header",
                self.max_payload_size
            )));
        }
        Ok(())
    }
}
