/*!
Sifting and error estimation.

After the quantum transmission both parties publish their bases, keep the
positions where the bases agree, disclose a random sample of the sifted bits
to estimate the error rate and drop that sample from the key.
*/

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{
    error::{Error, Result},
    quantum::photon::Basis,
};

/// Outcome of disclosing a sample of both sifted keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleCheck {
    /// Mismatches in the sample divided by sample size
    pub error_rate: f64,
    /// Sampled key positions, ascending
    pub positions: Vec<usize>,
    /// First key's bits at the sampled positions
    pub sample_a: Vec<u8>,
    /// Second key's bits at the sampled positions
    pub sample_b: Vec<u8>,
}

/// Positions where both basis sequences agree, ascending
pub fn find_matching_positions(bases_a: &[Basis], bases_b: &[Basis]) -> Result<Vec<usize>> {
    if bases_a.len() != bases_b.len() {
        return Err(Error::ProtocolViolation(format!(
            "Basis sequences differ in length: {} vs {}",
            bases_a.len(),
            bases_b.len()
        )));
    }
    Ok(bases_a
        .iter()
        .zip(bases_b)
        .enumerate()
        .filter(|(_, (a, b))| a == b)
        .map(|(i, _)| i)
        .collect())
}

/// Bits at the given positions, in the order given
pub fn extract_key_bits(bits: &[u8], positions: &[usize]) -> Result<Vec<u8>> {
    positions
        .iter()
        .map(|&pos| {
            bits.get(pos).copied().ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "Position {} out of range for {} bits",
                    pos,
                    bits.len()
                ))
            })
        })
        .collect()
}

/// `max(1, floor(n * fraction))`, capped at `n`
pub fn sample_size(n: usize, fraction: f64) -> usize {
    let wanted = (n as f64 * fraction).floor() as usize;
    wanted.max(1).min(n)
}

/// Uniformly chosen sample positions in `0..n`, ascending
pub fn sample_positions<R: Rng + ?Sized>(n: usize, fraction: f64, rng: &mut R) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let mut positions = rand::seq::index::sample(rng, n, sample_size(n, fraction)).into_vec();
    positions.sort_unstable();
    positions
}

/// Fraction of differing bits; 0 for an empty sample
pub fn error_rate(sample_a: &[u8], sample_b: &[u8]) -> Result<f64> {
    if sample_a.len() != sample_b.len() {
        return Err(Error::ProtocolViolation(format!(
            "Sample sizes differ: {} vs {}",
            sample_a.len(),
            sample_b.len()
        )));
    }
    if sample_a.is_empty() {
        return Ok(0.0);
    }
    let errors = sample_a.iter().zip(sample_b).filter(|(a, b)| a != b).count();
    Ok(errors as f64 / sample_a.len() as f64)
}

/// Whether an error rate indicates an eavesdropper
pub fn is_eavesdropper_detected(error_rate: f64, threshold: f64) -> bool {
    error_rate > threshold
}

/// Sample both sifted keys and compare, using the thread CSPRNG
pub fn sample_and_check(key_a: &[u8], key_b: &[u8], fraction: f64) -> Result<SampleCheck> {
    sample_and_check_with(key_a, key_b, fraction, &mut rand::rng())
}

/// Sample both sifted keys and compare
pub fn sample_and_check_with<R: Rng + ?Sized>(
    key_a: &[u8],
    key_b: &[u8],
    fraction: f64,
    rng: &mut R,
) -> Result<SampleCheck> {
    if key_a.len() != key_b.len() {
        return Err(Error::ProtocolViolation(format!(
            "Sifted keys differ in length: {} vs {}",
            key_a.len(),
            key_b.len()
        )));
    }
    let positions = sample_positions(key_a.len(), fraction, rng);
    let sample_a = extract_key_bits(key_a, &positions)?;
    let sample_b = extract_key_bits(key_b, &positions)?;
    let error_rate = error_rate(&sample_a, &sample_b)?;

    Ok(SampleCheck {
        error_rate,
        positions,
        sample_a,
        sample_b,
    })
}

/// Key with the sampled positions removed, order preserved
pub fn remove_sample_bits(key: &[u8], sample_positions: &[usize]) -> Vec<u8> {
    key.iter()
        .enumerate()
        .filter(|(i, _)| sample_positions.binary_search(i).is_err())
        .map(|(_, &bit)| bit)
        .collect()
}

/// Final key after sample removal, rejected below `min_length`
///
/// `sample_positions` must be ascending.
pub fn extract_final_key(key: &[u8], sample_positions: &[usize], min_length: usize) -> Result<Vec<u8>> {
    let final_key = remove_sample_bits(key, sample_positions);
    if final_key.is_empty() || final_key.len() < min_length {
        return Err(Error::KeyTooShort {
            length: final_key.len(),
            minimum: min_length,
        });
    }
    Ok(final_key)
}
