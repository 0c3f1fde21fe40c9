/*!
Photon encoding and measurement.

A photon carries one bit polarized in one of two bases. Measuring in the
preparation basis recovers the bit; measuring in the other basis yields a
uniformly random bit.
*/

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{
    constants::angles,
    error::{Error, Result},
};

/// Polarization basis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Basis {
    /// Rectilinear basis (+), angles 0° and 90°
    Rectilinear = 0,
    /// Diagonal basis (×), angles 45° and 135°
    Diagonal = 1,
}

impl Basis {
    /// Convert a u8 value to a Basis
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Basis::Rectilinear),
            1 => Some(Basis::Diagonal),
            _ => None,
        }
    }

    /// Get the u8 value of this Basis
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Pick a basis uniformly at random
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.random_bool(0.5) {
            Basis::Diagonal
        } else {
            Basis::Rectilinear
        }
    }

    /// Display symbol
    pub fn symbol(self) -> char {
        match self {
            Basis::Rectilinear => '+',
            Basis::Diagonal => '×',
        }
    }
}

impl From<Basis> for u8 {
    fn from(basis: Basis) -> Self {
        basis.as_u8()
    }
}

impl TryFrom<u8> for Basis {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Basis::from_u8(value).ok_or_else(|| Error::InvalidFormat(format!("Invalid basis: {}", value)))
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Basis::Rectilinear => write!(f, "Rectilinear"),
            Basis::Diagonal => write!(f, "Diagonal"),
        }
    }
}

/// A polarized photon
///
/// The angle is a pure function of bit and basis, so a `Photon` can only be
/// built through [`Photon::encode`]. Deserialization re-checks the angle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPhoton")]
pub struct Photon {
    bit: u8,
    basis: Basis,
    angle: u16,
}

#[derive(Deserialize)]
struct RawPhoton {
    bit: u8,
    basis: Basis,
    angle: u16,
}

impl TryFrom<RawPhoton> for Photon {
    type Error = Error;

    fn try_from(raw: RawPhoton) -> Result<Self> {
        if raw.bit > 1 {
            return Err(Error::InvalidFormat(format!("Invalid photon bit: {}", raw.bit)));
        }
        let photon = Photon::encode(raw.bit, raw.basis);
        if photon.angle != raw.angle {
            return Err(Error::InvalidFormat(format!(
                "Photon angle {}° does not match bit {} in {} basis",
                raw.angle, raw.bit, raw.basis
            )));
        }
        Ok(photon)
    }
}

impl Photon {
    /// Encode a bit in a basis. Any non-zero bit is treated as 1.
    pub fn encode(bit: u8, basis: Basis) -> Self {
        let bit = (bit != 0) as u8;
        let angle = match (bit, basis) {
            (0, Basis::Rectilinear) => angles::HORIZONTAL,
            (_, Basis::Rectilinear) => angles::VERTICAL,
            (0, Basis::Diagonal) => angles::DIAGONAL_RIGHT,
            (_, Basis::Diagonal) => angles::DIAGONAL_LEFT,
        };
        Self { bit, basis, angle }
    }

    /// Encoded bit
    pub fn bit(&self) -> u8 {
        self.bit
    }

    /// Preparation basis
    pub fn basis(&self) -> Basis {
        self.basis
    }

    /// Polarization angle in degrees
    pub fn angle(&self) -> u16 {
        self.angle
    }

    /// Measure in `basis` using the supplied RNG for the mismatch case
    pub fn measure_with<R: Rng + ?Sized>(&self, basis: Basis, rng: &mut R) -> u8 {
        if basis == self.basis {
            self.bit
        } else {
            rng.random_range(0..=1)
        }
    }

    /// Polarization symbol for renderers
    pub fn symbol(&self) -> char {
        match self.angle {
            angles::HORIZONTAL => '↔',
            angles::VERTICAL => '↕',
            angles::DIAGONAL_RIGHT => '↗',
            _ => '↖',
        }
    }
}

impl fmt::Display for Photon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°{}", self.angle, self.symbol())
    }
}

/// Encode a bit in a basis
pub fn encode(bit: u8, basis: Basis) -> Photon {
    Photon::encode(bit, basis)
}

/// Measure a photon in a basis
pub fn measure(photon: &Photon, basis: Basis) -> u8 {
    photon.measure_with(basis, &mut rand::rng())
}

/// `n` uniformly random bits from the thread CSPRNG
pub fn random_bits(n: usize) -> Vec<u8> {
    random_bits_with(n, &mut rand::rng())
}

/// `n` uniformly random bits
pub fn random_bits_with<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<u8> {
    (0..n).map(|_| rng.random_range(0..=1)).collect()
}

/// `n` uniformly random bases from the thread CSPRNG
pub fn random_bases(n: usize) -> Vec<Basis> {
    random_bases_with(n, &mut rand::rng())
}

/// `n` uniformly random bases
pub fn random_bases_with<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<Basis> {
    (0..n).map(|_| Basis::random(rng)).collect()
}

/// Encode index-aligned bits and bases
pub fn encode_all(bits: &[u8], bases: &[Basis]) -> Result<Vec<Photon>> {
    if bits.len() != bases.len() {
        return Err(Error::ProtocolViolation(format!(
            "{} bits but {} bases",
            bits.len(),
            bases.len()
        )));
    }
    Ok(bits.iter().zip(bases).map(|(&bit, &basis)| encode(bit, basis)).collect())
}

/// Measure index-aligned photons and bases
pub fn measure_all(photons: &[Photon], bases: &[Basis]) -> Result<Vec<u8>> {
    measure_all_with(photons, bases, &mut rand::rng())
}

/// Measure index-aligned photons and bases using the supplied RNG
pub fn measure_all_with<R: Rng + ?Sized>(
    photons: &[Photon],
    bases: &[Basis],
    rng: &mut R,
) -> Result<Vec<u8>> {
    if photons.len() != bases.len() {
        return Err(Error::ProtocolViolation(format!(
            "{} photons but {} bases",
            photons.len(),
            bases.len()
        )));
    }
    Ok(photons
        .iter()
        .zip(bases)
        .map(|(photon, &basis)| photon.measure_with(basis, rng))
        .collect())
}
