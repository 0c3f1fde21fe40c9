/*!
Local choice of bits and bases.

The exchange asks a `LocalInput` for the secret choices of its side. The
default draws from the thread CSPRNG; `ScriptedInput` replays user-entered
sequences.
*/

use std::collections::VecDeque;

use crate::core::{
    error::{Error, Result},
    quantum::photon::{self, Basis},
};

/// Source of a peer's secret bit and basis choices
pub trait LocalInput: Send {
    /// Bits to encode
    fn choose_bits(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Bases to encode or measure with
    fn choose_bases(&mut self, n: usize) -> Result<Vec<Basis>>;
}

/// Choices drawn from the thread CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomInput;

impl LocalInput for RandomInput {
    fn choose_bits(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(photon::random_bits(n))
    }

    fn choose_bases(&mut self, n: usize) -> Result<Vec<Basis>> {
        Ok(photon::random_bases(n))
    }
}

/// Queued choices, one entry per exchange attempt
///
/// When a queue runs dry the choice falls back to random.
#[derive(Debug, Default, Clone)]
pub struct ScriptedInput {
    bits: VecDeque<Vec<u8>>,
    bases: VecDeque<Vec<Basis>>,
}

impl ScriptedInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a bit sequence
    pub fn with_bits(mut self, bits: Vec<u8>) -> Self {
        self.bits.push_back(bits);
        self
    }

    /// Queue a basis sequence
    pub fn with_bases(mut self, bases: Vec<Basis>) -> Self {
        self.bases.push_back(bases);
        self
    }

    /// Queue a bit sequence typed as `0`/`1` characters
    pub fn push_bits_str(&mut self, text: &str) -> Result<()> {
        self.bits.push_back(parse_bits(text)?);
        Ok(())
    }

    /// Queue a basis sequence typed as `+`/`x` characters
    pub fn push_bases_str(&mut self, text: &str) -> Result<()> {
        self.bases.push_back(parse_bases(text)?);
        Ok(())
    }
}

fn check_length<T>(what: &str, values: Vec<T>, n: usize) -> Result<Vec<T>> {
    if values.len() != n {
        return Err(Error::InvalidFormat(format!(
            "Scripted {} have {} entries, the exchange needs {}",
            what,
            values.len(),
            n
        )));
    }
    Ok(values)
}

impl LocalInput for ScriptedInput {
    fn choose_bits(&mut self, n: usize) -> Result<Vec<u8>> {
        match self.bits.pop_front() {
            Some(bits) => check_length("bits", bits, n),
            None => Ok(photon::random_bits(n)),
        }
    }

    fn choose_bases(&mut self, n: usize) -> Result<Vec<Basis>> {
        match self.bases.pop_front() {
            Some(bases) => check_length("bases", bases, n),
            None => Ok(photon::random_bases(n)),
        }
    }
}

/// Parse `0`/`1` characters, ignoring whitespace
pub fn parse_bits(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '0' => Ok(0),
            '1' => Ok(1),
            other => Err(Error::InvalidFormat(format!("Invalid bit '{}'", other))),
        })
        .collect()
}

/// Parse `+` (rectilinear) and `x`/`×` (diagonal), ignoring whitespace
pub fn parse_bases(text: &str) -> Result<Vec<Basis>> {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '+' => Ok(Basis::Rectilinear),
            'x' | 'X' | '×' => Ok(Basis::Diagonal),
            other => Err(Error::InvalidFormat(format!("Invalid basis '{}'", other))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_input_lengths() {
        let mut input = RandomInput;
        assert_eq!(input.choose_bits(16).unwrap().len(), 16);
        assert_eq!(input.choose_bases(16).unwrap().len(), 16);
    }

    #[test]
    fn test_scripted_input() {
        let mut input = ScriptedInput::new().with_bits(vec![1, 0, 1]);
        input.push_bases_str("+x+").unwrap();

        assert_eq!(input.choose_bits(3).unwrap(), vec![1, 0, 1]);
        assert_eq!(
            input.choose_bases(3).unwrap(),
            vec![Basis::Rectilinear, Basis::Diagonal, Basis::Rectilinear]
        );
        // Exhausted queues fall back to random choices
        assert_eq!(input.choose_bits(5).unwrap().len(), 5);
    }

    #[test]
    fn test_scripted_length_mismatch() {
        let mut input = ScriptedInput::new().with_bits(vec![1, 0]);
        assert!(matches!(input.choose_bits(3), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse_bits("10 01").unwrap(), vec![1, 0, 0, 1]);
        assert!(parse_bits("102").is_err());
        assert_eq!(parse_bases("×X").unwrap(), vec![Basis::Diagonal, Basis::Diagonal]);
        assert!(parse_bases("+-").is_err());
    }
}
