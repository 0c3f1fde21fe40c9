/*!
Intercept-resend eavesdropper.

Eve measures every photon in a random basis and forwards a fresh photon
encoding what she measured. Each wrong basis choice disturbs the state and
shows up as errors in the sifted key.
*/

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::quantum::photon::{self, Basis, Photon};

/// Audit data of the interceptions so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interception {
    /// Bits measured during the last run
    pub bits: Vec<u8>,
    /// Bases used during the last run
    pub bases: Vec<Basis>,
    /// Photons intercepted across all runs
    pub total_intercepted: usize,
}

/// Intercept-resend attacker
#[derive(Debug, Default)]
pub struct Eavesdropper {
    audit: Interception,
}

impl Eavesdropper {
    /// Create an eavesdropper with an empty audit trail
    pub fn new() -> Self {
        Self::default()
    }

    /// Intercept a batch using the thread CSPRNG
    pub fn intercept(&mut self, photons: &[Photon]) -> Vec<Photon> {
        self.intercept_with(photons, &mut rand::rng())
    }

    /// Intercept a batch, returning the photons forwarded to the receiver
    pub fn intercept_with<R: Rng + ?Sized>(&mut self, photons: &[Photon], rng: &mut R) -> Vec<Photon> {
        let bases = photon::random_bases_with(photons.len(), rng);
        let bits: Vec<u8> = photons
            .iter()
            .zip(&bases)
            .map(|(photon, &basis)| photon.measure_with(basis, rng))
            .collect();
        let forwarded = bits
            .iter()
            .zip(&bases)
            .map(|(&bit, &basis)| Photon::encode(bit, basis))
            .collect();

        self.audit.total_intercepted += photons.len();
        self.audit.bits = bits;
        self.audit.bases = bases;

        log::debug!(
            "Eve intercepted {} photons ({} total)",
            photons.len(),
            self.audit.total_intercepted
        );
        forwarded
    }

    /// Bits measured during the last run
    pub fn last_bits(&self) -> &[u8] {
        &self.audit.bits
    }

    /// Bases used during the last run
    pub fn last_bases(&self) -> &[Basis] {
        &self.audit.bases
    }

    /// Photons intercepted across all runs
    pub fn intercepted_count(&self) -> usize {
        self.audit.total_intercepted
    }

    /// Snapshot of the audit trail
    pub fn interception(&self) -> Interception {
        self.audit.clone()
    }
}
