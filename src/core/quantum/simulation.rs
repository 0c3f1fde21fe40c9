/*!
Single-process BB84 run.

Both parties (and optionally Eve) are simulated in one call and every
intermediate sequence is returned for display. `establish_local_key` wraps the
run in a bounded retry loop and installs the resulting key.
*/

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{
    config::ProtocolConfig,
    crypto::key_manager::{KeyInfo, KeyManager},
    error::{Error, Result},
    quantum::{
        eavesdropper::Eavesdropper,
        photon::{self, Basis, Photon},
        reconciliation,
    },
};

/// Every phase of one simulated exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub alice_bits: Vec<u8>,
    pub alice_bases: Vec<Basis>,
    /// Photons as Alice sent them
    pub photons: Vec<Photon>,
    /// Photons as Bob received them
    pub transmitted_photons: Vec<Photon>,
    pub eve_active: bool,
    pub eve_bits: Option<Vec<u8>>,
    pub eve_bases: Option<Vec<Basis>>,
    pub bob_bases: Vec<Basis>,
    pub bob_bits: Vec<u8>,
    pub matching_positions: Vec<usize>,
    pub match_rate: f64,
    pub alice_raw_key: Vec<u8>,
    pub bob_raw_key: Vec<u8>,
    pub error_rate: f64,
    pub sample_positions: Vec<usize>,
    pub alice_sample: Vec<u8>,
    pub bob_sample: Vec<u8>,
    pub eavesdropper_detected: bool,
    pub alice_final_key: Vec<u8>,
    pub bob_final_key: Vec<u8>,
    pub final_key_length: usize,
    pub key_too_short: bool,
}

/// Key installed by [`establish_local_key`]
#[derive(Debug, Clone)]
pub struct LocalExchange {
    pub key: KeyInfo,
    pub result: SimulationResult,
    pub attempts: u32,
}

/// Simulate one exchange with the thread CSPRNG
pub fn simulate(config: &ProtocolConfig, eve: Option<&mut Eavesdropper>) -> Result<SimulationResult> {
    simulate_with(config, eve, &mut rand::rng())
}

/// Simulate one exchange
pub fn simulate_with<R: Rng + ?Sized>(
    config: &ProtocolConfig,
    eve: Option<&mut Eavesdropper>,
    rng: &mut R,
) -> Result<SimulationResult> {
    config.validate()?;
    let n = config.photon_count;

    let alice_bits = photon::random_bits_with(n, rng);
    let alice_bases = photon::random_bases_with(n, rng);
    let photons = photon::encode_all(&alice_bits, &alice_bases)?;

    let eve_active = eve.is_some();
    let (transmitted_photons, eve_bits, eve_bases) = match eve {
        Some(eve) => {
            let forwarded = eve.intercept_with(&photons, rng);
            (forwarded, Some(eve.last_bits().to_vec()), Some(eve.last_bases().to_vec()))
        }
        None => (photons.clone(), None, None),
    };

    let bob_bases = photon::random_bases_with(n, rng);
    let bob_bits = photon::measure_all_with(&transmitted_photons, &bob_bases, rng)?;

    let matching_positions = reconciliation::find_matching_positions(&alice_bases, &bob_bases)?;
    let match_rate = matching_positions.len() as f64 / n as f64;
    let alice_raw_key = reconciliation::extract_key_bits(&alice_bits, &matching_positions)?;
    let bob_raw_key = reconciliation::extract_key_bits(&bob_bits, &matching_positions)?;

    let check = reconciliation::sample_and_check_with(&alice_raw_key, &bob_raw_key, config.sample_fraction, rng)?;
    let eavesdropper_detected = reconciliation::is_eavesdropper_detected(check.error_rate, config.error_threshold);

    let alice_final_key = reconciliation::remove_sample_bits(&alice_raw_key, &check.positions);
    let bob_final_key = reconciliation::remove_sample_bits(&bob_raw_key, &check.positions);
    let final_key_length = alice_final_key.len();
    let key_too_short = final_key_length == 0 || final_key_length < config.min_key_length;

    log::debug!(
        "Simulated {} photons: {} matching, error rate {:.1}%, final key {} bits",
        n,
        matching_positions.len(),
        check.error_rate * 100.0,
        final_key_length
    );

    Ok(SimulationResult {
        alice_bits,
        alice_bases,
        photons,
        transmitted_photons,
        eve_active,
        eve_bits,
        eve_bases,
        bob_bases,
        bob_bits,
        matching_positions,
        match_rate,
        alice_raw_key,
        bob_raw_key,
        error_rate: check.error_rate,
        sample_positions: check.positions,
        alice_sample: check.sample_a,
        bob_sample: check.sample_b,
        eavesdropper_detected,
        alice_final_key,
        bob_final_key,
        final_key_length,
        key_too_short,
    })
}

/// Simulate until a usable key is found, at most `max_attempts` times
///
/// A detection marks the current key compromised and disables Eve for the
/// next attempt. A short key retries unchanged.
pub fn establish_local_key(
    config: &ProtocolConfig,
    key_manager: &mut KeyManager,
    eve_active: bool,
) -> Result<LocalExchange> {
    let mut eve = Eavesdropper::new();
    let mut eve_active = eve_active;
    let mut last_error = None;

    for attempt in 1..=config.max_attempts {
        let result = simulate(config, eve_active.then_some(&mut eve))?;

        if result.eavesdropper_detected {
            log::warn!(
                "Attempt {}: eavesdropper detected (error rate {:.1}%), discarding key",
                attempt,
                result.error_rate * 100.0
            );
            key_manager.mark_compromised();
            eve_active = false;
            last_error = Some(Error::EavesdropperDetected {
                error_rate: result.error_rate,
                threshold: config.error_threshold,
            });
            continue;
        }

        if result.key_too_short {
            log::warn!(
                "Attempt {}: final key of {} bits is below the minimum of {}",
                attempt,
                result.final_key_length,
                config.min_key_length
            );
            last_error = Some(Error::KeyTooShort {
                length: result.final_key_length,
                minimum: config.min_key_length,
            });
            continue;
        }

        let key = key_manager.set_key(&result.alice_final_key, result.error_rate)?;
        return Ok(LocalExchange {
            key,
            result,
            attempts: attempt,
        });
    }

    Err(Error::RetriesExhausted {
        attempts: config.max_attempts,
        last: Box::new(last_error.unwrap_or(Error::Config("max_attempts must be positive".into()))),
    })
}
