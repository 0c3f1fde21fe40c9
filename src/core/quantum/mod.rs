/*!
Simulated quantum channel.

This module provides photon encoding and measurement, sifting and error
estimation, the intercept-resend eavesdropper and the single-process
simulation of a whole exchange.
*/

pub mod photon;
pub mod reconciliation;
pub mod eavesdropper;
pub mod simulation;

pub use photon::{Basis, Photon, encode, measure};
pub use reconciliation::{SampleCheck, find_matching_positions, extract_key_bits, remove_sample_bits, sample_and_check};
pub use eavesdropper::{Eavesdropper, Interception};
pub use simulation::{LocalExchange, SimulationResult, establish_local_key, simulate};
