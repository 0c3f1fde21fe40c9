/*!
Exchange state management for the BB84 protocol.

This module defines the exchange states of both roles and the state machine
that validates their progression.
*/

use std::fmt;

use crate::{core::error::Result, invalid_state_err};

/// Exchange state for tracking key exchange progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    /// No exchange running
    Idle,
    /// Initiator picked its random bits
    BitsChosen,
    /// Bases picked (initiator: for encoding, responder: for measuring)
    BasesChosen,
    /// Initiator encoded its photons
    PhotonsEncoded,
    /// Initiator sent its photons
    PhotonsSent,
    /// Initiator waits for the responder's bases
    AwaitingPeerBases,
    /// Initiator computed matches and the sample
    Reconciled,
    /// Initiator waits for the responder's sample bits
    AwaitingSampleAgreement,
    /// Responder waits for an exchange-init
    AwaitingInit,
    /// Responder waits for the photon batch
    AwaitingPhotons,
    /// Responder measured the photons
    PhotonsMeasured,
    /// Responder sent its bases and waits for the match positions
    BasesSent,
    /// Responder sent its sample bits and waits for the verdict
    AwaitingKey,
    /// Both peers hold the same key
    KeyEstablished,
    /// Exchange abandoned
    Aborted,
}

impl ExchangeState {
    /// Whether the state waits on the peer and therefore has a deadline
    pub fn is_awaiting(self) -> bool {
        matches!(
            self,
            ExchangeState::AwaitingPeerBases
                | ExchangeState::AwaitingSampleAgreement
                | ExchangeState::AwaitingInit
                | ExchangeState::AwaitingPhotons
                | ExchangeState::BasesSent
                | ExchangeState::AwaitingKey
        )
    }

    /// Whether the exchange is over
    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangeState::KeyEstablished | ExchangeState::Aborted)
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeState::Idle => write!(f, "Idle"),
            ExchangeState::BitsChosen => write!(f, "BitsChosen"),
            ExchangeState::BasesChosen => write!(f, "BasesChosen"),
            ExchangeState::PhotonsEncoded => write!(f, "PhotonsEncoded"),
            ExchangeState::PhotonsSent => write!(f, "PhotonsSent"),
            ExchangeState::AwaitingPeerBases => write!(f, "AwaitingPeerBases"),
            ExchangeState::Reconciled => write!(f, "Reconciled"),
            ExchangeState::AwaitingSampleAgreement => write!(f, "AwaitingSampleAgreement"),
            ExchangeState::AwaitingInit => write!(f, "AwaitingInit"),
            ExchangeState::AwaitingPhotons => write!(f, "AwaitingPhotons"),
            ExchangeState::PhotonsMeasured => write!(f, "PhotonsMeasured"),
            ExchangeState::BasesSent => write!(f, "BasesSent"),
            ExchangeState::AwaitingKey => write!(f, "AwaitingKey"),
            ExchangeState::KeyEstablished => write!(f, "KeyEstablished"),
            ExchangeState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Endpoint role in the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Alice: sends photons and decides the outcome
    Initiator,
    /// Bob: measures photons and follows the initiator
    Responder,
}

impl Role {
    /// Conventional party name
    pub fn name(self) -> &'static str {
        match self {
            Role::Initiator => "Alice",
            Role::Responder => "Bob",
        }
    }

    /// Successful path through the exchange for this role
    pub fn path(self) -> &'static [ExchangeState] {
        match self {
            Role::Initiator => &[
                ExchangeState::Idle,
                ExchangeState::BitsChosen,
                ExchangeState::BasesChosen,
                ExchangeState::PhotonsEncoded,
                ExchangeState::PhotonsSent,
                ExchangeState::AwaitingPeerBases,
                ExchangeState::Reconciled,
                ExchangeState::AwaitingSampleAgreement,
                ExchangeState::KeyEstablished,
            ],
            Role::Responder => &[
                ExchangeState::Idle,
                ExchangeState::AwaitingInit,
                ExchangeState::AwaitingPhotons,
                ExchangeState::BasesChosen,
                ExchangeState::PhotonsMeasured,
                ExchangeState::BasesSent,
                ExchangeState::AwaitingKey,
                ExchangeState::KeyEstablished,
            ],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "Initiator"),
            Role::Responder => write!(f, "Responder"),
        }
    }
}

/// Exchange state manager
///
/// Only the next state on the role's path, or `Aborted` from a non-terminal
/// state, is accepted.
#[derive(Debug, Clone, Copy)]
pub struct StateManager {
    state: ExchangeState,
    role: Role,
}

impl StateManager {
    /// Create a new state manager
    pub fn new(role: Role) -> Self {
        Self {
            state: ExchangeState::Idle,
            role,
        }
    }

    /// Get the current state
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Get the role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Check if the exchange is in the given state
    pub fn is_state(&self, state: ExchangeState) -> bool {
        self.state == state
    }

    /// The state that follows the current one on the role's path
    pub fn next_state(&self) -> Option<ExchangeState> {
        let path = self.role.path();
        path.iter()
            .position(|s| *s == self.state)
            .and_then(|i| path.get(i + 1))
            .copied()
    }

    /// Check if moving to `next` is allowed
    pub fn can_transition_to(&self, next: ExchangeState) -> bool {
        if next == ExchangeState::Aborted {
            return !self.state.is_terminal();
        }
        self.next_state() == Some(next)
    }

    /// Move to `next`, or fail with `InvalidState`
    pub fn transition_to(&mut self, next: ExchangeState) -> Result<()> {
        if !self.can_transition_to(next) {
            let expected = match self.next_state() {
                Some(state) => state.to_string(),
                None => "a non-terminal state".to_string(),
            };
            return invalid_state_err!(expected, format!("{} -> {}", self.state, next));
        }
        log::trace!("{} exchange state {} -> {}", self.role.name(), self.state, next);
        self.state = next;
        Ok(())
    }

    /// Move to `Aborted` unless already terminal
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = ExchangeState::Aborted;
        }
    }

    /// Back to `Idle` for another attempt
    pub fn reset(&mut self) {
        self.state = ExchangeState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_path() {
        let mut manager = StateManager::new(Role::Initiator);
        for &state in &Role::Initiator.path()[1..] {
            manager.transition_to(state).unwrap();
        }
        assert!(manager.is_state(ExchangeState::KeyEstablished));
        assert_eq!(manager.next_state(), None);
    }

    #[test]
    fn test_responder_path() {
        let mut manager = StateManager::new(Role::Responder);
        for &state in &Role::Responder.path()[1..] {
            manager.transition_to(state).unwrap();
        }
        assert!(manager.is_state(ExchangeState::KeyEstablished));
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        let mut manager = StateManager::new(Role::Initiator);
        assert!(manager.transition_to(ExchangeState::PhotonsSent).is_err());
        assert!(manager.transition_to(ExchangeState::AwaitingInit).is_err());
        assert!(manager.is_state(ExchangeState::Idle));

        let mut manager = StateManager::new(Role::Responder);
        assert!(manager.transition_to(ExchangeState::BitsChosen).is_err());
    }

    #[test]
    fn test_abort_and_reset() {
        let mut manager = StateManager::new(Role::Responder);
        manager.transition_to(ExchangeState::AwaitingInit).unwrap();
        assert!(manager.state().is_awaiting());
        manager.transition_to(ExchangeState::Aborted).unwrap();
        assert!(manager.state().is_terminal());
        assert!(manager.transition_to(ExchangeState::Aborted).is_err());

        manager.reset();
        assert!(manager.is_state(ExchangeState::Idle));
        manager.abort();
        manager.abort();
        assert!(manager.is_state(ExchangeState::Aborted));
    }

    #[test]
    fn test_role_names() {
        assert_eq!(Role::Initiator.name(), "Alice");
        assert_eq!(Role::Responder.name(), "Bob");
        assert_eq!(ExchangeState::AwaitingSampleAgreement.to_string(), "AwaitingSampleAgreement");
    }
}
