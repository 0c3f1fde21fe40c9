/*!
Per-exchange session data.

An `ExchangeSession` holds everything one role learns during one exchange
attempt. It is owned by the foreground coordinator, never shared across
threads, and wiped when reset or dropped.
*/

use std::time::{Duration, Instant};

use zeroize::Zeroize;

use crate::core::{
    error::Result,
    quantum::photon::Basis,
    session::state::{ExchangeState, Role, StateManager},
};

/// State of one exchange attempt
#[derive(Debug)]
pub struct ExchangeSession {
    id: String,
    state_manager: StateManager,
    timeout: Duration,
    started_at: Instant,
    deadline: Option<Instant>,

    /// Bits sent (initiator) or measured (responder)
    pub local_bits: Vec<u8>,
    /// Bases used to encode (initiator) or measure (responder)
    pub local_bases: Vec<Basis>,
    /// Bases disclosed by the peer
    pub peer_bases: Vec<Basis>,
    /// Photon indices where both bases agree
    pub matching_positions: Vec<usize>,
    /// Sifted-key indices disclosed for error estimation
    pub sample_positions: Vec<usize>,
    /// Sifted key
    pub raw_key: Vec<u8>,
    /// Sifted key without the sample
    pub final_key: Vec<u8>,
    /// Error rate over the sample
    pub error_rate: f64,
}

impl ExchangeSession {
    /// Create an idle session
    pub fn new(role: Role, id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            state_manager: StateManager::new(role),
            timeout,
            started_at: Instant::now(),
            deadline: None,
            local_bits: Vec::new(),
            local_bases: Vec::new(),
            peer_bases: Vec::new(),
            matching_positions: Vec::new(),
            sample_positions: Vec::new(),
            raw_key: Vec::new(),
            final_key: Vec::new(),
            error_rate: 0.0,
        }
    }

    /// Exchange id shared with the peer
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adopt the id announced by the initiator
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn role(&self) -> Role {
        self.state_manager.role()
    }

    pub fn state(&self) -> ExchangeState {
        self.state_manager.state()
    }

    /// Advance the state machine; awaiting states start their deadline
    pub fn transition_to(&mut self, next: ExchangeState) -> Result<()> {
        self.state_manager.transition_to(next)?;
        self.deadline = next.is_awaiting().then(|| Instant::now() + self.timeout);
        Ok(())
    }

    /// Deadline of the current awaiting state
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Per-state timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time since the attempt started
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Mark the attempt aborted
    pub fn abort(&mut self) {
        self.state_manager.abort();
        self.deadline = None;
    }

    /// Wipe all data and return to `Idle` under a new id
    pub fn reset(&mut self, id: impl Into<String>) {
        self.wipe();
        self.id = id.into();
        self.state_manager.reset();
        self.started_at = Instant::now();
        self.deadline = None;
    }

    fn wipe(&mut self) {
        self.local_bits.zeroize();
        self.raw_key.zeroize();
        self.final_key.zeroize();
        self.local_bases.clear();
        self.peer_bases.clear();
        self.matching_positions.clear();
        self.sample_positions.clear();
        self.error_rate = 0.0;
    }
}

impl Drop for ExchangeSession {
    fn drop(&mut self) {
        self.wipe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_only_in_awaiting_states() {
        let mut session = ExchangeSession::new(Role::Responder, "abcd1234", Duration::from_secs(5));
        assert!(session.deadline().is_none());

        session.transition_to(ExchangeState::AwaitingInit).unwrap();
        let deadline = session.deadline().unwrap();
        assert!(deadline > Instant::now());

        session.transition_to(ExchangeState::AwaitingPhotons).unwrap();
        session.transition_to(ExchangeState::BasesChosen).unwrap();
        assert!(session.deadline().is_none());
    }

    #[test]
    fn test_reset_wipes_data() {
        let mut session = ExchangeSession::new(Role::Initiator, "first", Duration::from_secs(1));
        session.local_bits = vec![1, 0, 1];
        session.final_key = vec![1, 1];
        session.matching_positions = vec![0, 2];
        session.transition_to(ExchangeState::BitsChosen).unwrap();
        session.abort();
        assert_eq!(session.state(), ExchangeState::Aborted);

        session.reset("second");
        assert_eq!(session.id(), "second");
        assert_eq!(session.state(), ExchangeState::Idle);
        assert!(session.local_bits.is_empty());
        assert!(session.final_key.is_empty());
        assert!(session.matching_positions.is_empty());
    }
}
