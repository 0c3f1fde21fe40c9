/*!
Interactive key exchange.

Each peer runs its half of the exchange in the foreground: the initiator
(Alice) chooses bits and bases, sends photons and decides the outcome; the
responder (Bob) measures and follows. Peer messages arrive through the
`Inbox` fed by the receive loop, so every state transition happens on the
thread that owns the session.
*/

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use zeroize::Zeroize;

use crate::{
    core::{
        config::{ProtocolConfig, RetryPolicy},
        crypto::key_manager::{KeyManager, short_id},
        error::{Error, Result},
        message::{
            MessageType, WireMessage,
            payload::{
                AbortPayload, BasisBatch, EveToggle, ExchangeInit, KeyComplete, MatchPositions, PhotonBatch,
                SampleBits,
            },
        },
        quantum::{
            eavesdropper::Eavesdropper,
            photon,
            reconciliation,
        },
        session::{
            input::{LocalInput, RandomInput},
            session::ExchangeSession,
            state::{ExchangeState, Role},
        },
    },
    protocol::{
        router::{CancelHandle, Inbound, Inbox},
        transport::Transport,
    },
    protocol_err,
};

/// Reason codes carried by `abort` messages
pub mod abort_reason {
    pub const EAVESDROPPER: &str = "eavesdropper-detected";
    pub const KEY_TOO_SHORT: &str = "key-too-short";
    pub const TIMEOUT: &str = "timeout";
    pub const CANCELLED: &str = "cancelled";
    pub const PROTOCOL_ERROR: &str = "protocol-error";
}

/// Exchange ids remembered after their init was consumed
const HANDLED_LIMIT: usize = 16;

/// Outcome of a successful exchange, for display and statistics
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeReport {
    /// Id of the key now held by both peers
    pub key_id: String,
    /// Reconciled key bits before expansion
    pub final_key: Vec<u8>,
    pub error_rate: f64,
    /// Fraction of photons measured in the sender's basis
    pub match_rate: f64,
    pub photon_count: usize,
    pub matching_count: usize,
    pub sample_count: usize,
    pub duration: Duration,
    /// An earlier attempt was discarded because of an eavesdropper
    pub eve_detected: bool,
    pub attempts: u32,
}

impl Drop for ExchangeReport {
    fn drop(&mut self) {
        self.final_key.zeroize();
    }
}

/// Drives one side of the exchange over a transport
pub struct Coordinator {
    config: ProtocolConfig,
    transport: Arc<dyn Transport>,
    inbox: Inbox,
    key_manager: Arc<Mutex<KeyManager>>,
    eve_active: Arc<AtomicBool>,
    eavesdropper: Eavesdropper,
    input: Box<dyn LocalInput>,
    peer_abort: Option<AbortPayload>,
    handled: VecDeque<String>,
}

impl Coordinator {
    pub fn new(
        config: ProtocolConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        key_manager: Arc<Mutex<KeyManager>>,
        eve_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            transport,
            inbox,
            key_manager,
            eve_active,
            eavesdropper: Eavesdropper::new(),
            input: Box::new(RandomInput),
            peer_abort: None,
            handled: VecDeque::new(),
        }
    }

    /// Replace the source of local bit and basis choices
    pub fn with_input(mut self, input: Box<dyn LocalInput>) -> Self {
        self.set_input(input);
        self
    }

    pub fn set_input(&mut self, input: Box<dyn LocalInput>) {
        self.input = input;
    }

    /// Handle that interrupts the current wait
    pub fn cancel_handle(&self) -> CancelHandle {
        self.inbox.cancel_handle()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Photons intercepted by the simulated eavesdropper so far
    pub fn eavesdropper(&self) -> &Eavesdropper {
        &self.eavesdropper
    }

    /// Whether the init of `exchange_id` was already consumed by this side
    pub fn has_handled(&self, exchange_id: &str) -> bool {
        self.handled.iter().any(|id| id == exchange_id)
    }

    /// Run the exchange as initiator, retrying according to the retry policy
    pub fn establish_key(&mut self) -> Result<ExchangeReport> {
        self.config.validate()?;
        let max_attempts = self.config.max_attempts;
        let mut eve_detected = false;

        for attempt in 1..=max_attempts {
            self.inbox.discard_cancellations();
            let mut session = ExchangeSession::new(Role::Initiator, short_id(), self.config.exchange_timeout);
            log::info!("Starting key exchange {} (attempt {}/{})", session.id(), attempt, max_attempts);

            let error = match self.run_initiator(&mut session) {
                Ok(mut report) => {
                    report.attempts = attempt;
                    report.eve_detected = eve_detected;
                    return Ok(report);
                }
                Err(error) => error,
            };
            session.abort();

            let automatic = self.config.retry_policy == RetryPolicy::Automatic;
            let retrying = automatic && error.should_retry_exchange() && attempt < max_attempts;
            self.send_abort(&session, &error, retrying);

            if let Error::EavesdropperDetected { error_rate, .. } = &error {
                log::warn!(
                    "Eavesdropper detected in exchange {} (error rate {:.1}%)",
                    session.id(),
                    error_rate * 100.0
                );
                eve_detected = true;
                self.key_manager.lock().mark_compromised();
                if automatic {
                    self.disable_eve();
                }
            }

            if !error.should_retry_exchange() || !automatic {
                return Err(error);
            }
            if !retrying {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }
            log::info!("Retrying key exchange: {}", error);
        }

        Err(Error::Config("max_attempts must be positive".into()))
    }

    /// Follow exchanges started by the peer until one completes or fails
    ///
    /// Aborts marked as retrying keep the responder waiting for the next init.
    pub fn respond_to_exchange(&mut self) -> Result<ExchangeReport> {
        self.config.validate()?;
        let max_attempts = self.config.max_attempts;
        let mut eve_detected = false;

        for attempt in 1..=max_attempts {
            self.inbox.discard_cancellations();
            self.peer_abort = None;
            let mut session = ExchangeSession::new(Role::Responder, "pending", self.config.exchange_timeout);

            let error = match self.run_responder(&mut session) {
                Ok(mut report) => {
                    report.attempts = attempt;
                    report.eve_detected = eve_detected;
                    return Ok(report);
                }
                Err(error) => error,
            };
            session.abort();

            let Some(abort) = self.peer_abort.take() else {
                self.send_abort(&session, &error, false);
                return Err(error);
            };

            let error = if abort.reason == abort_reason::EAVESDROPPER {
                eve_detected = true;
                self.key_manager.lock().mark_compromised();
                Error::EavesdropperDetected {
                    error_rate: abort.error_rate.unwrap_or_default(),
                    threshold: self.config.error_threshold,
                }
            } else {
                error
            };

            if !abort.retrying {
                return Err(error);
            }
            if attempt == max_attempts {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }
            log::info!("Peer is retrying the key exchange: {}", error);
        }

        Err(Error::Config("max_attempts must be positive".into()))
    }

    /// One initiator attempt
    pub fn run_initiator(&mut self, session: &mut ExchangeSession) -> Result<ExchangeReport> {
        let photon_count = self.config.photon_count;

        session.local_bits = self.input.choose_bits(photon_count)?;
        session.transition_to(ExchangeState::BitsChosen)?;
        session.local_bases = self.input.choose_bases(photon_count)?;
        session.transition_to(ExchangeState::BasesChosen)?;

        let photons = photon::encode_all(&session.local_bits, &session.local_bases)?;
        session.transition_to(ExchangeState::PhotonsEncoded)?;

        let photons = if self.eve_active.load(Ordering::SeqCst) {
            log::debug!("Eavesdropper intercepting {} photons", photons.len());
            self.eavesdropper.intercept(&photons)
        } else {
            photons
        };

        self.transport.send(&WireMessage::ExchangeInit(ExchangeInit {
            exchange_id: session.id().to_string(),
            photon_count,
            sample_fraction: self.config.sample_fraction,
        }))?;
        self.transport.send(&WireMessage::PhotonBatch(PhotonBatch {
            exchange_id: session.id().to_string(),
            photons,
        }))?;
        session.transition_to(ExchangeState::PhotonsSent)?;
        session.transition_to(ExchangeState::AwaitingPeerBases)?;

        let WireMessage::BasisBatch(batch) = self.await_message(session, MessageType::BasisBatch)? else {
            return protocol_err!("Expected basis batch");
        };
        session.peer_bases = batch.bases;
        session.matching_positions = reconciliation::find_matching_positions(&session.local_bases, &session.peer_bases)?;
        session.raw_key = reconciliation::extract_key_bits(&session.local_bits, &session.matching_positions)?;
        session.sample_positions = reconciliation::sample_positions(
            session.raw_key.len(),
            self.config.sample_fraction,
            &mut rand::rng(),
        );
        session.transition_to(ExchangeState::Reconciled)?;
        log::debug!(
            "{} of {} bases match, sampling {} bits",
            session.matching_positions.len(),
            photon_count,
            session.sample_positions.len()
        );

        self.transport.send(&WireMessage::MatchPositions(MatchPositions {
            exchange_id: session.id().to_string(),
            positions: session.matching_positions.clone(),
            sample_positions: session.sample_positions.clone(),
        }))?;
        session.transition_to(ExchangeState::AwaitingSampleAgreement)?;

        let WireMessage::SampleBits(sample) = self.await_message(session, MessageType::SampleBits)? else {
            return protocol_err!("Expected sample bits");
        };
        let local_sample = reconciliation::extract_key_bits(&session.raw_key, &session.sample_positions)?;
        session.error_rate = reconciliation::error_rate(&local_sample, &sample.bits)?;

        if reconciliation::is_eavesdropper_detected(session.error_rate, self.config.error_threshold) {
            return Err(Error::EavesdropperDetected {
                error_rate: session.error_rate,
                threshold: self.config.error_threshold,
            });
        }

        session.final_key = reconciliation::extract_final_key(
            &session.raw_key,
            &session.sample_positions,
            self.config.min_key_length,
        )?;

        self.transport.send(&WireMessage::KeyComplete(KeyComplete {
            exchange_id: session.id().to_string(),
            key: session.final_key.clone(),
            error_rate: session.error_rate,
        }))?;

        let key = self
            .key_manager
            .lock()
            .set_key_with_id(session.id().to_string(), &session.final_key, session.error_rate)?;
        session.transition_to(ExchangeState::KeyEstablished)?;
        log::info!(
            "Key {} established: {} bits, error rate {:.1}%",
            key.id,
            session.final_key.len(),
            session.error_rate * 100.0
        );

        Ok(self.report(session, key.id, photon_count))
    }

    /// One responder attempt
    pub fn run_responder(&mut self, session: &mut ExchangeSession) -> Result<ExchangeReport> {
        session.transition_to(ExchangeState::AwaitingInit)?;
        let WireMessage::ExchangeInit(init) = self.await_message(session, MessageType::ExchangeInit)? else {
            return protocol_err!("Expected exchange init");
        };
        session.set_id(init.exchange_id.clone());
        self.remember(init.exchange_id);
        log::info!(
            "Joining key exchange {} ({} photons, sample fraction {})",
            session.id(),
            init.photon_count,
            init.sample_fraction
        );
        if init.photon_count == 0 {
            return protocol_err!("Exchange {} announces no photons", session.id());
        }
        session.transition_to(ExchangeState::AwaitingPhotons)?;

        let WireMessage::PhotonBatch(batch) = self.await_message(session, MessageType::PhotonBatch)? else {
            return protocol_err!("Expected photon batch");
        };
        if batch.photons.len() != init.photon_count {
            return protocol_err!(
                "Received {} photons, {} were announced",
                batch.photons.len(),
                init.photon_count
            );
        }
        let photon_count = init.photon_count;

        session.local_bases = self.input.choose_bases(photon_count)?;
        session.transition_to(ExchangeState::BasesChosen)?;
        session.local_bits = photon::measure_all(&batch.photons, &session.local_bases)?;
        session.transition_to(ExchangeState::PhotonsMeasured)?;

        self.transport.send(&WireMessage::BasisBatch(BasisBatch {
            exchange_id: session.id().to_string(),
            bases: session.local_bases.clone(),
        }))?;
        session.transition_to(ExchangeState::BasesSent)?;

        let WireMessage::MatchPositions(matches) = self.await_message(session, MessageType::MatchPositions)? else {
            return protocol_err!("Expected match positions");
        };
        if !is_strictly_ascending(&matches.positions) || !is_strictly_ascending(&matches.sample_positions) {
            return protocol_err!("Match and sample positions must be strictly ascending");
        }
        session.matching_positions = matches.positions;
        session.sample_positions = matches.sample_positions;
        session.raw_key = reconciliation::extract_key_bits(&session.local_bits, &session.matching_positions)?;
        let sample = reconciliation::extract_key_bits(&session.raw_key, &session.sample_positions)?;

        self.transport.send(&WireMessage::SampleBits(SampleBits {
            exchange_id: session.id().to_string(),
            bits: sample,
        }))?;
        session.transition_to(ExchangeState::AwaitingKey)?;

        let WireMessage::KeyComplete(complete) = self.await_message(session, MessageType::KeyComplete)? else {
            return protocol_err!("Expected key complete");
        };

        let local_key = reconciliation::remove_sample_bits(&session.raw_key, &session.sample_positions);
        if local_key != complete.key {
            let differing = local_key.iter().zip(&complete.key).filter(|(a, b)| a != b).count();
            log::warn!(
                "Local key differs from the announced key ({} of {} bits), adopting the announced key",
                differing + local_key.len().abs_diff(complete.key.len()),
                complete.key.len()
            );
        }
        session.final_key = complete.key;
        session.error_rate = complete.error_rate;

        let key = self
            .key_manager
            .lock()
            .set_key_with_id(session.id().to_string(), &session.final_key, session.error_rate)?;
        session.transition_to(ExchangeState::KeyEstablished)?;
        log::info!("Key {} received: {} bits", key.id, session.final_key.len());

        Ok(self.report(session, key.id, photon_count))
    }

    /// Wait for the next message of `expected` type for this session
    ///
    /// Messages of other exchanges or of other types are logged and skipped.
    fn await_message(&mut self, session: &mut ExchangeSession, expected: MessageType) -> Result<WireMessage> {
        let deadline = session
            .deadline()
            .unwrap_or_else(|| Instant::now() + session.timeout());
        let accept_any_id = expected == MessageType::ExchangeInit;

        loop {
            let envelope = match self.inbox.recv_until(deadline) {
                Some(Inbound::Message(envelope)) => envelope,
                Some(Inbound::Cancelled) => {
                    log::info!("Exchange {} cancelled in state {}", session.id(), session.state());
                    return Err(Error::Cancelled);
                }
                Some(Inbound::Closed(None)) => {
                    log::info!("Peer disconnected during exchange {}", session.id());
                    return Err(Error::Cancelled);
                }
                Some(Inbound::Closed(Some(reason))) => return Err(Error::TransportFailure(reason)),
                None => {
                    log::warn!("Exchange {} timed out in state {}", session.id(), session.state());
                    return Err(Error::ExchangeTimeout {
                        state: session.state().to_string(),
                        waited_ms: session.timeout().as_millis() as u64,
                    });
                }
            };

            let message = envelope.message;
            let msg_type = message.message_type();
            if !accept_any_id && message.exchange_id() != Some(session.id()) {
                log::warn!(
                    "Ignoring {} for exchange {:?} while running {}",
                    msg_type,
                    message.exchange_id(),
                    session.id()
                );
                continue;
            }

            match message {
                WireMessage::Abort(abort) if !accept_any_id => {
                    log::warn!("Peer aborted exchange {}: {}", session.id(), abort.reason);
                    let reason = abort.reason.clone();
                    self.peer_abort = Some(abort);
                    return Err(Error::ExchangeAborted(reason));
                }
                message if msg_type == expected => return Ok(message),
                _ => {
                    log::warn!("Ignoring unexpected {} in state {}", msg_type, session.state());
                }
            }
        }
    }

    fn send_abort(&self, session: &ExchangeSession, error: &Error, retrying: bool) {
        let (reason, error_rate) = match error {
            Error::EavesdropperDetected { error_rate, .. } => (abort_reason::EAVESDROPPER, Some(*error_rate)),
            Error::KeyTooShort { .. } => (abort_reason::KEY_TOO_SHORT, None),
            Error::ExchangeTimeout { .. } => (abort_reason::TIMEOUT, None),
            Error::Cancelled => (abort_reason::CANCELLED, None),
            Error::ExchangeAborted(_) | Error::TransportFailure(_) | Error::Io(_) => return,
            _ => (abort_reason::PROTOCOL_ERROR, None),
        };
        if !self.transport.is_connected() {
            return;
        }

        let abort = WireMessage::Abort(AbortPayload {
            exchange_id: session.id().to_string(),
            reason: reason.to_string(),
            error_rate,
            retrying,
        });
        if let Err(e) = self.transport.send(&abort) {
            log::warn!("Failed to send abort for exchange {}: {}", session.id(), e);
        }
    }

    fn disable_eve(&self) {
        if self.eve_active.swap(false, Ordering::SeqCst) {
            log::info!("Disabling eavesdropper for the retry");
            if let Err(e) = self.transport.send(&WireMessage::EveToggle(EveToggle { active: false })) {
                log::warn!("Failed to announce eavesdropper toggle: {}", e);
            }
        }
    }

    fn remember(&mut self, exchange_id: String) {
        if self.handled.len() == HANDLED_LIMIT {
            self.handled.pop_front();
        }
        self.handled.push_back(exchange_id);
    }

    fn report(&self, session: &ExchangeSession, key_id: String, photon_count: usize) -> ExchangeReport {
        ExchangeReport {
            key_id,
            final_key: session.final_key.clone(),
            error_rate: session.error_rate,
            match_rate: session.matching_positions.len() as f64 / photon_count as f64,
            photon_count,
            matching_count: session.matching_positions.len(),
            sample_count: session.sample_positions.len(),
            duration: session.elapsed(),
            eve_detected: false,
            attempts: 1,
        }
    }
}

fn is_strictly_ascending(positions: &[usize]) -> bool {
    positions.windows(2).all(|pair| pair[0] < pair[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::defaults::{MAX_PAYLOAD_SIZE, MAX_PROTOCOL_VIOLATIONS};
    use crate::protocol::{router::Router, transport::MemoryTransport};
    use std::{sync::mpsc::Receiver, thread};

    use crate::protocol::router::AppInbound;

    struct Side {
        coordinator: Coordinator,
        key_manager: Arc<Mutex<KeyManager>>,
        transport: Arc<MemoryTransport>,
        app: Receiver<AppInbound>,
        eve: Arc<AtomicBool>,
    }

    fn pair(config: ProtocolConfig) -> (Side, Side) {
        let (router_a, inbox_a, app_a) = Router::new();
        let (router_b, inbox_b, app_b) = Router::new();
        let (ta, tb) = MemoryTransport::pair(router_a, router_b, MAX_PAYLOAD_SIZE, MAX_PROTOCOL_VIOLATIONS);

        let side = |transport: Arc<MemoryTransport>, inbox, app| {
            let key_manager = Arc::new(Mutex::new(KeyManager::new(&config)));
            let eve = Arc::new(AtomicBool::new(false));
            let coordinator = Coordinator::new(
                config.clone(),
                transport.clone(),
                inbox,
                key_manager.clone(),
                eve.clone(),
            );
            Side {
                coordinator,
                key_manager,
                transport,
                app,
                eve,
            }
        };
        (side(ta, inbox_a, app_a), side(tb, inbox_b, app_b))
    }

    fn run_both(alice: &mut Side, bob: Side) -> (Result<ExchangeReport>, Side, Result<ExchangeReport>) {
        let handle = thread::spawn(move || {
            let mut bob = bob;
            let result = bob.coordinator.respond_to_exchange();
            (bob, result)
        });
        let alice_result = alice.coordinator.establish_key();
        let (bob, bob_result) = handle.join().unwrap();
        (alice_result, bob, bob_result)
    }

    #[test]
    fn test_exchange_produces_identical_keys() {
        let (mut alice, bob) = pair(ProtocolConfig::testing());
        let (alice_result, bob, bob_result) = run_both(&mut alice, bob);

        let a = alice_result.unwrap();
        let b = bob_result.unwrap();
        assert_eq!(a.key_id, b.key_id);
        assert_eq!(a.final_key, b.final_key);
        assert_eq!(a.error_rate, 0.0);
        assert_eq!(a.matching_count, b.matching_count);
        assert_eq!(a.final_key.len(), a.matching_count - a.sample_count);

        let mut ka = alice.key_manager.lock();
        let mut kb = bob.key_manager.lock();
        assert_eq!(ka.position(), kb.position());
        assert_eq!(*ka.consume(64).unwrap(), *kb.consume(64).unwrap());
        assert!(bob.coordinator.has_handled(&a.key_id));
    }

    // Half the sifted bits are disclosed and no disagreement is tolerated,
    // so an intercept-resend attack cannot go unnoticed
    fn strict_config() -> ProtocolConfig {
        ProtocolConfig::testing()
            .with_sample_fraction(0.5)
            .with_error_threshold(0.0)
    }

    #[test]
    fn test_eve_detection_retries_without_eve() {
        let (mut alice, bob) = pair(strict_config().with_max_attempts(3));
        alice.eve.store(true, Ordering::SeqCst);

        let (alice_result, bob, bob_result) = run_both(&mut alice, bob);
        let a = alice_result.unwrap();
        let b = bob_result.unwrap();
        assert_eq!(a.final_key, b.final_key);
        assert_eq!(a.error_rate, 0.0);
        assert!(a.eve_detected);
        assert!(b.eve_detected);
        assert_eq!(a.attempts, 2);
        assert_eq!(b.attempts, 2);

        assert!(!alice.eve.load(Ordering::SeqCst));
        assert!(alice.key_manager.lock().keys_compromised() >= 1);
        assert!(bob.key_manager.lock().keys_compromised() >= 1);
        let toggled = bob.app.try_iter().any(|item| {
            matches!(item, AppInbound::Message(envelope)
                if envelope.message == WireMessage::EveToggle(EveToggle { active: false }))
        });
        assert!(toggled);
    }

    #[test]
    fn test_manual_policy_returns_detection() {
        let (mut alice, bob) = pair(strict_config().with_retry_policy(RetryPolicy::Manual));
        alice.eve.store(true, Ordering::SeqCst);

        let (alice_result, bob, bob_result) = run_both(&mut alice, bob);
        assert!(matches!(alice_result, Err(Error::EavesdropperDetected { .. })));
        assert!(matches!(bob_result, Err(Error::EavesdropperDetected { .. })));
        assert!(alice.eve.load(Ordering::SeqCst));
        assert!(!alice.key_manager.lock().has_key());
        assert!(!bob.key_manager.lock().has_key());
    }

    #[test]
    fn test_eve_is_usually_detected_over_the_wire() {
        // 256 photons with the default threshold; a quarter of the sifted bits is sampled
        let config = ProtocolConfig::testing()
            .with_sample_fraction(0.25)
            .with_retry_policy(RetryPolicy::Manual);

        let mut detected = 0;
        for _ in 0..10 {
            let (mut alice, bob) = pair(config.clone());
            alice.eve.store(true, Ordering::SeqCst);
            let (alice_result, _bob, bob_result) = run_both(&mut alice, bob);
            match (alice_result, bob_result) {
                (Err(Error::EavesdropperDetected { .. }), Err(Error::EavesdropperDetected { .. })) => detected += 1,
                (Ok(a), Ok(b)) => assert_eq!(a.final_key, b.final_key),
                (a, b) => panic!("peers disagree: {:?} / {:?}", a.map(|r| r.key_id.clone()), b.map(|r| r.key_id.clone())),
            }
        }
        assert!(detected >= 5, "detected {} of 10", detected);
    }

    #[test]
    fn test_responder_times_out() {
        let config = ProtocolConfig::testing().with_exchange_timeout(Duration::from_millis(100));
        let (_alice, mut bob) = pair(config);

        let started = Instant::now();
        match bob.coordinator.respond_to_exchange() {
            Err(Error::ExchangeTimeout { state, waited_ms }) => {
                assert_eq!(state, "AwaitingInit");
                assert_eq!(waited_ms, 100);
            }
            other => panic!("unexpected {:?}", other.map(|r| r.key_id.clone())),
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!bob.key_manager.lock().has_key());
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let (_alice, mut bob) = pair(ProtocolConfig::testing());
        let cancel = bob.coordinator.cancel_handle();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        assert!(matches!(bob.coordinator.respond_to_exchange(), Err(Error::Cancelled)));
        handle.join().unwrap();
    }

    #[test]
    fn test_disconnect_aborts_wait() {
        let (alice, mut bob) = pair(ProtocolConfig::testing());
        alice.transport.close();
        assert!(matches!(bob.coordinator.respond_to_exchange(), Err(Error::Cancelled)));
        assert!(!bob.transport.is_connected());
    }
}
