/*!
Chat-facing peer.

A `Peer` owns one connection, its key manager and its exchange coordinator.
The application drives it from one thread: establish or follow key exchanges,
send encrypted chat, and poll for events. Events are plain data; nothing here
renders.
*/

use std::{
    net::TcpListener,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    core::{
        config::{NetworkConfig, ProtocolConfig},
        constants::{
            defaults::{MAX_PAYLOAD_SIZE, MAX_PROTOCOL_VIOLATIONS},
            sizes::BITS_PER_BYTE,
        },
        crypto::{
            cipher::{self, CryptoDetails},
            key_manager::{KeyInfo, KeyManager},
        },
        error::{Error, Result},
        message::{
            WireMessage,
            payload::{ChatPayload, EveToggle},
        },
        session::{input::LocalInput, state::Role},
    },
    invalid_state_err,
    protocol::{
        coordinator::{Coordinator, ExchangeReport},
        router::{AppInbound, CancelHandle, Inbox, Router},
        tcp::TcpTransport,
        transport::{MemoryTransport, Transport},
    },
};

/// Something the peer or the connection did
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Chat decrypted with the local key
    ChatReceived {
        sender: String,
        details: CryptoDetails,
    },
    /// Chat encrypted at a key position this side does not hold
    KeyDesynchronized {
        sender: String,
        peer_key: String,
        peer_offset: usize,
        local_key: Option<String>,
        local_offset: usize,
    },
    /// Chat at the right position that did not decrypt
    DecryptionFailed { sender: String, reason: String },
    /// The peer switched the simulated eavesdropper
    EveToggled { active: bool },
    /// The peer asks for a new key
    RotationRequested,
    /// The peer started a key exchange; answer with `respond_to_exchange`
    ExchangeRequested { exchange_id: String, photon_count: usize },
    /// Error report sent by the peer
    PeerError { message: String },
    /// The peer disconnected
    Disconnected,
    /// The connection failed
    TransportLost { reason: String },
}

/// Result of sending a chat message
#[derive(Debug, Clone)]
pub struct ChatSent {
    pub details: CryptoDetails,
    /// Exchange run because the key could not cover the message
    pub rotation: Option<ExchangeReport>,
    /// Key usage is past the rotation threshold
    pub rotation_advised: bool,
}

/// One side of a chat secured by BB84 keys
pub struct Peer {
    role: Role,
    config: ProtocolConfig,
    transport: Arc<dyn Transport>,
    coordinator: Coordinator,
    app: Receiver<AppInbound>,
    key_manager: Arc<Mutex<KeyManager>>,
    eve_active: Arc<AtomicBool>,
    closed: bool,
}

impl Peer {
    /// Build a peer over an established transport
    pub fn new(
        role: Role,
        config: ProtocolConfig,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        app: Receiver<AppInbound>,
    ) -> Result<Self> {
        config.validate()?;
        let key_manager = Arc::new(Mutex::new(KeyManager::new(&config)));
        let eve_active = Arc::new(AtomicBool::new(false));
        let coordinator = Coordinator::new(
            config.clone(),
            Arc::clone(&transport),
            inbox,
            Arc::clone(&key_manager),
            Arc::clone(&eve_active),
        );

        Ok(Self {
            role,
            config,
            transport,
            coordinator,
            app,
            key_manager,
            eve_active,
            closed: false,
        })
    }

    /// Connect to a listening peer over TCP
    pub fn connect(role: Role, config: ProtocolConfig, network: &NetworkConfig) -> Result<Self> {
        let (router, inbox, app) = Router::new();
        let transport = TcpTransport::connect(network, router)?;
        Self::new(role, config, transport, inbox, app)
    }

    /// Accept one peer on a bound listener
    pub fn accept(
        role: Role,
        config: ProtocolConfig,
        listener: &TcpListener,
        network: &NetworkConfig,
    ) -> Result<Self> {
        let (router, inbox, app) = Router::new();
        let transport = TcpTransport::accept(listener, network, router)?;
        Self::new(role, config, transport, inbox, app)
    }

    /// Alice and Bob connected in process
    pub fn memory_pair(config: ProtocolConfig) -> Result<(Peer, Peer)> {
        let (router_a, inbox_a, app_a) = Router::new();
        let (router_b, inbox_b, app_b) = Router::new();
        let (ta, tb) = MemoryTransport::pair(router_a, router_b, MAX_PAYLOAD_SIZE, MAX_PROTOCOL_VIOLATIONS);

        let alice = Self::new(Role::Initiator, config.clone(), ta, inbox_a, app_a)?;
        let bob = Self::new(Role::Responder, config, tb, inbox_b, app_b)?;
        Ok((alice, bob))
    }

    /// Replace the source of local bit and basis choices
    pub fn with_input(mut self, input: Box<dyn LocalInput>) -> Self {
        self.coordinator.set_input(input);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn name(&self) -> &'static str {
        self.role.name()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Metadata of the current key
    pub fn key_info(&self) -> Option<KeyInfo> {
        self.key_manager.lock().current()
    }

    /// Past keys, oldest first
    pub fn key_history(&self) -> Vec<KeyInfo> {
        self.key_manager.lock().history().cloned().collect()
    }

    /// Keystream bits left on the current key
    pub fn remaining_bits(&self) -> usize {
        self.key_manager.lock().remaining()
    }

    pub fn needs_rotation(&self) -> bool {
        self.key_manager.lock().needs_rotation()
    }

    pub fn is_eve_active(&self) -> bool {
        self.eve_active.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.transport.is_connected()
    }

    /// Handle that interrupts a running exchange from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.coordinator.cancel_handle()
    }

    /// Run a key exchange as Alice
    pub fn establish_key(&mut self) -> Result<ExchangeReport> {
        self.ensure_open()?;
        if self.role != Role::Initiator {
            return invalid_state_err!(Role::Initiator, self.role);
        }
        self.coordinator.establish_key()
    }

    /// Follow the exchange the peer started, as Bob
    pub fn respond_to_exchange(&mut self) -> Result<ExchangeReport> {
        self.ensure_open()?;
        if self.role != Role::Responder {
            return invalid_state_err!(Role::Responder, self.role);
        }
        self.coordinator.respond_to_exchange()
    }

    /// Encrypt and send a chat message
    ///
    /// When the key cannot cover the message a new one is obtained first:
    /// Alice runs an exchange, Bob asks for one and follows it.
    pub fn send_chat(&mut self, text: &str) -> Result<ChatSent> {
        self.ensure_open()?;
        let needed = text.len() * BITS_PER_BYTE;

        let (short, remaining) = {
            let key_manager = self.key_manager.lock();
            (!key_manager.has_key() || key_manager.remaining() < needed, key_manager.remaining())
        };
        // No fresh key could cover it either
        if needed > self.config.expanded_key_bits {
            return Err(Error::KeyExhausted {
                requested: needed,
                remaining,
            });
        }
        let rotation = if short {
            log::info!("Key cannot cover {} bits, rotating before sending", needed);
            Some(self.rotate()?)
        } else {
            None
        };

        let (ciphertext, details, rotation_advised, usage) = {
            let mut key_manager = self.key_manager.lock();
            let (ciphertext, details) = cipher::encrypt_message(text, &mut key_manager)?;
            (ciphertext, details, key_manager.needs_rotation(), key_manager.usage_percentage())
        };
        self.transport.send(&WireMessage::Chat(ChatPayload {
            sender: self.name().to_string(),
            ciphertext,
            bits_used: details.bits_used,
            key_id: details.key_id.clone(),
            key_offset: details.key_offset,
        }))?;

        if rotation_advised {
            log::info!("Key usage at {:.0}%, rotation advised", usage);
        }
        Ok(ChatSent {
            details,
            rotation,
            rotation_advised,
        })
    }

    fn rotate(&mut self) -> Result<ExchangeReport> {
        match self.role {
            Role::Initiator => self.coordinator.establish_key(),
            Role::Responder => {
                self.request_rotation()?;
                self.coordinator.respond_to_exchange()
            }
        }
    }

    /// Ask the peer to start a new exchange
    pub fn request_rotation(&self) -> Result<()> {
        self.ensure_open()?;
        log::info!("Requesting key rotation");
        self.transport.send(&WireMessage::KeyRotateRequest)
    }

    /// Switch the simulated eavesdropper on both sides
    pub fn set_eve(&mut self, active: bool) -> Result<()> {
        self.ensure_open()?;
        self.eve_active.store(active, Ordering::SeqCst);
        log::info!("Eavesdropper {}", if active { "enabled" } else { "disabled" });
        self.transport.send(&WireMessage::EveToggle(EveToggle { active }))
    }

    /// Next event, or `None` when `timeout` passes quietly
    pub fn poll_event(&mut self, timeout: Duration) -> Option<PeerEvent> {
        let deadline = Instant::now() + timeout;

        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let item = match self.app.recv_timeout(wait) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    return Some(self.connection_ended(Some("Receive loop stopped".into())));
                }
            };

            match item {
                AppInbound::ExchangeRequested(init) => {
                    if self.coordinator.has_handled(&init.exchange_id) {
                        log::debug!("Exchange {} already handled", init.exchange_id);
                        continue;
                    }
                    return Some(PeerEvent::ExchangeRequested {
                        exchange_id: init.exchange_id,
                        photon_count: init.photon_count,
                    });
                }
                AppInbound::Closed(reason) => return Some(self.connection_ended(reason)),
                AppInbound::Message(envelope) => match envelope.message {
                    WireMessage::Chat(chat) => return Some(self.receive_chat(chat)),
                    WireMessage::EveToggle(toggle) => {
                        self.eve_active.store(toggle.active, Ordering::SeqCst);
                        log::info!("Peer {} the eavesdropper", if toggle.active { "enabled" } else { "disabled" });
                        return Some(PeerEvent::EveToggled { active: toggle.active });
                    }
                    WireMessage::KeyRotateRequest => return Some(PeerEvent::RotationRequested),
                    WireMessage::Error(error) => {
                        log::warn!("Peer reported an error: {}", error.message);
                        return Some(PeerEvent::PeerError { message: error.message });
                    }
                    other => log::warn!("Ignoring unexpected {}", other.message_type()),
                },
            }
        }
    }

    fn receive_chat(&mut self, chat: ChatPayload) -> PeerEvent {
        let mut key_manager = self.key_manager.lock();
        let local = key_manager.position();
        let in_step = matches!(&local, Some((id, offset)) if *id == chat.key_id && *offset == chat.key_offset);

        if !in_step {
            let (local_key, local_offset) = match local {
                Some((id, offset)) => (Some(id), offset),
                None => (None, 0),
            };
            log::warn!(
                "Chat from {} uses key {}@{}, local key is {:?}@{}",
                chat.sender,
                chat.key_id,
                chat.key_offset,
                local_key,
                local_offset
            );
            return PeerEvent::KeyDesynchronized {
                sender: chat.sender,
                peer_key: chat.key_id,
                peer_offset: chat.key_offset,
                local_key,
                local_offset,
            };
        }

        match cipher::decrypt_message(&chat.ciphertext, &mut key_manager) {
            Ok((_, details)) => PeerEvent::ChatReceived {
                sender: chat.sender,
                details,
            },
            Err(e) => {
                log::warn!("Could not decrypt chat from {}: {}", chat.sender, e);
                PeerEvent::DecryptionFailed {
                    sender: chat.sender,
                    reason: e.to_string(),
                }
            }
        }
    }

    fn connection_ended(&mut self, reason: Option<String>) -> PeerEvent {
        self.closed = true;
        self.key_manager.lock().clear();
        self.transport.close();
        match reason {
            None => PeerEvent::Disconnected,
            Some(reason) => PeerEvent::TransportLost { reason },
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::TransportFailure("Not connected".into()))
        }
    }

    /// Tell the peer, wipe keys and close the connection
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.transport.is_connected() {
            if let Err(e) = self.transport.send(&WireMessage::Disconnect) {
                log::debug!("Could not send disconnect: {}", e);
            }
        }
        self.key_manager.lock().clear();
        self.transport.close();
        log::info!("{} shut down", self.name());
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    fn established() -> (Peer, Peer) {
        let (mut alice, bob) = Peer::memory_pair(ProtocolConfig::testing()).unwrap();
        let handle = thread::spawn(move || {
            let mut bob = bob;
            bob.respond_to_exchange().unwrap();
            bob
        });
        alice.establish_key().unwrap();
        (alice, handle.join().unwrap())
    }

    #[test]
    fn test_chat_round_trip() {
        let (mut alice, mut bob) = established();

        let sent = alice.send_chat("hello bob").unwrap();
        assert!(sent.rotation.is_none());
        assert_eq!(sent.details.bits_used, 72);

        // Bob first sees the exchange notice, which was already handled
        match bob.poll_event(WAIT) {
            Some(PeerEvent::ChatReceived { sender, details }) => {
                assert_eq!(sender, "Alice");
                assert_eq!(details.plaintext, "hello bob");
                assert_eq!(details.key_offset, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(alice.remaining_bits(), bob.remaining_bits());
    }

    #[test]
    fn test_oversized_chat_keeps_the_key() {
        let (mut alice, mut bob) = established();
        let key_id = alice.key_info().map(|k| k.id);

        // 200 bytes need 1600 bits, more than any 1024-bit key holds
        let text = "x".repeat(200);
        match alice.send_chat(&text) {
            Err(Error::KeyExhausted { requested, remaining }) => {
                assert_eq!(requested, 1600);
                assert_eq!(remaining, 1024);
            }
            other => panic!("unexpected {:?}", other.map(|s| s.details.bits_used)),
        }
        assert_eq!(alice.key_info().map(|k| k.id), key_id);
        assert_eq!(alice.remaining_bits(), 1024);
        assert!(alice.key_history().is_empty());

        assert!(matches!(bob.send_chat(&text), Err(Error::KeyExhausted { .. })));
        assert_eq!(alice.poll_event(Duration::from_millis(50)), None);
    }

    /// Transport whose writes stall until the test lets them through
    struct StalledTransport {
        entered: std::sync::mpsc::Sender<()>,
        release: Mutex<Receiver<()>>,
    }

    impl Transport for StalledTransport {
        fn send(&self, _message: &WireMessage) -> Result<()> {
            let _ = self.entered.send(());
            let _ = self.release.lock().recv();
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn close(&self) {}
    }

    #[test]
    fn test_stalled_send_does_not_hold_the_key() {
        let (entered_tx, entered) = std::sync::mpsc::channel();
        let (release, release_rx) = std::sync::mpsc::channel();
        let transport = Arc::new(StalledTransport {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        });
        let (_router, inbox, app) = Router::new();
        let mut alice = Peer::new(Role::Initiator, ProtocolConfig::testing(), transport, inbox, app).unwrap();
        alice.key_manager.lock().set_key(&[1, 0, 1, 1, 0, 0, 1, 0], 0.0).unwrap();
        let key_manager = Arc::clone(&alice.key_manager);

        let sender = thread::spawn(move || {
            let sent = alice.send_chat("hi").unwrap();
            (alice, sent)
        });
        entered.recv_timeout(WAIT).unwrap();

        // The chat frame is stuck in the transport, yet the key is free
        let locked = key_manager.try_lock_for(Duration::from_secs(1)).map(|km| km.remaining());
        assert_eq!(locked, Some(1024 - 16));

        drop(release);
        let (_alice, sent) = sender.join().unwrap();
        assert_eq!(sent.details.bits_used, 16);
    }

    #[test]
    fn test_roles_are_enforced() {
        let (mut alice, mut bob) = Peer::memory_pair(ProtocolConfig::testing()).unwrap();
        assert!(matches!(alice.respond_to_exchange(), Err(Error::InvalidState { .. })));
        assert!(matches!(bob.establish_key(), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_key_desync_is_reported() {
        let (mut alice, mut bob) = established();
        alice.send_chat("one").unwrap();
        alice.send_chat("two").unwrap();

        assert!(matches!(bob.poll_event(WAIT), Some(PeerEvent::ChatReceived { .. })));
        // Bob's cursor moves past what Alice used for "two"
        bob.key_manager.lock().consume(8).unwrap();
        match bob.poll_event(WAIT) {
            Some(PeerEvent::KeyDesynchronized {
                peer_offset,
                local_offset,
                ..
            }) => {
                assert_eq!(peer_offset, 24);
                assert_eq!(local_offset, 32);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_eve_toggle_and_rotation_request() {
        let (mut alice, mut bob) = Peer::memory_pair(ProtocolConfig::testing()).unwrap();
        alice.set_eve(true).unwrap();
        assert_eq!(bob.poll_event(WAIT), Some(PeerEvent::EveToggled { active: true }));
        assert!(bob.is_eve_active());

        bob.request_rotation().unwrap();
        assert_eq!(alice.poll_event(WAIT), Some(PeerEvent::RotationRequested));
        assert_eq!(alice.poll_event(Duration::from_millis(20)), None);
    }

    #[test]
    fn test_shutdown_notifies_peer() {
        let (mut alice, mut bob) = established();
        alice.shutdown();
        assert!(alice.key_info().is_none());
        assert!(alice.send_chat("gone").is_err());

        assert_eq!(bob.poll_event(WAIT), Some(PeerEvent::Disconnected));
        assert!(!bob.is_connected());
        assert!(bob.key_info().is_none());
    }
}
