/*!
Transport abstraction.

A transport sends framed messages to the peer and delivers every inbound
message to a `Router`. Sequence numbers are scoped to one connection, start
at 1 and must strictly increase; anything else is a protocol violation.
*/

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI32, Ordering},
};

use parking_lot::Mutex;

use crate::{
    core::{
        error::{Error, Result},
        message::{Envelope, Frame, WireMessage},
    },
    protocol::router::Router,
};

/// Outbound half of a connection to the peer
pub trait Transport: Send + Sync {
    /// Frame and send a message; failure is fatal to the session
    fn send(&self, message: &WireMessage) -> Result<()>;

    /// Whether the connection is still usable
    fn is_connected(&self) -> bool;

    /// Close the connection
    fn close(&self);
}

/// Connection-scoped outbound sequence numbers
#[derive(Debug)]
pub struct SequenceCounter(AtomicI32);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(AtomicI32::new(1))
    }

    /// Next sequence number
    pub fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// What the receive path should do with an inbound frame
#[derive(Debug, PartialEq)]
pub enum Verdict {
    /// Deliver the message
    Accept(Envelope),
    /// Drop the message and keep the connection
    Drop,
    /// Too many consecutive violations; terminate the connection
    Terminate(String),
}

/// Inbound sequence and violation bookkeeping
#[derive(Debug)]
pub struct InboundGuard {
    last_sequence: i32,
    violations: u32,
    max_violations: u32,
}

impl InboundGuard {
    pub fn new(max_violations: u32) -> Self {
        Self {
            last_sequence: 0,
            violations: 0,
            max_violations,
        }
    }

    /// Check a decoded frame
    pub fn check(&mut self, decoded: Result<Envelope>) -> Verdict {
        let result = decoded.and_then(|envelope| {
            if envelope.sequence <= self.last_sequence {
                return Err(Error::ProtocolViolation(format!(
                    "Sequence {} does not follow {}",
                    envelope.sequence, self.last_sequence
                )));
            }
            Ok(envelope)
        });

        match result {
            Ok(envelope) => {
                self.last_sequence = envelope.sequence;
                self.violations = 0;
                Verdict::Accept(envelope)
            }
            Err(e) => self.violation(e),
        }
    }

    /// Record a violation found before decoding
    pub fn violation(&mut self, error: Error) -> Verdict {
        self.violations += 1;
        log::warn!("Dropping inbound message: {} ({} in a row)", error, self.violations);
        if self.violations >= self.max_violations {
            Verdict::Terminate(format!("{} consecutive protocol violations", self.violations))
        } else {
            Verdict::Drop
        }
    }
}

struct MemoryEndpoint {
    router: Router,
    guard: Mutex<InboundGuard>,
    connected: AtomicBool,
}

impl MemoryEndpoint {
    fn deliver(&self, frame: &Frame) {
        let verdict = self.guard.lock().check(Envelope::from_frame(frame));
        match verdict {
            Verdict::Accept(envelope) => self.router.dispatch(envelope),
            Verdict::Drop => {}
            Verdict::Terminate(reason) => {
                self.connected.store(false, Ordering::SeqCst);
                self.router.connection_lost(Some(reason));
            }
        }
    }
}

/// In-process transport; `send` delivers straight into the peer's router
pub struct MemoryTransport {
    local: Arc<MemoryEndpoint>,
    remote: Arc<MemoryEndpoint>,
    sequence: SequenceCounter,
    // Numbering and delivery happen as one step so concurrent senders stay in order
    send_lock: Mutex<()>,
    max_payload: usize,
}

impl MemoryTransport {
    /// Two connected transports, each delivering to the other side's router
    pub fn pair(
        router_a: Router,
        router_b: Router,
        max_payload: usize,
        max_violations: u32,
    ) -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let endpoint = |router| {
            Arc::new(MemoryEndpoint {
                router,
                guard: Mutex::new(InboundGuard::new(max_violations)),
                connected: AtomicBool::new(true),
            })
        };
        let a = endpoint(router_a);
        let b = endpoint(router_b);

        let transport = |local: &Arc<MemoryEndpoint>, remote: &Arc<MemoryEndpoint>| {
            Arc::new(MemoryTransport {
                local: Arc::clone(local),
                remote: Arc::clone(remote),
                sequence: SequenceCounter::new(),
                send_lock: Mutex::new(()),
                max_payload,
            })
        };
        (transport(&a, &b), transport(&b, &a))
    }

    /// Deliver an already framed message, bypassing the sequence counter
    pub fn send_frame(&self, frame: &Frame) -> Result<()> {
        let _sending = self.send_lock.lock();
        self.deliver_frame(frame)
    }

    fn deliver_frame(&self, frame: &Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::TransportFailure("Connection closed".into()));
        }
        self.remote.deliver(frame);
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: &WireMessage) -> Result<()> {
        let _sending = self.send_lock.lock();
        let frame = message.to_frame(self.sequence.next(), self.max_payload)?;
        self.deliver_frame(&frame)
    }

    fn is_connected(&self) -> bool {
        self.local.connected.load(Ordering::SeqCst) && self.remote.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.local.connected.swap(false, Ordering::SeqCst) {
            self.remote.connected.store(false, Ordering::SeqCst);
            self.remote.router.connection_lost(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        constants::defaults::{MAX_PAYLOAD_SIZE, MAX_PROTOCOL_VIOLATIONS},
        message::{MessageType, payload::EveToggle},
    };
    use crate::protocol::router::{AppInbound, Inbound};
    use std::time::{Duration, Instant};

    fn envelope(sequence: i32) -> Result<Envelope> {
        Ok(Envelope {
            sequence,
            message: WireMessage::Disconnect,
        })
    }

    #[test]
    fn test_sequence_counter_starts_at_one() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
    }

    #[test]
    fn test_guard_drops_regressing_sequences() {
        let mut guard = InboundGuard::new(8);
        assert!(matches!(guard.check(envelope(1)), Verdict::Accept(_)));
        assert!(matches!(guard.check(envelope(3)), Verdict::Accept(_)));
        assert_eq!(guard.check(envelope(3)), Verdict::Drop);
        assert_eq!(guard.check(envelope(2)), Verdict::Drop);
        assert!(matches!(guard.check(envelope(4)), Verdict::Accept(_)));
    }

    #[test]
    fn test_guard_terminates_after_repeated_violations() {
        let mut guard = InboundGuard::new(3);
        guard.check(envelope(5));
        assert_eq!(guard.check(envelope(1)), Verdict::Drop);
        assert_eq!(guard.check(envelope(1)), Verdict::Drop);
        assert!(matches!(guard.check(envelope(1)), Verdict::Terminate(_)));
    }

    #[test]
    fn test_memory_pair_delivers_in_order() {
        let (router_a, mut inbox_a, _app_a) = Router::new();
        let (router_b, _inbox_b, app_b) = Router::new();
        let (a, b) = MemoryTransport::pair(router_a, router_b, MAX_PAYLOAD_SIZE, MAX_PROTOCOL_VIOLATIONS);

        a.send(&WireMessage::EveToggle(EveToggle { active: true })).unwrap();
        match app_b.recv_timeout(Duration::from_secs(1)).unwrap() {
            AppInbound::Message(envelope) => {
                assert_eq!(envelope.sequence, 1);
                assert_eq!(envelope.message.message_type(), MessageType::EveToggle);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Replayed frame is dropped
        let replay = WireMessage::KeyRotateRequest.to_frame(1, MAX_PAYLOAD_SIZE).unwrap();
        a.send_frame(&replay).unwrap();
        assert!(app_b.recv_timeout(Duration::from_millis(50)).is_err());

        b.close();
        assert!(!a.is_connected());
        assert!(matches!(
            inbox_a.recv_until(Instant::now() + Duration::from_secs(1)),
            Some(Inbound::Closed(None))
        ));
        assert!(a.send(&WireMessage::Disconnect).is_err());
    }

    #[test]
    fn test_concurrent_senders_lose_nothing() {
        let (router_a, _inbox_a, _app_a) = Router::new();
        let (router_b, _inbox_b, app_b) = Router::new();
        let (a, _b) = MemoryTransport::pair(router_a, router_b, MAX_PAYLOAD_SIZE, MAX_PROTOCOL_VIOLATIONS);

        let senders: Vec<_> = (0..4)
            .map(|i| {
                let a = Arc::clone(&a);
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        a.send(&WireMessage::EveToggle(EveToggle { active: i % 2 == 0 })).unwrap();
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }

        let mut last = 0;
        let mut delivered = 0;
        while let Ok(item) = app_b.recv_timeout(Duration::from_millis(100)) {
            match item {
                AppInbound::Message(envelope) => {
                    assert!(envelope.sequence > last);
                    last = envelope.sequence;
                    delivered += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(delivered, 8000);
        assert!(a.is_connected());
    }
}
