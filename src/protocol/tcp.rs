/*!
TCP transport.

One connection carries all traffic between the two peers. Writes go through a
locked stream; reads happen on a background thread that frames inbound bytes,
checks sequence numbers and hands each message to the `Router`.
*/

use std::{
    io::{self, Read},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use crate::{
    core::{
        config::NetworkConfig,
        constants::sizes::HEADER_SIZE,
        error::{Error, Result},
        message::{Envelope, Frame, WireMessage},
    },
    protocol::{
        router::Router,
        transport::{InboundGuard, SequenceCounter, Transport, Verdict},
    },
};

/// Framed TCP connection with a background receive loop
pub struct TcpTransport {
    writer: Mutex<TcpStream>,
    sequence: SequenceCounter,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    peer_addr: SocketAddr,
    max_payload: usize,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Connect to `config.address()`, retrying with backoff
    pub fn connect(config: &NetworkConfig, router: Router) -> Result<Arc<Self>> {
        config.validate()?;
        let address = config.address();
        let mut last_error = None;

        for attempt in 0..config.connect_retries {
            match Self::try_connect(&address, config) {
                Ok(stream) => {
                    log::info!("Connected to {}", address);
                    return Self::from_stream(stream, config, router);
                }
                Err(e) => {
                    log::warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        config.connect_retries,
                        address,
                        e
                    );
                    last_error = Some(e);
                }
            }
            if attempt + 1 < config.connect_retries {
                thread::sleep(config.backoff(attempt));
            }
        }

        Err(Error::TransportFailure(format!(
            "Could not connect to {} after {} attempts: {}",
            address,
            config.connect_retries,
            last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string())
        )))
    }

    fn try_connect(address: &str, config: &NetworkConfig) -> io::Result<TcpStream> {
        let mut last_error = io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", address));
        for addr in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    /// Accept one peer on a bound listener
    pub fn accept(listener: &TcpListener, config: &NetworkConfig, router: Router) -> Result<Arc<Self>> {
        config.validate()?;
        let (stream, addr) = listener.accept()?;
        log::info!("Accepted connection from {}", addr);
        Self::from_stream(stream, config, router)
    }

    /// Wrap a connected stream and start its receive loop
    pub fn from_stream(stream: TcpStream, config: &NetworkConfig, router: Router) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.read_timeout))?;
        let peer_addr = stream.peer_addr()?;
        let reader = stream.try_clone()?;

        let connected = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));

        let receive_loop = ReceiveLoop {
            stream: reader,
            router,
            guard: InboundGuard::new(config.max_protocol_violations),
            connected: Arc::clone(&connected),
            shutdown: Arc::clone(&shutdown),
            max_payload: config.max_payload_size,
        };
        let handle = thread::Builder::new()
            .name("bb84-recv".into())
            .spawn(move || receive_loop.run())?;

        Ok(Arc::new(Self {
            writer: Mutex::new(stream),
            sequence: SequenceCounter::new(),
            connected,
            shutdown,
            peer_addr,
            max_payload: config.max_payload_size,
            receiver: Mutex::new(Some(handle)),
        }))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Transport for TcpTransport {
    fn send(&self, message: &WireMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::TransportFailure("Connection closed".into()));
        }

        let mut writer = self.writer.lock();
        // Sequence numbers are taken under the write lock so they hit the wire in order
        let frame = message.to_frame(self.sequence.next(), self.max_payload)?;
        if let Err(e) = frame.write(&mut *writer) {
            self.connected.store(false, Ordering::SeqCst);
            return Err(Error::TransportFailure(format!("Send to {} failed: {}", self.peer_addr, e)));
        }
        log::trace!("Sent {} (seq {})", frame.header.msg_type, frame.header.sequence);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.writer.lock().shutdown(Shutdown::Both);

        let handle = self.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("Receive loop panicked");
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader that keeps waiting through read timeouts until shutdown
///
/// Used once a frame has started so a slow peer cannot split it.
struct FrameReader<'a> {
    stream: &'a mut TcpStream,
    shutdown: &'a AtomicBool,
}

impl Read for FrameReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if is_timeout(&e) && !self.shutdown.load(Ordering::SeqCst) => continue,
                other => return other,
            }
        }
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

struct ReceiveLoop {
    stream: TcpStream,
    router: Router,
    guard: InboundGuard,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    max_payload: usize,
}

impl ReceiveLoop {
    fn run(mut self) {
        log::debug!("Receive loop started");
        let reason = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break None;
            }
            match self.next_frame() {
                Ok(None) => continue,
                Ok(Some(envelope)) => {
                    let disconnect = envelope.message == WireMessage::Disconnect;
                    self.router.dispatch(envelope);
                    if disconnect {
                        break None;
                    }
                }
                Err(reason) => break reason,
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        if self.shutdown.load(Ordering::SeqCst) {
            // Local close; the peer side learns from its own socket
            self.router.connection_lost(None);
        } else if reason.is_some() || !self.router.is_closed() {
            self.router.connection_lost(reason);
        }
        log::debug!("Receive loop stopped");
    }

    /// Next accepted message, `None` when idle or dropped
    ///
    /// `Err` ends the loop; its reason is `None` for an orderly close.
    fn next_frame(&mut self) -> std::result::Result<Option<Envelope>, Option<String>> {
        let mut header = [0u8; HEADER_SIZE];

        match self.stream.read(&mut header[..1]) {
            Ok(0) => {
                if self.shutdown.load(Ordering::SeqCst) {
                    return Err(None);
                }
                return Err(Some("Connection closed by peer".into()));
            }
            Ok(_) => {}
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => {
                if self.shutdown.load(Ordering::SeqCst) {
                    return Err(None);
                }
                return Err(Some(format!("Receive failed: {}", e)));
            }
        }

        let mut reader = FrameReader {
            stream: &mut self.stream,
            shutdown: &self.shutdown,
        };
        let frame = reader
            .read_exact(&mut header[1..])
            .map_err(Error::from)
            .and_then(|()| Frame::read_after_header(&header, &mut reader, self.max_payload));

        let verdict = match frame {
            Ok(frame) => self.guard.check(Envelope::from_frame(&frame)),
            Err(e @ Error::ProtocolViolation(_)) => self.guard.violation(e),
            Err(e) => {
                if self.shutdown.load(Ordering::SeqCst) {
                    return Err(None);
                }
                return Err(Some(format!("Framing error: {}", e)));
            }
        };

        match verdict {
            Verdict::Accept(envelope) => Ok(Some(envelope)),
            Verdict::Drop => Ok(None),
            Verdict::Terminate(reason) => {
                let _ = self.stream.shutdown(Shutdown::Both);
                Err(Some(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::payload::{ChatPayload, EveToggle};
    use crate::protocol::router::{AppInbound, Inbound};
    use std::{
        io::Write,
        time::{Duration, Instant},
    };

    fn loopback() -> (TcpListener, NetworkConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = NetworkConfig::new("127.0.0.1", port);
        config.read_timeout = Duration::from_millis(50);
        (listener, config)
    }

    fn chat(text: &str) -> WireMessage {
        WireMessage::Chat(ChatPayload {
            sender: "Alice".into(),
            ciphertext: text.into(),
            bits_used: 8 * text.len(),
            key_id: "k1".into(),
            key_offset: 0,
        })
    }

    #[test]
    fn test_loopback_messages_arrive_in_order() {
        let (listener, config) = loopback();
        let (router_b, _inbox_b, app_b) = Router::new();
        let accept_config = config.clone();
        let server = thread::spawn(move || TcpTransport::accept(&listener, &accept_config, router_b).unwrap());

        let (router_a, _inbox_a, _app_a) = Router::new();
        let alice = TcpTransport::connect(&config, router_a).unwrap();
        let bob = server.join().unwrap();

        alice.send(&chat("aa")).unwrap();
        alice.send(&WireMessage::EveToggle(EveToggle { active: true })).unwrap();

        let first = app_b.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = app_b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(first, AppInbound::Message(e) if e.sequence == 1 && e.message == chat("aa")));
        assert!(matches!(second, AppInbound::Message(e) if e.sequence == 2));

        alice.send(&WireMessage::Disconnect).unwrap();
        assert_eq!(app_b.recv_timeout(Duration::from_secs(2)).unwrap(), AppInbound::Closed(None));
        bob.close();
        alice.close();
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let (listener, config) = loopback();
        let (router_b, _inbox_b, app_b) = Router::new();
        let accept_config = config.clone();
        let server = thread::spawn(move || TcpTransport::accept(&listener, &accept_config, router_b).unwrap());

        let mut raw = TcpStream::connect(config.address()).unwrap();
        let bob = server.join().unwrap();

        // Unknown type 0x15 with a two-byte payload, then a valid frame
        raw.write_all(&[0x15, 0, 0, 0, 2, 0, 0, 0, 1, b'{', b'}']).unwrap();
        chat("ok").to_frame(2, config.max_payload_size).unwrap().write(&mut raw).unwrap();

        match app_b.recv_timeout(Duration::from_secs(2)).unwrap() {
            AppInbound::Message(envelope) => assert_eq!(envelope.sequence, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(bob.is_connected());
        bob.close();
    }

    #[test]
    fn test_peer_loss_reaches_inbox() {
        let (listener, config) = loopback();
        let (router_b, mut inbox_b, _app_b) = Router::new();
        let accept_config = config.clone();
        let server = thread::spawn(move || TcpTransport::accept(&listener, &accept_config, router_b).unwrap());

        let raw = TcpStream::connect(config.address()).unwrap();
        let bob = server.join().unwrap();
        drop(raw);

        match inbox_b.recv_until(Instant::now() + Duration::from_secs(2)) {
            Some(Inbound::Closed(Some(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(!bob.is_connected());
        assert!(bob.send(&chat("late")).is_err());
    }

    #[test]
    fn test_connect_gives_up() {
        let (listener, mut config) = loopback();
        drop(listener);
        config.connect_retries = 2;
        config.connect_backoff = vec![Duration::from_millis(10)];
        config.connect_timeout = Duration::from_millis(200);

        let (router, _inbox, _app) = Router::new();
        assert!(matches!(
            TcpTransport::connect(&config, router),
            Err(Error::TransportFailure(_))
        ));
    }
}
