/*!
Inbound message routing.

The receive loop hands every decoded message to a `Router`, which splits the
traffic into two ordered channels: exchange messages for the coordinator's
`Inbox`, and everything else for the application. Disconnects and transport
failures go to both so no wait outlives the connection.
*/

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    time::Instant,
};

use crate::core::message::{
    Envelope, WireMessage,
    payload::ExchangeInit,
};

/// Item delivered to the exchange coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Exchange message from the peer
    Message(Envelope),
    /// Connection ended: `None` for an orderly disconnect, otherwise the failure
    Closed(Option<String>),
    /// Local cancel request
    Cancelled,
}

/// Item delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum AppInbound {
    /// Chat, eve-toggle, rotation request or error report
    Message(Envelope),
    /// The peer started an exchange
    ExchangeRequested(ExchangeInit),
    /// Connection ended: `None` for an orderly disconnect, otherwise the failure
    Closed(Option<String>),
}

/// Dispatcher used by the receive loop
#[derive(Debug, Clone)]
pub struct Router {
    exchange_tx: Sender<Inbound>,
    app_tx: Sender<AppInbound>,
    closed: Arc<AtomicBool>,
}

impl Router {
    /// Create a router with its exchange inbox and application channel
    pub fn new() -> (Router, Inbox, Receiver<AppInbound>) {
        let (exchange_tx, exchange_rx) = mpsc::channel();
        let (app_tx, app_rx) = mpsc::channel();
        let inbox = Inbox {
            rx: exchange_rx,
            tx: exchange_tx.clone(),
            pending: VecDeque::new(),
            closed: None,
        };
        let router = Router {
            exchange_tx,
            app_tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (router, inbox, app_rx)
    }

    /// Route one inbound message
    pub fn dispatch(&self, envelope: Envelope) {
        let msg_type = envelope.message.message_type();
        log::debug!("Received {} (seq {})", msg_type, envelope.sequence);

        match &envelope.message {
            WireMessage::Disconnect => {
                log::info!("Peer disconnected");
                self.close(None);
            }
            WireMessage::ExchangeInit(init) => {
                let _ = self.app_tx.send(AppInbound::ExchangeRequested(init.clone()));
                let _ = self.exchange_tx.send(Inbound::Message(envelope));
            }
            _ if msg_type.is_exchange() => {
                let _ = self.exchange_tx.send(Inbound::Message(envelope));
            }
            _ => {
                let _ = self.app_tx.send(AppInbound::Message(envelope));
            }
        }
    }

    /// Report that the connection died
    pub fn connection_lost(&self, reason: Option<String>) {
        if let Some(reason) = &reason {
            log::error!("Connection lost: {}", reason);
        }
        self.close(reason);
    }

    /// Whether a disconnect or failure has been routed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Receivers may already be gone during shutdown
        let _ = self.exchange_tx.send(Inbound::Closed(reason.clone()));
        let _ = self.app_tx.send(AppInbound::Closed(reason));
    }
}

/// Cancels the coordinator's current wait
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Sender<Inbound>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(Inbound::Cancelled);
    }
}

/// Ordered exchange channel read by the coordinator
#[derive(Debug)]
pub struct Inbox {
    rx: Receiver<Inbound>,
    tx: Sender<Inbound>,
    pending: VecDeque<Inbound>,
    closed: Option<Option<String>>,
}

impl Inbox {
    /// Handle that interrupts a wait from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { tx: self.tx.clone() }
    }

    /// Next item, or `None` once `deadline` passes
    ///
    /// A close is sticky: every later call returns it immediately.
    pub fn recv_until(&mut self, deadline: Instant) -> Option<Inbound> {
        if let Some(reason) = &self.closed {
            return Some(Inbound::Closed(reason.clone()));
        }

        let item = match self.pending.pop_front() {
            Some(item) => item,
            None => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match self.rx.recv_timeout(wait) {
                    Ok(item) => item,
                    Err(RecvTimeoutError::Timeout) => return None,
                    // The inbox holds a sender, so this only happens if the
                    // channel was torn down
                    Err(RecvTimeoutError::Disconnected) => Inbound::Closed(None),
                }
            }
        };

        if let Inbound::Closed(reason) = &item {
            self.closed = Some(reason.clone());
        }
        Some(item)
    }

    /// Drop cancel requests left over from an earlier wait
    pub fn discard_cancellations(&mut self) {
        self.pending.extend(self.rx.try_iter());
        self.pending.retain(|item| *item != Inbound::Cancelled);
    }

    /// Whether the connection is known to be closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }
}
