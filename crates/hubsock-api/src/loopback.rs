// ── In-process loopback transport ──
//
// A `Transport` whose other end is a `LoopbackPeer` living in the same
// process. The peer sees every emit (with its acknowledgement slot, if
// any), answers acknowledgements, and injects lifecycle events and
// server pushes. Used for embedding a client behind a custom channel and
// for driving the client deterministically in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::transport::{Ack, EventReceiver, Transport, TransportEvent};

/// One outbound message as observed by the peer.
#[derive(Debug)]
pub struct Emitted {
    pub name: String,
    pub args: Vec<Value>,
    ack: Option<oneshot::Sender<Vec<Value>>>,
}

impl Emitted {
    /// Whether the sender asked for an acknowledgement.
    pub fn wants_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// Answer the acknowledgement. Returns `false` if none was requested
    /// or the requester stopped waiting.
    pub fn reply(mut self, args: Vec<Value>) -> bool {
        self.ack.take().is_some_and(|tx| tx.send(args).is_ok())
    }

    /// Take the acknowledgement slot to answer it later.
    pub fn take_ack(&mut self) -> Option<oneshot::Sender<Vec<Value>>> {
        self.ack.take()
    }
}

/// Client-side half of a loopback pair.
#[derive(Clone)]
pub struct LoopbackTransport {
    outbound: mpsc::UnboundedSender<Emitted>,
    closed: Arc<AtomicBool>,
}

/// Server-side half of a loopback pair.
pub struct LoopbackPeer {
    outbound: mpsc::UnboundedReceiver<Emitted>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

/// Create a connected transport/peer pair and the client's event stream.
pub fn pair() -> (LoopbackTransport, LoopbackPeer, EventReceiver) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    let transport = LoopbackTransport {
        outbound: outbound_tx,
        closed: Arc::clone(&closed),
    };
    let peer = LoopbackPeer {
        outbound: outbound_rx,
        events: event_tx,
        closed,
    };
    (transport, peer, event_rx)
}

impl Transport for LoopbackTransport {
    fn emit(&self, name: &str, args: Vec<Value>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.outbound.send(Emitted {
            name: name.to_owned(),
            args,
            ack: None,
        });
    }

    fn emit_with_ack(&self, name: &str, args: Vec<Value>) -> Ack {
        let (tx, rx) = oneshot::channel();
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.outbound.send(Emitted {
                name: name.to_owned(),
                args,
                ack: Some(tx),
            });
        }
        Ack::new(rx)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl LoopbackPeer {
    /// Wait for the next outbound message.
    pub async fn recv(&mut self) -> Option<Emitted> {
        self.outbound.recv().await
    }

    /// Next outbound message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Emitted> {
        self.outbound.try_recv().ok()
    }

    /// Everything queued so far.
    pub fn drain(&mut self) -> Vec<Emitted> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Whether the client side called [`Transport::close`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connect(&self, ready: bool) {
        self.send(TransportEvent::Connect { ready });
    }

    pub fn reconnect(&self) {
        self.send(TransportEvent::Reconnect);
    }

    /// Signal a disconnect. Unanswered acknowledgements still held by
    /// the test are unaffected; drop them to simulate a lost request.
    pub fn disconnect(&self, reason: &str) {
        self.send(TransportEvent::Disconnect {
            reason: reason.to_owned(),
        });
    }

    /// Inject a server push.
    pub fn push(&self, name: &str, args: Vec<Value>) {
        self.send(TransportEvent::Message {
            name: name.to_owned(),
            args,
        });
    }

    pub fn send(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}
