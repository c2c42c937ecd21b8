// ── Transport abstraction ──
//
// The connection client talks to the server through a named-event,
// bidirectional channel. Outbound traffic goes through the `Transport`
// trait; inbound traffic (lifecycle changes and server pushes) arrives
// in order on an mpsc channel of `TransportEvent`s handed out when the
// transport is created.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// Receiving half of a transport's inbound event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Outbound side of a named-event transport.
///
/// All methods are non-blocking: frames are queued to the transport's
/// writer and the call returns immediately.
pub trait Transport: Send + Sync {
    /// Send a named event without asking for an acknowledgement.
    fn emit(&self, name: &str, args: Vec<Value>);

    /// Send a named event and receive the acknowledgement arguments.
    ///
    /// The returned [`Ack`] resolves with the callback's argument list. If
    /// the transport drops the request (disconnect, shutdown) it yields
    /// `RecvError`. Dropping the `Ack` before it resolves releases the
    /// transport's correlation entry.
    fn emit_with_ack(&self, name: &str, args: Vec<Value>) -> Ack;

    /// Tear down the transport. No further events are delivered.
    fn close(&self);
}

// ── Ack ──────────────────────────────────────────────────────────────

type Release = Box<dyn FnOnce() + Send>;

/// Pending acknowledgement of an [`Transport::emit_with_ack`] request.
///
/// Resolves like the underlying `oneshot::Receiver`. When dropped the
/// release hook runs, so a caller that gives up (timeout, cancellation)
/// does not leave its entry in the transport's correlation table.
pub struct Ack {
    reply: oneshot::Receiver<Vec<Value>>,
    release: Option<Release>,
}

impl Ack {
    /// An acknowledgement with no correlation entry to release.
    pub fn new(reply: oneshot::Receiver<Vec<Value>>) -> Self {
        Self {
            reply,
            release: None,
        }
    }

    /// An acknowledgement that runs `release` when dropped.
    pub fn with_release(
        reply: oneshot::Receiver<Vec<Value>>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            reply,
            release: Some(Box::new(release)),
        }
    }

    /// An acknowledgement that fails immediately with `RecvError`.
    pub fn rejected() -> Self {
        let (_, reply) = oneshot::channel();
        Self::new(reply)
    }
}

impl Future for Ack {
    type Output = Result<Vec<Value>, oneshot::error::RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply).poll(cx)
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ack")
            .field("releases", &self.release.is_some())
            .finish_non_exhaustive()
    }
}

/// Inbound event delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// First successful connection.
    ///
    /// `ready` is set when the server has already installed its handlers
    /// and the client may authenticate without probing the version first.
    Connect { ready: bool },
    /// Connection re-established after a drop.
    Reconnect,
    /// Connection lost. Pending acknowledgements have been discarded.
    Disconnect { reason: String },
    /// Dial attempt failed.
    ConnectError(String),
    /// Server push (`stateChange`, `objectChange`, `log`, ...).
    Message { name: String, args: Vec<Value> },
}

impl TransportEvent {
    /// Short event name, used for logging.
    pub fn kind(&self) -> &str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Reconnect => "reconnect",
            Self::Disconnect { .. } => "disconnect",
            Self::ConnectError(_) => "connect_error",
            Self::Message { name, .. } => name,
        }
    }
}
