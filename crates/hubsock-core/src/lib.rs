//! Real-time connection client for the hubsock admin UI.
//!
//! Sits between the wire layer (`hubsock-api`) and UI consumers:
//!
//! - **[`Connection`]**: facade owning the transport, the
//!   [`ConnectionState`] machine, request/response plumbing with timeouts,
//!   subscription tables for states, objects, files and instance messages,
//!   the object cache, client-simulated states and the memo cache that
//!   coalesces concurrent duplicate requests.
//!
//! - **[`ConnectionCallbacks`]**: optional hooks installed at construction
//!   (progress, ready, errors, logs, object changes, language, permission
//!   denials, re-authentication and restart requests).
//!
//! - **Domain model** ([`model`]): typed objects, states, log lines,
//!   certificates and file payloads that keep unknown fields verbatim.
//!
//! - **[`pattern`]**: `*` wildcard subscription patterns compiled once.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hubsock_core::{Connection, ConnectionCallbacks, ConnectionConfig};
//!
//! # async fn demo() -> Result<(), hubsock_core::ConnectionError> {
//! let (transport, _peer, events) = hubsock_api::loopback::pair();
//! let conn = Connection::new(
//!     ConnectionConfig::default(),
//!     Arc::new(transport),
//!     events,
//!     ConnectionCallbacks::new(),
//! );
//! conn.wait_for_first_connection().await;
//! conn.subscribe_state(&["hm-rpc.0.*"], Arc::new(|id, state| {
//!     println!("{id}: {state:?}");
//! }));
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod pattern;
mod store;
mod subscription;

// ── Primary re-exports ──────────────────────────────────────────────
pub use callback::{
    CmdExitHandler, CmdOutputHandler, ConnectionCallbacks, ConnectionHandler, FileHandler,
    InstanceMessageHandler, LogHandler, ObjectHandler, StateHandler,
};
pub use config::{ConnectionConfig, RetryPolicy};
pub use connection::{Connection, ConnectionState};
pub use error::ConnectionError;
pub use model::{
    Certificate, CertificateKind, FileAclChange, FileContent, FileData, FileEntry,
    HistoryResult, IoObject, IpAddressEntry, LogEntry, ObjectIdentity, PermissionError, State,
    VersionInfo,
};
pub use pattern::Pattern;
