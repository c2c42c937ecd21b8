//! Wire layer for the hubsock admin client.
//!
//! - [`protocol`]: JSON-array frame codec
//! - [`transport`]: the [`Transport`] trait and inbound [`TransportEvent`]s
//! - [`websocket`]: WebSocket transport with correlation table and reconnect
//! - [`loopback`]: in-process transport pair
//! - [`endpoint`]: socket URL derivation from the hosting page
//! - [`session`]: HTTP client settings and the session probe

pub mod endpoint;
pub mod error;
pub mod loopback;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod websocket;

pub use endpoint::{DeploymentMode, Endpoint, HostLocation, HostMarkers};
pub use error::Error;
pub use loopback::{Emitted, LoopbackPeer, LoopbackTransport};
pub use protocol::Frame;
pub use session::{HttpConfig, SessionProbe, TlsMode};
pub use transport::{Ack, EventReceiver, Transport, TransportEvent};
pub use websocket::{ReconnectConfig, WebSocketOptions, WebSocketTransport};
