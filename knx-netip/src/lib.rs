//! KNXnet/IP transport over TCP with KNX IP secure sessions
//!
//! This crate provides the client-side transport core: a multiplexed TCP
//! connection to a KNXnet/IP server, authenticated and encrypted secure
//! sessions on that connection, and the dispatch of framed service messages
//! to logical sub-connections (tunneling, device configuration,
//! object-server).
//!
//! # Layering
//!
//! - [`TcpConnection`] owns the socket and the receive task, and routes each
//!   inbound frame to a secure session or a sub-connection.
//! - [`SecureSession`] drives the secure handshake, wraps and unwraps
//!   traffic, and keeps the session alive.
//! - [`ClientConnection`] is one communication channel; it can live directly
//!   on the TCP connection or inside a secure session.

pub mod connection;
pub mod object_server;
mod registry;
pub mod session;
pub mod settings;
pub mod subconn;

pub use connection::TcpConnection;
pub use object_server::ObjectServerDecoder;
pub use session::{SecureSession, SessionState};
pub use settings::{SessionSettings, TcpSettings};
pub use subconn::{ClientConnection, ServiceFrame, SubConnectionState};
