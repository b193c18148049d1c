//! knx - Rust implementation of the KNXnet/IP secure transport
//!
//! This library provides a client-side KNXnet/IP transport over TCP with
//! KNX IP secure sessions and an application-layer keystore for KNX secure
//! communication.
//!
//! # Architecture
//!
//! The library is organized as a workspace with multiple crates:
//!
//! - `knx-core`: core types, addressing, and error handling
//! - `knx-codec`: KNXnet/IP wire codec (header, service types, HPAI)
//! - `knx-security`: crypto primitives, secure wrapper, keyring, keystore
//! - `knx-netip`: TCP connection, secure sessions, sub-connections
//!
//! # Usage
//!
//! ```no_run
//! use knx::netip::TcpConnection;
//!
//! # async fn run() -> knx::KnxResult<()> {
//! let connection = TcpConnection::new("192.168.1.10:3671".parse().unwrap());
//! let session = connection.new_secure_session(2, &[0x01; 16], &[0x02; 16])?;
//! session.ensure_open().await?;
//! # Ok(())
//! # }
//! ```

// Re-export core types
pub use knx_core::{GroupAddress, IndividualAddress, KnxError, KnxResult, SerialNumber};

// Re-export the wire codec
pub mod codec {
    pub use knx_codec::*;
}

// Re-export the security layer
pub mod secure {
    pub use knx_security::*;
}

// Re-export the transport API
pub mod netip {
    pub use knx_netip::*;
}
