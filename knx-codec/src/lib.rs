//! Wire codec for the KNXnet/IP protocol
//!
//! This crate provides the KNXnet/IP frame header, service type identifiers,
//! the HPAI endpoint descriptor, and the connection management bodies used by
//! the TCP transport core.

pub mod header;
pub mod hpai;
pub mod management;
pub mod service_type;

pub use header::{KnxnetipHeader, HEADER_SIZE, KNXNETIP_VERSION_10};
pub use hpai::{HostProtocol, Hpai, HPAI_SIZE};
pub use management::{connect_request, connection_state_request, disconnect_request, frame, ConnectResponse};
pub use service_type::ServiceType;
