//! Object-server (BAOS) decoder seam
//!
//! The object-server sub-protocol is optional; a decoder implementation is
//! injected into a sub-connection at construction and consulted for
//! object-server frames instead of the plain listener path.

use async_trait::async_trait;
use knx_core::KnxResult;

/// Decoder for the BAOS object-server sub-protocol
#[async_trait]
pub trait ObjectServerDecoder: Send + Sync {
    /// Handle an object-server frame received on a sub-connection
    ///
    /// `service` is the raw service identifier (request or acknowledgement),
    /// `body` the frame content following the KNXnet/IP header.
    async fn on_frame(&self, service: u16, body: &[u8]) -> KnxResult<()>;
}
