//! Connection management service bodies

use crate::header::KnxnetipHeader;
use crate::hpai::Hpai;
use crate::service_type::ServiceType;
use knx_core::{KnxError, KnxResult};

/// Assemble a complete KNXnet/IP frame from a service type and body
pub fn frame(service: ServiceType, body: &[u8]) -> Vec<u8> {
    let header = KnxnetipHeader::new(service, body.len());
    let mut packet = Vec::with_capacity(6 + body.len());
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(body);
    packet
}

/// Build a connect request carrying the control and data endpoints and the
/// connection request information block supplied by the caller
pub fn connect_request(control: Hpai, data: Hpai, cri: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 + cri.len());
    body.extend_from_slice(&control.to_bytes());
    body.extend_from_slice(&data.to_bytes());
    body.extend_from_slice(cri);
    frame(ServiceType::ConnectRequest, &body)
}

/// Parsed connect response
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    /// Communication channel assigned by the server
    pub channel_id: u8,
    /// Connect status, 0 on success
    pub status: u8,
    /// Data endpoint and connection response data block
    pub crd: Vec<u8>,
}

impl ConnectResponse {
    /// Decode a connect response body
    pub fn parse(body: &[u8]) -> KnxResult<Self> {
        if body.len() < 2 {
            return Err(KnxError::FrameMalformed(format!(
                "connect response too short: {} bytes",
                body.len()
            )));
        }
        Ok(Self {
            channel_id: body[0],
            status: body[1],
            crd: body[2..].to_vec(),
        })
    }
}

/// Build a disconnect request for a communication channel
pub fn disconnect_request(channel_id: u8, control: Hpai) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + 8);
    body.push(channel_id);
    body.push(0); // reserved
    body.extend_from_slice(&control.to_bytes());
    frame(ServiceType::DisconnectRequest, &body)
}

/// Build a connection state request (heartbeat) for a communication channel
pub fn connection_state_request(channel_id: u8, control: Hpai) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + 8);
    body.push(channel_id);
    body.push(0); // reserved
    body.extend_from_slice(&control.to_bytes());
    frame(ServiceType::ConnectionStateRequest, &body)
}
