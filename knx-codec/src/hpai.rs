//! Host protocol address information (HPAI)

use knx_core::{KnxError, KnxResult};
use std::fmt;
use std::net::Ipv4Addr;

/// HPAI structure length
pub const HPAI_SIZE: usize = 8;

/// Host protocol code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostProtocol {
    /// IPv4 over UDP
    Udp = 0x01,
    /// IPv4 over TCP
    Tcp = 0x02,
}

impl HostProtocol {
    fn from_u8(value: u8) -> KnxResult<Self> {
        match value {
            0x01 => Ok(Self::Udp),
            0x02 => Ok(Self::Tcp),
            _ => Err(KnxError::FrameMalformed(format!(
                "invalid host protocol code 0x{:02x}",
                value
            ))),
        }
    }
}

/// 8-byte endpoint descriptor used in KNXnet/IP connection management
///
/// Connections over TCP use the unspecified route-back form with a zero
/// address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hpai {
    protocol: HostProtocol,
    address: Ipv4Addr,
    port: u16,
}

impl Hpai {
    /// The TCP route-back endpoint used in secure handshakes over TCP
    pub const TCP: Hpai = Hpai {
        protocol: HostProtocol::Tcp,
        address: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    /// Create a new endpoint descriptor
    pub fn new(protocol: HostProtocol, address: Ipv4Addr, port: u16) -> Self {
        Self {
            protocol,
            address,
            port,
        }
    }

    /// Decode an HPAI from the start of `data`
    pub fn parse(data: &[u8]) -> KnxResult<Self> {
        if data.len() < HPAI_SIZE {
            return Err(KnxError::FrameMalformed(format!(
                "HPAI too short: expected {}, got {}",
                HPAI_SIZE,
                data.len()
            )));
        }
        if data[0] as usize != HPAI_SIZE {
            return Err(KnxError::FrameMalformed(format!(
                "invalid HPAI structure length {}",
                data[0]
            )));
        }
        let protocol = HostProtocol::from_u8(data[1])?;
        let address = Ipv4Addr::new(data[2], data[3], data[4], data[5]);
        let port = u16::from_be_bytes([data[6], data[7]]);
        Ok(Self {
            protocol,
            address,
            port,
        })
    }

    /// Encode the HPAI to its 8-byte wire representation
    pub fn to_bytes(&self) -> [u8; HPAI_SIZE] {
        let ip = self.address.octets();
        let port = self.port.to_be_bytes();
        [
            HPAI_SIZE as u8,
            self.protocol as u8,
            ip[0],
            ip[1],
            ip[2],
            ip[3],
            port[0],
            port[1],
        ]
    }

    /// Get the host protocol
    pub fn protocol(&self) -> HostProtocol {
        self.protocol
    }

    /// Get the endpoint address
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Get the endpoint port
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Hpai {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}:{}", self.protocol, self.address, self.port)
    }
}
