//! KNXnet/IP frame header

use crate::service_type::ServiceType;
use knx_core::{KnxError, KnxResult};
use std::fmt;

/// KNXnet/IP header length
pub const HEADER_SIZE: usize = 6;

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// KNXnet/IP frame header
///
/// 6 bytes on the wire: structure length (6), protocol version (0x10),
/// service type (2 bytes big-endian), total frame length including the
/// header (2 bytes big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnxnetipHeader {
    service: u16,
    total_length: u16,
}

impl KnxnetipHeader {
    /// Create a header for a service with the given body length
    pub fn new(service: ServiceType, body_length: usize) -> Self {
        Self::with_service(service as u16, body_length)
    }

    /// Create a header for a raw service identifier with the given body length
    pub fn with_service(service: u16, body_length: usize) -> Self {
        Self {
            service,
            total_length: (HEADER_SIZE + body_length) as u16,
        }
    }

    /// Decode a header from the start of `data`
    pub fn parse(data: &[u8]) -> KnxResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(KnxError::FrameMalformed(format!(
                "header too short: expected {}, got {}",
                HEADER_SIZE,
                data.len()
            )));
        }
        if data[0] as usize != HEADER_SIZE {
            return Err(KnxError::FrameMalformed(format!(
                "invalid header structure length {}",
                data[0]
            )));
        }
        if data[1] != KNXNETIP_VERSION_10 {
            return Err(KnxError::FrameMalformed(format!(
                "unsupported protocol version 0x{:02x}",
                data[1]
            )));
        }
        let service = u16::from_be_bytes([data[2], data[3]]);
        let total_length = u16::from_be_bytes([data[4], data[5]]);
        if (total_length as usize) < HEADER_SIZE {
            return Err(KnxError::FrameMalformed(format!(
                "total length {} shorter than header",
                total_length
            )));
        }
        Ok(Self {
            service,
            total_length,
        })
    }

    /// Encode the header to its 6-byte wire representation
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let svc = self.service.to_be_bytes();
        let len = self.total_length.to_be_bytes();
        [
            HEADER_SIZE as u8,
            KNXNETIP_VERSION_10,
            svc[0],
            svc[1],
            len[0],
            len[1],
        ]
    }

    /// Get the raw service type identifier
    pub fn service(&self) -> u16 {
        self.service
    }

    /// Get the service type, if known
    pub fn service_type(&self) -> Option<ServiceType> {
        ServiceType::from_u16(self.service)
    }

    /// Get the total frame length, including the header
    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    /// Get the body length, excluding the header
    pub fn body_length(&self) -> usize {
        self.total_length as usize - HEADER_SIZE
    }

    /// Check whether this header carries a KNX IP secure service
    ///
    /// True for the secure wrapper and the session response/auth/status
    /// services received by a client.
    pub fn is_secure(&self) -> bool {
        matches!(
            self.service,
            0x0950 /* SecureWrapper */
            | 0x0952 /* SessionResponse */
            | 0x0953 /* SessionAuth */
            | 0x0954 /* SessionStatus */
        )
    }
}

impl fmt::Display for KnxnetipHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service 0x{:04x} length {}",
            self.service, self.total_length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = KnxnetipHeader::new(ServiceType::TunnelingRequest, 10);
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], 6);
        assert_eq!(bytes[1], 0x10);
        assert_eq!(&bytes[2..4], &[0x04, 0x20]);
        assert_eq!(&bytes[4..6], &[0x00, 0x10]);

        let decoded = KnxnetipHeader::parse(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.body_length(), 10);
    }

    #[test]
    fn test_header_rejects_malformed() {
        assert!(KnxnetipHeader::parse(&[0x06, 0x10, 0x02, 0x06]).is_err());
        assert!(KnxnetipHeader::parse(&[0x05, 0x10, 0x02, 0x06, 0x00, 0x08]).is_err());
        assert!(KnxnetipHeader::parse(&[0x06, 0x20, 0x02, 0x06, 0x00, 0x08]).is_err());
        assert!(KnxnetipHeader::parse(&[0x06, 0x10, 0x02, 0x06, 0x00, 0x02]).is_err());
    }

    #[test]
    fn test_is_secure() {
        for svc in [0x0950u16, 0x0952, 0x0953, 0x0954] {
            assert!(KnxnetipHeader::with_service(svc, 0).is_secure());
        }
        for svc in [0x0951u16, 0x0206, 0x0420, 0x0202] {
            assert!(!KnxnetipHeader::with_service(svc, 0).is_secure());
        }
    }
}
