//! KNXnet/IP service type identifiers

/// KNXnet/IP service type identifiers handled by the transport core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceType {
    /// `SEARCH_REQUEST` - device discovery request
    SearchRequest = 0x0201,
    /// `SEARCH_RESPONSE` - device discovery response
    SearchResponse = 0x0202,
    /// `DESCRIPTION_REQUEST` - device description request
    DescriptionRequest = 0x0203,
    /// `DESCRIPTION_RESPONSE` - device description response
    DescriptionResponse = 0x0204,
    /// `CONNECT_REQUEST` - connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - connection state request (heartbeat)
    ConnectionStateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - connection state response
    ConnectionStateResponse = 0x0208,
    /// `DISCONNECT_REQUEST` - disconnect request
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE` - disconnect response
    DisconnectResponse = 0x020A,

    /// `DEVICE_CONFIGURATION_REQUEST` - device management frame
    DeviceConfigurationRequest = 0x0310,
    /// `DEVICE_CONFIGURATION_ACK`
    DeviceConfigurationAck = 0x0311,

    /// `TUNNELING_REQUEST` - tunneling data frame
    TunnelingRequest = 0x0420,
    /// `TUNNELING_ACK` - tunneling acknowledgement
    TunnelingAck = 0x0421,
    /// `TUNNELING_FEATURE_RESPONSE`
    TunnelingFeatureResponse = 0x0424,
    /// `TUNNELING_FEATURE_INFO`
    TunnelingFeatureInfo = 0x0425,

    /// `SECURE_WRAPPER` - secure session wrapper
    SecureWrapper = 0x0950,
    /// `SESSION_REQUEST` - secure session request
    SessionRequest = 0x0951,
    /// `SESSION_RESPONSE` - secure session response
    SessionResponse = 0x0952,
    /// `SESSION_AUTH` - secure session authentication
    SessionAuth = 0x0953,
    /// `SESSION_STATUS` - secure session status
    SessionStatus = 0x0954,

    /// `OBJECT_SERVER_REQUEST` - BAOS object-server frame
    ObjectServerRequest = 0xF080,
    /// `OBJECT_SERVER_ACK` - BAOS object-server acknowledgement
    ObjectServerAck = 0xF082,
}

impl ServiceType {
    /// Convert a raw service identifier to a `ServiceType`
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0201 => Some(Self::SearchRequest),
            0x0202 => Some(Self::SearchResponse),
            0x0203 => Some(Self::DescriptionRequest),
            0x0204 => Some(Self::DescriptionResponse),
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionStateRequest),
            0x0208 => Some(Self::ConnectionStateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0310 => Some(Self::DeviceConfigurationRequest),
            0x0311 => Some(Self::DeviceConfigurationAck),
            0x0420 => Some(Self::TunnelingRequest),
            0x0421 => Some(Self::TunnelingAck),
            0x0424 => Some(Self::TunnelingFeatureResponse),
            0x0425 => Some(Self::TunnelingFeatureInfo),
            0x0950 => Some(Self::SecureWrapper),
            0x0951 => Some(Self::SessionRequest),
            0x0952 => Some(Self::SessionResponse),
            0x0953 => Some(Self::SessionAuth),
            0x0954 => Some(Self::SessionStatus),
            0xF080 => Some(Self::ObjectServerRequest),
            0xF082 => Some(Self::ObjectServerAck),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_roundtrip() {
        for svc in [
            ServiceType::ConnectResponse,
            ServiceType::TunnelingRequest,
            ServiceType::SecureWrapper,
            ServiceType::ObjectServerAck,
        ] {
            assert_eq!(ServiceType::from_u16(svc as u16), Some(svc));
        }
        assert_eq!(ServiceType::from_u16(0x0000), None);
    }
}
