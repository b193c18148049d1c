//! Connection and session settings

use std::net::SocketAddr;
use std::time::Duration;

/// TCP connection settings
#[derive(Debug, Clone)]
pub struct TcpSettings {
    /// Remote KNXnet/IP server endpoint
    pub server: SocketAddr,
    /// Local endpoint to bind, or `None` for an ephemeral one
    pub local: Option<SocketAddr>,
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
}

impl TcpSettings {
    /// Create settings for a server endpoint with the default 5 s connect
    /// timeout
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            local: None,
            connect_timeout: Duration::from_millis(5000),
        }
    }

    /// Create settings with an explicit local endpoint
    pub fn with_local(local: SocketAddr, server: SocketAddr) -> Self {
        Self {
            local: Some(local),
            ..Self::new(server)
        }
    }
}

/// Secure session settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Timeout per handshake half: session request to session response, and
    /// session auth to session status
    pub setup_timeout: Duration,
    /// Interval between keep-alive status frames of an authenticated session
    pub keep_alive_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_millis(10_000),
            keep_alive_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let tcp = TcpSettings::new("127.0.0.1:3671".parse().unwrap());
        assert_eq!(tcp.connect_timeout, Duration::from_secs(5));
        assert!(tcp.local.is_none());

        let session = SessionSettings::default();
        assert_eq!(session.setup_timeout, Duration::from_secs(10));
        assert_eq!(session.keep_alive_interval, Duration::from_secs(30));
    }
}
