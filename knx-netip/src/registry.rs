//! Sub-connection registry
//!
//! Maps server-assigned communication channels to sub-connections, both for
//! the unsecured channels of a TCP connection and the secured channels of a
//! session. Connect requests awaiting a response queue in a FIFO; the server
//! answers them in order, so the first response binds the queue head.

use crate::subconn::{ClientConnection, SubConnectionState};
use knx_codec::{KnxnetipHeader, ServiceType};
use log::warn;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: Mutex<HashMap<u8, ClientConnection>>,
    pending: Mutex<VecDeque<ClientConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a sub-connection whose connect request was just sent
    pub fn register_connect_request(&self, c: ClientConnection) {
        self.pending.lock().push_back(c);
    }

    /// Remove a sub-connection from the pending queue, e.g. after a send
    /// failure or a connect timeout
    pub fn cancel_connect_request(&self, c: &ClientConnection) {
        self.pending.lock().retain(|p| !p.same_connection(c));
    }

    /// Route a plain service frame to its sub-connection
    ///
    /// Search and description responses are broadcast to every registered
    /// sub-connection; all other services demultiplex by communication
    /// channel, falling back to the head of the pending-connect queue.
    pub async fn dispatch(&self, header: &KnxnetipHeader, body: &[u8]) {
        let service = header.service();
        if service == ServiceType::SearchResponse as u16
            || service == ServiceType::DescriptionResponse as u16
        {
            let all: Vec<ClientConnection> = self.connections.lock().values().cloned().collect();
            for c in all {
                if let Err(e) = c.handle_service_type(header, body).await {
                    warn!("{} error processing {}: {}", c, header, e);
                }
            }
            return;
        }

        let Some(channel) = channel_id(service, body) else {
            warn!("frame too short for channel id: {}", header);
            return;
        };

        let registered = self.connections.lock().get(&channel).cloned();
        let was_pending = registered.is_none();
        let target = registered.or_else(|| self.pending.lock().pop_front());

        let Some(c) = target else {
            warn!("communication channel {} does not exist", channel);
            return;
        };

        if let Err(e) = c.handle_service_type(header, body).await {
            warn!("{} error processing {}: {}", c, header, e);
        }
        if was_pending && c.state() == SubConnectionState::Open {
            self.connections.lock().insert(c.channel_id(), c.clone());
        }
        if service == ServiceType::DisconnectResponse as u16 {
            self.connections.lock().remove(&channel);
        }
    }

    /// Close all registered and pending sub-connections and clear the maps
    pub async fn close_all(&self) {
        let mut all: Vec<ClientConnection> = self.connections.lock().values().cloned().collect();
        all.extend(self.pending.lock().drain(..));
        for c in all {
            c.close().await;
        }
        self.connections.lock().clear();
    }
}

/// Extract the communication channel id of a service frame
///
/// Data services carry a connection sub-header whose first byte is a
/// structure length, putting the channel at body offset 1; connection
/// management services carry it at offset 0.
fn channel_id(service: u16, body: &[u8]) -> Option<u8> {
    let offset = match ServiceType::from_u16(service) {
        Some(
            ServiceType::TunnelingRequest
            | ServiceType::DeviceConfigurationRequest
            | ServiceType::TunnelingFeatureResponse
            | ServiceType::TunnelingFeatureInfo
            | ServiceType::ObjectServerRequest
            | ServiceType::ObjectServerAck,
        ) => 1,
        _ => 0,
    };
    body.get(offset).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_offsets() {
        let body = [0x04, 0x09, 0x00, 0x00];
        assert_eq!(channel_id(ServiceType::TunnelingRequest as u16, &body), Some(0x09));
        assert_eq!(
            channel_id(ServiceType::DeviceConfigurationRequest as u16, &body),
            Some(0x09)
        );
        assert_eq!(
            channel_id(ServiceType::ObjectServerRequest as u16, &body),
            Some(0x09)
        );
        assert_eq!(channel_id(ServiceType::ConnectResponse as u16, &body), Some(0x04));
        assert_eq!(channel_id(ServiceType::DisconnectResponse as u16, &body), Some(0x04));
        assert_eq!(channel_id(ServiceType::TunnelingRequest as u16, &[0x04]), None);
    }
}
