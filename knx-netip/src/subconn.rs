//! Client sub-connections
//!
//! A sub-connection is one logical conversation (tunneling, device
//! configuration, object-server) multiplexed onto a TCP connection or a
//! secure session, identified by the server-assigned communication channel.

use crate::connection::{ConnectionInner, TcpConnection};
use crate::object_server::ObjectServerDecoder;
use crate::session::{SecureSession, SessionInner};
use knx_codec::{
    connect_request, connection_state_request, disconnect_request, frame, ConnectResponse, Hpai,
    KnxnetipHeader, ServiceType,
};
use knx_core::{KnxError, KnxResult};
use log::{debug, trace};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Timeout for the server's connect response
const CONNECT_REQUEST_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Timeout for a device-management or connection-state response
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Sub-connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubConnectionState {
    /// Connect request sent, waiting for the server's response
    Pending,
    /// Communication channel established
    Open,
    /// Disconnected, refused, or parent closed
    Closed,
}

/// A service frame delivered to sub-connection listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFrame {
    /// Raw service type identifier
    pub service: u16,
    /// Frame content following the KNXnet/IP header
    pub body: Vec<u8>,
}

pub(crate) enum SubConnectionParent {
    Plain(Weak<ConnectionInner>),
    Secured(Weak<SessionInner>),
}

pub(crate) struct SubConnectionInner {
    parent: SubConnectionParent,
    channel_id: AtomicU8,
    connect_status: AtomicU8,
    state: Mutex<SubConnectionState>,
    state_changed: Notify,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ServiceFrame>>>,
    response: Mutex<Option<ServiceFrame>>,
    response_changed: Notify,
    object_server: Option<Arc<dyn ObjectServerDecoder>>,
}

/// Client side of a KNXnet/IP communication channel
#[derive(Clone)]
pub struct ClientConnection {
    pub(crate) inner: Arc<SubConnectionInner>,
}

impl ClientConnection {
    fn new(
        parent: SubConnectionParent,
        object_server: Option<Arc<dyn ObjectServerDecoder>>,
    ) -> Self {
        Self {
            inner: Arc::new(SubConnectionInner {
                parent,
                channel_id: AtomicU8::new(0),
                connect_status: AtomicU8::new(0),
                state: Mutex::new(SubConnectionState::Pending),
                state_changed: Notify::new(),
                listeners: Mutex::new(Vec::new()),
                response: Mutex::new(None),
                response_changed: Notify::new(),
                object_server,
            }),
        }
    }

    /// Open a sub-connection on a plain TCP connection
    ///
    /// Connects the underlying socket if necessary, sends a connect request
    /// with the supplied connection request information block, and waits up
    /// to 10 s for the server's response.
    pub async fn open_unsecured(
        connection: &TcpConnection,
        cri: &[u8],
        object_server: Option<Arc<dyn ObjectServerDecoder>>,
    ) -> KnxResult<ClientConnection> {
        connection.connect().await?;
        let c = Self::new(
            SubConnectionParent::Plain(Arc::downgrade(&connection.inner)),
            object_server,
        );
        connection.inner.registry.register_connect_request(c.clone());
        let request = connect_request(Hpai::TCP, Hpai::TCP, cri);
        if let Err(e) = connection.inner.send(&request).await {
            connection.inner.registry.cancel_connect_request(&c);
            return Err(e);
        }
        c.await_connect_response().await
    }

    /// Open a sub-connection on a secure session
    ///
    /// Establishes the session if necessary; the connect request and all
    /// subsequent traffic travel inside secure wrappers.
    pub async fn open_secured(
        session: &SecureSession,
        cri: &[u8],
        object_server: Option<Arc<dyn ObjectServerDecoder>>,
    ) -> KnxResult<ClientConnection> {
        session.ensure_open().await?;
        let c = Self::new(
            SubConnectionParent::Secured(session.downgrade()),
            object_server,
        );
        session.registry().register_connect_request(c.clone());
        let request = connect_request(Hpai::TCP, Hpai::TCP, cri);
        if let Err(e) = session.send_wrapped(&request).await {
            session.registry().cancel_connect_request(&c);
            return Err(e);
        }
        c.await_connect_response().await
    }

    /// Get the communication channel assigned by the server
    pub fn channel_id(&self) -> u8 {
        self.inner.channel_id.load(Ordering::Acquire)
    }

    /// Get the current sub-connection state
    pub fn state(&self) -> SubConnectionState {
        *self.inner.state.lock()
    }

    /// Subscribe to service frames received on this sub-connection
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServiceFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().push(tx);
        rx
    }

    /// Send a service frame on this sub-connection
    ///
    /// The frame travels through the parent connection, wrapped if the
    /// parent is a secure session. `body` is the service content following
    /// the KNXnet/IP header.
    pub async fn send_frame(&self, service: ServiceType, body: &[u8]) -> KnxResult<()> {
        if self.state() == SubConnectionState::Closed {
            return Err(KnxError::ConnectionClosed(format!("{} is closed", self)));
        }
        self.send_raw(&frame(service, body)).await
    }

    /// Query the connection state of this communication channel
    ///
    /// Sends a connection state request and returns the server's status
    /// code, 0 while the channel is healthy.
    pub async fn connection_state(&self) -> KnxResult<u8> {
        if self.state() != SubConnectionState::Open {
            return Err(KnxError::ConnectionClosed(format!("{} is not open", self)));
        }
        self.send_raw(&connection_state_request(self.channel_id(), Hpai::TCP))
            .await?;
        let response = self.response_for(ServiceType::ConnectionStateResponse).await?;
        if response.body.len() < 2 {
            return Err(KnxError::FrameMalformed(
                "connection state response too short".to_string(),
            ));
        }
        Ok(response.body[1])
    }

    /// Wait up to 1 s for a response frame of the expected service type
    ///
    /// Responses arrive through a single-slot inbox; a frame of a different
    /// service type empties the slot and the wait continues.
    pub async fn response_for(&self, expected: ServiceType) -> KnxResult<ServiceFrame> {
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        loop {
            let notified = self.inner.response_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(response) = self.inner.response.lock().take() {
                if response.service == expected as u16 {
                    return Ok(response);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(KnxError::Timeout);
            }
        }
    }

    /// Close this sub-connection
    ///
    /// Sends a best-effort disconnect request for a bound channel; the
    /// registry entry is removed when the disconnect response arrives or the
    /// parent closes.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == SubConnectionState::Closed {
                return;
            }
            *state = SubConnectionState::Closed;
        }
        let channel = self.channel_id();
        if channel != 0 {
            let _ = self.send_raw(&disconnect_request(channel, Hpai::TCP)).await;
        }
        self.inner.state_changed.notify_waiters();
        self.inner.listeners.lock().clear();
    }

    async fn send_raw(&self, packet: &[u8]) -> KnxResult<()> {
        match &self.inner.parent {
            SubConnectionParent::Plain(conn) => {
                let conn = conn
                    .upgrade()
                    .ok_or_else(|| KnxError::ConnectionClosed("connection dropped".to_string()))?;
                conn.send(packet).await
            }
            SubConnectionParent::Secured(session) => {
                let session = session
                    .upgrade()
                    .map(SecureSession::from_inner)
                    .ok_or_else(|| KnxError::ConnectionClosed("session dropped".to_string()))?;
                session.send_wrapped(packet).await
            }
        }
    }

    async fn await_connect_response(&self) -> KnxResult<ClientConnection> {
        let deadline = Instant::now() + CONNECT_REQUEST_TIMEOUT;
        loop {
            let notified = self.inner.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state() {
                SubConnectionState::Open => return Ok(self.clone()),
                SubConnectionState::Closed => {
                    return Err(KnxError::ConnectionClosed(format!(
                        "connect request refused, status 0x{:02x}",
                        self.inner.connect_status.load(Ordering::Acquire)
                    )));
                }
                SubConnectionState::Pending => {}
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.cancel_pending();
                return Err(KnxError::Timeout);
            }
        }
    }

    fn cancel_pending(&self) {
        match &self.inner.parent {
            SubConnectionParent::Plain(conn) => {
                if let Some(conn) = conn.upgrade() {
                    conn.registry.cancel_connect_request(self);
                }
            }
            SubConnectionParent::Secured(session) => {
                if let Some(session) = session.upgrade() {
                    SecureSession::from_inner(session)
                        .registry()
                        .cancel_connect_request(self);
                }
            }
        }
    }

    /// Handle a service frame routed to this sub-connection
    pub(crate) async fn handle_service_type(
        &self,
        header: &KnxnetipHeader,
        body: &[u8],
    ) -> KnxResult<()> {
        let service = header.service();
        match header.service_type() {
            Some(ServiceType::ConnectResponse) => {
                let response = ConnectResponse::parse(body)?;
                {
                    let mut state = self.inner.state.lock();
                    if *state == SubConnectionState::Pending {
                        if response.status == 0 {
                            self.inner
                                .channel_id
                                .store(response.channel_id, Ordering::Release);
                            *state = SubConnectionState::Open;
                            debug!("established communication channel {}", response.channel_id);
                        } else {
                            self.inner
                                .connect_status
                                .store(response.status, Ordering::Release);
                            *state = SubConnectionState::Closed;
                        }
                    }
                }
                self.inner.state_changed.notify_waiters();
                Ok(())
            }
            Some(ServiceType::DisconnectResponse) => {
                trace!("{} disconnected", self);
                *self.inner.state.lock() = SubConnectionState::Closed;
                self.inner.state_changed.notify_waiters();
                self.inner.listeners.lock().clear();
                Ok(())
            }
            Some(ServiceType::ConnectionStateResponse)
            | Some(ServiceType::DeviceConfigurationAck) => {
                self.put_response(service, body);
                Ok(())
            }
            Some(ServiceType::DeviceConfigurationRequest) => {
                // device-management confirmations arrive as configuration
                // requests; keep the inbox and the listeners supplied
                self.put_response(service, body);
                self.deliver(service, body);
                Ok(())
            }
            Some(ServiceType::TunnelingRequest)
            | Some(ServiceType::TunnelingFeatureResponse)
            | Some(ServiceType::TunnelingFeatureInfo)
            | Some(ServiceType::SearchResponse)
            | Some(ServiceType::DescriptionResponse) => {
                self.deliver(service, body);
                Ok(())
            }
            Some(ServiceType::ObjectServerRequest) | Some(ServiceType::ObjectServerAck) => {
                match &self.inner.object_server {
                    Some(decoder) => decoder.on_frame(service, body).await,
                    None => {
                        self.deliver(service, body);
                        Ok(())
                    }
                }
            }
            _ => Err(KnxError::UnsupportedService(service)),
        }
    }

    fn put_response(&self, service: u16, body: &[u8]) {
        *self.inner.response.lock() = Some(ServiceFrame {
            service,
            body: body.to_vec(),
        });
        self.inner.response_changed.notify_waiters();
    }

    fn deliver(&self, service: u16, body: &[u8]) {
        let frame = ServiceFrame {
            service,
            body: body.to_vec(),
        };
        let mut listeners = self.inner.listeners.lock();
        listeners.retain(|tx| tx.send(frame.clone()).is_ok());
        if listeners.is_empty() {
            trace!("{} has no listeners for service 0x{:04x}", self, service);
        }
    }

    pub(crate) fn same_connection(&self, other: &ClientConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channel {} ({:?})",
            self.channel_id(),
            *self.inner.state.lock()
        )
    }
}
