//! TCP connection management for KNXnet/IP servers
//!
//! A `TcpConnection` owns one socket to one server and multiplexes secure
//! sessions and plain sub-connections onto it. A single receive task frames
//! the byte stream and dispatches each frame either to a secure session (by
//! the session id leading the wrapper body) or to a sub-connection (by
//! communication channel).

use crate::registry::ConnectionRegistry;
use crate::session::SecureSession;
use crate::settings::{SessionSettings, TcpSettings};
use knx_codec::{KnxnetipHeader, ServiceType, HEADER_SIZE};
use knx_core::{KnxError, KnxResult};
use log::{error, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;

/// Receive buffer size; larger frames are skipped
const RCV_BUFFER_SIZE: usize = 512;

pub(crate) struct ConnectionInner {
    settings: TcpSettings,
    local: Mutex<Option<SocketAddr>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    closed: AtomicBool,
    connect_guard: tokio::sync::Mutex<()>,
    receiver: Mutex<Option<JoinHandle<()>>>,

    // session id -> secure session
    pub(crate) sessions: Mutex<HashMap<u16, SecureSession>>,
    // communication channel -> plain sub-connection, and pending connects
    pub(crate) registry: ConnectionRegistry,

    // serializes secure session setups on this connection
    pub(crate) session_request_lock: tokio::sync::Mutex<()>,
    // the session currently awaiting its session response
    pub(crate) in_session_request: Mutex<Option<SecureSession>>,
}

/// Connection management for TCP connections to KNXnet/IP servers, and for
/// KNX IP secure sessions
#[derive(Clone)]
pub struct TcpConnection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl TcpConnection {
    /// Create a new TCP connection to a KNXnet/IP server
    ///
    /// The socket connects lazily, on the first operation that needs it.
    pub fn new(server: SocketAddr) -> Self {
        Self::with_settings(TcpSettings::new(server))
    }

    /// Create a new TCP connection with explicit settings
    pub fn with_settings(settings: TcpSettings) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                settings,
                local: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                connect_guard: tokio::sync::Mutex::new(()),
                receiver: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                registry: ConnectionRegistry::new(),
                session_request_lock: tokio::sync::Mutex::new(()),
                in_session_request: Mutex::new(None),
            }),
        }
    }

    /// Get the remote server endpoint
    pub fn server(&self) -> SocketAddr {
        self.inner.settings.server
    }

    /// Get the bound local endpoint, available once connected
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        *self.inner.local.lock()
    }

    /// Check whether the underlying socket is connected
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire) && !self.inner.closed.load(Ordering::Acquire)
    }

    /// Create a new secure session for this TCP connection
    ///
    /// `user` is the user to authenticate, in range [1..127]. `user_key` is
    /// the 16-byte user key, or empty to use the hash of the empty password.
    /// `device_auth_code` is the 16-byte device authentication code; an
    /// empty code skips device authentication.
    pub fn new_secure_session(
        &self,
        user: u16,
        user_key: &[u8],
        device_auth_code: &[u8],
    ) -> KnxResult<SecureSession> {
        self.new_secure_session_with_settings(
            user,
            user_key,
            device_auth_code,
            SessionSettings::default(),
        )
    }

    /// Create a new secure session with explicit session settings
    pub fn new_secure_session_with_settings(
        &self,
        user: u16,
        user_key: &[u8],
        device_auth_code: &[u8],
        settings: SessionSettings,
    ) -> KnxResult<SecureSession> {
        SecureSession::new(&self.inner, user, user_key, device_auth_code, settings)
    }

    /// Connect the underlying socket
    ///
    /// Idempotent; concurrent callers are serialized and only the first one
    /// performs the actual connect, with a 5 s default timeout.
    pub async fn connect(&self) -> KnxResult<()> {
        self.inner.connect().await
    }

    /// Close this connection and all its sub-connections and secure sessions
    ///
    /// Idempotent; the connection is not reusable afterwards.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl fmt::Display for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.inner.closed.load(Ordering::Acquire) {
            "closed"
        } else if self.is_connected() {
            "connected"
        } else {
            "unconnected"
        };
        match self.local_endpoint() {
            Some(local) => write!(f, "{}<=>{} ({})", local, self.server(), state),
            None => write!(f, "{} ({})", self.server(), state),
        }
    }
}

impl ConnectionInner {
    pub(crate) fn server(&self) -> SocketAddr {
        self.settings.server
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write a complete frame to the socket and flush
    pub(crate) async fn send(&self, data: &[u8]) -> KnxResult<()> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| {
            KnxError::ConnectionClosed(format!("not connected to {}", self.settings.server))
        })?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    pub(crate) async fn connect(self: &Arc<Self>) -> KnxResult<()> {
        if self.is_closed() {
            return Err(KnxError::ConnectionClosed(format!(
                "connection to {} is closed",
                self.settings.server
            )));
        }
        let _guard = self.connect_guard.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let server = self.settings.server;
        let connecting = async {
            match self.settings.local {
                Some(local) => {
                    let socket = if server.is_ipv4() {
                        TcpSocket::new_v4()?
                    } else {
                        TcpSocket::new_v6()?
                    };
                    socket.bind(local)?;
                    socket.connect(server).await
                }
                None => TcpStream::connect(server).await,
            }
        };
        let stream = tokio::time::timeout(self.settings.connect_timeout, connecting)
            .await
            .map_err(|_| {
                KnxError::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", server),
                ))
            })??;

        *self.local.lock() = Some(stream.local_addr()?);
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::Release);

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            inner.receive_loop(read_half).await;
        });
        *self.receiver.lock() = Some(handle);
        Ok(())
    }

    pub(crate) async fn close(self: &Arc<Self>) {
        self.shutdown(true).await;
    }

    async fn shutdown(self: &Arc<Self>, abort_receiver: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.close_all().await;

        let sessions: Vec<SecureSession> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            session.close().await;
        }
        self.sessions.lock().clear();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let receiver = self.receiver.lock().take();
        if let Some(handle) = receiver {
            if abort_receiver {
                handle.abort();
            }
        }
    }

    /// Receive loop: frame the byte stream and dispatch each frame
    ///
    /// Frames accumulate in a fixed buffer; a complete frame is sliced out
    /// and the remainder compacted to the front. Frames larger than the
    /// buffer are skipped. A malformed header drops the buffer content and
    /// the loop continues.
    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut data = [0u8; RCV_BUFFER_SIZE];
        let mut offset = 0usize;

        'receive: loop {
            if self.is_closed() {
                break;
            }
            if offset >= HEADER_SIZE {
                match KnxnetipHeader::parse(&data[..offset]) {
                    Ok(header) => {
                        let total = header.total_length() as usize;
                        if total <= offset {
                            let body = data[HEADER_SIZE..total].to_vec();
                            let leftover = offset - total;
                            data.copy_within(total..offset, 0);
                            offset = leftover;
                            self.dispatch(&header, &body).await;
                            continue;
                        }
                        if total > RCV_BUFFER_SIZE {
                            // skip bodies which do not fit into the buffer
                            let mut skip = total - offset;
                            let mut sink = [0u8; 64];
                            while skip > 0 {
                                let want = skip.min(sink.len());
                                match reader.read(&mut sink[..want]).await {
                                    Ok(0) | Err(_) => break 'receive,
                                    Ok(n) => skip -= n,
                                }
                            }
                            offset = 0;
                        }
                    }
                    Err(e) => {
                        warn!("received invalid frame: {}", e);
                        offset = 0;
                    }
                }
            }
            match reader.read(&mut data[offset..]).await {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(e) => {
                    if !self.is_closed() {
                        error!("receiver communication failure: {}", e);
                    }
                    break;
                }
            }
        }
        self.shutdown(false).await;
    }

    async fn dispatch(self: &Arc<Self>, header: &KnxnetipHeader, body: &[u8]) {
        if header.is_secure() {
            if let Err(e) = self.dispatch_to_session(header, body).await {
                warn!("received invalid secure frame: {}", e);
            }
        } else {
            self.registry.dispatch(header, body).await;
        }
    }

    async fn dispatch_to_session(
        self: &Arc<Self>,
        header: &KnxnetipHeader,
        body: &[u8],
    ) -> KnxResult<()> {
        if body.len() < 2 {
            return Err(KnxError::FrameMalformed(
                "secure frame without session id".to_string(),
            ));
        }
        let session_id = u16::from_be_bytes([body[0], body[1]]);
        let session = self.sessions.lock().get(&session_id).cloned();
        // a session response may arrive before the id binding exists, and
        // carries id 0 when the server is out of sessions; both cases belong
        // to the session in its request stage
        let session = session.or_else(|| {
            if header.service() == ServiceType::SessionResponse as u16 {
                self.in_session_request.lock().clone()
            } else {
                None
            }
        });

        match session {
            Some(session) => session.accept_service_type(header, body).await,
            None if session_id == 0 => Err(KnxError::AuthenticationFailed(
                "no more free secure sessions, or remote endpoint busy".to_string(),
            )),
            None => {
                warn!("session {} does not exist", session_id);
                Ok(())
            }
        }
    }
}
