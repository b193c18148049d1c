//! KNX IP secure sessions
//!
//! A secure session is an authenticated, encrypted channel multiplexed onto
//! a TCP connection. The session handshake exchanges X25519 public keys,
//! verifies the server against the device authentication code, and
//! authenticates the client user against the server; all subsequent traffic
//! travels in secure wrappers with monotonically increasing sequence numbers.

use crate::connection::ConnectionInner;
use crate::registry::ConnectionRegistry;
use crate::settings::SessionSettings;
use knx_codec::{frame, Hpai, KnxnetipHeader, ServiceType, HEADER_SIZE};
use knx_core::{KnxError, KnxResult, SerialNumber};
use knx_security::crypto::{
    self, cbc_mac, ctr_crypt, mac_equal, security_info, StaticSecret, EMPTY_USER_PASSWORD_HASH,
    KEY_SIZE, MAC_COUNTER, MAC_SIZE, PUBLIC_KEY_SIZE,
};
use knx_security::wrapper::{self, MIN_WRAPPER_LENGTH};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Session status codes
pub(crate) mod status {
    /// Authentication succeeded
    pub const AUTH_SUCCESS: u8 = 0;
    /// Authentication failed
    pub const AUTH_FAILED: u8 = 1;
    /// Error, session not authenticated
    pub const UNAUTHENTICATED: u8 = 2;
    /// Session timed out on the server
    pub const TIMEOUT: u8 = 3;
    /// Keep-alive heartbeat
    pub const KEEP_ALIVE: u8 = 4;
    /// Session close notification
    pub const CLOSE: u8 = 5;
    /// Initial setup, no status received yet
    pub const SETUP: u8 = 6;
}

fn status_message(code: u8) -> &'static str {
    match code {
        status::AUTH_SUCCESS => "authentication success",
        status::AUTH_FAILED => "authentication failed",
        status::UNAUTHENTICATED => "unauthenticated",
        status::TIMEOUT => "timeout",
        status::KEEP_ALIVE => "keep-alive",
        status::CLOSE => "close",
        status::SETUP => "setup in progress",
        _ => "unknown status",
    }
}

/// Secure session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session established
    Idle,
    /// Session key negotiated, waiting for user authentication
    Unauthenticated,
    /// Session established and authenticated
    Authenticated,
}

pub(crate) struct SessionInner {
    conn: Weak<ConnectionInner>,
    server: SocketAddr,
    user: u16,
    user_key: [u8; KEY_SIZE],
    device_auth_key: [u8; KEY_SIZE],
    serial_number: SerialNumber,
    settings: SessionSettings,

    session_id: AtomicU16,
    state: Mutex<SessionState>,
    status: AtomicU8,
    handshake: Notify,

    send_seq: AtomicU64,
    rcv_seq: AtomicU64,
    session_key: Mutex<Option<[u8; KEY_SIZE]>>,
    handshake_secret: Mutex<Option<StaticSecret>>,
    public_key: Mutex<[u8; PUBLIC_KEY_SIZE]>,

    // serializes wrap-and-write so sequence numbers leave in order
    send_lock: tokio::sync::Mutex<()>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
    registry: ConnectionRegistry,
}

/// A KNX IP secure session used over a TCP connection
#[derive(Clone)]
pub struct SecureSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl SecureSession {
    pub(crate) fn new(
        conn: &Arc<ConnectionInner>,
        user: u16,
        user_key: &[u8],
        device_auth_code: &[u8],
        settings: SessionSettings,
    ) -> KnxResult<Self> {
        if !(1..=127).contains(&user) {
            return Err(KnxError::InvalidArgument(format!(
                "user {} out of range [1..127]",
                user
            )));
        }
        let user_key = match user_key.len() {
            0 => EMPTY_USER_PASSWORD_HASH,
            KEY_SIZE => {
                let mut key = [0u8; KEY_SIZE];
                key.copy_from_slice(user_key);
                key
            }
            n => {
                return Err(KnxError::InvalidArgument(format!(
                    "user key length {} not in {{0, 16}}",
                    n
                )))
            }
        };
        let device_auth_key = match device_auth_code.len() {
            0 => [0u8; KEY_SIZE],
            KEY_SIZE => {
                let mut key = [0u8; KEY_SIZE];
                key.copy_from_slice(device_auth_code);
                key
            }
            n => {
                return Err(KnxError::InvalidArgument(format!(
                    "device authentication code length {} not in {{0, 16}}",
                    n
                )))
            }
        };

        Ok(Self {
            inner: Arc::new(SessionInner {
                conn: Arc::downgrade(conn),
                server: conn.server(),
                user,
                user_key,
                device_auth_key,
                serial_number: derive_serial_number(),
                settings,
                session_id: AtomicU16::new(0),
                state: Mutex::new(SessionState::Idle),
                status: AtomicU8::new(status::SETUP),
                handshake: Notify::new(),
                send_seq: AtomicU64::new(0),
                rcv_seq: AtomicU64::new(0),
                session_key: Mutex::new(None),
                handshake_secret: Mutex::new(None),
                public_key: Mutex::new([0u8; PUBLIC_KEY_SIZE]),
                send_lock: tokio::sync::Mutex::new(()),
                keep_alive: Mutex::new(None),
                registry: ConnectionRegistry::new(),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Get the session identifier assigned by the server
    pub fn id(&self) -> u16 {
        self.inner.session_id.load(Ordering::Acquire)
    }

    /// Get the user this session authenticates
    pub fn user(&self) -> u16 {
        self.inner.user
    }

    /// Get the client serial number used in secure wrappers
    pub fn serial_number(&self) -> SerialNumber {
        self.inner.serial_number
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Establish this session if it is not authenticated yet
    ///
    /// Idempotent: an authenticated session returns immediately. At most one
    /// session per connection can be in its handshake at a time; concurrent
    /// callers queue on the connection's session request lock.
    pub async fn ensure_open(&self) -> KnxResult<()> {
        if self.state() == SessionState::Authenticated {
            return Ok(());
        }
        self.setup().await
    }

    /// Close this session
    ///
    /// Cancels the keep-alive, closes all secured sub-connections, removes
    /// the session from its connection, and notifies the server while the
    /// socket is still open.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Idle {
                return;
            }
            *state = SessionState::Idle;
        }
        if let Some(handle) = self.inner.keep_alive.lock().take() {
            handle.abort();
        }
        self.inner.registry.close_all().await;
        self.inner.handshake.notify_waiters();

        let Some(conn) = self.inner.conn.upgrade() else {
            return;
        };
        conn.sessions.lock().remove(&self.id());
        if conn.is_closed() {
            return;
        }
        if let Err(e) = self.send_status(status::CLOSE).await {
            info!("I/O error closing secure session {}: {}", self.id(), e);
        }
    }

    fn connection(&self) -> KnxResult<Arc<ConnectionInner>> {
        self.inner
            .conn
            .upgrade()
            .ok_or_else(|| KnxError::ConnectionClosed("connection dropped".to_string()))
    }

    async fn setup(&self) -> KnxResult<()> {
        let conn = self.connection()?;
        let _request_stage = conn.session_request_lock.lock().await;
        if self.state() == SessionState::Authenticated {
            return Ok(());
        }
        *self.inner.state.lock() = SessionState::Idle;
        self.inner.status.store(status::SETUP, Ordering::Release);
        *conn.in_session_request.lock() = Some(self.clone());

        debug!("setup secure session with {}", self.inner.server);

        let (secret, public) = crypto::generate_keypair();
        *self.inner.handshake_secret.lock() = Some(secret);
        *self.inner.public_key.lock() = public;

        let result = self.handshake(&conn, &public).await;

        *conn.in_session_request.lock() = None;
        self.inner.handshake_secret.lock().take();
        *self.inner.public_key.lock() = [0u8; PUBLIC_KEY_SIZE];
        result
    }

    async fn handshake(
        &self,
        conn: &Arc<ConnectionInner>,
        public: &[u8; PUBLIC_KEY_SIZE],
    ) -> KnxResult<()> {
        conn.connect().await?;

        let mut body = Vec::with_capacity(8 + PUBLIC_KEY_SIZE);
        body.extend_from_slice(&Hpai::TCP.to_bytes());
        body.extend_from_slice(public);
        let request = frame(ServiceType::SessionRequest, &body);
        if let Err(e) = conn.send(&request).await {
            self.close().await;
            conn.close().await;
            return Err(KnxError::ConnectionClosed(format!(
                "I/O error establishing secure session with {}: {}",
                self.inner.server, e
            )));
        }

        self.await_authentication_status().await?;

        let state = self.state();
        let code = self.inner.status.load(Ordering::Acquire);
        if state == SessionState::Unauthenticated || code != status::AUTH_SUCCESS {
            *self.inner.state.lock() = SessionState::Idle;
            return Err(KnxError::AuthenticationFailed(format!(
                "secure session {}",
                status_message(code)
            )));
        }

        self.start_keep_alive();
        Ok(())
    }

    /// Wait for the handshake outcome, one setup timeout per handshake half
    ///
    /// The deadline starts when the session request is sent and is extended
    /// by a second setup timeout once the session enters the authentication
    /// stage.
    async fn await_authentication_status(&self) -> KnxResult<()> {
        let step = self.inner.settings.setup_timeout;
        let mut deadline = Instant::now() + step;
        let mut in_auth = false;
        loop {
            let notified = self.inner.handshake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state();
            if state == SessionState::Authenticated
                || self.inner.status.load(Ordering::Acquire) != status::SETUP
            {
                return Ok(());
            }
            if state == SessionState::Unauthenticated && !in_auth {
                in_auth = true;
                deadline += step;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                *self.inner.state.lock() = SessionState::Idle;
                return Err(KnxError::SessionTimeout(self.inner.server.to_string()));
            }
        }
    }

    /// Handle a secure service frame routed to this session
    pub(crate) async fn accept_service_type(
        &self,
        header: &KnxnetipHeader,
        body: &[u8],
    ) -> KnxResult<()> {
        if (header.total_length() as usize) < MIN_WRAPPER_LENGTH {
            warn!("discard secure frame with length {}", header.total_length());
            return Ok(());
        }
        match header.service_type() {
            Some(ServiceType::SessionResponse) => {
                if self.state() != SessionState::Idle {
                    warn!("received session response in state {:?} - ignore", self.state());
                    return Ok(());
                }
                if let Err(e) = self.process_session_response(header, body).await {
                    self.inner.status.store(status::AUTH_FAILED, Ordering::Release);
                    error!("negotiating session key failed: {}", e);
                }
                self.inner.handshake.notify_waiters();
                Ok(())
            }
            Some(ServiceType::SecureWrapper) => {
                let packet = match self.unwrap(header, body) {
                    Ok(packet) => packet,
                    Err(e @ KnxError::ReplayDetected { .. }) => {
                        warn!("{} on {} - closing session", e, self);
                        self.close().await;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let plain_header = KnxnetipHeader::parse(&packet)?;
                let plain_body = &packet[HEADER_SIZE..];
                if plain_header.service() == ServiceType::SessionStatus as u16 {
                    self.process_session_status(&plain_header, plain_body).await
                } else {
                    self.inner.registry.dispatch(&plain_header, plain_body).await;
                    Ok(())
                }
            }
            _ => {
                warn!(
                    "received unsupported secure service type 0x{:04x} - ignore",
                    header.service()
                );
                Ok(())
            }
        }
    }

    async fn process_session_response(
        &self,
        header: &KnxnetipHeader,
        body: &[u8],
    ) -> KnxResult<()> {
        if header.total_length() != 0x38 || body.len() < 2 + PUBLIC_KEY_SIZE + MAC_SIZE {
            return Err(KnxError::FrameMalformed(format!(
                "invalid length {} for a secure session response",
                header.total_length()
            )));
        }
        let conn = self.connection()?;

        let session_id = u16::from_be_bytes([body[0], body[1]]);
        if session_id == 0 {
            return Err(KnxError::AuthenticationFailed(
                "no more free secure sessions, or remote endpoint busy".to_string(),
            ));
        }
        let mut server_public = [0u8; PUBLIC_KEY_SIZE];
        server_public.copy_from_slice(&body[2..2 + PUBLIC_KEY_SIZE]);

        let client_public = *self.inner.public_key.lock();
        let secret = self.inner.handshake_secret.lock().take().ok_or_else(|| {
            KnxError::AuthenticationFailed("no key agreement in progress".to_string())
        })?;
        let shared_secret = crypto::key_agreement(&secret, &server_public);
        *self.inner.session_key.lock() = Some(crypto::session_key(&shared_secret));
        self.inner.session_id.store(session_id, Ordering::Release);

        conn.sessions.lock().insert(session_id, self.clone());
        *conn.in_session_request.lock() = None;

        if self.inner.device_auth_key == [0u8; KEY_SIZE] {
            warn!("skipping device authentication of {} (no device key)", self.inner.server);
        } else {
            let mut mac = [0u8; MAC_SIZE];
            mac.copy_from_slice(&body[2 + PUBLIC_KEY_SIZE..2 + PUBLIC_KEY_SIZE + MAC_SIZE]);
            ctr_crypt(
                &self.inner.device_auth_key,
                &security_info(0, SerialNumber::ZERO, 0, MAC_COUNTER),
                &mut mac,
            );

            let msg_len = (HEADER_SIZE + 2 + PUBLIC_KEY_SIZE) as u16;
            let mut input = Vec::with_capacity(16 + 2 + HEADER_SIZE + 2 + PUBLIC_KEY_SIZE);
            input.extend_from_slice(&[0u8; 16]);
            input.extend_from_slice(&msg_len.to_be_bytes());
            input.extend_from_slice(&header.to_bytes());
            input.extend_from_slice(&session_id.to_be_bytes());
            input.extend_from_slice(&crypto::xor_keys(&server_public, &client_public));
            let expected = cbc_mac(&self.inner.device_auth_key, &input);
            if !mac_equal(&mac, &expected) {
                return Err(KnxError::AuthenticationFailed(
                    "authentication failed for session response".to_string(),
                ));
            }
        }

        let auth = self.new_session_auth(&server_public, &client_public);
        *self.inner.state.lock() = SessionState::Unauthenticated;
        debug!("secure session {}, request access for user {}", session_id, self.inner.user);
        self.send_wrapped(&auth).await
    }

    async fn process_session_status(
        &self,
        header: &KnxnetipHeader,
        body: &[u8],
    ) -> KnxResult<()> {
        if header.total_length() != 8 || body.is_empty() {
            return Err(KnxError::FrameMalformed(format!(
                "invalid length {} for a session status",
                header.total_length()
            )));
        }
        let code = body[0];
        self.inner.status.store(code, Ordering::Release);

        if self.state() == SessionState::Unauthenticated {
            if code == status::AUTH_SUCCESS {
                *self.inner.state.lock() = SessionState::Authenticated;
                debug!("{} {}", status_message(code), self);
            } else {
                error!("{} {}", status_message(code), self);
            }
            self.inner.handshake.notify_waiters();
        } else if code == status::TIMEOUT || code == status::UNAUTHENTICATED {
            error!("{} {}", status_message(code), self);
            self.close().await;
        }
        Ok(())
    }

    fn new_session_auth(
        &self,
        server_public: &[u8; PUBLIC_KEY_SIZE],
        client_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Vec<u8> {
        let header = KnxnetipHeader::new(ServiceType::SessionAuth, 2 + MAC_SIZE);
        let mut packet = Vec::with_capacity(header.total_length() as usize);
        packet.extend_from_slice(&header.to_bytes());
        packet.extend_from_slice(&self.inner.user.to_be_bytes());

        let msg_len = (HEADER_SIZE + 2 + PUBLIC_KEY_SIZE) as u16;
        let mut input = Vec::with_capacity(16 + 2 + HEADER_SIZE + 2 + PUBLIC_KEY_SIZE);
        input.extend_from_slice(&[0u8; 16]);
        input.extend_from_slice(&msg_len.to_be_bytes());
        input.extend_from_slice(&packet);
        input.extend_from_slice(&crypto::xor_keys(server_public, client_public));
        let mut mac = cbc_mac(&self.inner.user_key, &input);
        ctr_crypt(
            &self.inner.user_key,
            &security_info(0, SerialNumber::ZERO, 0, MAC_COUNTER),
            &mut mac,
        );
        packet.extend_from_slice(&mac);
        packet
    }

    /// Wrap a plain KNXnet/IP frame and send it on the connection
    ///
    /// Wrap and write happen under the session send lock, so frames reach
    /// the wire in sequence-number order.
    pub(crate) async fn send_wrapped(&self, plain_frame: &[u8]) -> KnxResult<()> {
        let conn = self.connection()?;
        let _ordered = self.inner.send_lock.lock().await;
        let key = self.session_key()?;
        let seq = self.inner.send_seq.fetch_add(1, Ordering::SeqCst);
        let packet = wrapper::wrap(
            plain_frame,
            self.id(),
            seq,
            self.inner.serial_number,
            0,
            &key,
        );
        conn.send(&packet).await
    }

    async fn send_status(&self, code: u8) -> KnxResult<()> {
        self.send_wrapped(&frame(ServiceType::SessionStatus, &[code, 0])).await
    }

    fn session_key(&self) -> KnxResult<[u8; KEY_SIZE]> {
        (*self.inner.session_key.lock())
            .ok_or_else(|| KnxError::AuthenticationFailed("no session key bound".to_string()))
    }

    fn unwrap(&self, header: &KnxnetipHeader, body: &[u8]) -> KnxResult<Vec<u8>> {
        let key = self.session_key()?;
        let packet = wrapper::unwrap(header, body, &key)?;

        let session_id = self.id();
        if packet.session_id != session_id {
            return Err(KnxError::SessionMismatch {
                received: packet.session_id,
                expected: session_id,
            });
        }
        let expected = self.inner.rcv_seq.load(Ordering::Acquire);
        if packet.seq < expected {
            return Err(KnxError::ReplayDetected {
                received: packet.seq,
                expected,
            });
        }
        self.inner.rcv_seq.store(packet.seq + 1, Ordering::Release);
        if packet.tag != 0 {
            return Err(KnxError::FrameMalformed(format!(
                "expected message tag 0, received {}",
                packet.tag
            )));
        }
        trace!("received (seq {} S/N {})", packet.seq, packet.serial_number);
        Ok(packet.frame)
    }

    fn start_keep_alive(&self) {
        let weak = self.downgrade();
        let interval = self.inner.settings.keep_alive_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let session = SecureSession::from_inner(inner);
                if session.state() != SessionState::Authenticated {
                    return;
                }
                trace!("sending keep-alive");
                if let Err(e) = session.send_status(status::KEEP_ALIVE).await {
                    let socket_open = session
                        .inner
                        .conn
                        .upgrade()
                        .map(|c| !c.is_closed())
                        .unwrap_or(false);
                    if session.state() == SessionState::Authenticated && socket_open {
                        warn!("error sending keep-alive: {}", e);
                        session.close().await;
                        if let Some(conn) = session.inner.conn.upgrade() {
                            conn.close().await;
                        }
                    }
                    return;
                }
            }
        });
        *self.inner.keep_alive.lock() = Some(handle);
    }
}

impl fmt::Display for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "secure session {} (user {}): {:?}",
            self.id(),
            self.inner.user,
            self.state()
        )
    }
}

fn derive_serial_number() -> SerialNumber {
    match mac_address::get_mac_address() {
        Ok(Some(mac)) => SerialNumber::from_bytes(mac.bytes()),
        _ => SerialNumber::ZERO,
    }
}
