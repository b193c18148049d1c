//! Secure session lifecycle tests against a scripted server

mod common;

use common::{read_frame, read_wrapped, send_wrapped, server_handshake};
use knx_codec::{frame, KnxnetipHeader, ServiceType, HEADER_SIZE};
use knx_core::KnxError;
use knx_netip::{SessionSettings, SessionState, TcpConnection};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

const USER: u16 = 2;
const USER_KEY: [u8; 16] = [0x01; 16];
const DEVICE_AUTH: [u8; 16] = [0x02; 16];

async fn listen() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn wait_for_state(
    session: &knx_netip::SecureSession,
    state: SessionState,
) {
    for _ in 0..100 {
        if session.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session did not reach {:?}, still {:?}", state, session.state());
}

#[tokio::test]
async fn handshake_happy_path() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        server_handshake(&mut stream, 0x1234, USER, &USER_KEY, &DEVICE_AUTH, 0).await
    });

    let connection = TcpConnection::new(addr);
    let session = connection
        .new_secure_session(USER, &USER_KEY, &DEVICE_AUTH)
        .unwrap();
    session.ensure_open().await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.id(), 0x1234);

    // idempotent: a second call does not run another handshake
    session.ensure_open().await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);

    server.await.unwrap();
    connection.close().await;
}

#[tokio::test]
async fn handshake_without_device_auth() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // an all-zero device key makes the client skip response verification
        server_handshake(&mut stream, 1, USER, &USER_KEY, &[0u8; 16], 0).await
    });

    let connection = TcpConnection::new(addr);
    let session = connection.new_secure_session(USER, &USER_KEY, &[]).unwrap();
    session.ensure_open().await.unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    server.await.unwrap();
    connection.close().await;
}

#[tokio::test]
async fn server_rejects_authentication() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        server_handshake(&mut stream, 5, USER, &USER_KEY, &DEVICE_AUTH, 1).await;
    });

    let connection = TcpConnection::new(addr);
    let session = connection
        .new_secure_session(USER, &USER_KEY, &DEVICE_AUTH)
        .unwrap();
    let result = session.ensure_open().await;
    assert!(matches!(result, Err(KnxError::AuthenticationFailed(_))));
    assert_eq!(session.state(), SessionState::Idle);
    server.await.unwrap();
}

#[tokio::test]
async fn server_out_of_sessions() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (_, body) = read_frame(&mut stream).await;
        let mut client_public = [0u8; 32];
        client_public.copy_from_slice(&body[8..40]);

        // session id 0: no more free sessions
        let header = KnxnetipHeader::new(ServiceType::SessionResponse, 2 + 32 + 16);
        let mut response = Vec::new();
        response.extend_from_slice(&header.to_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&client_public);
        response.extend_from_slice(&[0u8; 16]);
        stream.write_all(&response).await.unwrap();
    });

    let connection = TcpConnection::new(addr);
    let session = connection
        .new_secure_session(USER, &USER_KEY, &DEVICE_AUTH)
        .unwrap();
    let result = session.ensure_open().await;
    assert!(matches!(result, Err(KnxError::AuthenticationFailed(_))));
    server.await.unwrap();
}

#[tokio::test]
async fn handshake_timeout() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // swallow the session request and never answer
        let _ = read_frame(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let connection = TcpConnection::new(addr);
    let settings = SessionSettings {
        setup_timeout: Duration::from_millis(200),
        ..SessionSettings::default()
    };
    let session = connection
        .new_secure_session_with_settings(USER, &USER_KEY, &DEVICE_AUTH, settings)
        .unwrap();
    let result = session.ensure_open().await;
    assert!(matches!(result, Err(KnxError::SessionTimeout(_))));
    assert_eq!(session.state(), SessionState::Idle);
    server.abort();
}

#[tokio::test]
async fn replayed_sequence_closes_session() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut session = server_handshake(&mut stream, 0x0042, USER, &USER_KEY, &DEVICE_AUTH, 0).await;

        // send the same wrapped frame twice: identical sequence numbers
        let plain = frame(ServiceType::TunnelingRequest, &[0x04, 0x09, 0x00, 0x00]);
        send_wrapped(&mut stream, &mut session, &plain).await;
        session.send_seq -= 1;
        send_wrapped(&mut stream, &mut session, &plain).await;
    });

    let connection = TcpConnection::new(addr);
    let session = connection
        .new_secure_session(USER, &USER_KEY, &DEVICE_AUTH)
        .unwrap();
    session.ensure_open().await.unwrap();
    server.await.unwrap();

    // the replayed frame closes the session
    wait_for_state(&session, SessionState::Idle).await;
}

#[tokio::test]
async fn keep_alive_is_scheduled() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut session = server_handshake(&mut stream, 7, USER, &USER_KEY, &DEVICE_AUTH, 0).await;
        // next wrapped frame must be the keep-alive status
        let keep_alive = read_wrapped(&mut stream, &mut session).await;
        let header = KnxnetipHeader::parse(&keep_alive).unwrap();
        assert_eq!(header.service(), ServiceType::SessionStatus as u16);
        assert_eq!(keep_alive[HEADER_SIZE], 4);
    });

    let connection = TcpConnection::new(addr);
    let settings = SessionSettings {
        keep_alive_interval: Duration::from_millis(100),
        ..SessionSettings::default()
    };
    let session = connection
        .new_secure_session_with_settings(USER, &USER_KEY, &DEVICE_AUTH, settings)
        .unwrap();
    session.ensure_open().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("no keep-alive within interval")
        .unwrap();
    connection.close().await;
}

#[test]
fn session_construction_rejects_bad_arguments() {
    let connection = TcpConnection::new("127.0.0.1:3671".parse().unwrap());
    assert!(matches!(
        connection.new_secure_session(0, &USER_KEY, &DEVICE_AUTH),
        Err(KnxError::InvalidArgument(_))
    ));
    assert!(matches!(
        connection.new_secure_session(128, &USER_KEY, &DEVICE_AUTH),
        Err(KnxError::InvalidArgument(_))
    ));
    assert!(matches!(
        connection.new_secure_session(USER, &[0x01; 15], &DEVICE_AUTH),
        Err(KnxError::InvalidArgument(_))
    ));
    assert!(matches!(
        connection.new_secure_session(USER, &USER_KEY, &[0x02; 5]),
        Err(KnxError::InvalidArgument(_))
    ));
    // empty user key and device auth code are valid
    assert!(connection.new_secure_session(127, &[], &[]).is_ok());
}
