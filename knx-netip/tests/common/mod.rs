//! Scripted KNXnet/IP server helpers for transport tests
#![allow(dead_code)]

use knx_codec::{frame, KnxnetipHeader, ServiceType, HEADER_SIZE};
use knx_core::SerialNumber;
use knx_security::crypto::{
    cbc_mac, ctr_crypt, generate_keypair, key_agreement, mac_equal, security_info, session_key,
    xor_keys, MAC_COUNTER,
};
use knx_security::wrapper;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Server side of an established secure session
pub struct ServerSession {
    pub key: [u8; 16],
    pub session_id: u16,
    pub send_seq: u64,
    pub rcv_seq: u64,
}

/// Read one KNXnet/IP frame from the stream
pub async fn read_frame(stream: &mut TcpStream) -> (KnxnetipHeader, Vec<u8>) {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes).await.unwrap();
    let header = KnxnetipHeader::parse(&header_bytes).unwrap();
    let mut body = vec![0u8; header.body_length()];
    stream.read_exact(&mut body).await.unwrap();
    (header, body)
}

/// Read one secure wrapper from the stream and return the decrypted frame
///
/// Asserts that the client's sequence numbers arrive strictly increasing.
pub async fn read_wrapped(stream: &mut TcpStream, session: &mut ServerSession) -> Vec<u8> {
    let (header, body) = read_frame(stream).await;
    assert_eq!(header.service(), ServiceType::SecureWrapper as u16);
    let packet = wrapper::unwrap(&header, &body, &session.key).unwrap();
    assert_eq!(packet.session_id, session.session_id);
    assert!(
        packet.seq >= session.rcv_seq,
        "client sequence {} below expected {}",
        packet.seq,
        session.rcv_seq
    );
    session.rcv_seq = packet.seq + 1;
    packet.frame
}

/// Wrap a plain frame with the server's next sequence number and send it
pub async fn send_wrapped(stream: &mut TcpStream, session: &mut ServerSession, plain: &[u8]) {
    let packet = wrapper::wrap(
        plain,
        session.session_id,
        session.send_seq,
        SerialNumber::ZERO,
        0,
        &session.key,
    );
    session.send_seq += 1;
    stream.write_all(&packet).await.unwrap();
}

/// Drive the server side of the secure session handshake
///
/// Answers the session request with `session_id`, verifies the client's
/// session auth MAC, and finishes with the given session status code.
pub async fn server_handshake(
    stream: &mut TcpStream,
    session_id: u16,
    user: u16,
    user_key: &[u8; 16],
    device_auth_key: &[u8; 16],
    final_status: u8,
) -> ServerSession {
    // session request carries HPAI (8 bytes) and the client public key
    let (header, body) = read_frame(stream).await;
    assert_eq!(header.service(), ServiceType::SessionRequest as u16);
    assert_eq!(body.len(), 8 + 32);
    let mut client_public = [0u8; 32];
    client_public.copy_from_slice(&body[8..40]);

    let (server_secret, server_public) = generate_keypair();
    let key = session_key(&key_agreement(&server_secret, &client_public));

    // session response: header | session id | server public key | MAC
    let response_header = KnxnetipHeader::new(ServiceType::SessionResponse, 2 + 32 + 16);
    let msg_len = (HEADER_SIZE + 2 + 32) as u16;
    let mut mac_input = Vec::new();
    mac_input.extend_from_slice(&[0u8; 16]);
    mac_input.extend_from_slice(&msg_len.to_be_bytes());
    mac_input.extend_from_slice(&response_header.to_bytes());
    mac_input.extend_from_slice(&session_id.to_be_bytes());
    mac_input.extend_from_slice(&xor_keys(&server_public, &client_public));
    let mut mac = cbc_mac(device_auth_key, &mac_input);
    ctr_crypt(
        device_auth_key,
        &security_info(0, SerialNumber::ZERO, 0, MAC_COUNTER),
        &mut mac,
    );

    let mut response = Vec::new();
    response.extend_from_slice(&response_header.to_bytes());
    response.extend_from_slice(&session_id.to_be_bytes());
    response.extend_from_slice(&server_public);
    response.extend_from_slice(&mac);
    stream.write_all(&response).await.unwrap();

    let mut session = ServerSession {
        key,
        session_id,
        send_seq: 0,
        rcv_seq: 0,
    };

    // session auth arrives wrapped; verify the user MAC
    let auth = read_wrapped(stream, &mut session).await;
    let auth_header = KnxnetipHeader::parse(&auth).unwrap();
    assert_eq!(auth_header.service(), ServiceType::SessionAuth as u16);
    assert_eq!(u16::from_be_bytes([auth[6], auth[7]]), user);

    let mut auth_input = Vec::new();
    auth_input.extend_from_slice(&[0u8; 16]);
    auth_input.extend_from_slice(&msg_len.to_be_bytes());
    auth_input.extend_from_slice(&auth[..8]);
    auth_input.extend_from_slice(&xor_keys(&server_public, &client_public));
    let expected = cbc_mac(user_key, &auth_input);
    let mut received = [0u8; 16];
    received.copy_from_slice(&auth[8..24]);
    ctr_crypt(
        user_key,
        &security_info(0, SerialNumber::ZERO, 0, MAC_COUNTER),
        &mut received,
    );
    assert!(mac_equal(&received, &expected), "session auth MAC mismatch");

    let status = frame(ServiceType::SessionStatus, &[final_status, 0]);
    send_wrapped(stream, &mut session, &status).await;
    session
}
