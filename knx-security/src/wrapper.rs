//! Secure wrapper packets
//!
//! A secure wrapper carries an encrypted, authenticated KNXnet/IP frame
//! inside a session. Wire layout:
//!
//! ```text
//! header(6) | session id(2) | seq(6) | serial(6) | tag(2) | ciphertext(n) | MAC(16)
//! ```

use crate::crypto::{
    cbc_mac, ctr_crypt, mac_equal, security_info, KEY_SIZE, MAC_COUNTER, MAC_SIZE,
};
use knx_codec::{KnxnetipHeader, ServiceType, HEADER_SIZE};
use knx_core::{KnxError, KnxResult, SerialNumber};

/// Minimum total length of a secure wrapper frame
///
/// 6-byte header, 16-byte security information, 6-byte encapsulated header,
/// 16-byte MAC.
pub const MIN_WRAPPER_LENGTH: usize = 44;

/// Largest sequence number representable in the 6-byte wire field
pub const MAX_SEQ: u64 = 0xffff_ffff_ffff;

/// Decoded secure wrapper contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurePacket {
    /// Secure session the packet belongs to
    pub session_id: u16,
    /// Sender's sequence number
    pub seq: u64,
    /// Sender's serial number
    pub serial_number: SerialNumber,
    /// Message tag
    pub tag: u16,
    /// Decrypted encapsulated KNXnet/IP frame
    pub frame: Vec<u8>,
}

/// Encrypt and authenticate a KNXnet/IP frame into a secure wrapper
pub fn wrap(
    plain_frame: &[u8],
    session_id: u16,
    seq: u64,
    serial_number: SerialNumber,
    tag: u16,
    key: &[u8; KEY_SIZE],
) -> Vec<u8> {
    debug_assert!(seq <= MAX_SEQ);
    let n = plain_frame.len();
    let header = KnxnetipHeader::new(ServiceType::SecureWrapper, 2 + 6 + 6 + 2 + n + MAC_SIZE);
    let msg_len = (HEADER_SIZE + n) as u16;

    let mac = wrapper_mac(&header, session_id, plain_frame, msg_len, key);

    let mut ciphertext = plain_frame.to_vec();
    ctr_crypt(key, &security_info(seq, serial_number, tag, msg_len), &mut ciphertext);
    let mut mac_ct = mac;
    ctr_crypt(
        key,
        &security_info(seq, serial_number, tag, MAC_COUNTER),
        &mut mac_ct,
    );

    let mut packet = Vec::with_capacity(header.total_length() as usize);
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(&session_id.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes()[2..]);
    packet.extend_from_slice(serial_number.as_bytes());
    packet.extend_from_slice(&tag.to_be_bytes());
    packet.extend_from_slice(&ciphertext);
    packet.extend_from_slice(&mac_ct);
    packet
}

/// Decrypt and verify a secure wrapper body
///
/// `body` is the frame content following the 6-byte header. Returns the
/// decoded fields and the decrypted encapsulated frame, or
/// `AuthenticationFailed` if the MAC does not verify.
pub fn unwrap(
    header: &KnxnetipHeader,
    body: &[u8],
    key: &[u8; KEY_SIZE],
) -> KnxResult<SecurePacket> {
    if header.service() != ServiceType::SecureWrapper as u16 {
        return Err(KnxError::UnsupportedService(header.service()));
    }
    let total = header.total_length() as usize;
    if total < MIN_WRAPPER_LENGTH || body.len() < total - HEADER_SIZE {
        return Err(KnxError::FrameMalformed(format!(
            "invalid secure wrapper length {}",
            total
        )));
    }

    let session_id = u16::from_be_bytes([body[0], body[1]]);
    let mut seq_bytes = [0u8; 8];
    seq_bytes[2..].copy_from_slice(&body[2..8]);
    let seq = u64::from_be_bytes(seq_bytes);
    let mut sno = [0u8; 6];
    sno.copy_from_slice(&body[8..14]);
    let serial_number = SerialNumber::from_bytes(sno);
    let tag = u16::from_be_bytes([body[14], body[15]]);

    let n = total - MIN_WRAPPER_LENGTH + HEADER_SIZE;
    let msg_len = (HEADER_SIZE + n) as u16;

    let mut mac = [0u8; MAC_SIZE];
    mac.copy_from_slice(&body[16 + n..16 + n + MAC_SIZE]);
    ctr_crypt(
        key,
        &security_info(seq, serial_number, tag, MAC_COUNTER),
        &mut mac,
    );

    let mut frame = body[16..16 + n].to_vec();
    ctr_crypt(key, &security_info(seq, serial_number, tag, msg_len), &mut frame);

    let expected = wrapper_mac(header, session_id, &frame, msg_len, key);
    if !mac_equal(&mac, &expected) {
        return Err(KnxError::AuthenticationFailed(
            "secure wrapper MAC mismatch".to_string(),
        ));
    }

    Ok(SecurePacket {
        session_id,
        seq,
        serial_number,
        tag,
        frame,
    })
}

fn wrapper_mac(
    header: &KnxnetipHeader,
    session_id: u16,
    plain_frame: &[u8],
    msg_len: u16,
    key: &[u8; KEY_SIZE],
) -> [u8; MAC_SIZE] {
    let mut input = Vec::with_capacity(16 + 2 + HEADER_SIZE + 2 + plain_frame.len());
    input.extend_from_slice(&[0u8; 16]);
    input.extend_from_slice(&msg_len.to_be_bytes());
    input.extend_from_slice(&header.to_bytes());
    input.extend_from_slice(&session_id.to_be_bytes());
    input.extend_from_slice(plain_frame);
    cbc_mac(key, &input)
}
