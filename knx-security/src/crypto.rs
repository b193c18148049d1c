//! Cryptographic primitives for KNX IP secure
//!
//! KNX IP secure combines X25519 key agreement with an AES-128 CCM-style
//! construction: CBC-MAC for authentication and CTR mode for confidentiality,
//! both keyed with the 16-byte session key and driven by a 16-byte
//! security-info block.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use knx_core::SerialNumber;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
pub use x25519_dalek::{PublicKey, StaticSecret};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// AES key length
pub const KEY_SIZE: usize = 16;

/// X25519 public key length
pub const PUBLIC_KEY_SIZE: usize = 32;

/// CBC-MAC length
pub const MAC_SIZE: usize = 16;

/// Counter field value selecting the MAC keystream block
pub const MAC_COUNTER: u16 = 0xff00;

/// Hash of the empty user password, used when no user key is supplied
pub const EMPTY_USER_PASSWORD_HASH: [u8; KEY_SIZE] = [
    0xe9, 0xc3, 0x04, 0xb9, 0x14, 0xa3, 0x51, 0x75, 0xfd, 0x7d, 0x1c, 0x67, 0x3a, 0xb5, 0x2f,
    0xe1,
];

/// Generate an X25519 keypair
///
/// The returned public key bytes are in the little-endian wire order the
/// session handshake transmits.
pub fn generate_keypair() -> (StaticSecret, [u8; PUBLIC_KEY_SIZE]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, *public.as_bytes())
}

/// Compute the X25519 shared secret with a peer's public key
pub fn key_agreement(secret: &StaticSecret, peer_public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
    let peer = PublicKey::from(*peer_public);
    *secret.diffie_hellman(&peer).as_bytes()
}

/// Derive the 16-byte session key from a shared secret
///
/// The session key is the first half of SHA-256 over the shared secret.
pub fn session_key(shared_secret: &[u8]) -> [u8; KEY_SIZE] {
    let digest = Sha256::digest(shared_secret);
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    key
}

/// Build the 16-byte security-info block used as CTR counter and MAC prefix
///
/// Layout: 6-byte sequence number (big-endian), 6-byte serial number,
/// 2-byte message tag, 2-byte counter field.
pub fn security_info(seq: u64, sno: SerialNumber, tag: u16, counter: u16) -> [u8; 16] {
    let mut info = [0u8; 16];
    info[..6].copy_from_slice(&seq.to_be_bytes()[2..]);
    info[6..12].copy_from_slice(sno.as_bytes());
    info[12..14].copy_from_slice(&tag.to_be_bytes());
    info[14..16].copy_from_slice(&counter.to_be_bytes());
    info
}

/// Compute the CBC-MAC of `data`
///
/// AES-128 in CBC mode with a zero IV over the input zero-padded to a
/// 16-byte multiple; the MAC is the last ciphertext block.
pub fn cbc_mac(key: &[u8; KEY_SIZE], data: &[u8]) -> [u8; MAC_SIZE] {
    let cipher = Aes128::new(key.into());
    let mut block = [0u8; 16];
    for chunk in data.chunks(16) {
        for (b, d) in block.iter_mut().zip(chunk.iter()) {
            *b ^= d;
        }
        cipher.encrypt_block((&mut block).into());
    }
    block
}

/// Apply the AES-128 CTR keystream to `data` in place
///
/// CTR encryption and decryption are the same operation.
pub fn ctr_crypt(key: &[u8; KEY_SIZE], info: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), info.into());
    cipher.apply_keystream(data);
}

/// XOR two public keys
pub fn xor_keys(
    a: &[u8; PUBLIC_KEY_SIZE],
    b: &[u8; PUBLIC_KEY_SIZE],
) -> [u8; PUBLIC_KEY_SIZE] {
    let mut out = [0u8; PUBLIC_KEY_SIZE];
    for i in 0..PUBLIC_KEY_SIZE {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compare two MACs in constant time
pub fn mac_equal(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
