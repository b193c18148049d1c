//! Security layer for the KNXnet/IP protocol
//!
//! This crate provides the KNX IP secure primitives (key agreement,
//! CBC-MAC, CTR encryption), the secure wrapper packet, the keyring
//! interface, and the keystore for secure process communication.

pub mod crypto;
pub mod keyring;
pub mod security;
pub mod wrapper;

pub use keyring::{Keyring, KeyringDevice, KeyringInterface, SealedKey};
pub use security::Security;
pub use wrapper::{unwrap, wrap, SecurePacket, MAX_SEQ, MIN_WRAPPER_LENGTH};
