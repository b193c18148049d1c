//! Keyring interface consumed by the keystore
//!
//! Keyring parsing and signature verification live outside this crate; the
//! keystore only consumes the keyed artifact through this trait.

use knx_core::{GroupAddress, IndividualAddress, KnxResult};
use std::collections::{HashMap, HashSet};

/// A password-encrypted key as stored in a keyring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedKey(pub Vec<u8>);

/// Device entry of a keyring
#[derive(Debug, Clone, Default)]
pub struct KeyringDevice {
    tool_key: Option<SealedKey>,
}

impl KeyringDevice {
    /// Create a device entry with an optional encrypted tool key
    pub fn new(tool_key: Option<SealedKey>) -> Self {
        Self { tool_key }
    }

    /// Get the device's encrypted tool key, if any
    pub fn tool_key(&self) -> Option<&SealedKey> {
        self.tool_key.as_ref()
    }
}

/// Interface entry of a keyring
#[derive(Debug, Clone)]
pub struct KeyringInterface {
    address: IndividualAddress,
    groups: HashMap<GroupAddress, HashSet<IndividualAddress>>,
}

impl KeyringInterface {
    /// Create an interface entry with its declared group senders
    pub fn new(
        address: IndividualAddress,
        groups: HashMap<GroupAddress, HashSet<IndividualAddress>>,
    ) -> Self {
        Self { address, groups }
    }

    /// Get the interface's individual address
    pub fn address(&self) -> IndividualAddress {
        self.address
    }

    /// Get the datapoints linked to this interface, with the senders of each
    pub fn groups(&self) -> &HashMap<GroupAddress, HashSet<IndividualAddress>> {
        &self.groups
    }
}

/// Signed, password-encrypted artifact carrying KNX secure keys and topology
pub trait Keyring {
    /// Verify the keyring signature with the supplied password
    fn verify_signature(&self, password: &str) -> bool;

    /// Get the devices stored in the keyring
    fn devices(&self) -> HashMap<IndividualAddress, KeyringDevice>;

    /// Get the encrypted group keys stored in the keyring
    fn groups(&self) -> HashMap<GroupAddress, SealedKey>;

    /// Get the interfaces stored in the keyring, grouped by host address
    fn interfaces(&self) -> HashMap<IndividualAddress, Vec<KeyringInterface>>;

    /// Decrypt an encrypted key with the supplied password
    fn decrypt_key(&self, key: &SealedKey, password: &str) -> KnxResult<[u8; 16]>;
}
