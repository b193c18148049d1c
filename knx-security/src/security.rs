//! Key and address information for KNX secure communication
//!
//! A `Security` instance holds the keys and sender topology required for
//! secure process communication and management, usually populated from a
//! verified keyring.

use crate::keyring::Keyring;
use knx_core::{GroupAddress, IndividualAddress, KnxError, KnxResult, SerialNumber};
use parking_lot::{MappedRwLockWriteGuard, RwLock, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Keys and address information for one KNX installation
///
/// All accessors return live mutable views of the underlying maps; callers
/// may add or remove entries, and no defensive copies are made.
#[derive(Debug, Default)]
pub struct Security {
    device_tool_keys: RwLock<HashMap<IndividualAddress, [u8; 16]>>,
    group_keys: RwLock<HashMap<GroupAddress, [u8; 16]>>,
    group_senders: RwLock<HashMap<GroupAddress, HashSet<IndividualAddress>>>,
    senders_by_interface:
        RwLock<HashMap<IndividualAddress, HashMap<GroupAddress, HashSet<IndividualAddress>>>>,
    broadcast_tool_keys: RwLock<HashMap<SerialNumber, [u8; 16]>>,
}

static DEFAULT_INSTALLATION: OnceLock<Security> = OnceLock::new();

impl Security {
    /// Create a new security object, mainly for KNX installations other than
    /// the default installation
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the security object of the default KNX installation
    pub fn default_installation() -> &'static Security {
        DEFAULT_INSTALLATION.get_or_init(Security::new)
    }

    /// Add the KNX secure information of the supplied keyring to this
    /// security object
    ///
    /// Keyring entries overwrite existing key data. Fails with
    /// `KeyringSignatureMismatch` if the signature does not verify under the
    /// password, leaving the keystore unchanged.
    pub fn use_keyring<K: Keyring>(&self, keyring: &K, password: &str) -> KnxResult<()> {
        if !keyring.verify_signature(password) {
            return Err(KnxError::KeyringSignatureMismatch);
        }

        for (addr, device) in keyring.devices() {
            if let Some(tool_key) = device.tool_key() {
                let key = keyring.decrypt_key(tool_key, password)?;
                self.device_tool_keys.write().insert(addr, key);
            }
        }

        for (addr, sealed) in keyring.groups() {
            let key = keyring.decrypt_key(&sealed, password)?;
            self.group_keys.write().insert(addr, key);
        }

        let interfaces = keyring.interfaces();
        let interface_addresses: HashSet<IndividualAddress> = interfaces
            .values()
            .flatten()
            .map(|i| i.address())
            .collect();

        {
            let mut senders = self.group_senders.write();
            for interface in interfaces.values().flatten() {
                for (group, declared) in interface.groups() {
                    let entry = senders.entry(*group).or_default();
                    entry.extend(
                        declared
                            .iter()
                            .filter(|addr| !interface_addresses.contains(addr)),
                    );
                }
            }
        }

        let mut by_interface = self.senders_by_interface.write();
        for interface in interfaces.values().flatten() {
            by_interface.insert(interface.address(), interface.groups().clone());
        }
        Ok(())
    }

    /// Get the device tool keys currently configured for this security object
    pub fn device_tool_keys(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<IndividualAddress, [u8; 16]>> {
        self.device_tool_keys.write()
    }

    /// Get the group keys currently configured for this security object
    pub fn group_keys(&self) -> RwLockWriteGuard<'_, HashMap<GroupAddress, [u8; 16]>> {
        self.group_keys.write()
    }

    /// Get the secure datapoints currently configured for this security
    /// object, together with the addresses of devices acting as senders for
    /// each datapoint
    pub fn group_senders(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<GroupAddress, HashSet<IndividualAddress>>> {
        self.group_senders.write()
    }

    /// Get the group addresses and group senders configured for a specific
    /// secure interface; the view might be empty
    pub fn group_senders_of_interface(
        &self,
        interface: IndividualAddress,
    ) -> MappedRwLockWriteGuard<'_, HashMap<GroupAddress, HashSet<IndividualAddress>>> {
        RwLockWriteGuard::map(self.senders_by_interface.write(), |map| {
            map.entry(interface).or_default()
        })
    }

    /// Get the broadcast tool keys currently configured for this security
    /// object
    pub fn broadcast_tool_keys(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<SerialNumber, [u8; 16]>> {
        self.broadcast_tool_keys.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::{KeyringDevice, KeyringInterface, SealedKey};

    const PASSWORD: &str = "keyring-pwd";

    /// Keyring stub storing keys XOR-sealed with a password-derived byte
    struct StubKeyring {
        devices: HashMap<IndividualAddress, KeyringDevice>,
        groups: HashMap<GroupAddress, SealedKey>,
        interfaces: HashMap<IndividualAddress, Vec<KeyringInterface>>,
    }

    fn seal(key: [u8; 16]) -> SealedKey {
        SealedKey(key.iter().map(|b| b ^ 0x5a).collect())
    }

    impl Keyring for StubKeyring {
        fn verify_signature(&self, password: &str) -> bool {
            password == PASSWORD
        }

        fn devices(&self) -> HashMap<IndividualAddress, KeyringDevice> {
            self.devices.clone()
        }

        fn groups(&self) -> HashMap<GroupAddress, SealedKey> {
            self.groups.clone()
        }

        fn interfaces(&self) -> HashMap<IndividualAddress, Vec<KeyringInterface>> {
            self.interfaces.clone()
        }

        fn decrypt_key(&self, key: &SealedKey, _password: &str) -> KnxResult<[u8; 16]> {
            let mut out = [0u8; 16];
            for (o, b) in out.iter_mut().zip(key.0.iter()) {
                *o = b ^ 0x5a;
            }
            Ok(out)
        }
    }

    fn sample_keyring() -> StubKeyring {
        let device = IndividualAddress::from_string("1.1.5").unwrap();
        let other_sender = IndividualAddress::from_string("1.1.6").unwrap();
        let interface = IndividualAddress::from_string("1.1.1").unwrap();
        let g1 = GroupAddress::from_string("1/0/1").unwrap();
        let g2 = GroupAddress::from_string("1/0/2").unwrap();

        let mut devices = HashMap::new();
        devices.insert(device, KeyringDevice::new(Some(seal([0xe0; 16]))));

        let mut groups = HashMap::new();
        groups.insert(g1, seal([0x01; 16]));
        groups.insert(g2, seal([0x02; 16]));

        let mut interface_groups = HashMap::new();
        interface_groups.insert(g1, HashSet::from([device, interface]));
        interface_groups.insert(g2, HashSet::from([other_sender]));
        let mut interfaces = HashMap::new();
        interfaces.insert(
            interface,
            vec![KeyringInterface::new(interface, interface_groups)],
        );

        StubKeyring {
            devices,
            groups,
            interfaces,
        }
    }

    #[test]
    fn test_use_keyring_populates_maps() {
        let security = Security::new();
        security.use_keyring(&sample_keyring(), PASSWORD).unwrap();

        let device = IndividualAddress::from_string("1.1.5").unwrap();
        let interface = IndividualAddress::from_string("1.1.1").unwrap();
        let g1 = GroupAddress::from_string("1/0/1").unwrap();
        let g2 = GroupAddress::from_string("1/0/2").unwrap();

        assert_eq!(security.device_tool_keys().get(&device), Some(&[0xe0; 16]));
        assert_eq!(security.group_keys().get(&g1), Some(&[0x01; 16]));
        assert_eq!(security.group_keys().get(&g2), Some(&[0x02; 16]));

        // the interface's own address is filtered from the installation-wide
        // sender view, but kept in the per-interface view
        let senders = security.group_senders();
        assert_eq!(senders.get(&g1), Some(&HashSet::from([device])));
        assert_eq!(
            senders.get(&g2),
            Some(&HashSet::from([
                IndividualAddress::from_string("1.1.6").unwrap()
            ]))
        );
        drop(senders);

        let view = security.group_senders_of_interface(interface);
        assert_eq!(view.get(&g1), Some(&HashSet::from([device, interface])));
    }

    #[test]
    fn test_use_keyring_idempotent() {
        let security = Security::new();
        let keyring = sample_keyring();
        security.use_keyring(&keyring, PASSWORD).unwrap();
        let first_senders = security.group_senders().clone();
        let first_keys = security.group_keys().clone();

        security.use_keyring(&keyring, PASSWORD).unwrap();
        assert_eq!(*security.group_senders(), first_senders);
        assert_eq!(*security.group_keys(), first_keys);
    }

    #[test]
    fn test_use_keyring_wrong_password() {
        let security = Security::new();
        let result = security.use_keyring(&sample_keyring(), "wrong");
        assert!(matches!(result, Err(KnxError::KeyringSignatureMismatch)));
        assert!(security.device_tool_keys().is_empty());
        assert!(security.group_keys().is_empty());
        assert!(security.group_senders().is_empty());
    }

    #[test]
    fn test_accessors_are_live_views() {
        let security = Security::new();
        let addr = IndividualAddress::from_string("2.3.4").unwrap();
        security.device_tool_keys().insert(addr, [9; 16]);
        assert_eq!(security.device_tool_keys().get(&addr), Some(&[9; 16]));
        security.device_tool_keys().remove(&addr);
        assert!(security.device_tool_keys().is_empty());
    }

    #[test]
    fn test_independent_installations() {
        let a = Security::new();
        let b = Security::new();
        let addr = IndividualAddress::from_string("1.0.1").unwrap();
        a.device_tool_keys().insert(addr, [1; 16]);
        assert!(b.device_tool_keys().is_empty());
    }
}
