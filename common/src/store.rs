//! Network and messaging documents.
//!
//! Two write paths exist and they are deliberately asymmetric:
//!
//! * [`ConfigStore::replace`] is used by the local configuration endpoint and
//!   overwrites the whole document.
//! * [`ConfigStore::merge_patch`] is used for documents arriving over the
//!   message bus. It only overwrites keys the stored document already has.
//!   Keys that appear only in the patch are dropped, so a remote publisher can
//!   change existing settings but can never add fields to the document.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use log::{info, warn};
use serde_json::{Map, Value};

use crate::{
    config::{DocumentKind, MessagingProfile, NetworkProfile},
    error::StoreError,
};

pub trait DocumentStorage: Send + Sync {
    /// Raw bytes of the stored document, `None` when it was never written.
    fn read(&self, kind: DocumentKind) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, kind: DocumentKind, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Directory holding `network.json` and `mqtt.json`.
#[derive(Debug, Clone)]
pub struct FsDocumentStorage {
    root: PathBuf,
}

impl FsDocumentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, kind: DocumentKind) -> PathBuf {
        self.root.join(kind.file_name())
    }
}

impl DocumentStorage for FsDocumentStorage {
    fn read(&self, kind: DocumentKind) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path(kind)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, kind: DocumentKind, bytes: &[u8]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.path(kind), bytes)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profile {
    Network(NetworkProfile),
    Messaging(MessagingProfile),
}

impl Profile {
    pub fn configured(&self) -> bool {
        match self {
            Self::Network(profile) => profile.configured,
            Self::Messaging(profile) => profile.configured,
        }
    }
}

pub struct ConfigStore<S> {
    storage: S,
    network_lock: Mutex<()>,
    messaging_lock: Mutex<()>,
}

impl<S: DocumentStorage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            network_lock: Mutex::new(()),
            messaging_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Re-reads storage on every call. Missing, empty or malformed documents
    /// yield an unconfigured profile.
    pub fn load(&self, kind: DocumentKind) -> Profile {
        match kind {
            DocumentKind::Network => Profile::Network(self.load_network()),
            DocumentKind::Messaging => Profile::Messaging(self.load_messaging()),
        }
    }

    pub fn load_network(&self) -> NetworkProfile {
        let _guard = self.guard(DocumentKind::Network);
        match self.read_raw(DocumentKind::Network) {
            Some(raw) => NetworkProfile::from_document(&raw).unwrap_or_else(|err| {
                warn!("network document is malformed, treating as unconfigured: {err}");
                NetworkProfile::default()
            }),
            None => NetworkProfile::default(),
        }
    }

    pub fn load_messaging(&self) -> MessagingProfile {
        let _guard = self.guard(DocumentKind::Messaging);
        match self.read_raw(DocumentKind::Messaging) {
            Some(raw) => MessagingProfile::from_document(&raw).unwrap_or_else(|err| {
                warn!("messaging document is malformed, treating as unconfigured: {err}");
                MessagingProfile::default()
            }),
            None => MessagingProfile::default(),
        }
    }

    /// Stored document as a JSON object, if there is a usable one.
    pub fn document(&self, kind: DocumentKind) -> Option<Map<String, Value>> {
        let _guard = self.guard(kind);
        self.read_object(kind)
    }

    pub fn replace(&self, kind: DocumentKind, document: &Value) -> Result<(), StoreError> {
        let Value::Object(object) = document else {
            return Err(StoreError::NotAnObject);
        };

        let payload = serde_json::to_vec(object).map_err(StoreError::Serialize)?;
        let _guard = self.guard(kind);
        self.storage.write(kind, &payload)?;
        info!("{} document replaced ({} keys)", kind.as_str(), object.len());
        Ok(())
    }

    /// Applies a remote patch and returns how many stored keys changed.
    pub fn merge_patch(&self, kind: DocumentKind, patch: &[u8]) -> Result<usize, StoreError> {
        let patch = serde_json::from_slice::<Value>(patch).map_err(StoreError::MalformedPatch)?;
        let Value::Object(patch) = patch else {
            return Err(StoreError::NotAnObject);
        };

        let _guard = self.guard(kind);
        let Some(mut stored) = self.read_object(kind) else {
            info!(
                "no stored {} document; ignoring remote patch",
                kind.as_str()
            );
            return Ok(0);
        };

        let updated = merge_existing_keys(&mut stored, &patch);
        if updated > 0 {
            let payload = serde_json::to_vec(&stored).map_err(StoreError::Serialize)?;
            self.storage.write(kind, &payload)?;
        }

        info!(
            "{} document patched: {updated} key(s) updated, {} ignored",
            kind.as_str(),
            patch.len() - updated
        );
        Ok(updated)
    }

    fn guard(&self, kind: DocumentKind) -> MutexGuard<'_, ()> {
        let lock = match kind {
            DocumentKind::Network => &self.network_lock,
            DocumentKind::Messaging => &self.messaging_lock,
        };
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_raw(&self, kind: DocumentKind) -> Option<Vec<u8>> {
        match self.storage.read(kind) {
            Ok(Some(raw)) if !raw.iter().all(u8::is_ascii_whitespace) => Some(raw),
            Ok(_) => None,
            Err(err) => {
                warn!("failed to read {} document: {err}", kind.as_str());
                None
            }
        }
    }

    fn read_object(&self, kind: DocumentKind) -> Option<Map<String, Value>> {
        let raw = self.read_raw(kind)?;
        match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(object)) => Some(object),
            Ok(_) => {
                warn!("{} document is not a JSON object", kind.as_str());
                None
            }
            Err(err) => {
                warn!("{} document is malformed: {err}", kind.as_str());
                None
            }
        }
    }
}

/// Overwrites the stored value of every key present in both maps. Returns the
/// number of keys taken from `patch`; patch-only keys are not added.
pub fn merge_existing_keys(stored: &mut Map<String, Value>, patch: &Map<String, Value>) -> usize {
    let mut updated = 0;
    for (key, value) in stored.iter_mut() {
        if let Some(replacement) = patch.get(key) {
            *value = replacement.clone();
            updated += 1;
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::fakes::MemoryDocuments;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(object) => object,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn merge_keeps_unpatched_keys_and_drops_new_ones() {
        let mut stored = object(json!({"a": 1, "b": 2}));
        let updated = merge_existing_keys(&mut stored, &object(json!({"b": 3, "c": 4})));

        assert_eq!(updated, 1);
        assert_eq!(Value::Object(stored), json!({"a": 1, "b": 3}));
    }

    #[test]
    fn merge_replaces_nested_values_wholesale() {
        let mut stored = object(json!({"opts": {"x": 1, "y": 2}}));
        merge_existing_keys(&mut stored, &object(json!({"opts": {"x": 5}})));

        assert_eq!(Value::Object(stored), json!({"opts": {"x": 5}}));
    }

    #[test]
    fn missing_documents_load_unconfigured() {
        let store = ConfigStore::new(MemoryDocuments::default());

        assert_eq!(store.load_network(), NetworkProfile::default());
        assert!(!store.load(DocumentKind::Messaging).configured());
        assert_eq!(store.document(DocumentKind::Network), None);
    }

    #[test]
    fn empty_and_malformed_documents_load_unconfigured() {
        let docs = MemoryDocuments::default();
        docs.insert(DocumentKind::Network, b"   ");
        docs.insert(DocumentKind::Messaging, b"{ not json");
        let store = ConfigStore::new(docs);

        assert!(!store.load_network().configured);
        assert!(!store.load_messaging().configured);
    }

    #[test]
    fn replace_overwrites_the_whole_document() {
        let store = ConfigStore::new(MemoryDocuments::default());
        store
            .replace(DocumentKind::Network, &json!({"ssid": "old", "ip": "10.0.0.5"}))
            .unwrap();
        store
            .replace(DocumentKind::Network, &json!({"ssid": "plant-floor"}))
            .unwrap();

        let document = store.document(DocumentKind::Network).unwrap();
        assert_eq!(Value::Object(document), json!({"ssid": "plant-floor"}));
        assert_eq!(store.load_network().network_name, "plant-floor");
    }

    #[test]
    fn replace_rejects_non_objects_without_writing() {
        let docs = MemoryDocuments::default();
        let store = ConfigStore::new(docs);

        let err = store.replace(DocumentKind::Messaging, &json!([1, 2])).unwrap_err();
        assert!(matches!(err, StoreError::NotAnObject));
        assert_eq!(store.storage().writes(), 0);
    }

    #[test]
    fn replace_reports_storage_failures() {
        let docs = MemoryDocuments::default();
        docs.fail_writes(true);
        let store = ConfigStore::new(docs);

        assert!(store
            .replace(DocumentKind::Network, &json!({"ssid": "x"}))
            .is_err());
    }

    #[test]
    fn merge_patch_persists_only_existing_keys() {
        let store = ConfigStore::new(MemoryDocuments::default());
        store
            .replace(
                DocumentKind::Messaging,
                &json!({"broker": "10.0.0.2", "port": "1883", "topic": "plant"}),
            )
            .unwrap();

        let updated = store
            .merge_patch(
                DocumentKind::Messaging,
                br#"{"broker": "10.0.0.9", "injected": true}"#,
            )
            .unwrap();

        assert_eq!(updated, 1);
        let document = store.document(DocumentKind::Messaging).unwrap();
        assert_eq!(
            Value::Object(document),
            json!({"broker": "10.0.0.9", "port": "1883", "topic": "plant"})
        );
    }

    #[test]
    fn merge_patch_without_stored_document_writes_nothing() {
        let store = ConfigStore::new(MemoryDocuments::default());
        let updated = store
            .merge_patch(DocumentKind::Network, br#"{"ssid": "rogue"}"#)
            .unwrap();

        assert_eq!(updated, 0);
        assert_eq!(store.storage().writes(), 0);
        assert!(!store.load_network().configured);
    }

    #[test]
    fn merge_patch_rejects_malformed_payloads() {
        let store = ConfigStore::new(MemoryDocuments::default());
        store
            .replace(DocumentKind::Network, &json!({"ssid": "a"}))
            .unwrap();

        assert!(matches!(
            store.merge_patch(DocumentKind::Network, b"ssid=b"),
            Err(StoreError::MalformedPatch(_))
        ));
        assert!(matches!(
            store.merge_patch(DocumentKind::Network, b"\"b\""),
            Err(StoreError::NotAnObject)
        ));
        assert_eq!(store.load_network().network_name, "a");
    }

    #[test]
    fn fs_storage_round_trips_documents() {
        let root = std::env::temp_dir().join(format!("dweb08-docs-{}", std::process::id()));
        let store = ConfigStore::new(FsDocumentStorage::new(&root));

        assert!(!store.load_network().configured);
        store
            .replace(DocumentKind::Network, &json!({"ssid": "lab", "dhcp": 1}))
            .unwrap();

        let profile = store.load_network();
        assert!(profile.configured);
        assert!(profile.dhcp_enabled);
        assert!(root.join("network.json").exists());

        let _ = fs::remove_dir_all(&root);
    }
}
