//! Cluster membership as seen by this host.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IpsecError, Result};

/// One endpoint reachable through a tunnel host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Address of the host terminating the tunnel.
    pub host_ip_address: String,
    /// CIDR of the endpoint behind that host.
    pub ip_address: String,
    /// Whether the endpoint needs its own key load.
    #[serde(default)]
    pub peer: bool,
}

impl Entry {
    /// An endpoint entry.
    #[must_use]
    pub fn new(host_ip_address: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            host_ip_address: host_ip_address.into(),
            ip_address: ip_address.into(),
            peer: false,
        }
    }

    /// Marks the entry as a peer.
    #[must_use]
    pub fn as_peer(mut self) -> Self {
        self.peer = true;
        self
    }
}

/// Source of membership entries and local identity.
pub trait MembershipStore: Send + Sync {
    /// Refreshes the snapshot returned by the other methods.
    fn reload(&self) -> Result<()>;

    /// Version of the underlying data, changes whenever it does.
    fn current_version(&self) -> Result<String>;

    /// Entries of the last snapshot.
    fn entries(&self) -> Vec<Entry>;

    /// This host's tunnel address.
    fn local_host_ip_address(&self) -> String;

    /// This host's endpoint address.
    fn local_ip_address(&self) -> String;

    /// CIDR of the endpoints behind this host.
    fn local_subnet(&self) -> String;
}

/// This host's identity within a membership document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalIdentity {
    /// Tunnel address.
    pub host_ip_address: String,
    /// Endpoint address.
    pub ip_address: String,
    /// Endpoint subnet.
    pub subnet: String,
}

/// A membership document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Membership {
    /// This host.
    pub local: LocalIdentity,
    /// Every endpoint in the cluster, this host's included.
    pub entries: Vec<Entry>,
}

/// Membership read from a JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    snapshot: RwLock<(String, Membership)>,
}

impl FileStore {
    /// Creates a store for `path`. Nothing is read until [`reload`](MembershipStore::reload).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new((String::new(), Membership::default())),
        }
    }

    /// Creates a store and loads it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(path);
        store.reload()?;
        Ok(store)
    }

    /// Path of the membership file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Version of the loaded snapshot.
    pub fn loaded_version(&self) -> String {
        self.snapshot.read().0.clone()
    }

    fn read(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path).map_err(|e| {
            IpsecError::Store(format!("failed to read {}: {e}", self.path.display()))
        })
    }
}

impl MembershipStore for FileStore {
    fn reload(&self) -> Result<()> {
        let raw = self.read()?;
        let membership: Membership = serde_json::from_slice(&raw).map_err(|e| {
            IpsecError::Store(format!("failed to parse {}: {e}", self.path.display()))
        })?;
        let version = blake3::hash(&raw).to_hex().to_string();
        debug!(
            version = %version,
            entries = membership.entries.len(),
            "membership reloaded"
        );
        *self.snapshot.write() = (version, membership);
        Ok(())
    }

    fn current_version(&self) -> Result<String> {
        Ok(blake3::hash(&self.read()?).to_hex().to_string())
    }

    fn entries(&self) -> Vec<Entry> {
        self.snapshot.read().1.entries.clone()
    }

    fn local_host_ip_address(&self) -> String {
        self.snapshot.read().1.local.host_ip_address.clone()
    }

    fn local_ip_address(&self) -> String {
        self.snapshot.read().1.local.ip_address.clone()
    }

    fn local_subnet(&self) -> String {
        self.snapshot.read().1.local.subnet.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r#"{
        "local": {"host_ip_address": "10.0.0.1", "ip_address": "10.42.0.1", "subnet": "10.42.0.0/24"},
        "entries": [
            {"host_ip_address": "10.0.0.1", "ip_address": "10.42.0.1/32"},
            {"host_ip_address": "10.0.0.2", "ip_address": "10.42.1.7/32", "peer": true}
        ]
    }"#;

    fn write_doc(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn test_open_reads_snapshot() {
        let file = write_doc(DOC);
        let store = FileStore::open(file.path()).expect("open");

        assert_eq!(store.local_host_ip_address(), "10.0.0.1");
        assert_eq!(store.local_ip_address(), "10.42.0.1");
        assert_eq!(store.local_subnet(), "10.42.0.0/24");

        let entries = store.entries();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].peer);
        assert_eq!(entries[1], Entry::new("10.0.0.2", "10.42.1.7/32").as_peer());
    }

    #[test]
    fn test_version_tracks_contents() {
        let file = write_doc(DOC);
        let store = FileStore::open(file.path()).expect("open");
        let loaded = store.loaded_version();
        assert_eq!(store.current_version().expect("version"), loaded);

        std::fs::write(file.path(), DOC.replace("10.42.1.7", "10.42.1.8")).expect("rewrite");
        assert_ne!(store.current_version().expect("version"), loaded);
        // The snapshot only moves on reload.
        assert_eq!(store.entries()[1].ip_address, "10.42.1.7/32");
        store.reload().expect("reload");
        assert_eq!(store.entries()[1].ip_address, "10.42.1.8/32");
    }

    #[test]
    fn test_missing_file_is_store_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = FileStore::open(dir.path().join("members.json")).expect_err("missing");
        assert!(matches!(err, IpsecError::Store(_)));
    }

    #[test]
    fn test_bad_json_keeps_previous_snapshot() {
        let file = write_doc(DOC);
        let store = FileStore::open(file.path()).expect("open");
        std::fs::write(file.path(), "[").expect("rewrite");
        assert!(store.reload().is_err());
        assert_eq!(store.entries().len(), 2);
    }
}
