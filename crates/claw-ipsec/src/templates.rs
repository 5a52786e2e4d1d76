//! Default connection skeletons and their revision stamp.
//!
//! The reconciler customizes a fresh copy of these per peer. Operators can
//! override either skeleton by dropping `ike.json` or `child_sa.json` into the
//! config directory; missing fields keep their built-in values.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::conn::{AuthConfig, ChildSaConfig, IkeConfig};
use crate::error::{IpsecError, Result};

/// IKE skeleton override file.
pub const IKE_TEMPLATE_FILE: &str = "ike.json";

/// Child SA skeleton override file.
pub const CHILD_SA_TEMPLATE_FILE: &str = "child_sa.json";

/// Fixed reqid shared by every tunnel.
pub const REQ_ID: u32 = 1234;

/// Supplies connection skeletons and a stamp identifying their generation.
pub trait TemplateSource: Send {
    /// Re-reads the skeletons.
    fn reload(&mut self) -> Result<()>;

    /// Stamp of the current skeletons. Equal stamps mean equal output.
    fn revision(&self) -> &str;

    /// A fresh IKE skeleton.
    fn new_ike_config(&self) -> IkeConfig;

    /// A fresh child SA skeleton.
    fn new_child_sa_config(&self) -> ChildSaConfig;
}

/// File-backed templates with built-in defaults.
#[derive(Debug, Clone)]
pub struct Templates {
    config_dir: PathBuf,
    ike: IkeConfig,
    child: ChildSaConfig,
    revision: String,
}

impl Templates {
    /// Loads templates from `config_dir`.
    pub fn new(config_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut templates = Self {
            config_dir: config_dir.into(),
            ike: default_ike_config(),
            child: default_child_sa_config(),
            revision: String::new(),
        };
        templates.reload()?;
        Ok(templates)
    }
}

impl TemplateSource for Templates {
    fn reload(&mut self) -> Result<()> {
        let ike = read_override(&self.config_dir.join(IKE_TEMPLATE_FILE))?
            .unwrap_or_else(default_ike_config);
        let child = read_override(&self.config_dir.join(CHILD_SA_TEMPLATE_FILE))?
            .unwrap_or_else(default_child_sa_config);

        let revision = revision_of(&ike, &child)?;
        if revision != self.revision {
            debug!(revision = %revision, "connection templates changed");
        }
        self.ike = ike;
        self.child = child;
        self.revision = revision;
        Ok(())
    }

    fn revision(&self) -> &str {
        &self.revision
    }

    fn new_ike_config(&self) -> IkeConfig {
        self.ike.clone()
    }

    fn new_child_sa_config(&self) -> ChildSaConfig {
        self.child.clone()
    }
}

/// Built-in IKE skeleton.
#[must_use]
pub fn default_ike_config() -> IkeConfig {
    IkeConfig {
        proposals: strings(&[
            "aes128gcm16-prfsha256-modp2048",
            "aes256-sha256-modp2048",
            "aes128-sha1-modp2048",
        ]),
        version: "2".to_string(),
        encap: "yes".to_string(),
        keyingtries: "0".to_string(),
        dpd_delay: "10s".to_string(),
        local_auth: AuthConfig::psk(),
        remote_auth: AuthConfig::psk(),
        ..IkeConfig::default()
    }
}

/// Built-in child SA skeleton.
#[must_use]
pub fn default_child_sa_config() -> ChildSaConfig {
    ChildSaConfig {
        local_ts: strings(&["0.0.0.0/0"]),
        remote_ts: strings(&["0.0.0.0/0"]),
        esp_proposals: strings(&[
            "aes128gcm16-modp2048",
            "aes256-sha256-modp2048",
            "aes128-sha1-modp2048",
        ]),
        start_action: "start".to_string(),
        close_action: "none".to_string(),
        dpd_action: "restart".to_string(),
        mode: "tunnel".to_string(),
        // Kernel policies are managed by the reconciler.
        policies: "no".to_string(),
        ..ChildSaConfig::default()
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

fn read_override<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(IpsecError::Template(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| IpsecError::Template(format!("failed to parse {}: {e}", path.display())))
}

fn revision_of(ike: &IkeConfig, child: &ChildSaConfig) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    for part in [serde_json::to_vec(ike), serde_json::to_vec(child)] {
        let bytes = part.map_err(|e| IpsecError::Template(e.to_string()))?;
        hasher.update(&bytes);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
