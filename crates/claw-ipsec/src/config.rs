//! Overlay tunables and fixed protocol constants.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IpsecError, Result};

/// Name of the shared secret file inside the config directory.
pub const PSK_FILE: &str = "psk.txt";

/// Default pid file written by charon.
pub const DEFAULT_PID_FILE: &str = "/var/run/charon.pid";

/// Default VICI control socket.
pub const DEFAULT_VICI_SOCKET: &str = "/var/run/charon.vici";

/// Default replay window size for child SAs.
pub const DEFAULT_REPLAY_WINDOW_SIZE: &str = "1024";

/// Default rekey interval for IKE SAs.
pub const DEFAULT_IKE_SA_REKEY_INTERVAL: &str = "4h";

/// Default rekey interval for child SAs.
pub const DEFAULT_CHILD_SA_REKEY_INTERVAL: &str = "1h";

/// Rekey interval used by the side that must not initiate rekeying.
pub const DISABLED_REKEY_INTERVAL: &str = "8760h";

/// Configuration for the overlay reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Directory holding `psk.txt` and template overrides.
    pub config_dir: PathBuf,
    /// Proposal prefixes that must never be offered.
    pub blacklist: Vec<String>,
    /// Child SA replay window size.
    pub replay_window_size: String,
    /// IKE SA rekey interval for the rekey-initiating side.
    pub ike_sa_rekey_interval: String,
    /// Child SA rekey interval for the rekey-initiating side.
    pub child_sa_rekey_interval: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/ipsec"),
            blacklist: Vec::new(),
            replay_window_size: DEFAULT_REPLAY_WINDOW_SIZE.to_string(),
            ike_sa_rekey_interval: DEFAULT_IKE_SA_REKEY_INTERVAL.to_string(),
            child_sa_rekey_interval: DEFAULT_CHILD_SA_REKEY_INTERVAL.to_string(),
        }
    }
}

impl OverlayConfig {
    /// Creates a config rooted at the given directory.
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the proposal blacklist.
    #[must_use]
    pub fn with_blacklist<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the replay window size.
    #[must_use]
    pub fn with_replay_window_size(mut self, size: impl Into<String>) -> Self {
        self.replay_window_size = size.into();
        self
    }

    /// Sets both rekey intervals.
    #[must_use]
    pub fn with_rekey_intervals(
        mut self,
        ike_sa: impl Into<String>,
        child_sa: impl Into<String>,
    ) -> Self {
        self.ike_sa_rekey_interval = ike_sa.into();
        self.child_sa_rekey_interval = child_sa.into();
        self
    }

    /// Path of the shared secret file.
    #[must_use]
    pub fn psk_path(&self) -> PathBuf {
        self.config_dir.join(PSK_FILE)
    }

    /// Directory holding template overrides.
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value would be rejected by charon.
    pub fn validate(&self) -> Result<()> {
        if self.replay_window_size.parse::<u32>().is_err() {
            return Err(IpsecError::Config(format!(
                "replay window size must be a number, got '{}'",
                self.replay_window_size
            )));
        }

        for (name, value) in [
            ("ike_sa_rekey_interval", &self.ike_sa_rekey_interval),
            ("child_sa_rekey_interval", &self.child_sa_rekey_interval),
        ] {
            if !is_duration(value) {
                return Err(IpsecError::Config(format!(
                    "{name} must be a duration like 90s, 30m, 4h or 1d, got '{value}'"
                )));
            }
        }

        if self.blacklist.iter().any(String::is_empty) {
            return Err(IpsecError::Config(
                "blacklist entries cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Whether `s` is a strongSwan time value: digits with an optional unit.
fn is_duration(s: &str) -> bool {
    let digits = s.trim_end_matches(['s', 'm', 'h', 'd']);
    let unit_len = s.len() - digits.len();
    !digits.is_empty() && unit_len <= 1 && digits.bytes().all(|b| b.is_ascii_digit())
}
