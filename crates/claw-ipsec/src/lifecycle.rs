//! Idempotent key and connection loading, and stale-host cleanup.
//!
//! `OverlayState` remembers what was last pushed to charon (key value per
//! peer, template revision per host) so a pass only talks to the daemon when
//! something changed. Each pass also records what it attempted; anything
//! cached but not attempted is stale once the pass succeeds.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::{debug, info, warn};

use crate::client::ConnectionClient;
use crate::config::{OverlayConfig, DISABLED_REKEY_INTERVAL};
use crate::conn::{child_name, conn_name, strip_prefix_len, SharedKey};
use crate::error::{IpsecError, Result};
use crate::store::Entry;
use crate::templates::{TemplateSource, REQ_ID};

/// Identity matching any peer.
pub const WILDCARD_IDENTITY: &str = "%any";

/// How many times `load-conn` is submitted before giving up.
pub const LOAD_CONN_ATTEMPTS: usize = 3;

/// What has been pushed to charon, and what the current pass wants.
pub struct OverlayState {
    keys: HashMap<String, String>,
    hosts: HashMap<String, String>,
    key_attempt: HashSet<String>,
    host_attempt: HashSet<String>,
    psk: String,
    templates: Box<dyn TemplateSource>,
}

impl fmt::Debug for OverlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayState")
            .field("keys", &self.keys.len())
            .field("hosts", &self.hosts)
            .field("key_attempt", &self.key_attempt)
            .field("host_attempt", &self.host_attempt)
            .field("psk", &"[REDACTED]")
            .field("revision", &self.templates.revision())
            .finish()
    }
}

impl OverlayState {
    /// Empty state using `templates` for connection skeletons.
    pub fn new(templates: Box<dyn TemplateSource>) -> Self {
        Self {
            keys: HashMap::new(),
            hosts: HashMap::new(),
            key_attempt: HashSet::new(),
            host_attempt: HashSet::new(),
            psk: String::new(),
            templates,
        }
    }

    /// Replaces the shared secret.
    pub fn set_psk(&mut self, psk: impl Into<String>) {
        self.psk = psk.into();
    }

    /// The secret to use for `peer`. Every peer shares one secret.
    pub fn psk_for(&self, _peer: &str) -> &str {
        &self.psk
    }

    /// Template source, for reloading at the start of a pass.
    pub fn templates_mut(&mut self) -> &mut dyn TemplateSource {
        self.templates.as_mut()
    }

    /// Current template revision.
    pub fn revision(&self) -> &str {
        self.templates.revision()
    }

    /// Hosts with a loaded connection, and the revision they were loaded at.
    pub fn hosts(&self) -> &HashMap<String, String> {
        &self.hosts
    }

    /// Peers with a loaded key.
    pub fn key_owners(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Clears the per-pass attempt sets.
    pub fn begin_pass(&mut self) {
        self.key_attempt.clear();
        self.host_attempt.clear();
    }

    /// Records a connection found in the daemon as loaded at the current revision.
    pub fn seed_host(&mut self, host: &str) {
        let revision = self.templates.revision().to_string();
        self.hosts.insert(host.to_string(), revision);
    }

    /// Forgets every cached host.
    pub fn clear_hosts(&mut self) {
        self.hosts.clear();
    }

    /// Loads the shared secret for `peer` unless it is already loaded.
    ///
    /// Returns whether a `load-shared` request was made.
    pub fn load_shared_key(&mut self, client: &ConnectionClient, peer: &str) -> Result<bool> {
        let peer = strip_prefix_len(peer).to_string();
        self.key_attempt.insert(peer.clone());

        let key = self.psk_for(&peer).to_string();
        if self.keys.get(&peer) == Some(&key) {
            debug!(peer = %peer, "pre-shared key already loaded");
            return Ok(false);
        }

        let shared = SharedKey::ike(key.clone(), peer.clone());
        let loaded = client
            .session()
            .and_then(|mut session| session.load_shared(&shared));
        if let Err(source) = loaded {
            warn!(peer = %peer, error = %source, "failed to load pre-shared key");
            return Err(IpsecError::KeyLoad { peer, source });
        }

        info!(peer = %peer, "loaded pre-shared key");
        self.keys.insert(peer, key);
        Ok(true)
    }

    /// Loads the connection to `entry`'s host unless it is current.
    ///
    /// Returns whether a `load-conn` request succeeded.
    pub fn add_host_connection(
        &mut self,
        client: &ConnectionClient,
        config: &OverlayConfig,
        local_host: &str,
        entry: &Entry,
    ) -> Result<bool> {
        let host = entry.host_ip_address.clone();
        self.host_attempt.insert(host.clone());

        let revision = self.templates.revision().to_string();
        if self.hosts.get(&host) == Some(&revision) {
            debug!(host = %host, "connection already loaded");
            return Ok(false);
        }

        let (ike_rekey, child_rekey) = rekey_intervals(local_host, &host, config);

        let mut child = self.templates.new_child_sa_config();
        child.esp_proposals = filter_proposals(&child.esp_proposals, &config.blacklist);
        child.reqid = REQ_ID.to_string();
        child.rekey_time = child_rekey.to_string();
        child.replay_window.clone_from(&config.replay_window_size);

        let mut ike = self.templates.new_ike_config();
        ike.proposals = filter_proposals(&ike.proposals, &config.blacklist);
        ike.remote_addrs = vec![host.clone()];
        ike.rekey_time = ike_rekey.to_string();
        ike.children.insert(child_name(&host), child);

        let name = conn_name(&host);
        let loaded = client.session().and_then(|mut session| {
            let mut attempt = 1;
            loop {
                match session.load_conn(&name, &ike) {
                    Err(e) if attempt < LOAD_CONN_ATTEMPTS => {
                        debug!(conn = %name, attempt, error = %e, "load-conn failed, retrying");
                        attempt += 1;
                    }
                    result => return result,
                }
            }
        });
        if let Err(source) = loaded {
            warn!(conn = %name, error = %source, "failed to load connection");
            return Err(IpsecError::ConnectionLoad { host, source });
        }

        info!(
            conn = %name,
            ike_rekey,
            child_rekey,
            proposals = ?ike.proposals,
            "loaded connection"
        );
        self.hosts.insert(host, revision);
        Ok(true)
    }

    /// Unloads connections for cached hosts not attempted this pass.
    ///
    /// Every stale host is tried; the first failure is returned.
    pub fn remove_hosts(&mut self, client: &ConnectionClient) -> Result<usize> {
        let mut stale: Vec<String> = self
            .hosts
            .keys()
            .filter(|h| !self.host_attempt.contains(*h))
            .cloned()
            .collect();
        stale.sort();

        let mut removed = 0;
        let mut first_err = None;
        for host in stale {
            let name = conn_name(&host);
            info!(conn = %name, "removing connection");
            let unloaded = client
                .session()
                .and_then(|mut session| session.unload_conn(&name));
            match unloaded {
                Ok(()) => {
                    info!(host = %host, "removed connection");
                    self.hosts.remove(&host);
                    removed += 1;
                }
                Err(source) => {
                    warn!(host = %host, error = %source, "failed to remove connection");
                    first_err.get_or_insert(IpsecError::ConnectionUnload { host, source });
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Drops cached keys not attempted this pass.
    ///
    /// charon has no way to unload a shared secret, so the key stays loaded;
    /// forgetting it forces a fresh load if the peer comes back.
    pub fn forget_stale_keys(&mut self) -> usize {
        let before = self.keys.len();
        let attempted = &self.key_attempt;
        self.keys.retain(|peer, _| attempted.contains(peer));
        let forgotten = before - self.keys.len();
        if forgotten > 0 {
            debug!(forgotten, "forgot stale pre-shared keys");
        }
        forgotten
    }
}

/// Drops every proposal starting with a blacklisted prefix.
pub fn filter_proposals(proposals: &[String], blacklist: &[String]) -> Vec<String> {
    proposals
        .iter()
        .filter(|p| !blacklist.iter().any(|b| p.starts_with(b.as_str())))
        .cloned()
        .collect()
}

/// IKE and child SA rekey intervals for the connection from `local` to `remote`.
///
/// Exactly one side of each pair initiates rekeying: the host with the
/// lexicographically smaller address effectively disables its timers.
pub fn rekey_intervals<'a>(
    local: &str,
    remote: &str,
    config: &'a OverlayConfig,
) -> (&'a str, &'a str) {
    if local < remote {
        (DISABLED_REKEY_INTERVAL, DISABLED_REKEY_INTERVAL)
    } else {
        (
            config.ike_sa_rekey_interval.as_str(),
            config.child_sa_rekey_interval.as_str(),
        )
    }
}
