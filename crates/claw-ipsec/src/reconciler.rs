//! The convergence pass.
//!
//! A pass computes the desired connections and kernel policies from the
//! membership snapshot, pushes what is missing, and only removes what is no
//! longer wanted when every entry went through cleanly. A partially failed
//! pass therefore adds what it can and never tears anything down.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::client::ConnectionClient;
use crate::config::OverlayConfig;
use crate::conn::CONN_PREFIX;
use crate::error::{IpsecError, Result, ViciError};
use crate::lifecycle::WILDCARD_IDENTITY;
use crate::policy::{endpoint_policies, LocalEndpoint, PolicyDiff};
use crate::store::{Entry, MembershipStore};
use crate::templates::TemplateSource;
use crate::xfrm::{add_policies, delete_policies, PolicyTable};

pub use crate::lifecycle::OverlayState;

/// What a successful pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// `load-shared` requests made.
    pub keys_loaded: usize,
    /// Connections (re)loaded.
    pub connections_loaded: usize,
    /// Kernel policies installed.
    pub policies_added: usize,
    /// Kernel policies removed.
    pub policies_deleted: usize,
    /// Kernel policies already in place.
    pub policies_kept: usize,
    /// Stale connections unloaded.
    pub hosts_removed: usize,
    /// Stale keys dropped from the cache.
    pub keys_forgotten: usize,
}

impl PassReport {
    /// Whether the pass changed nothing in charon or the kernel.
    pub fn is_noop(&self) -> bool {
        self.keys_loaded == 0
            && self.connections_loaded == 0
            && self.policies_added == 0
            && self.policies_deleted == 0
            && self.hosts_removed == 0
    }
}

/// Converges charon and the kernel policy table on the membership list.
pub struct Reconciler {
    config: OverlayConfig,
    store: Arc<dyn MembershipStore>,
    policies: Arc<dyn PolicyTable>,
    client: ConnectionClient,
    state: Mutex<OverlayState>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler. Nothing is pushed until the first pass.
    pub fn new(
        config: OverlayConfig,
        store: Arc<dyn MembershipStore>,
        policies: Arc<dyn PolicyTable>,
        client: ConnectionClient,
        templates: Box<dyn TemplateSource>,
    ) -> Self {
        Self {
            config,
            store,
            policies,
            client,
            state: Mutex::new(OverlayState::new(templates)),
        }
    }

    /// Overlay configuration.
    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Membership source.
    pub fn store(&self) -> &Arc<dyn MembershipStore> {
        &self.store
    }

    /// Refreshes membership and the shared secret, then runs a pass.
    pub fn reload(&self) -> Result<PassReport> {
        self.store.reload()?;
        let psk = read_psk(&self.config.psk_path())?;

        let mut state = self.state.lock();
        state.set_psk(psk);
        self.configure_locked(&mut state)
    }

    /// Runs a pass with the current membership and secret.
    pub fn configure(&self) -> Result<PassReport> {
        let mut state = self.state.lock();
        self.configure_locked(&mut state)
    }

    fn configure_locked(&self, state: &mut OverlayState) -> Result<PassReport> {
        info!("reconfiguring");
        state.templates_mut().reload()?;

        let local_host = self.store.local_host_ip_address();
        let mut report = PassReport::default();
        let mut first_err: Option<IpsecError> = None;

        // Without a usable local endpoint no policy can be computed, but keys
        // and connections are still loaded.
        let local = match LocalEndpoint::parse(&self.store.local_ip_address(), &self.store.local_subnet()) {
            Ok(local) => Some(local),
            Err(e) => {
                error!(error = %e, "invalid local endpoint");
                first_err = Some(e);
                None
            }
        };

        let existing = match self.policies.list() {
            Ok(existing) => existing,
            Err(e) => {
                error!(error = %e, "failed to list xfrm policies");
                keep_first(&mut first_err, e.into());
                Vec::new()
            }
        };
        let mut diff = PolicyDiff::new(existing);

        state.begin_pass();
        match state.load_shared_key(&self.client, WILDCARD_IDENTITY) {
            Ok(loaded) => report.keys_loaded += usize::from(loaded),
            Err(e) => keep_first(&mut first_err, e),
        }

        let mut hosts_done = HashSet::new();
        for entry in self.store.entries() {
            if entry.host_ip_address == local_host {
                continue;
            }

            if entry.peer {
                match state.load_shared_key(&self.client, &entry.ip_address) {
                    Ok(loaded) => report.keys_loaded += usize::from(loaded),
                    Err(e) => keep_first(&mut first_err, e),
                }
            }

            if !hosts_done.contains(&entry.host_ip_address) {
                match self.add_host(state, &local_host, &entry, &mut report) {
                    Ok(()) => {
                        hosts_done.insert(entry.host_ip_address.clone());
                    }
                    Err(e) => keep_first(&mut first_err, e),
                }
            }

            let Some(local) = &local else {
                continue;
            };
            match endpoint_policies(local, &entry) {
                Ok(policies) => policies.into_iter().for_each(|p| diff.observe(p)),
                Err(e) => {
                    error!(
                        host = %entry.host_ip_address,
                        ip = %entry.ip_address,
                        error = %e,
                        "failed to compute policies"
                    );
                    keep_first(&mut first_err, e);
                }
            }
        }
        report.policies_kept = diff.kept();

        if let Some(e) = first_err {
            warn!(error = %e, "pass incomplete, skipping cleanup");
            return Err(e);
        }

        // A failed delete must not keep new policies out.
        let (stale, missing) = diff.into_parts();
        let deleted = delete_policies(self.policies.as_ref(), &stale);
        let added = add_policies(self.policies.as_ref(), &missing);
        report.policies_deleted = deleted?;
        report.policies_added = added?;
        report.hosts_removed = state.remove_hosts(&self.client)?;
        report.keys_forgotten = state.forget_stale_keys();

        info!(
            keys_loaded = report.keys_loaded,
            connections_loaded = report.connections_loaded,
            policies_added = report.policies_added,
            policies_deleted = report.policies_deleted,
            policies_kept = report.policies_kept,
            hosts_removed = report.hosts_removed,
            "reconfigured"
        );
        Ok(report)
    }

    fn add_host(
        &self,
        state: &mut OverlayState,
        local_host: &str,
        entry: &Entry,
        report: &mut PassReport,
    ) -> Result<()> {
        if state.load_shared_key(&self.client, &entry.host_ip_address)? {
            report.keys_loaded += 1;
        }
        if state.add_host_connection(&self.client, &self.config, local_host, entry)? {
            report.connections_loaded += 1;
        }
        Ok(())
    }

    /// Seeds the host cache from the `conn-*` connections charon already has.
    ///
    /// Seeded hosts count as loaded at the current template revision, so a
    /// restart of this process does not reload every connection.
    pub fn load_existing_connections(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let names = {
            let mut session = self.client.session()?;
            session.list_conns(None)?
        };

        state.clear_hosts();
        let mut found = 0;
        for host in names.iter().filter_map(|n| n.strip_prefix(CONN_PREFIX)) {
            info!(host, "found existing connection");
            state.seed_host(host);
            found += 1;
        }
        Ok(found)
    }

    /// Checks that charon answers.
    pub fn probe(&self) -> std::result::Result<(), ViciError> {
        self.client.probe()
    }

    /// Runs `f` while holding the pass lock, so no pass runs concurrently.
    pub fn while_locked<R>(&self, f: impl FnOnce(&ConnectionClient) -> R) -> R {
        let _state = self.state.lock();
        f(&self.client)
    }

    /// Hosts with a loaded connection, sorted.
    pub fn cached_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.state.lock().hosts().keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Peers with a loaded key, sorted.
    pub fn cached_key_owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self
            .state
            .lock()
            .key_owners()
            .map(ToString::to_string)
            .collect();
        owners.sort();
        owners
    }
}

fn keep_first(first: &mut Option<IpsecError>, err: IpsecError) {
    if first.is_none() {
        *first = Some(err);
    } else {
        warn!(error = %err, "additional pass error");
    }
}

fn read_psk(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|source| IpsecError::Psk {
            path: path.to_path_buf(),
            source,
        })
}
