//! In-memory stand-ins for charon, the kernel policy table, the membership
//! store and the template source.
//!
//! These record every call so tests can assert on what a pass did, and can
//! be told to fail specific operations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::client::{ConnectionClient, RetryPolicy};
use crate::conn::{ChildSaConfig, IkeConfig, SharedKey};
use crate::error::{Result, ViciError, XfrmError};
use crate::policy::XfrmPolicy;
use crate::store::{Entry, LocalIdentity, MembershipStore};
use crate::templates::{default_child_sa_config, default_ike_config, TemplateSource};
use crate::vici::{Connector, Session};
use crate::xfrm::PolicyTable;

#[derive(Debug, Default)]
struct DaemonState {
    connections: BTreeMap<String, IkeConfig>,
    shared: Vec<SharedKey>,
    connect_attempts: usize,
    open_sessions: usize,
    list_calls: usize,
    load_shared_calls: usize,
    load_conn_calls: usize,
    unload_conn_calls: usize,
    connect_failures: u32,
    load_conn_failures: HashMap<String, u32>,
    load_shared_failures: HashSet<String>,
    unload_failures: HashSet<String>,
    fail_list: bool,
}

/// A fake charon reachable through [`FakeDaemon::connector`].
#[derive(Debug, Clone, Default)]
pub struct FakeDaemon {
    state: Arc<Mutex<DaemonState>>,
}

impl FakeDaemon {
    /// A daemon with no connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector opening sessions to this daemon.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            state: Arc::clone(&self.state),
        })
    }

    /// A client for this daemon that retries without pausing.
    pub fn client(&self) -> ConnectionClient {
        ConnectionClient::new(self.connector()).with_retry(RetryPolicy::immediate(3))
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.state.lock().connect_failures = n;
    }

    /// Makes the next `times` loads of connection `name` fail.
    pub fn fail_load_conn(&self, name: &str, times: u32) {
        self.state
            .lock()
            .load_conn_failures
            .insert(name.to_string(), times);
    }

    /// Makes every key load for `owner` fail.
    pub fn fail_load_shared(&self, owner: &str) {
        self.state
            .lock()
            .load_shared_failures
            .insert(owner.to_string());
    }

    /// Makes every unload of connection `name` fail.
    pub fn fail_unload(&self, name: &str) {
        self.state.lock().unload_failures.insert(name.to_string());
    }

    /// Makes `list-conns` fail or succeed.
    pub fn fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    /// Clears injected failures.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.connect_failures = 0;
        state.load_conn_failures.clear();
        state.load_shared_failures.clear();
        state.unload_failures.clear();
        state.fail_list = false;
    }

    /// Adds a connection as if loaded by someone else.
    pub fn insert_connection(&self, name: &str, config: IkeConfig) {
        self.state
            .lock()
            .connections
            .insert(name.to_string(), config);
    }

    /// Names of loaded connections.
    pub fn connections(&self) -> Vec<String> {
        self.state.lock().connections.keys().cloned().collect()
    }

    /// A loaded connection by name.
    pub fn connection(&self, name: &str) -> Option<IkeConfig> {
        self.state.lock().connections.get(name).cloned()
    }

    /// Every key ever loaded, in order.
    pub fn shared_keys(&self) -> Vec<SharedKey> {
        self.state.lock().shared.clone()
    }

    /// Connection attempts so far.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state.lock().open_sessions
    }

    /// `list-conns` requests so far.
    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    /// `load-shared` requests so far.
    pub fn load_shared_calls(&self) -> usize {
        self.state.lock().load_shared_calls
    }

    /// `load-conn` requests so far, failed ones included.
    pub fn load_conn_calls(&self) -> usize {
        self.state.lock().load_conn_calls
    }

    /// `unload-conn` requests so far.
    pub fn unload_conn_calls(&self) -> usize {
        self.state.lock().unload_conn_calls
    }

    /// Zeroes the request counters.
    pub fn reset_counts(&self) {
        let mut state = self.state.lock();
        state.connect_attempts = 0;
        state.list_calls = 0;
        state.load_shared_calls = 0;
        state.load_conn_calls = 0;
        state.unload_conn_calls = 0;
    }
}

fn injected(command: &str) -> ViciError {
    ViciError::CommandFailed {
        command: command.to_string(),
        message: "injected failure".to_string(),
    }
}

/// Connector handing out [`FakeSession`]s.
#[derive(Debug)]
pub struct FakeConnector {
    state: Arc<Mutex<DaemonState>>,
}

impl Connector for FakeConnector {
    fn connect(&self) -> std::result::Result<Box<dyn Session>, ViciError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(ViciError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "charon not listening",
            )));
        }
        state.open_sessions += 1;
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

/// A session on a [`FakeDaemon`].
#[derive(Debug)]
pub struct FakeSession {
    state: Arc<Mutex<DaemonState>>,
    closed: bool,
}

impl Session for FakeSession {
    fn list_conns(&mut self, ike: Option<&str>) -> std::result::Result<Vec<String>, ViciError> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.fail_list {
            return Err(injected("list-conns"));
        }
        Ok(state
            .connections
            .keys()
            .filter(|name| ike.is_none_or(|filter| filter == name.as_str()))
            .cloned()
            .collect())
    }

    fn load_shared(&mut self, key: &SharedKey) -> std::result::Result<(), ViciError> {
        let mut state = self.state.lock();
        state.load_shared_calls += 1;
        if key
            .owners
            .iter()
            .any(|owner| state.load_shared_failures.contains(owner))
        {
            return Err(injected("load-shared"));
        }
        state.shared.push(key.clone());
        Ok(())
    }

    fn load_conn(&mut self, name: &str, config: &IkeConfig) -> std::result::Result<(), ViciError> {
        let mut state = self.state.lock();
        state.load_conn_calls += 1;
        if let Some(remaining) = state.load_conn_failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(injected("load-conn"));
            }
        }
        state.connections.insert(name.to_string(), config.clone());
        Ok(())
    }

    fn unload_conn(&mut self, name: &str) -> std::result::Result<(), ViciError> {
        let mut state = self.state.lock();
        state.unload_conn_calls += 1;
        if state.unload_failures.contains(name) {
            return Err(injected("unload-conn"));
        }
        state.connections.remove(name);
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().open_sessions -= 1;
        }
    }
}

/// An in-memory policy table.
#[derive(Debug, Default)]
pub struct FakePolicyTable {
    installed: Mutex<Vec<XfrmPolicy>>,
    fail_add: Mutex<HashSet<String>>,
    fail_delete: Mutex<HashSet<String>>,
    fail_list: Mutex<bool>,
    add_calls: Mutex<usize>,
    delete_calls: Mutex<usize>,
}

impl FakePolicyTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding `policies`.
    pub fn with_policies(policies: Vec<XfrmPolicy>) -> Self {
        Self {
            installed: Mutex::new(policies),
            ..Self::default()
        }
    }

    /// Installed policies, in installation order.
    pub fn installed(&self) -> Vec<XfrmPolicy> {
        self.installed.lock().clone()
    }

    /// Keys of installed policies, sorted.
    pub fn installed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.installed.lock().iter().map(XfrmPolicy::key).collect();
        keys.sort();
        keys
    }

    /// Makes adding the policy with `key` fail.
    pub fn fail_add(&self, key: &str) {
        self.fail_add.lock().insert(key.to_string());
    }

    /// Makes deleting the policy with `key` fail.
    pub fn fail_delete(&self, key: &str) {
        self.fail_delete.lock().insert(key.to_string());
    }

    /// Makes listing fail or succeed.
    pub fn fail_list(&self, fail: bool) {
        *self.fail_list.lock() = fail;
    }

    /// Add requests so far.
    pub fn add_calls(&self) -> usize {
        *self.add_calls.lock()
    }

    /// Delete requests so far.
    pub fn delete_calls(&self) -> usize {
        *self.delete_calls.lock()
    }
}

fn ip_failed(action: &str, policy: &XfrmPolicy) -> XfrmError {
    XfrmError::CommandFailed {
        command: format!("ip xfrm policy {action} {}", policy.key()),
        stderr: "injected failure".to_string(),
    }
}

impl PolicyTable for FakePolicyTable {
    fn list(&self) -> std::result::Result<Vec<XfrmPolicy>, XfrmError> {
        if *self.fail_list.lock() {
            return Err(XfrmError::CommandFailed {
                command: "ip xfrm policy list".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(self.installed())
    }

    fn add(&self, policy: &XfrmPolicy) -> std::result::Result<(), XfrmError> {
        *self.add_calls.lock() += 1;
        if self.fail_add.lock().contains(&policy.key()) {
            return Err(ip_failed("add", policy));
        }
        self.installed.lock().push(policy.clone());
        Ok(())
    }

    fn delete(&self, policy: &XfrmPolicy) -> std::result::Result<(), XfrmError> {
        *self.delete_calls.lock() += 1;
        let key = policy.key();
        if self.fail_delete.lock().contains(&key) {
            return Err(ip_failed("delete", policy));
        }
        let mut installed = self.installed.lock();
        let before = installed.len();
        installed.retain(|p| p.key() != key);
        if installed.len() == before {
            return Err(XfrmError::CommandFailed {
                command: format!("ip xfrm policy delete {key}"),
                stderr: "No such file or directory".to_string(),
            });
        }
        Ok(())
    }
}

/// Membership held in memory. Every change bumps the version.
#[derive(Debug, Default)]
pub struct StaticStore {
    local: RwLock<LocalIdentity>,
    entries: RwLock<Vec<Entry>>,
    version: Mutex<u64>,
    reloads: Mutex<usize>,
}

impl StaticStore {
    /// A store for a host with the given addresses and no entries.
    pub fn new(host_ip_address: &str, ip_address: &str, subnet: &str) -> Self {
        Self {
            local: RwLock::new(LocalIdentity {
                host_ip_address: host_ip_address.to_string(),
                ip_address: ip_address.to_string(),
                subnet: subnet.to_string(),
            }),
            ..Self::default()
        }
    }

    /// Adds entries.
    #[must_use]
    pub fn with_entries(self, entries: Vec<Entry>) -> Self {
        self.set_entries(entries);
        self
    }

    /// Replaces the entries.
    pub fn set_entries(&self, entries: Vec<Entry>) {
        *self.entries.write() = entries;
        *self.version.lock() += 1;
    }

    /// Times `reload` was called.
    pub fn reloads(&self) -> usize {
        *self.reloads.lock()
    }
}

impl MembershipStore for StaticStore {
    fn reload(&self) -> Result<()> {
        *self.reloads.lock() += 1;
        Ok(())
    }

    fn current_version(&self) -> Result<String> {
        Ok(self.version.lock().to_string())
    }

    fn entries(&self) -> Vec<Entry> {
        self.entries.read().clone()
    }

    fn local_host_ip_address(&self) -> String {
        self.local.read().host_ip_address.clone()
    }

    fn local_ip_address(&self) -> String {
        self.local.read().ip_address.clone()
    }

    fn local_subnet(&self) -> String {
        self.local.read().subnet.clone()
    }
}

/// Handle for changing a [`StaticTemplates`] revision after it is boxed.
#[derive(Debug, Clone)]
pub struct RevisionHandle(Arc<Mutex<String>>);

impl RevisionHandle {
    /// Sets the revision picked up on the next reload.
    pub fn set(&self, revision: &str) {
        *self.0.lock() = revision.to_string();
    }
}

/// Built-in skeletons with a revision controlled by the test.
#[derive(Debug)]
pub struct StaticTemplates {
    next: Arc<Mutex<String>>,
    current: String,
    ike: IkeConfig,
    child: ChildSaConfig,
}

impl StaticTemplates {
    /// Templates at `revision`.
    pub fn new(revision: &str) -> Self {
        Self {
            next: Arc::new(Mutex::new(revision.to_string())),
            current: revision.to_string(),
            ike: default_ike_config(),
            child: default_child_sa_config(),
        }
    }

    /// Overrides the proposal lists.
    #[must_use]
    pub fn with_proposals(mut self, ike: &[&str], esp: &[&str]) -> Self {
        self.ike.proposals = ike.iter().map(ToString::to_string).collect();
        self.child.esp_proposals = esp.iter().map(ToString::to_string).collect();
        self
    }

    /// A handle for bumping the revision.
    pub fn handle(&self) -> RevisionHandle {
        RevisionHandle(Arc::clone(&self.next))
    }
}

impl TemplateSource for StaticTemplates {
    fn reload(&mut self) -> Result<()> {
        self.current = self.next.lock().clone();
        Ok(())
    }

    fn revision(&self) -> &str {
        &self.current
    }

    fn new_ike_config(&self) -> IkeConfig {
        self.ike.clone()
    }

    fn new_child_sa_config(&self) -> ChildSaConfig {
        self.child.clone()
    }
}
