//! Integration tests for full reconciliation passes.

use std::sync::Arc;

use claw_ipsec::config::OverlayConfig;
use claw_ipsec::policy::{endpoint_policies, LocalEndpoint};
use claw_ipsec::testing::{FakeDaemon, FakePolicyTable, RevisionHandle, StaticStore, StaticTemplates};
use claw_ipsec::{Entry, IpsecError, Reconciler};

struct Cluster {
    daemon: FakeDaemon,
    table: Arc<FakePolicyTable>,
    store: Arc<StaticStore>,
    revision: RevisionHandle,
    reconciler: Reconciler,
    _dir: tempfile::TempDir,
}

fn cluster(local_host: &str, entries: Vec<Entry>, config: impl FnOnce(OverlayConfig) -> OverlayConfig) -> Cluster {
    cluster_with(local_host, entries, config, FakePolicyTable::new(), StaticTemplates::new("r1"))
}

fn cluster_with(
    local_host: &str,
    entries: Vec<Entry>,
    config: impl FnOnce(OverlayConfig) -> OverlayConfig,
    table: FakePolicyTable,
    templates: StaticTemplates,
) -> Cluster {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("psk.txt"), "cluster-secret\n").expect("psk");

    let daemon = FakeDaemon::new();
    let table = Arc::new(table);
    let store = Arc::new(StaticStore::new(local_host, local_host, "10.0.0.0/24").with_entries(entries));
    let revision = templates.handle();
    let reconciler = Reconciler::new(
        config(OverlayConfig::new(dir.path())),
        store.clone(),
        table.clone(),
        daemon.client(),
        Box::new(templates),
    );
    Cluster {
        daemon,
        table,
        store,
        revision,
        reconciler,
        _dir: dir,
    }
}

fn keys(entries: &[Entry]) -> Vec<String> {
    let local = LocalEndpoint::parse("10.0.0.1", "10.0.0.0/24").expect("local");
    let mut keys: Vec<String> = entries
        .iter()
        .flat_map(|e| endpoint_policies(&local, e).expect("policies"))
        .map(|p| p.key())
        .collect();
    keys.sort();
    keys
}

#[test]
fn test_single_peer_end_to_end() {
    let c = cluster(
        "10.0.0.1",
        vec![
            Entry::new("10.0.0.1", "10.0.0.3/32"),
            Entry::new("10.0.0.2", "10.0.0.5/32"),
        ],
        |c| c,
    );

    let report = c.reconciler.reload().expect("reload");

    assert_eq!(c.daemon.connections(), vec!["conn-10.0.0.2".to_string()]);
    let conn = c.daemon.connection("conn-10.0.0.2").expect("connection");
    let child = conn.children.get("child-10.0.0.2").expect("child");
    assert_eq!(child.reqid, "1234");
    assert_eq!(conn.remote_addrs, vec!["10.0.0.2".to_string()]);

    assert_eq!(report.policies_added, 3);
    assert_eq!(
        c.table.installed_keys(),
        vec![
            "fwd-10.0.0.5/32-10.0.0.0/24-10.0.0.2-10.0.0.1-1234".to_string(),
            "in-10.0.0.5/32-10.0.0.0/24-10.0.0.2-10.0.0.1-1234".to_string(),
            "out-10.0.0.0/24-10.0.0.5/32-10.0.0.1-10.0.0.2-1234".to_string(),
        ]
    );
    assert!(c.table.installed().iter().all(|p| p.priority == 10_000));
    assert_eq!(c.daemon.open_sessions(), 0);
}

#[test]
fn test_second_pass_is_idempotent() {
    let c = cluster(
        "10.0.0.1",
        vec![
            Entry::new("10.0.0.2", "10.0.0.5/32").as_peer(),
            Entry::new("10.0.0.3", "10.0.0.6/32"),
        ],
        |c| c,
    );
    c.reconciler.reload().expect("first pass");
    c.daemon.reset_counts();
    let adds = c.table.add_calls();

    let report = c.reconciler.reload().expect("second pass");

    assert!(report.is_noop());
    assert_eq!(report.policies_kept, 6);
    assert_eq!(c.daemon.load_shared_calls(), 0);
    assert_eq!(c.daemon.load_conn_calls(), 0);
    assert_eq!(c.daemon.unload_conn_calls(), 0);
    assert_eq!(c.table.add_calls(), adds);
    assert_eq!(c.table.delete_calls(), 0);
}

#[test]
fn test_policy_diff_against_live_table() {
    let a = Entry::new("10.0.0.2", "10.0.1.1/32");
    let b = Entry::new("10.0.0.3", "10.0.2.1/32");
    let c_entry = Entry::new("10.0.0.4", "10.0.3.1/32");
    let d = Entry::new("10.0.0.5", "10.0.4.1/32");

    let first = cluster("10.0.0.1", vec![a.clone(), b.clone(), c_entry.clone()], |c| c);
    first.reconciler.reload().expect("seed table");
    let live = first.table.installed();

    let c = cluster_with(
        "10.0.0.1",
        vec![b.clone(), c_entry.clone(), d.clone()],
        |c| c,
        FakePolicyTable::with_policies(live),
        StaticTemplates::new("r1"),
    );
    let report = c.reconciler.reload().expect("reload");

    assert_eq!(report.policies_deleted, 3);
    assert_eq!(report.policies_added, 3);
    assert_eq!(report.policies_kept, 6);
    assert_eq!(c.table.installed_keys(), keys(&[b, c_entry, d]));
    let removed = keys(&[a]);
    assert!(c.table.installed_keys().iter().all(|k| !removed.contains(k)));
}

#[test]
fn test_unlistable_table_still_loads_connections() {
    let c = cluster("10.0.0.1", vec![Entry::new("10.0.0.2", "10.0.0.5/32")], |c| c);
    c.table.fail_list(true);

    let err = c.reconciler.reload().expect_err("listing fails");
    assert!(matches!(err, IpsecError::Xfrm(_)));
    assert_eq!(c.daemon.connections(), vec!["conn-10.0.0.2".to_string()]);
    assert_eq!(c.table.add_calls(), 0);
    assert_eq!(c.table.delete_calls(), 0);

    c.table.fail_list(false);
    let report = c.reconciler.reload().expect("recovered");
    assert_eq!(report.policies_added, 3);
    assert_eq!(report.connections_loaded, 0);
}

#[test]
fn test_failed_entry_blocks_cleanup() {
    let c = cluster(
        "10.0.0.1",
        vec![
            Entry::new("10.0.0.2", "10.0.0.5/32"),
            Entry::new("10.0.0.3", "10.0.0.6/32"),
        ],
        |c| c,
    );
    c.reconciler.reload().expect("first pass");
    let before = c.table.installed_keys();

    // Host 10.0.0.3 leaves, a new entry arrives malformed.
    c.store.set_entries(vec![
        Entry::new("10.0.0.2", "10.0.0.5/32"),
        Entry::new("10.0.0.4", "10.0.0.7"),
    ]);
    let err = c.reconciler.reload().expect_err("malformed entry");
    assert!(matches!(err, IpsecError::InvalidAddress { .. }));

    assert_eq!(c.daemon.unload_conn_calls(), 0);
    assert_eq!(c.table.delete_calls(), 0);
    assert_eq!(c.table.installed_keys(), before);
    assert!(c.reconciler.cached_hosts().contains(&"10.0.0.3".to_string()));
    // The healthy new host still got its connection.
    assert!(c.daemon.connections().contains(&"conn-10.0.0.4".to_string()));
}

#[test]
fn test_connection_failure_blocks_cleanup_then_recovers() {
    let c = cluster(
        "10.0.0.1",
        vec![
            Entry::new("10.0.0.2", "10.0.0.5/32"),
            Entry::new("10.0.0.3", "10.0.0.6/32"),
        ],
        |c| c,
    );
    c.reconciler.reload().expect("first pass");

    c.store.set_entries(vec![Entry::new("10.0.0.4", "10.0.0.7/32")]);
    c.daemon.fail_load_conn("conn-10.0.0.4", 5);
    let err = c.reconciler.reload().expect_err("load-conn fails");
    assert!(matches!(err, IpsecError::ConnectionLoad { ref host, .. } if host == "10.0.0.4"));
    assert_eq!(c.daemon.unload_conn_calls(), 0);
    assert_eq!(c.table.delete_calls(), 0);

    c.daemon.heal();
    let report = c.reconciler.reload().expect("recovered");
    assert_eq!(report.hosts_removed, 2);
    assert_eq!(report.policies_deleted, 6);
    assert_eq!(c.daemon.connections(), vec!["conn-10.0.0.4".to_string()]);
    assert_eq!(c.reconciler.cached_hosts(), vec!["10.0.0.4".to_string()]);
}

#[test]
fn test_departed_host_removed() {
    let c = cluster(
        "10.0.0.1",
        vec![
            Entry::new("10.0.0.2", "10.0.0.5/32").as_peer(),
            Entry::new("10.0.0.3", "10.0.0.6/32"),
        ],
        |c| c,
    );
    c.reconciler.reload().expect("first pass");

    c.store.set_entries(vec![Entry::new("10.0.0.3", "10.0.0.6/32")]);
    let report = c.reconciler.reload().expect("second pass");

    assert_eq!(report.hosts_removed, 1);
    assert_eq!(report.policies_deleted, 3);
    assert_eq!(report.keys_forgotten, 2);
    assert_eq!(c.daemon.connections(), vec!["conn-10.0.0.3".to_string()]);
    assert_eq!(
        c.reconciler.cached_key_owners(),
        vec!["%any".to_string(), "10.0.0.3".to_string()]
    );
}

#[test]
fn test_revision_change_reloads_connections() {
    let c = cluster("10.0.0.1", vec![Entry::new("10.0.0.2", "10.0.0.5/32")], |c| c);
    c.reconciler.reload().expect("first pass");
    c.daemon.reset_counts();

    c.revision.set("r2");
    let report = c.reconciler.reload().expect("second pass");
    assert_eq!(report.connections_loaded, 1);
    assert_eq!(report.keys_loaded, 0);
    assert_eq!(c.daemon.load_conn_calls(), 1);
}

#[test]
fn test_psk_change_reloads_keys() {
    let c = cluster("10.0.0.1", vec![Entry::new("10.0.0.2", "10.0.0.5/32")], |c| c);
    c.reconciler.reload().expect("first pass");
    c.daemon.reset_counts();

    std::fs::write(c.reconciler.config().psk_path(), "rotated").expect("psk");
    let report = c.reconciler.reload().expect("second pass");
    assert_eq!(report.keys_loaded, 2);
    assert!(c.daemon.shared_keys().iter().rev().take(2).all(|k| k.data == "rotated"));
}

#[test]
fn test_blacklisted_proposals_never_submitted() {
    let templates = StaticTemplates::new("r1").with_proposals(
        &["aes128-sha1-modp2048", "aes256-sha256-modp2048", "3des-md5-modp1024"],
        &["aes128gcm16-modp2048", "3des-sha1", "3desx"],
    );
    let c = cluster_with(
        "10.0.0.1",
        vec![Entry::new("10.0.0.2", "10.0.0.5/32")],
        |c| c.with_blacklist(["3des", "aes128-sha1"]),
        FakePolicyTable::new(),
        templates,
    );
    c.reconciler.reload().expect("reload");

    let conn = c.daemon.connection("conn-10.0.0.2").expect("connection");
    assert_eq!(conn.proposals, vec!["aes256-sha256-modp2048".to_string()]);
    let child = conn.children.get("child-10.0.0.2").expect("child");
    assert_eq!(child.esp_proposals, vec!["aes128gcm16-modp2048".to_string()]);
}

#[test]
fn test_rekey_roles_agree_across_views() {
    let configure = |c: OverlayConfig| c.with_rekey_intervals("3h", "45m");
    let x = cluster("10.0.0.1", vec![Entry::new("10.0.0.2", "10.0.1.5/32")], configure);
    let y = cluster("10.0.0.2", vec![Entry::new("10.0.0.1", "10.0.0.5/32")], configure);
    x.reconciler.reload().expect("x pass");
    y.reconciler.reload().expect("y pass");

    let x_conn = x.daemon.connection("conn-10.0.0.2").expect("x view");
    let y_conn = y.daemon.connection("conn-10.0.0.1").expect("y view");

    assert_eq!(x_conn.rekey_time, "8760h");
    assert_eq!(x_conn.children["child-10.0.0.2"].rekey_time, "8760h");
    assert_eq!(y_conn.rekey_time, "3h");
    assert_eq!(y_conn.children["child-10.0.0.1"].rekey_time, "45m");
}

#[test]
fn test_unreachable_daemon_fails_pass_without_cleanup() {
    let c = cluster("10.0.0.1", vec![Entry::new("10.0.0.2", "10.0.0.5/32")], |c| c);
    c.reconciler.reload().expect("first pass");

    c.store.set_entries(Vec::new());
    c.daemon.fail_connects(100);
    std::fs::write(c.reconciler.config().psk_path(), "rotated").expect("psk");
    let err = c.reconciler.reload().expect_err("daemon down");
    assert!(matches!(err, IpsecError::KeyLoad { ref peer, .. } if peer == "%any"));
    assert_eq!(c.table.delete_calls(), 0);
    assert_eq!(c.reconciler.cached_hosts(), vec!["10.0.0.2".to_string()]);
}
