//! Connection and key definitions submitted to charon.
//!
//! These mirror the `load-conn` / `load-shared` request layouts. Only
//! non-empty fields are sent, so charon's own defaults apply to anything a
//! template leaves blank.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::vici::Message;

/// Prefix of every connection this process manages.
pub const CONN_PREFIX: &str = "conn-";

/// Prefix of every child SA this process manages.
pub const CHILD_PREFIX: &str = "child-";

/// Connection name for a remote host.
#[must_use]
pub fn conn_name(host: &str) -> String {
    format!("{CONN_PREFIX}{}", strip_prefix_len(host))
}

/// Child SA name for a remote host.
#[must_use]
pub fn child_name(host: &str) -> String {
    format!("{CHILD_PREFIX}{}", strip_prefix_len(host))
}

/// Drops a trailing `/len` from an address.
#[must_use]
pub fn strip_prefix_len(address: &str) -> &str {
    address.split('/').next().unwrap_or(address)
}

/// Authentication round of an IKE connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Authentication method, e.g. `psk`.
    pub auth: String,
    /// Identity to use or expect.
    pub id: String,
}

impl AuthConfig {
    /// Pre-shared key authentication.
    #[must_use]
    pub fn psk() -> Self {
        Self {
            auth: "psk".to_string(),
            id: String::new(),
        }
    }

    fn to_message(&self) -> Message {
        let mut message = Message::new();
        message = put(message, "auth", &self.auth);
        put(message, "id", &self.id)
    }
}

/// Child SA section of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildSaConfig {
    /// Local traffic selectors.
    pub local_ts: Vec<String>,
    /// Remote traffic selectors.
    pub remote_ts: Vec<String>,
    /// ESP proposals in preference order.
    pub esp_proposals: Vec<String>,
    /// Action after loading (`none`, `trap`, `start`).
    pub start_action: String,
    /// Action when the peer closes the SA.
    pub close_action: String,
    /// Action on dead peer detection.
    pub dpd_action: String,
    /// Fixed reqid binding the SA to kernel policies.
    pub reqid: String,
    /// Rekey interval.
    pub rekey_time: String,
    /// Replay window size.
    pub replay_window: String,
    /// IPsec mode.
    pub mode: String,
    /// Whether charon installs its own policies (`yes`/`no`).
    pub policies: String,
}

impl ChildSaConfig {
    /// Encodes the child SA for a `load-conn` request.
    #[must_use]
    pub fn to_message(&self) -> Message {
        let mut message = Message::new();
        message = put_list(message, "local_ts", &self.local_ts);
        message = put_list(message, "remote_ts", &self.remote_ts);
        message = put_list(message, "esp_proposals", &self.esp_proposals);
        message = put(message, "start_action", &self.start_action);
        message = put(message, "close_action", &self.close_action);
        message = put(message, "dpd_action", &self.dpd_action);
        message = put(message, "reqid", &self.reqid);
        message = put(message, "rekey_time", &self.rekey_time);
        message = put(message, "replay_window", &self.replay_window);
        message = put(message, "mode", &self.mode);
        put(message, "policies", &self.policies)
    }
}

/// IKE connection definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IkeConfig {
    /// Local addresses to accept/initiate on.
    pub local_addrs: Vec<String>,
    /// Remote peer addresses.
    pub remote_addrs: Vec<String>,
    /// IKE proposals in preference order.
    pub proposals: Vec<String>,
    /// IKE major version.
    pub version: String,
    /// Force UDP encapsulation.
    pub encap: String,
    /// Number of keying attempts, `0` retries forever.
    pub keyingtries: String,
    /// Rekey interval.
    pub rekey_time: String,
    /// Dead peer detection interval.
    pub dpd_delay: String,
    /// Local authentication round.
    pub local_auth: AuthConfig,
    /// Remote authentication round.
    pub remote_auth: AuthConfig,
    /// Child SAs by name.
    #[serde(skip)]
    pub children: BTreeMap<String, ChildSaConfig>,
}

impl IkeConfig {
    /// Encodes the connection body for a `load-conn` request.
    #[must_use]
    pub fn to_message(&self) -> Message {
        let mut message = Message::new();
        message = put_list(message, "local_addrs", &self.local_addrs);
        message = put_list(message, "remote_addrs", &self.remote_addrs);
        message = put_list(message, "proposals", &self.proposals);
        message = put(message, "version", &self.version);
        message = put(message, "encap", &self.encap);
        message = put(message, "keyingtries", &self.keyingtries);
        message = put(message, "rekey_time", &self.rekey_time);
        message = put(message, "dpd_delay", &self.dpd_delay);
        message = message
            .with_section("local", self.local_auth.to_message())
            .with_section("remote", self.remote_auth.to_message());

        let children = self
            .children
            .iter()
            .fold(Message::new(), |acc, (name, child)| {
                acc.with_section(name.clone(), child.to_message())
            });
        message.with_section("children", children)
    }
}

/// A shared secret and the identities it applies to.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey {
    /// Key type, `IKE` for pre-shared keys.
    pub kind: String,
    /// Secret material.
    pub data: String,
    /// Identities owning the secret.
    pub owners: Vec<String>,
}

impl SharedKey {
    /// An IKE pre-shared key owned by a single identity.
    #[must_use]
    pub fn ike(data: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            kind: "IKE".to_string(),
            data: data.into(),
            owners: vec![owner.into()],
        }
    }

    /// Encodes the key for a `load-shared` request.
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message::new()
            .with_value("type", self.kind.clone())
            .with_value("data", self.data.clone())
            .with_list("owners", self.owners.iter().cloned())
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKey")
            .field("kind", &self.kind)
            .field("data", &"[REDACTED]")
            .field("owners", &self.owners)
            .finish()
    }
}

fn put(message: Message, key: &str, value: &str) -> Message {
    if value.is_empty() {
        message
    } else {
        message.with_value(key, value)
    }
}

fn put_list(message: Message, key: &str, values: &[String]) -> Message {
    if values.is_empty() {
        message
    } else {
        message.with_list(key, values.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_strip_prefix_len() {
        assert_eq!(conn_name("10.0.0.2"), "conn-10.0.0.2");
        assert_eq!(conn_name("10.0.0.2/32"), "conn-10.0.0.2");
        assert_eq!(child_name("10.0.0.2"), "child-10.0.0.2");
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let child = ChildSaConfig {
            reqid: "1234".to_string(),
            ..ChildSaConfig::default()
        };
        let message = child.to_message();
        assert_eq!(message.keys().collect::<Vec<_>>(), vec!["reqid"]);
    }

    #[test]
    fn test_ike_message_nests_children() {
        let mut ike = IkeConfig {
            remote_addrs: vec!["10.0.0.2".to_string()],
            local_auth: AuthConfig::psk(),
            remote_auth: AuthConfig::psk(),
            ..IkeConfig::default()
        };
        ike.children.insert(
            child_name("10.0.0.2"),
            ChildSaConfig {
                mode: "tunnel".to_string(),
                ..ChildSaConfig::default()
            },
        );

        let message = ike.to_message();
        assert_eq!(message.list("remote_addrs"), Some(&["10.0.0.2".to_string()][..]));
        assert_eq!(message.section("local").and_then(|m| m.value("auth")), Some("psk"));
        let child = message
            .section("children")
            .and_then(|c| c.section("child-10.0.0.2"))
            .expect("child present");
        assert_eq!(child.value("mode"), Some("tunnel"));
    }

    #[test]
    fn test_shared_key_debug_redacts_data() {
        let key = SharedKey::ike("s3cret", "10.0.0.2");
        let debug = format!("{key:?}");
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("10.0.0.2"));
    }

    #[test]
    fn test_shared_key_message() {
        let message = SharedKey::ike("s3cret", "%any").to_message();
        assert_eq!(message.value("type"), Some("IKE"));
        assert_eq!(message.value("data"), Some("s3cret"));
        assert_eq!(message.list("owners"), Some(&["%any".to_string()][..]));
    }

    #[test]
    fn test_template_override_parses_partial_json() {
        let child: ChildSaConfig =
            serde_json::from_str(r#"{"esp_proposals": ["aes256gcm16"], "mode": "tunnel"}"#)
                .expect("parse");
        assert_eq!(child.esp_proposals, vec!["aes256gcm16".to_string()]);
        assert!(child.reqid.is_empty());
    }
}
