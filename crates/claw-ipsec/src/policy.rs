//! Kernel policy model and the desired-vs-live diff.
//!
//! Every membership entry maps to three tunnel-mode policies (out, in, fwd).
//! Policies are compared by a canonical string key built from direction,
//! selectors and the first template, so a live policy and a desired one are
//! "the same" only when those fields match byte for byte.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::conn::strip_prefix_len;
use crate::error::{IpsecError, Result, XfrmError};
use crate::store::Entry;
use crate::templates::REQ_ID;

/// Priority of every policy the overlay installs.
pub const POLICY_PRIORITY: u32 = 10_000;

/// Policy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Inbound.
    In,
    /// Outbound.
    Out,
    /// Forwarded.
    Fwd,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Fwd => "fwd",
        };
        f.write_str(s)
    }
}

impl FromStr for Direction {
    type Err = XfrmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "fwd" => Ok(Self::Fwd),
            other => Err(XfrmError::Parse(format!("unknown direction '{other}'"))),
        }
    }
}

/// Transform template of a policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XfrmTemplate {
    /// Tunnel source.
    pub src: IpAddr,
    /// Tunnel destination.
    pub dst: IpAddr,
    /// Transform protocol, `esp`.
    pub proto: String,
    /// Transform mode, `tunnel`.
    pub mode: String,
    /// Request id binding the policy to its SA.
    pub reqid: u32,
}

impl XfrmTemplate {
    /// An ESP tunnel template with the overlay reqid.
    #[must_use]
    pub fn esp_tunnel(src: IpAddr, dst: IpAddr) -> Self {
        Self {
            src,
            dst,
            proto: "esp".to_string(),
            mode: "tunnel".to_string(),
            reqid: REQ_ID,
        }
    }
}

/// A kernel IPsec policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XfrmPolicy {
    /// Direction.
    pub dir: Direction,
    /// Source selector, absent for "any".
    pub src: Option<IpNet>,
    /// Destination selector, absent for "any".
    pub dst: Option<IpNet>,
    /// Priority.
    pub priority: u32,
    /// Templates, the first one identifies the tunnel.
    pub tmpls: Vec<XfrmTemplate>,
}

impl XfrmPolicy {
    /// Canonical identity used by the diff.
    ///
    /// `dir-src-dst-` followed by `tmplsrc-tmpldst-reqid` when a template is
    /// present. Absent selectors are written as empty fields.
    #[must_use]
    pub fn key(&self) -> String {
        let mut key = format!(
            "{}-{}-{}-",
            self.dir,
            self.src.map(|n| n.to_string()).unwrap_or_default(),
            self.dst.map(|n| n.to_string()).unwrap_or_default(),
        );
        if let Some(tmpl) = self.tmpls.first() {
            key.push_str(&format!("{}-{}-{}", tmpl.src, tmpl.dst, tmpl.reqid));
        }
        key
    }
}

/// This host's addressing, resolved once per pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEndpoint {
    /// Endpoint address, the local tunnel template address.
    pub ip: IpAddr,
    /// Endpoint subnet.
    pub subnet: IpNet,
}

impl LocalEndpoint {
    /// Parses the local endpoint address and subnet.
    pub fn parse(ip: &str, subnet: &str) -> Result<Self> {
        let ip = parse_addr("local_ip_address", ip)?;
        let subnet = subnet
            .parse::<IpNet>()
            .map_err(|e| IpsecError::invalid_address("local_subnet", subnet, e))?
            .trunc();
        Ok(Self { ip, subnet })
    }
}

/// The out/in/fwd policies tunnelling `entry` to its host.
pub fn endpoint_policies(local: &LocalEndpoint, entry: &Entry) -> Result<[XfrmPolicy; 3]> {
    let host = parse_addr("host_ip_address", &entry.host_ip_address)?;
    let endpoint = host_route(&entry.ip_address)?;

    let policy = |dir, src, dst, tmpl| XfrmPolicy {
        dir,
        src: Some(src),
        dst: Some(dst),
        priority: POLICY_PRIORITY,
        tmpls: vec![tmpl],
    };
    let outbound = XfrmTemplate::esp_tunnel(local.ip, host);
    let inbound = XfrmTemplate::esp_tunnel(host, local.ip);

    Ok([
        policy(Direction::Out, local.subnet, endpoint, outbound),
        policy(Direction::In, endpoint, local.subnet, inbound.clone()),
        policy(Direction::Fwd, endpoint, local.subnet, inbound),
    ])
}

fn parse_addr(field: &'static str, value: &str) -> Result<IpAddr> {
    strip_prefix_len(value)
        .parse()
        .map_err(|e| IpsecError::invalid_address(field, value, e))
}

/// Narrows a CIDR to the single-address route of its address.
fn host_route(cidr: &str) -> Result<IpNet> {
    let net: IpNet = cidr
        .parse()
        .map_err(|e| IpsecError::invalid_address("ip_address", cidr, e))?;
    IpNet::new(net.addr(), net.max_prefix_len())
        .map_err(|e| IpsecError::invalid_address("ip_address", cidr, e))
}

/// Symmetric difference between live and desired policies.
#[derive(Debug, Default)]
pub struct PolicyDiff {
    existing: HashMap<String, XfrmPolicy>,
    to_add: HashMap<String, XfrmPolicy>,
    kept: usize,
}

impl PolicyDiff {
    /// Indexes the live policies by key.
    pub fn new(existing: impl IntoIterator<Item = XfrmPolicy>) -> Self {
        Self {
            existing: existing.into_iter().map(|p| (p.key(), p)).collect(),
            to_add: HashMap::new(),
            kept: 0,
        }
    }

    /// Records a desired policy: keeps a live match, otherwise queues it.
    pub fn observe(&mut self, policy: XfrmPolicy) {
        let key = policy.key();
        if self.existing.remove(&key).is_some() {
            self.kept += 1;
        } else if !self.to_add.contains_key(&key) {
            self.to_add.insert(key, policy);
        }
    }

    /// Number of live policies matched so far.
    pub fn kept(&self) -> usize {
        self.kept
    }

    /// Splits into (policies to delete, policies to add).
    pub fn into_parts(self) -> (Vec<XfrmPolicy>, Vec<XfrmPolicy>) {
        (
            self.existing.into_values().collect(),
            self.to_add.into_values().collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn local() -> LocalEndpoint {
        LocalEndpoint::parse("10.0.0.1", "10.0.0.0/24").expect("local")
    }

    fn policy(dir: Direction, src: &str, dst: &str, tsrc: &str, tdst: &str) -> XfrmPolicy {
        XfrmPolicy {
            dir,
            src: Some(src.parse().expect("src")),
            dst: Some(dst.parse().expect("dst")),
            priority: POLICY_PRIORITY,
            tmpls: vec![XfrmTemplate::esp_tunnel(
                tsrc.parse().expect("tsrc"),
                tdst.parse().expect("tdst"),
            )],
        }
    }

    #[test]
    fn test_endpoint_policies() {
        let entry = Entry::new("10.0.0.2", "10.0.0.5/32");
        let [out, inbound, fwd] = endpoint_policies(&local(), &entry).expect("policies");

        assert_eq!(out.key(), "out-10.0.0.0/24-10.0.0.5/32-10.0.0.1-10.0.0.2-1234");
        assert_eq!(inbound.key(), "in-10.0.0.5/32-10.0.0.0/24-10.0.0.2-10.0.0.1-1234");
        assert_eq!(fwd.key(), "fwd-10.0.0.5/32-10.0.0.0/24-10.0.0.2-10.0.0.1-1234");
        assert!(out.tmpls.iter().all(|t| t.mode == "tunnel" && t.proto == "esp"));
        assert_eq!(out.priority, 10_000);
    }

    #[test]
    fn test_endpoint_narrowed_to_host_route() {
        let entry = Entry::new("10.0.0.2", "10.42.3.9/16");
        let [out, ..] = endpoint_policies(&local(), &entry).expect("policies");
        assert_eq!(out.dst, Some("10.42.3.9/32".parse().expect("net")));
    }

    #[test]
    fn test_local_subnet_truncated() {
        let local = LocalEndpoint::parse("10.0.0.1", "10.0.0.17/24").expect("local");
        assert_eq!(local.subnet.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_ipv6_endpoint() {
        let local = LocalEndpoint::parse("fd00::1", "fd00::/64").expect("local");
        let entry = Entry::new("fd00:1::2", "fd00:2::5/64");
        let [out, ..] = endpoint_policies(&local, &entry).expect("policies");
        assert_eq!(out.dst.map(|n| n.prefix_len()), Some(128));
    }

    #[test]
    fn test_invalid_entry_address() {
        let err = endpoint_policies(&local(), &Entry::new("10.0.0.2", "10.0.0.5"))
            .expect_err("not a cidr");
        assert!(matches!(err, IpsecError::InvalidAddress { field: "ip_address", .. }));

        let err = endpoint_policies(&local(), &Entry::new("host-b", "10.0.0.5/32"))
            .expect_err("not an address");
        assert!(matches!(err, IpsecError::InvalidAddress { field: "host_ip_address", .. }));
    }

    #[test]
    fn test_key_absent_fields() {
        let policy = XfrmPolicy {
            dir: Direction::Out,
            src: None,
            dst: None,
            priority: 0,
            tmpls: Vec::new(),
        };
        assert_eq!(policy.key(), "out---");
    }

    #[test]
    fn test_diff_keeps_matches() {
        let a = policy(Direction::Out, "10.0.0.0/24", "10.0.1.1/32", "10.0.0.1", "10.0.1.254");
        let b = policy(Direction::Out, "10.0.0.0/24", "10.0.2.1/32", "10.0.0.1", "10.0.2.254");
        let c = policy(Direction::Out, "10.0.0.0/24", "10.0.3.1/32", "10.0.0.1", "10.0.3.254");
        let d = policy(Direction::Out, "10.0.0.0/24", "10.0.4.1/32", "10.0.0.1", "10.0.4.254");

        let mut diff = PolicyDiff::new([a.clone(), b.clone(), c.clone()]);
        for p in [b, c, d.clone()] {
            diff.observe(p);
        }
        assert_eq!(diff.kept(), 2);

        let (delete, add) = diff.into_parts();
        assert_eq!(delete, vec![a]);
        assert_eq!(add, vec![d]);
    }

    #[test]
    fn test_diff_deduplicates_desired() {
        let a = policy(Direction::In, "10.0.1.1/32", "10.0.0.0/24", "10.0.1.254", "10.0.0.1");
        let mut diff = PolicyDiff::new(Vec::new());
        diff.observe(a.clone());
        diff.observe(a);
        let (delete, add) = diff.into_parts();
        assert!(delete.is_empty());
        assert_eq!(add.len(), 1);
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("fwd".parse::<Direction>().expect("fwd"), Direction::Fwd);
        assert!("socket".parse::<Direction>().is_err());
    }

    fn arb_net() -> impl Strategy<Value = IpNet> {
        (any::<[u8; 4]>(), 8u8..=32).prop_map(|(octets, len)| {
            IpNet::new(IpAddr::from(octets), len).expect("valid prefix")
        })
    }

    fn arb_addr() -> impl Strategy<Value = IpAddr> {
        any::<[u8; 4]>().prop_map(IpAddr::from)
    }

    fn arb_policy() -> impl Strategy<Value = XfrmPolicy> {
        (
            prop_oneof![Just(Direction::In), Just(Direction::Out), Just(Direction::Fwd)],
            arb_net(),
            arb_net(),
            arb_addr(),
            arb_addr(),
            any::<u32>(),
        )
            .prop_map(|(dir, src, dst, tsrc, tdst, reqid)| {
                let mut tmpl = XfrmTemplate::esp_tunnel(tsrc, tdst);
                tmpl.reqid = reqid;
                XfrmPolicy {
                    dir,
                    src: Some(src),
                    dst: Some(dst),
                    priority: POLICY_PRIORITY,
                    tmpls: vec![tmpl],
                }
            })
    }

    proptest! {
        #[test]
        fn prop_single_field_change_changes_key(
            base in arb_policy(),
            field in 0usize..6,
            net in arb_net(),
            addr in arb_addr(),
            reqid in any::<u32>(),
        ) {
            let mut other = base.clone();
            match field {
                0 => other.dir = match base.dir {
                    Direction::In => Direction::Out,
                    Direction::Out => Direction::Fwd,
                    Direction::Fwd => Direction::In,
                },
                1 => other.src = Some(net),
                2 => other.dst = Some(net),
                3 => other.tmpls[0].src = addr,
                4 => other.tmpls[0].dst = addr,
                _ => other.tmpls[0].reqid = reqid,
            }
            let changed = match field {
                0 => true,
                1 => base.src != other.src,
                2 => base.dst != other.dst,
                3 => base.tmpls[0].src != other.tmpls[0].src,
                4 => base.tmpls[0].dst != other.tmpls[0].dst,
                _ => base.tmpls[0].reqid != other.tmpls[0].reqid,
            };
            prop_assume!(changed);
            prop_assert_ne!(base.key(), other.key());
        }

        #[test]
        fn prop_priority_does_not_affect_key(base in arb_policy(), priority in any::<u32>()) {
            let mut other = base.clone();
            other.priority = priority;
            prop_assert_eq!(base.key(), other.key());
        }
    }
}
