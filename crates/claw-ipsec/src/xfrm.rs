//! Kernel policy table access through `ip xfrm policy`.

use std::net::IpAddr;
use std::process::Command;

use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::error::XfrmError;
use crate::policy::{Direction, XfrmPolicy, XfrmTemplate};

/// The kernel's IPsec policy database.
pub trait PolicyTable: Send + Sync {
    /// All in/out/fwd policies currently installed.
    fn list(&self) -> Result<Vec<XfrmPolicy>, XfrmError>;

    /// Installs a policy.
    fn add(&self, policy: &XfrmPolicy) -> Result<(), XfrmError>;

    /// Removes a policy, matched by selectors and direction.
    fn delete(&self, policy: &XfrmPolicy) -> Result<(), XfrmError>;
}

/// Policy table driven by the iproute2 `ip` command.
#[derive(Debug, Clone)]
pub struct IpXfrm {
    program: String,
}

impl Default for IpXfrm {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl IpXfrm {
    /// Uses `program` in place of `ip`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String, XfrmError> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| XfrmError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(XfrmError::CommandFailed {
                command: format!("{} {}", self.program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl PolicyTable for IpXfrm {
    fn list(&self) -> Result<Vec<XfrmPolicy>, XfrmError> {
        let out = self.run(&words(&["xfrm", "policy", "list"]))?;
        parse_policies(&out)
    }

    fn add(&self, policy: &XfrmPolicy) -> Result<(), XfrmError> {
        self.run(&add_args(policy)).map(|_| ())
    }

    fn delete(&self, policy: &XfrmPolicy) -> Result<(), XfrmError> {
        self.run(&delete_args(policy)).map(|_| ())
    }
}

fn words(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

fn selector_args(policy: &XfrmPolicy, args: &mut Vec<String>) {
    if let Some(src) = policy.src {
        args.extend(["src".to_string(), src.to_string()]);
    }
    if let Some(dst) = policy.dst {
        args.extend(["dst".to_string(), dst.to_string()]);
    }
    args.extend(["dir".to_string(), policy.dir.to_string()]);
}

/// Arguments for `ip xfrm policy add`.
pub fn add_args(policy: &XfrmPolicy) -> Vec<String> {
    let mut args = words(&["xfrm", "policy", "add"]);
    selector_args(policy, &mut args);
    args.extend(["priority".to_string(), policy.priority.to_string()]);
    for tmpl in &policy.tmpls {
        args.extend([
            "tmpl".to_string(),
            "src".to_string(),
            tmpl.src.to_string(),
            "dst".to_string(),
            tmpl.dst.to_string(),
            "proto".to_string(),
            tmpl.proto.clone(),
            "reqid".to_string(),
            tmpl.reqid.to_string(),
            "mode".to_string(),
            tmpl.mode.clone(),
        ]);
    }
    args
}

/// Arguments for `ip xfrm policy delete`.
pub fn delete_args(policy: &XfrmPolicy) -> Vec<String> {
    let mut args = words(&["xfrm", "policy", "delete"]);
    selector_args(policy, &mut args);
    args
}

/// Parses `ip xfrm policy list` output.
///
/// Records start on an unindented line. Socket policies and directions other
/// than in/out/fwd are skipped.
pub fn parse_policies(text: &str) -> Result<Vec<XfrmPolicy>, XfrmError> {
    let mut policies = Vec::new();
    let mut record: Vec<&str> = Vec::new();

    for line in text.lines() {
        let starts_record = line.chars().next().is_some_and(|c| !c.is_whitespace());
        if starts_record && !record.is_empty() {
            if let Some(policy) = parse_record(&record)? {
                policies.push(policy);
            }
            record.clear();
        }
        record.extend(line.split_whitespace());
    }
    if !record.is_empty() {
        if let Some(policy) = parse_record(&record)? {
            policies.push(policy);
        }
    }
    Ok(policies)
}

/// Listing keywords followed by exactly one value.
const VALUE_KEYWORDS: &[&str] = &[
    "src", "dst", "dir", "socket", "priority", "ptype", "action", "index", "proto", "spi",
    "reqid", "mode", "level", "share", "mark", "if_id", "sport", "dport", "type", "code", "uid",
];

fn parse_record(tokens: &[&str]) -> Result<Option<XfrmPolicy>, XfrmError> {
    let mut dir = None;
    let mut src = None;
    let mut dst = None;
    let mut priority = 0;
    let mut tmpls: Vec<PartialTemplate> = Vec::new();

    let mut iter = tokens.iter().copied();
    while let Some(key) = iter.next() {
        if key == "tmpl" {
            tmpls.push(PartialTemplate::default());
            continue;
        }
        // Flags (`flag localok icmp`) and other bare words take no value.
        if !VALUE_KEYWORDS.contains(&key) {
            continue;
        }
        let Some(value) = iter.next() else {
            break;
        };
        match (key, tmpls.last_mut()) {
            ("socket", _) => return Ok(None),
            ("dir", _) => match value.parse::<Direction>() {
                Ok(d) => dir = Some(d),
                Err(_) => return Ok(None),
            },
            ("priority", _) => {
                priority = value
                    .parse()
                    .map_err(|_| XfrmError::Parse(format!("bad priority '{value}'")))?;
            }
            ("src", None) => src = Some(parse_net(value)?),
            ("dst", None) => dst = Some(parse_net(value)?),
            ("src", Some(t)) => t.src = Some(parse_ip(value)?),
            ("dst", Some(t)) => t.dst = Some(parse_ip(value)?),
            ("proto", Some(t)) => t.proto = value.to_string(),
            ("mode", Some(t)) => t.mode = value.to_string(),
            ("reqid", Some(t)) => {
                t.reqid = value
                    .parse()
                    .map_err(|_| XfrmError::Parse(format!("bad reqid '{value}'")))?;
            }
            _ => {}
        }
    }

    let Some(dir) = dir else {
        return Ok(None);
    };
    let tmpls = tmpls
        .into_iter()
        .map(PartialTemplate::finish)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(XfrmPolicy {
        dir,
        src,
        dst,
        priority,
        tmpls,
    }))
}

#[derive(Default)]
struct PartialTemplate {
    src: Option<IpAddr>,
    dst: Option<IpAddr>,
    proto: String,
    mode: String,
    reqid: u32,
}

impl PartialTemplate {
    fn finish(self) -> Result<XfrmTemplate, XfrmError> {
        match (self.src, self.dst) {
            (Some(src), Some(dst)) => Ok(XfrmTemplate {
                src,
                dst,
                proto: self.proto,
                mode: self.mode,
                reqid: self.reqid,
            }),
            _ => Err(XfrmError::Parse("template without src/dst".to_string())),
        }
    }
}

fn parse_net(value: &str) -> Result<IpNet, XfrmError> {
    value
        .parse::<IpNet>()
        .or_else(|_| value.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| XfrmError::Parse(format!("bad selector '{value}'")))
}

fn parse_ip(value: &str) -> Result<IpAddr, XfrmError> {
    value
        .parse()
        .map_err(|_| XfrmError::Parse(format!("bad address '{value}'")))
}

/// Removes every policy, returning how many were removed or the last failure.
pub fn delete_policies(table: &dyn PolicyTable, policies: &[XfrmPolicy]) -> Result<usize, XfrmError> {
    apply_each(policies, "delete", |p| table.delete(p))
}

/// Installs every policy, returning how many were installed or the last failure.
pub fn add_policies(table: &dyn PolicyTable, policies: &[XfrmPolicy]) -> Result<usize, XfrmError> {
    apply_each(policies, "add", |p| table.add(p))
}

fn apply_each<F>(policies: &[XfrmPolicy], action: &'static str, mut apply: F) -> Result<usize, XfrmError>
where
    F: FnMut(&XfrmPolicy) -> Result<(), XfrmError>,
{
    let mut applied = 0;
    let mut last_err = None;
    for policy in policies {
        match apply(policy) {
            Ok(()) => {
                applied += 1;
                info!(action, policy = %policy.key(), "xfrm policy applied");
            }
            Err(e) => {
                warn!(action, policy = %policy.key(), error = %e, "xfrm policy failed");
                last_err = Some(e);
            }
        }
    }
    debug!(action, applied, total = policies.len(), "xfrm batch done");
    match last_err {
        Some(e) => Err(e),
        None => Ok(applied),
    }
}
