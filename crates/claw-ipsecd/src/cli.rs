//! Command line flags.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use claw_ipsec::config::{
    DEFAULT_CHILD_SA_REKEY_INTERVAL, DEFAULT_IKE_SA_REKEY_INTERVAL, DEFAULT_PID_FILE,
    DEFAULT_REPLAY_WINDOW_SIZE, DEFAULT_VICI_SOCKET,
};
use claw_ipsec::{OverlayConfig, SupervisorMode};

/// Flags for `claw-ipsecd`. Every flag can also come from a `CLAW_IPSEC_*`
/// environment variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "claw-ipsecd")]
#[command(about = "Clawbernetes IPsec overlay agent")]
#[command(version)]
pub struct Cli {
    /// Address for the ping and reload endpoints
    #[arg(long, env = "CLAW_IPSEC_LISTEN", default_value = "127.0.0.1:4510")]
    pub listen: SocketAddr,

    /// Directory holding psk.txt and template overrides
    #[arg(long, env = "CLAW_IPSEC_CONFIG_DIR", default_value = "/etc/ipsec")]
    pub config_dir: PathBuf,

    /// Membership document
    #[arg(
        long,
        env = "CLAW_IPSEC_MEMBERSHIP_FILE",
        default_value = "/etc/ipsec/members.json"
    )]
    pub membership_file: PathBuf,

    /// Start charon as a child instead of watching an existing one
    #[arg(long, env = "CLAW_IPSEC_CHARON_LAUNCH")]
    pub charon_launch: bool,

    /// Append charon output to this file (launch mode only)
    #[arg(long, env = "CLAW_IPSEC_CHARON_LOG")]
    pub charon_log: Option<PathBuf>,

    /// Charon executable (launch mode only)
    #[arg(long, env = "CLAW_IPSEC_CHARON_PROGRAM", default_value = "charon")]
    pub charon_program: PathBuf,

    /// Charon control socket
    #[arg(long, env = "CLAW_IPSEC_VICI_SOCKET", default_value = DEFAULT_VICI_SOCKET)]
    pub vici_socket: PathBuf,

    /// Charon pid file
    #[arg(long, env = "CLAW_IPSEC_PID_FILE", default_value = DEFAULT_PID_FILE)]
    pub pid_file: PathBuf,

    /// IKE SA rekey interval
    #[arg(
        long,
        env = "CLAW_IPSEC_IKE_SA_REKEY_INTERVAL",
        default_value = DEFAULT_IKE_SA_REKEY_INTERVAL
    )]
    pub ike_sa_rekey_interval: String,

    /// Child SA rekey interval
    #[arg(
        long,
        env = "CLAW_IPSEC_CHILD_SA_REKEY_INTERVAL",
        default_value = DEFAULT_CHILD_SA_REKEY_INTERVAL
    )]
    pub child_sa_rekey_interval: String,

    /// Child SA replay window size
    #[arg(
        long,
        env = "CLAW_IPSEC_REPLAY_WINDOW_SIZE",
        default_value = DEFAULT_REPLAY_WINDOW_SIZE
    )]
    pub replay_window_size: String,

    /// Proposal prefixes never offered, comma separated
    #[arg(long, env = "CLAW_IPSEC_BLACKLIST", value_delimiter = ',')]
    pub blacklist: Vec<String>,

    /// Log at debug level and run charon with verbose subsystems
    #[arg(long, env = "CLAW_IPSEC_DEBUG")]
    pub debug: bool,
}

impl Cli {
    /// Reconciler tunables from the flags.
    pub fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig::new(&self.config_dir)
            .with_blacklist(
                self.blacklist
                    .iter()
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty()),
            )
            .with_replay_window_size(&self.replay_window_size)
            .with_rekey_intervals(&self.ike_sa_rekey_interval, &self.child_sa_rekey_interval)
    }

    /// Whether charon is launched or watched.
    pub fn supervisor_mode(&self) -> SupervisorMode {
        if self.charon_launch {
            SupervisorMode::Launch {
                log_file: self.charon_log.clone(),
            }
        } else {
            SupervisorMode::Monitor
        }
    }

    /// Default tracing directive.
    pub fn log_directive(&self) -> &'static str {
        if self.debug {
            "claw_ipsec=debug"
        } else {
            "claw_ipsec=info"
        }
    }
}
