//! IPsec overlay for Clawbernetes.
//!
//! Keeps strongSwan's `charon` and the kernel XFRM policy table in line with
//! a changing cluster membership list. Every remote host gets one IKE
//! connection (`conn-<host>`) authenticated with a cluster-wide pre-shared
//! key, and every remote endpoint gets three tunnel-mode policies (out, in,
//! fwd) pointing at its host.
//!
//! # Layout
//!
//! - [`vici`]: charon's control protocol (packet codec and blocking sessions)
//! - [`client`]: retrying session setup
//! - [`policy`] / [`xfrm`]: kernel policy model, diff, and `ip xfrm` access
//! - [`lifecycle`]: idempotent key and connection loading
//! - [`reconciler`]: one convergence pass over the membership list
//! - [`supervisor`]: launching or watching charon
//! - [`store`] / [`templates`]: membership and connection skeleton sources
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use claw_ipsec::{
//!     ConnectionClient, FileStore, IpXfrm, OverlayConfig, Reconciler, Templates, UnixConnector,
//! };
//!
//! # fn example() -> claw_ipsec::Result<()> {
//! let config = OverlayConfig::new("/etc/ipsec");
//! let reconciler = Reconciler::new(
//!     config.clone(),
//!     Arc::new(FileStore::new("/etc/ipsec/members.json")),
//!     Arc::new(IpXfrm::default()),
//!     ConnectionClient::new(Arc::new(UnixConnector::new("/var/run/charon.vici"))),
//!     Box::new(Templates::new(config.config_dir())?),
//! );
//! let report = reconciler.reload()?;
//! println!("added {} policies", report.policies_added);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod lifecycle;
pub mod policy;
pub mod reconciler;
pub mod store;
pub mod supervisor;
pub mod templates;
pub mod testing;
pub mod vici;
pub mod xfrm;

pub use client::{ConnectionClient, RetryPolicy, SessionGuard};
pub use config::OverlayConfig;
pub use conn::{ChildSaConfig, IkeConfig, SharedKey};
pub use error::{IpsecError, Result, SupervisorError, ViciError, XfrmError};
pub use lifecycle::OverlayState;
pub use policy::{Direction, PolicyDiff, XfrmPolicy, XfrmTemplate};
pub use reconciler::{PassReport, Reconciler};
pub use store::{Entry, FileStore, MembershipStore};
pub use supervisor::{Supervisor, SupervisorMode};
pub use templates::{TemplateSource, Templates};
pub use vici::{Connector, Session, UnixConnector};
pub use xfrm::{IpXfrm, PolicyTable};
