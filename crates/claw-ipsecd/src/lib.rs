//! claw-ipsecd - Clawbernetes IPsec overlay agent
//!
//! Wires the [`claw_ipsec`] reconciler to its outer surfaces: command line
//! flags, the HTTP reload endpoint, and the membership watcher.

pub mod cli;
pub mod server;
pub mod watcher;

pub use cli::Cli;
pub use server::{create_router, serve};
pub use watcher::{watch_membership, WATCH_INTERVAL};
