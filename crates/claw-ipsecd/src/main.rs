//! claw-ipsecd - Clawbernetes IPsec overlay agent
//!
//! Keeps charon and the kernel XFRM policies in line with the cluster
//! membership, and exposes `/ping` and `/v1/reload` for operators.

use std::sync::Arc;

use clap::Parser;
use claw_ipsec::{
    ConnectionClient, FileStore, IpXfrm, Reconciler, Supervisor, Templates, UnixConnector,
};
use claw_ipsecd::{serve, watch_membership, Cli, WATCH_INTERVAL};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(cli.log_directive().parse()?))
        .init();

    let config = cli.overlay_config();
    config.validate()?;
    info!(
        listen = %cli.listen,
        config_dir = %config.config_dir().display(),
        membership = %cli.membership_file.display(),
        "starting claw-ipsecd"
    );

    let store = Arc::new(FileStore::new(&cli.membership_file));
    let templates = Templates::new(config.config_dir())?;
    let client = ConnectionClient::new(Arc::new(UnixConnector::new(&cli.vici_socket)));
    let reconciler = Arc::new(Reconciler::new(
        config,
        store,
        Arc::new(IpXfrm::default()),
        client,
        Box::new(templates),
    ));

    let supervisor = Arc::new(
        Supervisor::new(Arc::clone(&reconciler))
            .with_pid_file(&cli.pid_file)
            .with_vici_socket(&cli.vici_socket)
            .with_program(&cli.charon_program),
    );
    let mut supervision = tokio::spawn(supervisor.run(cli.supervisor_mode()));

    let seeding = Arc::clone(&reconciler);
    let found = tokio::task::spawn_blocking(move || seeding.load_existing_connections()).await??;
    info!(connections = found, "loaded existing connections");

    tokio::spawn(watch_membership(Arc::clone(&reconciler), WATCH_INTERVAL));

    tokio::select! {
        outcome = &mut supervision => {
            let fatal = outcome?;
            error!(error = %fatal, "charon supervision failed");
            Err(fatal.into())
        }
        served = serve(cli.listen, reconciler) => {
            served?;
            anyhow::bail!("control server stopped")
        }
    }
}
