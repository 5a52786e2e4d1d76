//! Error types for the IPsec overlay.
//!
//! Each external surface has its own error enum (`ViciError` for the charon
//! control socket, `XfrmError` for kernel policy, `SupervisorError` for the
//! daemon lifecycle). `IpsecError` is what a reconciliation pass returns.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for overlay operations.
pub type Result<T> = std::result::Result<T, IpsecError>;

/// Errors from the VICI control protocol.
#[derive(Debug, Error)]
pub enum ViciError {
    /// The control socket could not be reached.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        /// Socket path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// IO error on an established session.
    #[error("vici io error: {0}")]
    Io(#[from] std::io::Error),

    /// A packet or message could not be decoded.
    #[error("malformed vici packet: {0}")]
    Malformed(String),

    /// Packet length exceeds the protocol maximum.
    #[error("vici packet too large: {0} bytes")]
    PacketTooLarge(usize),

    /// A name or value does not fit its length prefix.
    #[error("vici element '{name}' too long: {len} bytes")]
    ElementTooLong {
        /// Element name.
        name: String,
        /// Offending length.
        len: usize,
    },

    /// The daemon answered with a packet of the wrong type.
    #[error("unexpected vici packet: expected {expected}, got {got}")]
    UnexpectedPacket {
        /// What the session was waiting for.
        expected: &'static str,
        /// What arrived instead.
        got: String,
    },

    /// The daemon does not know the command.
    #[error("unknown vici command: {0}")]
    UnknownCommand(String),

    /// The daemon does not know the event.
    #[error("unknown vici event: {0}")]
    UnknownEvent(String),

    /// The daemon ran the command and reported failure.
    #[error("{command} failed: {message}")]
    CommandFailed {
        /// Command name.
        command: String,
        /// `errmsg` from the response.
        message: String,
    },
}

/// Errors from the kernel policy table.
#[derive(Debug, Error)]
pub enum XfrmError {
    /// The `ip` program could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// `ip` exited with a failure status.
    #[error("'{command}' failed: {stderr}")]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// Standard error output.
        stderr: String,
    },

    /// Policy listing could not be parsed.
    #[error("failed to parse xfrm policy: {0}")]
    Parse(String),
}

/// Unrecoverable daemon supervision failures.
///
/// The daemon's SA and connection state is assumed lost when any of these
/// occur, so the control process must not carry on with its caches.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The pid file could not be read.
    #[error("failed to read pid file {path}: {source}")]
    PidFile {
        /// Pid file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The daemon pid changed between two polls.
    #[error("charon restarted, old PID: {old}, new PID: {new}")]
    DaemonRestarted {
        /// Pid seen first.
        old: String,
        /// Pid seen now.
        new: String,
    },

    /// The launched daemon exited.
    #[error("charon exited: {status}")]
    DaemonExited {
        /// Exit status description.
        status: String,
    },

    /// The daemon could not be spawned or waited on.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The daemon log file could not be opened.
    #[error("failed to log to file {path}: {source}")]
    LogFile {
        /// Log file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A supervision task panicked or was cancelled.
    #[error("supervisor task failed: {0}")]
    Task(String),
}

/// Errors surfaced by a reconciliation pass or its collaborators.
#[derive(Debug, Error)]
pub enum IpsecError {
    /// Control protocol failure not tied to a single peer.
    #[error(transparent)]
    Vici(#[from] ViciError),

    /// Kernel policy failure.
    #[error(transparent)]
    Xfrm(#[from] XfrmError),

    /// A membership entry or local identity carries an unusable address.
    #[error("invalid {field} '{value}': {reason}")]
    InvalidAddress {
        /// Which field was being parsed.
        field: &'static str,
        /// The raw value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Loading a pre-shared key for a peer failed.
    #[error("failed to load pre-shared key for {peer}: {source}")]
    KeyLoad {
        /// Peer identity.
        peer: String,
        /// Protocol error.
        #[source]
        source: ViciError,
    },

    /// Loading the connection for a host failed.
    #[error("failed to load connection for host {host}: {source}")]
    ConnectionLoad {
        /// Remote host IP.
        host: String,
        /// Protocol error.
        #[source]
        source: ViciError,
    },

    /// Unloading the connection for a stale host failed.
    #[error("failed to remove connection for host {host}: {source}")]
    ConnectionUnload {
        /// Remote host IP.
        host: String,
        /// Protocol error.
        #[source]
        source: ViciError,
    },

    /// The shared secret file could not be read.
    #[error("failed to read pre-shared key {path}: {source}")]
    Psk {
        /// Secret file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The membership source could not be loaded.
    #[error("membership store error: {0}")]
    Store(String),

    /// Connection templates could not be loaded.
    #[error("template error: {0}")]
    Template(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl IpsecError {
    /// Creates an `InvalidAddress` error.
    #[must_use]
    pub fn invalid_address(
        field: &'static str,
        value: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::InvalidAddress {
            field,
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
