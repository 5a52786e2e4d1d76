//! Blocking VICI sessions over charon's unix socket.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, trace};

use super::codec::{Message, Packet, MAX_PACKET_LEN};
use crate::conn::{IkeConfig, SharedKey};
use crate::error::ViciError;

/// Event streamed once per connection by `list-conns`.
const LIST_CONN_EVENT: &str = "list-conn";


/// The charon commands the overlay relies on.
///
/// Every call blocks until the daemon answers.
pub trait Session: Send {
    /// Names of the loaded connections, optionally filtered to one name.
    fn list_conns(&mut self, ike: Option<&str>) -> Result<Vec<String>, ViciError>;

    /// Loads or replaces a shared secret.
    fn load_shared(&mut self, key: &SharedKey) -> Result<(), ViciError>;

    /// Loads or replaces a connection.
    fn load_conn(&mut self, name: &str, config: &IkeConfig) -> Result<(), ViciError>;

    /// Unloads a connection by name.
    fn unload_conn(&mut self, name: &str) -> Result<(), ViciError>;

    /// Releases the session. Further calls fail.
    fn close(&mut self);
}

/// Opens sessions to the daemon.
pub trait Connector: Send + Sync {
    /// Opens a new session.
    fn connect(&self) -> Result<Box<dyn Session>, ViciError>;
}

/// Connector for a VICI unix socket.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: PathBuf,
    timeout: Option<Duration>,
}

impl UnixConnector {
    /// Creates a connector for the socket at `path`. Socket IO blocks
    /// until charon answers.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: None,
        }
    }

    /// Bounds every socket read and write.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The socket IO bound, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Connector for UnixConnector {
    fn connect(&self) -> Result<Box<dyn Session>, ViciError> {
        let stream = UnixStream::connect(&self.path).map_err(|source| ViciError::Connect {
            path: self.path.clone(),
            source,
        })?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;
        debug!(path = %self.path.display(), "vici session opened");
        Ok(Box::new(ViciSession::new(stream)))
    }
}

/// A VICI session on any byte stream.
pub struct ViciSession<S = UnixStream> {
    stream: S,
    closed: bool,
}

impl<S: Read + Write> ViciSession<S> {
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    fn send(&mut self, packet: &Packet) -> Result<(), ViciError> {
        if self.closed {
            return Err(ViciError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session closed",
            )));
        }
        write_packet(&mut self.stream, packet)
    }

    fn command(&mut self, name: &str, message: Message) -> Result<Message, ViciError> {
        trace!(command = name, "vici request");
        self.send(&Packet::CmdRequest {
            name: name.to_string(),
            message,
        })?;
        match read_packet(&mut self.stream)? {
            Packet::CmdResponse(response) => Ok(response),
            Packet::CmdUnknown => Err(ViciError::UnknownCommand(name.to_string())),
            other => Err(ViciError::UnexpectedPacket {
                expected: "CMD_RESPONSE",
                got: other.kind().to_string(),
            }),
        }
    }

    fn checked_command(&mut self, name: &str, message: Message) -> Result<(), ViciError> {
        let response = self.command(name, message)?;
        check_success(name, &response)
    }

    fn subscribe(&mut self, packet: Packet, event: &str) -> Result<(), ViciError> {
        self.send(&packet)?;
        match read_packet(&mut self.stream)? {
            Packet::EventConfirm => Ok(()),
            Packet::EventUnknown => Err(ViciError::UnknownEvent(event.to_string())),
            other => Err(ViciError::UnexpectedPacket {
                expected: "EVENT_CONFIRM",
                got: other.kind().to_string(),
            }),
        }
    }

    fn stream_conns(&mut self, ike: Option<&str>) -> Result<Vec<String>, ViciError> {
        let mut request = Message::new();
        if let Some(ike) = ike {
            request = request.with_value("ike", ike);
        }
        self.send(&Packet::CmdRequest {
            name: "list-conns".to_string(),
            message: request,
        })?;

        let mut names = Vec::new();
        loop {
            match read_packet(&mut self.stream)? {
                Packet::Event { name, message } if name == LIST_CONN_EVENT => {
                    names.extend(message.keys().map(str::to_string));
                }
                // Events from other subscriptions are not ours to consume.
                Packet::Event { .. } => {}
                Packet::CmdResponse(_) => return Ok(names),
                Packet::CmdUnknown => {
                    return Err(ViciError::UnknownCommand("list-conns".to_string()))
                }
                other => {
                    return Err(ViciError::UnexpectedPacket {
                        expected: "EVENT or CMD_RESPONSE",
                        got: other.kind().to_string(),
                    })
                }
            }
        }
    }
}

impl<S> Session for ViciSession<S>
where
    S: Read + Write + Send + ShutdownStream,
{
    fn list_conns(&mut self, ike: Option<&str>) -> Result<Vec<String>, ViciError> {
        self.subscribe(
            Packet::EventRegister(LIST_CONN_EVENT.to_string()),
            LIST_CONN_EVENT,
        )?;
        let listed = self.stream_conns(ike);
        let unsubscribed = self.subscribe(
            Packet::EventUnregister(LIST_CONN_EVENT.to_string()),
            LIST_CONN_EVENT,
        );
        let names = listed?;
        unsubscribed?;
        Ok(names)
    }

    fn load_shared(&mut self, key: &SharedKey) -> Result<(), ViciError> {
        self.checked_command("load-shared", key.to_message())
    }

    fn load_conn(&mut self, name: &str, config: &IkeConfig) -> Result<(), ViciError> {
        let message = Message::new().with_section(name, config.to_message());
        self.checked_command("load-conn", message)
    }

    fn unload_conn(&mut self, name: &str) -> Result<(), ViciError> {
        self.checked_command("unload-conn", Message::new().with_value("name", name))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stream.shutdown_stream();
        }
    }
}

/// Streams that can be shut down from our side.
pub trait ShutdownStream {
    /// Shuts down both directions, ignoring errors.
    fn shutdown_stream(&mut self);
}

impl ShutdownStream for UnixStream {
    fn shutdown_stream(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

/// Writes one framed packet.
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> Result<(), ViciError> {
    let bytes = packet.encode()?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Reads one framed packet.
///
/// # Errors
///
/// Returns an error on IO failure, oversized length or a malformed body.
pub fn read_packet<R: Read>(reader: &mut R) -> Result<Packet, ViciError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_PACKET_LEN {
        return Err(ViciError::PacketTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Packet::decode(&body)
}

fn check_success(command: &str, response: &Message) -> Result<(), ViciError> {
    if response.value("success") == Some("yes") {
        return Ok(());
    }
    Err(ViciError::CommandFailed {
        command: command.to_string(),
        message: response
            .value("errmsg")
            .unwrap_or("no error message")
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::AuthConfig;
    use std::thread;

    fn ok() -> Packet {
        Packet::CmdResponse(Message::new().with_value("success", "yes"))
    }

    /// Runs a scripted daemon on the other end of a socket pair. For every
    /// request it reads, it writes the next batch of replies.
    fn scripted(replies: Vec<Vec<Packet>>) -> (ViciSession, thread::JoinHandle<Vec<Packet>>) {
        let (ours, mut theirs) = UnixStream::pair().expect("socket pair");
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for batch in replies {
                seen.push(read_packet(&mut theirs).expect("request"));
                for reply in batch {
                    write_packet(&mut theirs, &reply).expect("reply");
                }
            }
            seen
        });
        (ViciSession::new(ours), handle)
    }

    #[test]
    fn test_load_conn_sends_named_section() {
        let (mut session, daemon) = scripted(vec![vec![ok()]]);
        let config = IkeConfig {
            remote_addrs: vec!["10.0.0.2".to_string()],
            local_auth: AuthConfig::psk(),
            ..IkeConfig::default()
        };
        session.load_conn("conn-10.0.0.2", &config).expect("load");

        let seen = daemon.join().expect("daemon");
        match &seen[0] {
            Packet::CmdRequest { name, message } => {
                assert_eq!(name, "load-conn");
                assert!(message.section("conn-10.0.0.2").is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_command_failure_carries_errmsg() {
        let failed = Packet::CmdResponse(
            Message::new()
                .with_value("success", "no")
                .with_value("errmsg", "unknown connection"),
        );
        let (mut session, daemon) = scripted(vec![vec![failed]]);
        let err = session.unload_conn("conn-10.0.0.9").expect_err("failure");
        daemon.join().expect("daemon");
        assert_eq!(err.to_string(), "unload-conn failed: unknown connection");
    }

    #[test]
    fn test_unknown_command() {
        let (mut session, daemon) = scripted(vec![vec![Packet::CmdUnknown]]);
        let key = SharedKey::ike("secret", "%any");
        let err = session.load_shared(&key).expect_err("unknown");
        daemon.join().expect("daemon");
        assert!(matches!(err, ViciError::UnknownCommand(c) if c == "load-shared"));
    }

    #[test]
    fn test_list_conns_streams_events() {
        let event = |name: &str| Packet::Event {
            name: LIST_CONN_EVENT.to_string(),
            message: Message::new().with_section(name, Message::new()),
        };
        let (mut session, daemon) = scripted(vec![
            vec![Packet::EventConfirm],
            vec![
                event("conn-10.0.0.2"),
                Packet::Event {
                    name: "log".to_string(),
                    message: Message::new(),
                },
                event("conn-10.0.0.3"),
                Packet::CmdResponse(Message::new()),
            ],
            vec![Packet::EventConfirm],
        ]);

        let names = session.list_conns(None).expect("list");
        let seen = daemon.join().expect("daemon");

        assert_eq!(names, vec!["conn-10.0.0.2", "conn-10.0.0.3"]);
        assert_eq!(seen[0], Packet::EventRegister(LIST_CONN_EVENT.to_string()));
        assert_eq!(seen[2], Packet::EventUnregister(LIST_CONN_EVENT.to_string()));
    }

    #[test]
    fn test_list_conns_filters_by_name() {
        let (mut session, daemon) = scripted(vec![
            vec![Packet::EventConfirm],
            vec![Packet::CmdResponse(Message::new())],
            vec![Packet::EventConfirm],
        ]);
        let names = session.list_conns(Some("conn-10.0.0.7")).expect("list");
        let seen = daemon.join().expect("daemon");
        assert!(names.is_empty());
        match &seen[1] {
            Packet::CmdRequest { message, .. } => {
                assert_eq!(message.value("ike"), Some("conn-10.0.0.7"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_rejected() {
        let (mut session, daemon) = scripted(vec![vec![Packet::EventUnknown]]);
        let err = session.list_conns(None).expect_err("unknown event");
        daemon.join().expect("daemon");
        assert!(matches!(err, ViciError::UnknownEvent(_)));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut bytes: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        let err = read_packet(&mut bytes).expect_err("too large");
        assert!(matches!(err, ViciError::PacketTooLarge(_)));
    }

    #[test]
    fn test_closed_session_refuses_commands() {
        let (ours, _theirs) = UnixStream::pair().expect("socket pair");
        let mut session = ViciSession::new(ours);
        session.close();
        assert!(session.unload_conn("conn-x").is_err());
    }

    #[test]
    fn test_connect_to_missing_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let connector = UnixConnector::new(dir.path().join("charon.vici"));
        let err = connector.connect().err().expect("no socket");
        assert!(matches!(err, ViciError::Connect { .. }));
    }

    #[test]
    fn test_connector_blocks_without_timeout_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("charon.vici");
        let _listener = std::os::unix::net::UnixListener::bind(&path).expect("bind");

        let connector = UnixConnector::new(&path);
        assert_eq!(connector.timeout(), None);
        assert!(connector.connect().is_ok());

        let bounded = connector.with_timeout(Duration::from_secs(5));
        assert_eq!(bounded.timeout(), Some(Duration::from_secs(5)));
        assert!(bounded.connect().is_ok());
    }
}
