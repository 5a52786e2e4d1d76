//! Client side of charon's VICI control protocol.

pub mod codec;
pub mod session;

pub use codec::{Element, Message, Packet, MAX_PACKET_LEN};
pub use session::{Connector, Session, UnixConnector, ViciSession};
