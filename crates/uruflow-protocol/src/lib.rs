//! uruflow-protocol: Wire protocol for coordinator/worker communication
//!
//! Defines the length-prefixed binary framing (8-byte header, JSON payload),
//! the message kind table, and the connection wrapper shared by the
//! coordinator and the worker daemon.

pub mod conn;
pub mod error;
pub mod frame;
pub mod message;

pub use conn::{BoxedTransport, Connection, Transport};
pub use error::ProtocolError;
pub use frame::{HEADER_SIZE, MAGIC_1, MAGIC_2, MAX_PAYLOAD_SIZE, VERSION};
pub use message::{Message, MessageKind};
