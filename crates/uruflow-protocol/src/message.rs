//! Message kinds and payload schemas
//!
//! Payloads are JSON documents whose schema is determined entirely by the
//! message kind. Bodyless kinds (ping, pong, disconnect, metrics-ack) carry
//! an empty payload.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;
use crate::frame::{encode_header, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Message kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Worker credentials (worker → coordinator, always first)
    Auth,
    /// Authentication accepted
    AuthOk,
    /// Authentication rejected
    AuthFail,
    /// Periodic system/container metrics push
    Metrics,
    /// Metrics received
    MetricsAck,
    /// Command dispatch (coordinator → worker)
    Command,
    /// Command received
    CommandAck,
    /// Command execution started
    CommandStart,
    /// One line of command output
    CommandLog,
    /// Command finished
    CommandDone,
    /// Liveness probe
    Ping,
    /// Liveness reply
    Pong,
    /// Graceful teardown (either direction)
    Disconnect,
    /// Protocol-level error report
    Error,
    /// Start a container log stream
    ContainerLogsRequest,
    /// One line of container log output
    ContainerLogsData,
    /// Stop a container log stream
    ContainerLogsStop,
    /// Kind byte this endpoint does not recognize
    Unknown(u8),
}

impl MessageKind {
    /// Convert to the wire byte
    pub fn as_u8(&self) -> u8 {
        match self {
            MessageKind::Auth => 0x01,
            MessageKind::AuthOk => 0x02,
            MessageKind::AuthFail => 0x03,
            MessageKind::Metrics => 0x10,
            MessageKind::MetricsAck => 0x11,
            MessageKind::Command => 0x20,
            MessageKind::CommandAck => 0x21,
            MessageKind::CommandStart => 0x22,
            MessageKind::CommandLog => 0x23,
            MessageKind::CommandDone => 0x24,
            MessageKind::Ping => 0x30,
            MessageKind::Pong => 0x31,
            MessageKind::Disconnect => 0x40,
            MessageKind::Error => 0x41,
            MessageKind::ContainerLogsRequest => 0x50,
            MessageKind::ContainerLogsData => 0x51,
            MessageKind::ContainerLogsStop => 0x52,
            MessageKind::Unknown(b) => *b,
        }
    }

    /// Convert from the wire byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => MessageKind::Auth,
            0x02 => MessageKind::AuthOk,
            0x03 => MessageKind::AuthFail,
            0x10 => MessageKind::Metrics,
            0x11 => MessageKind::MetricsAck,
            0x20 => MessageKind::Command,
            0x21 => MessageKind::CommandAck,
            0x22 => MessageKind::CommandStart,
            0x23 => MessageKind::CommandLog,
            0x24 => MessageKind::CommandDone,
            0x30 => MessageKind::Ping,
            0x31 => MessageKind::Pong,
            0x40 => MessageKind::Disconnect,
            0x41 => MessageKind::Error,
            0x50 => MessageKind::ContainerLogsRequest,
            0x51 => MessageKind::ContainerLogsData,
            0x52 => MessageKind::ContainerLogsStop,
            other => MessageKind::Unknown(other),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Auth => "AUTH",
            MessageKind::AuthOk => "AUTH_OK",
            MessageKind::AuthFail => "AUTH_FAIL",
            MessageKind::Metrics => "METRICS",
            MessageKind::MetricsAck => "METRICS_ACK",
            MessageKind::Command => "COMMAND",
            MessageKind::CommandAck => "COMMAND_ACK",
            MessageKind::CommandStart => "COMMAND_START",
            MessageKind::CommandLog => "COMMAND_LOG",
            MessageKind::CommandDone => "COMMAND_DONE",
            MessageKind::Ping => "PING",
            MessageKind::Pong => "PONG",
            MessageKind::Disconnect => "DISCONNECT",
            MessageKind::Error => "ERROR",
            MessageKind::ContainerLogsRequest => "CONTAINER_LOGS_REQUEST",
            MessageKind::ContainerLogsData => "CONTAINER_LOGS_DATA",
            MessageKind::ContainerLogsStop => "CONTAINER_LOGS_STOP",
            MessageKind::Unknown(b) => return write!(f, "UNKNOWN({:#04x})", b),
        };
        f.write_str(name)
    }
}

/// A complete protocol message: a kind plus its (possibly empty) payload
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message kind
    pub kind: MessageKind,
    /// Raw JSON payload bytes
    pub payload: Bytes,
}

impl Message {
    /// Create a message with a JSON-encoded payload
    pub fn new<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Self, ProtocolError> {
        let data = serde_json::to_vec(payload)?;
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            kind,
            payload: Bytes::from(data),
        })
    }

    /// Create a bodyless message
    pub fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Bytes::new(),
        }
    }

    /// Liveness probe
    pub fn ping() -> Self {
        Self::empty(MessageKind::Ping)
    }

    /// Liveness reply
    pub fn pong() -> Self {
        Self::empty(MessageKind::Pong)
    }

    /// Graceful teardown
    pub fn disconnect() -> Self {
        Self::empty(MessageKind::Disconnect)
    }

    /// Protocol-level error report
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        // An ErrorPayload always fits well under the size cap
        Self::new(
            MessageKind::Error,
            &ErrorPayload {
                code,
                message: message.into(),
            },
        )
        .expect("error payload encodes")
    }

    /// Decode the payload as the given schema type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the full frame (header + payload) for wire transmission
    pub fn encode(&self) -> Bytes {
        let header = encode_header(self.kind, self.payload.len() as u32);
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// AUTH: worker credentials, sent as the first frame of every connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Pre-provisioned worker token
    pub token: String,
    /// Worker hostname
    pub hostname: String,
    /// Worker-reported address. The coordinator binds the socket peer
    /// address instead, so this may be omitted on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Worker software version
    pub version: String,
}

/// AUTH_OK: identity assigned by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthOkPayload {
    pub agent_id: String,
    pub name: String,
    pub server_version: String,
}

/// AUTH_FAIL: rejection reason, reported before the connection closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthFailPayload {
    pub reason: String,
}

/// METRICS: periodic system and container telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    /// Collection time (epoch seconds)
    pub timestamp: i64,
    pub system: SystemMetrics,
    #[serde(default)]
    pub containers: Vec<ContainerMetrics>,
}

/// Host-level metrics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_percent: f64,
    pub disk_used: u64,
    pub disk_total: u64,
    /// 1/5/15-minute load averages
    pub load_avg: [f64; 3],
    /// Seconds since boot
    pub uptime: i64,
}

/// Per-container metrics, reported for managed containers
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerMetrics {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub health: String,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub restart_count: i64,
    /// Epoch seconds, 0 when never started
    pub started_at: i64,
}

/// COMMAND: coordinator-issued work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    /// Schema depends on `command_type`
    pub payload: serde_json::Value,
}

/// COMMAND_ACK: worker received the command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAckPayload {
    pub command_id: String,
    pub status: String,
}

/// COMMAND_START: worker began executing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStartPayload {
    pub command_id: String,
    /// Epoch seconds
    pub started_at: i64,
}

/// COMMAND_LOG: one line of command output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLogPayload {
    pub command_id: String,
    pub line: String,
    /// "stdout" or "stderr"
    pub stream: String,
    /// Epoch seconds
    pub timestamp: i64,
}

/// COMMAND_DONE: terminal result for a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDonePayload {
    pub command_id: String,
    /// "success" or "failed"
    pub status: String,
    pub exit_code: i32,
    /// Milliseconds
    pub duration: i64,
    /// Final output or failure reason, may be empty
    pub output: String,
}

/// ERROR: protocol-level error report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}

/// CONTAINER_LOGS_REQUEST: begin tailing a container's logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLogsRequestPayload {
    pub container_id: String,
    /// Number of historical lines to replay first
    pub tail: u32,
    /// Keep following after the tail is drained
    pub follow: bool,
}

/// CONTAINER_LOGS_DATA: one line of container log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLogsDataPayload {
    pub container_id: String,
    pub line: String,
    /// "stdout" or "stderr"
    pub stream: String,
    /// Epoch seconds
    pub timestamp: i64,
}

/// CONTAINER_LOGS_STOP: cancel the stream for a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLogsStopPayload {
    pub container_id: String,
}
