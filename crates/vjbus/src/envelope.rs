//! Message envelope: the versioned wrapper every bus message travels in.
//!
//! An [`Envelope`] carries the sender's identity (worker name, instance id,
//! generation) plus exactly one typed [`Payload`]. The payload variant is keyed
//! by the wire `type` field; decoding fails closed on anything it does not know.
//!
//! Envelopes are immutable once built. Use an [`EnvelopeBuilder`] per worker
//! instance so that every envelope shares the same `instance_id`/`generation`
//! and telemetry sequences stay monotonic per stream.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Wire schema identifier stamped on every envelope.
pub const SCHEMA_VERSION: &str = "vjbus.v1";

/// Identifies one process start of a logical worker slot.
///
/// Regenerated on every start; never reused across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(uuid::Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while decoding or validating envelopes.
///
/// Receivers log these and drop the offending message; they never tear down
/// the loop that received it.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported schema: {0}")]
    UnsupportedSchema(String),
    #[error("unrecognized message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageType,
        source: serde_json::Error,
    },
    #[error("expected {expected} message, got {actual}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("correlation mismatch: expected {expected}, got {actual}")]
    CorrelationMismatch { expected: String, actual: String },
    #[error("telemetry frame topic {frame} does not match envelope worker {worker}")]
    FrameMismatch { frame: String, worker: String },
}

/// Discriminant of the payload union, serialized as the envelope `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Ack,
    Telemetry,
    Event,
    Heartbeat,
    StateSync,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Ack => "ack",
            Self::Telemetry => "telemetry",
            Self::Event => "event",
            Self::Heartbeat => "heartbeat",
            Self::StateSync => "state_sync",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(Self::Command),
            "ack" => Ok(Self::Ack),
            "telemetry" => Ok(Self::Telemetry),
            "event" => Ok(Self::Event),
            "heartbeat" => Ok(Self::Heartbeat),
            "state_sync" => Ok(Self::StateSync),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub verb: String,
    #[serde(default)]
    pub config_version: Option<u64>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result body of the command, if it produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub applied_config_version: Option<u64>,
}

impl AckPayload {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            status: AckStatus::Ok,
            message: None,
            data,
            applied_config_version: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            message: Some(message.into()),
            data: None,
            applied_config_version: None,
        }
    }

    pub fn with_applied_config_version(mut self, version: Option<u64>) -> Self {
        self.applied_config_version = version;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub stream: String,
    pub sequence: u64,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub level: EventLevel,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Process cpu usage in percent of one core.
    pub cpu: f32,
    /// Resident memory in bytes.
    pub mem: u64,
    pub uptime_sec: f64,
    /// How late this heartbeat fired relative to its schedule.
    pub lag_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncPayload {
    #[serde(default)]
    pub config_version: Option<u64>,
    #[serde(default)]
    pub state: Value,
}

/// Closed union of payloads, one per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Command(CommandPayload),
    Ack(AckPayload),
    Telemetry(TelemetryPayload),
    Event(EventPayload),
    Heartbeat(HeartbeatPayload),
    StateSync(StateSyncPayload),
}

impl Payload {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Command(_) => MessageType::Command,
            Self::Ack(_) => MessageType::Ack,
            Self::Telemetry(_) => MessageType::Telemetry,
            Self::Event(_) => MessageType::Event,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::StateSync(_) => MessageType::StateSync,
        }
    }

    fn decode(kind: MessageType, value: Value) -> Result<Self, ProtocolError> {
        let invalid = |source| ProtocolError::InvalidPayload { kind, source };
        Ok(match kind {
            MessageType::Command => Self::Command(serde_json::from_value(value).map_err(invalid)?),
            MessageType::Ack => Self::Ack(serde_json::from_value(value).map_err(invalid)?),
            MessageType::Telemetry => {
                Self::Telemetry(serde_json::from_value(value).map_err(invalid)?)
            }
            MessageType::Event => Self::Event(serde_json::from_value(value).map_err(invalid)?),
            MessageType::Heartbeat => {
                Self::Heartbeat(serde_json::from_value(value).map_err(invalid)?)
            }
            MessageType::StateSync => {
                Self::StateSync(serde_json::from_value(value).map_err(invalid)?)
            }
        })
    }
}

/// Versioned message wrapper.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    schema: String,
    worker: String,
    instance_id: InstanceId,
    correlation_id: Option<String>,
    generation: u64,
    timestamp: DateTime<Utc>,
    payload: Payload,
}

impl Envelope {
    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn as_command(&self) -> Option<&CommandPayload> {
        match &self.payload {
            Payload::Command(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_ack(&self) -> Option<&AckPayload> {
        match &self.payload {
            Payload::Ack(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_telemetry(&self) -> Option<&TelemetryPayload> {
        match &self.payload {
            Payload::Telemetry(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventPayload> {
        match &self.payload {
            Payload::Event(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_state_sync(&self) -> Option<&StateSyncPayload> {
        match &self.payload {
            Payload::StateSync(p) => Some(p),
            _ => None,
        }
    }

    /// Routing topic used by telemetry subscribers.
    ///
    /// Telemetry routes by `{worker}.{stream}`; every other kind routes by a
    /// fixed per-kind suffix.
    pub fn topic(&self) -> String {
        let suffix = match &self.payload {
            Payload::Telemetry(t) => t.stream.as_str(),
            Payload::Event(_) => "event",
            Payload::Heartbeat(_) => "heartbeat",
            Payload::StateSync(_) => "state",
            Payload::Command(_) => "command",
            Payload::Ack(_) => "ack",
        };
        format!("{}.{}", self.worker, suffix)
    }

    /// True if this envelope comes from an instance older than `latest`.
    pub fn is_stale_for(&self, latest: u64) -> bool {
        self.generation < latest
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        Self::try_from(wire)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Envelope", 8)?;
        s.serialize_field("schema", &self.schema)?;
        s.serialize_field("type", &self.payload.kind())?;
        s.serialize_field("worker", &self.worker)?;
        s.serialize_field("instance_id", &self.instance_id)?;
        s.serialize_field("correlation_id", &self.correlation_id)?;
        s.serialize_field("generation", &self.generation)?;
        s.serialize_field("timestamp", &self.timestamp)?;
        match &self.payload {
            Payload::Command(p) => s.serialize_field("payload", p)?,
            Payload::Ack(p) => s.serialize_field("payload", p)?,
            Payload::Telemetry(p) => s.serialize_field("payload", p)?,
            Payload::Event(p) => s.serialize_field("payload", p)?,
            Payload::Heartbeat(p) => s.serialize_field("payload", p)?,
            Payload::StateSync(p) => s.serialize_field("payload", p)?,
        }
        s.end()
    }
}

/// Untyped wire shape; `type` is kept as a string so unknown values surface
/// as [`ProtocolError::UnknownType`] instead of a generic parse error.
#[derive(Deserialize)]
struct WireEnvelope {
    schema: String,
    #[serde(rename = "type")]
    kind: String,
    worker: String,
    instance_id: InstanceId,
    #[serde(default)]
    correlation_id: Option<String>,
    generation: u64,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        if wire.schema != SCHEMA_VERSION {
            return Err(ProtocolError::UnsupportedSchema(wire.schema));
        }
        let kind: MessageType = wire.kind.parse()?;
        let payload = Payload::decode(kind, wire.payload)?;
        Ok(Self {
            schema: wire.schema,
            worker: wire.worker,
            instance_id: wire.instance_id,
            correlation_id: wire.correlation_id,
            generation: wire.generation,
            timestamp: wire.timestamp,
            payload,
        })
    }
}

/// Produces successive envelopes for one worker instance.
///
/// Shared across tasks behind an `Arc`; only the telemetry sequence map is
/// mutable.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    worker: String,
    instance_id: InstanceId,
    generation: u64,
    sequences: Mutex<HashMap<String, u64>>,
}

impl EnvelopeBuilder {
    /// Builder for a fresh process start: a new `instance_id` is generated.
    pub fn new(worker: impl Into<String>, generation: u64) -> Self {
        Self::for_instance(worker, InstanceId::new(), generation)
    }

    pub fn for_instance(worker: impl Into<String>, instance_id: InstanceId, generation: u64) -> Self {
        Self {
            worker: worker.into(),
            instance_id,
            generation,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn build(&self, correlation_id: Option<String>, payload: Payload) -> Envelope {
        Envelope {
            schema: SCHEMA_VERSION.to_string(),
            worker: self.worker.clone(),
            instance_id: self.instance_id,
            correlation_id,
            generation: self.generation,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// New command with a fresh correlation id.
    pub fn command(
        &self,
        verb: impl Into<String>,
        data: Map<String, Value>,
        config_version: Option<u64>,
    ) -> Envelope {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        self.build(
            Some(correlation_id),
            Payload::Command(CommandPayload {
                verb: verb.into(),
                config_version,
                data,
            }),
        )
    }

    /// Ack answering `command`; always carries the command's correlation id.
    pub fn ack_for(&self, command: &Envelope, ack: AckPayload) -> Envelope {
        self.build(command.correlation_id.clone(), Payload::Ack(ack))
    }

    /// Next telemetry envelope on `stream`; sequence numbers start at 0.
    pub fn telemetry(&self, stream: impl Into<String>, data: Value) -> Envelope {
        let stream = stream.into();
        let sequence = {
            let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
            let next = sequences.entry(stream.clone()).or_insert(0);
            let current = *next;
            *next += 1;
            current
        };
        self.build(
            None,
            Payload::Telemetry(TelemetryPayload {
                stream,
                sequence,
                data,
            }),
        )
    }

    pub fn event(
        &self,
        level: EventLevel,
        message: impl Into<String>,
        details: Map<String, Value>,
    ) -> Envelope {
        self.build(
            None,
            Payload::Event(EventPayload {
                level,
                message: message.into(),
                details,
            }),
        )
    }

    pub fn heartbeat(&self, heartbeat: HeartbeatPayload) -> Envelope {
        self.build(None, Payload::Heartbeat(heartbeat))
    }

    pub fn state_sync(&self, config_version: Option<u64>, state: Value) -> Envelope {
        self.build(
            None,
            Payload::StateSync(StateSyncPayload {
                config_version,
                state,
            }),
        )
    }
}
