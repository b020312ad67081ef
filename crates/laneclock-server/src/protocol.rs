//! JSON frames exchanged over the WebSocket.
//!
//! Every frame is `{ "event": "<name>", "data": <payload> }`. Inbound payloads
//! are loosely typed (lanes may arrive as numbers or strings, `stop-timer`
//! takes either a bare lane or an object), so inbound frames are decoded by
//! hand in the style of an RPC param extractor. Outbound frames are a tagged
//! enum.

use laneclock_core::{ElapsedSource, Lane, Role, LANE_COUNT};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw inbound frame before payload validation.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A validated inbound event.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    RequestRole { role: String },
    StartTimer,
    StopTimer { lane: Lane, client_stop_ms: Option<f64> },
    AdminStopLane { lane: Lane },
    ResendTimer { lane: Lane, elapsed: f64 },
    StopAllTimers,
    ResetAllTimers,
    AssignStudents(Value),
    ClearStudents,
    SyncState,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("invalid lane for {event}")]
    InvalidLane { event: &'static str },
    #[error("invalid payload for {event}: {reason}")]
    InvalidPayload { event: &'static str, reason: String },
}

/// Decode one text frame.
pub fn parse_frame(raw: &str) -> Result<InboundEvent, ProtocolError> {
    let frame: InboundFrame = serde_json::from_str(raw)?;
    InboundEvent::from_frame(frame)
}

impl InboundEvent {
    pub fn from_frame(frame: InboundFrame) -> Result<Self, ProtocolError> {
        let data = frame.data.unwrap_or(Value::Null);
        let event = match frame.event.as_str() {
            "request-role" => {
                let role = data
                    .as_str()
                    .or_else(|| data.get("role").and_then(Value::as_str))
                    .ok_or_else(|| ProtocolError::InvalidPayload {
                        event: "request-role",
                        reason: "role must be a string".into(),
                    })?;
                Self::RequestRole { role: role.to_string() }
            }
            "start-timer" => Self::StartTimer,
            "stop-timer" => Self::StopTimer {
                lane: lane_of(&data, "stop-timer")?,
                client_stop_ms: data.get("stopTime").and_then(Value::as_f64),
            },
            "admin-stop-lane" => Self::AdminStopLane {
                lane: lane_of(&data, "admin-stop-lane")?,
            },
            "resend-timer" => {
                let lane = lane_of(&data, "resend-timer")?;
                let elapsed = data.get("elapsed").and_then(Value::as_f64).ok_or_else(|| {
                    ProtocolError::InvalidPayload {
                        event: "resend-timer",
                        reason: "elapsed must be a number".into(),
                    }
                })?;
                Self::ResendTimer { lane, elapsed }
            }
            "stop-all-timers" => Self::StopAllTimers,
            "reset-all-timers" => Self::ResetAllTimers,
            "assign-students" => Self::AssignStudents(data),
            "clear-students" => Self::ClearStudents,
            "sync-state" => Self::SyncState,
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestRole { .. } => "request-role",
            Self::StartTimer => "start-timer",
            Self::StopTimer { .. } => "stop-timer",
            Self::AdminStopLane { .. } => "admin-stop-lane",
            Self::ResendTimer { .. } => "resend-timer",
            Self::StopAllTimers => "stop-all-timers",
            Self::ResetAllTimers => "reset-all-timers",
            Self::AssignStudents(_) => "assign-students",
            Self::ClearStudents => "clear-students",
            Self::SyncState => "sync-state",
        }
    }

    /// Role a sender must hold for this event, `None` when anyone may send it.
    pub fn required_role(&self) -> Option<Role> {
        match self {
            Self::StartTimer | Self::AdminStopLane { .. } | Self::StopAllTimers | Self::ResetAllTimers => {
                Some(Role::Admin)
            }
            Self::StopTimer { lane, .. } | Self::ResendTimer { lane, .. } => Some(Role::Lane(*lane)),
            Self::RequestRole { .. } | Self::AssignStudents(_) | Self::ClearStudents | Self::SyncState => None,
        }
    }
}

/// Lane from either a bare value or an object's `laneId`.
fn lane_of(data: &Value, event: &'static str) -> Result<Lane, ProtocolError> {
    let raw = match data {
        Value::Object(map) => map.get("laneId").unwrap_or(&Value::Null),
        other => other,
    };
    Lane::parse(raw).ok_or(ProtocolError::InvalidLane { event })
}

/// Canonical session state as seen by clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub start_timestamp: Option<i64>,
    pub lanes: [Option<u64>; LANE_COUNT],
    pub held_roles: Vec<Role>,
}

/// Events sent to clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    RoleResponse {
        success: bool,
        role: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    StartTimer {
        start_timestamp: i64,
    },
    StopTimer {
        lane_id: Lane,
        elapsed: u64,
        source: ElapsedSource,
    },
    StopAck {
        lane_id: Lane,
        elapsed: u64,
    },
    StopIgnored {
        lane_id: Lane,
        #[serde(skip_serializing_if = "Option::is_none")]
        elapsed: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
    StopAllTimers {
        elapsed: [u64; LANE_COUNT],
    },
    StopAllIgnored {
        reason: &'static str,
    },
    ResetAllTimers,
    ResendTimer {
        lane_id: Lane,
        elapsed: u64,
        source: ElapsedSource,
    },
    ResendRejected {
        lane_id: Lane,
        reason: &'static str,
    },
    AssignStudents(Value),
    ClearStudents,
    State(SessionSnapshot),
}

impl OutboundEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
