//! Backend events and the envelope that carries them over the wire.
//!
//! [`PuppetEvent`] is the closed set of events a backend emits. On the wire
//! each event travels as an [`EventEnvelope`]: a stable integer type plus the
//! payload serialized as a JSON string.

use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Stable integer identifiers of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Heartbeat,
    Message,
    Dong,
    Error,
    Friendship,
    RoomInvite,
    RoomJoin,
    RoomLeave,
    RoomTopic,
    Scan,
    Ready,
    /// Internal only. Never written to a peer.
    Reset,
    Login,
    Logout,
    Dirty,
}

impl EventType {
    pub const ALL: [EventType; 15] = [
        EventType::Heartbeat,
        EventType::Message,
        EventType::Dong,
        EventType::Error,
        EventType::Friendship,
        EventType::RoomInvite,
        EventType::RoomJoin,
        EventType::RoomLeave,
        EventType::RoomTopic,
        EventType::Scan,
        EventType::Ready,
        EventType::Reset,
        EventType::Login,
        EventType::Logout,
        EventType::Dirty,
    ];

    pub fn code(self) -> i32 {
        match self {
            EventType::Heartbeat => 1,
            EventType::Message => 2,
            EventType::Dong => 3,
            EventType::Error => 16,
            EventType::Friendship => 17,
            EventType::RoomInvite => 18,
            EventType::RoomJoin => 19,
            EventType::RoomLeave => 20,
            EventType::RoomTopic => 21,
            EventType::Scan => 22,
            EventType::Ready => 23,
            EventType::Reset => 24,
            EventType::Login => 25,
            EventType::Logout => 26,
            EventType::Dirty => 27,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Heartbeat => "heartbeat",
            EventType::Message => "message",
            EventType::Dong => "dong",
            EventType::Error => "error",
            EventType::Friendship => "friendship",
            EventType::RoomInvite => "room-invite",
            EventType::RoomJoin => "room-join",
            EventType::RoomLeave => "room-leave",
            EventType::RoomTopic => "room-topic",
            EventType::Scan => "scan",
            EventType::Ready => "ready",
            EventType::Reset => "reset",
            EventType::Login => "login",
            EventType::Logout => "logout",
            EventType::Dirty => "dirty",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginPayload {
    pub contact_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutPayload {
    pub contact_id: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendshipPayload {
    pub friendship_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInvitePayload {
    pub room_invitation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinPayload {
    pub room_id: String,
    pub invitee_id_list: Vec<String>,
    pub inviter_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLeavePayload {
    pub room_id: String,
    pub removee_id_list: Vec<String>,
    pub remover_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomTopicPayload {
    pub room_id: String,
    pub changer_id: String,
    pub new_topic: String,
    pub old_topic: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPayload {
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qrcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyPayload {
    pub payload_type: i32,
    pub payload_id: String,
}

/// An event emitted by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PuppetEvent {
    Heartbeat(DataPayload),
    Message(MessagePayload),
    Dong(DataPayload),
    Error(DataPayload),
    Friendship(FriendshipPayload),
    RoomInvite(RoomInvitePayload),
    RoomJoin(RoomJoinPayload),
    RoomLeave(RoomLeavePayload),
    RoomTopic(RoomTopicPayload),
    Scan(ScanPayload),
    Ready(DataPayload),
    Reset(DataPayload),
    Login(LoginPayload),
    Logout(LogoutPayload),
    Dirty(DirtyPayload),
}

impl PuppetEvent {
    pub fn heartbeat(data: impl Into<String>) -> Self {
        PuppetEvent::Heartbeat(DataPayload { data: data.into() })
    }

    pub fn login(contact_id: impl Into<String>) -> Self {
        PuppetEvent::Login(LoginPayload {
            contact_id: contact_id.into(),
        })
    }

    pub fn event_type(&self) -> EventType {
        match self {
            PuppetEvent::Heartbeat(_) => EventType::Heartbeat,
            PuppetEvent::Message(_) => EventType::Message,
            PuppetEvent::Dong(_) => EventType::Dong,
            PuppetEvent::Error(_) => EventType::Error,
            PuppetEvent::Friendship(_) => EventType::Friendship,
            PuppetEvent::RoomInvite(_) => EventType::RoomInvite,
            PuppetEvent::RoomJoin(_) => EventType::RoomJoin,
            PuppetEvent::RoomLeave(_) => EventType::RoomLeave,
            PuppetEvent::RoomTopic(_) => EventType::RoomTopic,
            PuppetEvent::Scan(_) => EventType::Scan,
            PuppetEvent::Ready(_) => EventType::Ready,
            PuppetEvent::Reset(_) => EventType::Reset,
            PuppetEvent::Login(_) => EventType::Login,
            PuppetEvent::Logout(_) => EventType::Logout,
            PuppetEvent::Dirty(_) => EventType::Dirty,
        }
    }

    fn payload_json(&self) -> serde_json::Result<String> {
        match self {
            PuppetEvent::Heartbeat(p)
            | PuppetEvent::Dong(p)
            | PuppetEvent::Error(p)
            | PuppetEvent::Ready(p)
            | PuppetEvent::Reset(p) => serde_json::to_string(p),
            PuppetEvent::Message(p) => serde_json::to_string(p),
            PuppetEvent::Friendship(p) => serde_json::to_string(p),
            PuppetEvent::RoomInvite(p) => serde_json::to_string(p),
            PuppetEvent::RoomJoin(p) => serde_json::to_string(p),
            PuppetEvent::RoomLeave(p) => serde_json::to_string(p),
            PuppetEvent::RoomTopic(p) => serde_json::to_string(p),
            PuppetEvent::Scan(p) => serde_json::to_string(p),
            PuppetEvent::Login(p) => serde_json::to_string(p),
            PuppetEvent::Logout(p) => serde_json::to_string(p),
            PuppetEvent::Dirty(p) => serde_json::to_string(p),
        }
    }
}

/// The wire unit of the event stream.
///
/// `event_type` is kept as the raw integer so envelopes with kinds this build
/// does not know still deserialize and can be logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: i32,
    pub payload: String,
}

impl EventEnvelope {
    /// Wrap an event for the wire.
    ///
    /// Fails for [`PuppetEvent::Reset`], which must never reach a peer.
    pub fn encode(event: &PuppetEvent) -> Result<Self> {
        let event_type = event.event_type();
        if event_type == EventType::Reset {
            return Err(BridgeError::protocol("reset events are never forwarded"));
        }
        Ok(Self {
            event_type: event_type.code(),
            payload: event.payload_json()?,
        })
    }

    pub fn kind(&self) -> Option<EventType> {
        EventType::from_code(self.event_type)
    }

    /// Decode back into an event. `Ok(None)` for an unknown type.
    pub fn decode(&self) -> Result<Option<PuppetEvent>> {
        let Some(kind) = self.kind() else {
            return Ok(None);
        };
        let p = self.payload.as_str();
        let event = match kind {
            EventType::Heartbeat => PuppetEvent::Heartbeat(parse_payload(p)?),
            EventType::Message => PuppetEvent::Message(serde_json::from_str(p)?),
            EventType::Dong => PuppetEvent::Dong(parse_payload(p)?),
            EventType::Error => PuppetEvent::Error(parse_payload(p)?),
            EventType::Friendship => PuppetEvent::Friendship(serde_json::from_str(p)?),
            EventType::RoomInvite => PuppetEvent::RoomInvite(serde_json::from_str(p)?),
            EventType::RoomJoin => PuppetEvent::RoomJoin(serde_json::from_str(p)?),
            EventType::RoomLeave => PuppetEvent::RoomLeave(serde_json::from_str(p)?),
            EventType::RoomTopic => PuppetEvent::RoomTopic(serde_json::from_str(p)?),
            EventType::Scan => PuppetEvent::Scan(serde_json::from_str(p)?),
            EventType::Ready => PuppetEvent::Ready(parse_payload(p)?),
            EventType::Reset => PuppetEvent::Reset(parse_payload(p)?),
            EventType::Login => PuppetEvent::Login(serde_json::from_str(p)?),
            EventType::Logout => PuppetEvent::Logout(serde_json::from_str(p)?),
            EventType::Dirty => PuppetEvent::Dirty(serde_json::from_str(p)?),
        };
        Ok(Some(event))
    }
}

/// Data-only payloads tolerate an empty string.
fn parse_payload(payload: &str) -> Result<DataPayload> {
    if payload.trim().is_empty() {
        return Ok(DataPayload {
            data: String::new(),
        });
    }
    Ok(serde_json::from_str(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_codes_are_unique_and_stable() {
        let mut codes: Vec<i32> = EventType::ALL.iter().map(|t| t.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), EventType::ALL.len());
        assert_eq!(EventType::Heartbeat.code(), 1);
        assert_eq!(EventType::Login.code(), 25);
        assert_eq!(EventType::from_code(0), None);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = EventEnvelope::encode(&PuppetEvent::login("contact-1")).unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], 25);
        assert_eq!(json["payload"], r#"{"contactId":"contact-1"}"#);
    }

    #[test]
    fn test_reset_is_never_encoded() {
        let reset = PuppetEvent::Reset(DataPayload {
            data: "boom".into(),
        });
        assert!(EventEnvelope::encode(&reset).is_err());
    }

    #[test]
    fn test_decode_room_topic() {
        let event = PuppetEvent::RoomTopic(RoomTopicPayload {
            room_id: "room".into(),
            changer_id: "alice".into(),
            new_topic: "new".into(),
            old_topic: "old".into(),
            timestamp: 42,
        });
        let env = EventEnvelope::encode(&event).unwrap();
        assert_eq!(env.decode().unwrap(), Some(event));
    }

    #[test]
    fn test_unknown_type_decodes_to_none() {
        let env = EventEnvelope {
            event_type: 999,
            payload: "{}".into(),
        };
        assert_eq!(env.decode().unwrap(), None);
    }

    #[test]
    fn test_empty_heartbeat_payload() {
        let env = EventEnvelope {
            event_type: EventType::Heartbeat.code(),
            payload: String::new(),
        };
        assert_eq!(env.decode().unwrap(), Some(PuppetEvent::heartbeat("")));
    }
}
