//! # Wire Protocol
//!
//! JSON frames exchanged with an audio node over its WebSocket. Every frame is
//! an object tagged by `op`.
//!
//! Outbound ops ([`OutgoingMessage`]): `connect`, `voiceUpdate`, `play`, `stop`,
//! `pause`, `seek`, `volume`, `destroy`, `disconnect`, `validationRes`,
//! `isConnectedRes`.
//!
//! Inbound ops ([`IncomingMessage`]): `stats`, `playerUpdate`, `event`,
//! `validationReq`, `isConnectedReq`, `sendWS`. Anything else decodes to
//! [`IncomingMessage::Unknown`] so a newer node never breaks routing.
//!
//! Snowflakes travel as strings, the way nodes expect them.

use std::num::NonZeroU64;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::node::NodeStats;

/// Frames sent from this process to a node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingMessage {
    /// Ask the node to bring the bot into a channel
    #[serde(rename_all = "camelCase")]
    Connect { guild_id: String, channel_id: String },

    /// Gateway-issued voice credentials
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        guild_id: String,
        session_id: String,
        event: VoiceUpdateEvent,
    },

    /// Start or replace playback
    #[serde(rename_all = "camelCase")]
    Play {
        guild_id: String,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        no_replace: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pause: Option<bool>,
    },

    #[serde(rename_all = "camelCase")]
    Stop { guild_id: String },

    #[serde(rename_all = "camelCase")]
    Pause { guild_id: String, pause: bool },

    #[serde(rename_all = "camelCase")]
    Seek { guild_id: String, position: u64 },

    #[serde(rename_all = "camelCase")]
    Volume { guild_id: String, volume: u16 },

    /// Tear down the node-side player
    #[serde(rename_all = "camelCase")]
    Destroy { guild_id: String },

    /// Drop the node-side voice connection
    #[serde(rename_all = "camelCase")]
    Disconnect { guild_id: String },

    #[serde(rename_all = "camelCase")]
    ValidationRes {
        guild_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        valid: bool,
    },

    #[serde(rename_all = "camelCase")]
    IsConnectedRes { shard_id: u64, connected: bool },
}

impl OutgoingMessage {
    /// Builds a `play` frame from a track token and its options
    pub fn play(guild_id: impl ToString, track: impl Into<String>, options: &PlayOptions) -> Self {
        Self::Play {
            guild_id: guild_id.to_string(),
            track: track.into(),
            start_time: options.start_time,
            end_time: options.end_time,
            volume: options.volume,
            no_replace: options.no_replace,
            pause: options.pause,
        }
    }

    /// Wire name of the op, for logging
    pub fn op(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::VoiceUpdate { .. } => "voiceUpdate",
            Self::Play { .. } => "play",
            Self::Stop { .. } => "stop",
            Self::Pause { .. } => "pause",
            Self::Seek { .. } => "seek",
            Self::Volume { .. } => "volume",
            Self::Destroy { .. } => "destroy",
            Self::Disconnect { .. } => "disconnect",
            Self::ValidationRes { .. } => "validationRes",
            Self::IsConnectedRes { .. } => "isConnectedRes",
        }
    }
}

/// Voice server payload forwarded inside `voiceUpdate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceUpdateEvent {
    pub endpoint: String,
    pub guild_id: String,
    pub token: String,
}

/// Optional fields merged onto a `play` frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayOptions {
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub volume: Option<u16>,
    pub no_replace: Option<bool>,
    pub pause: Option<bool>,
}

impl PlayOptions {
    /// Options that start playback at `position` milliseconds
    pub fn starting_at(position: u64) -> Self {
        Self {
            start_time: Some(position),
            ..Self::default()
        }
    }
}

/// Frames received from a node
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    /// Load sample; already stored by the node connection
    Stats(NodeStats),

    #[serde(rename_all = "camelCase")]
    PlayerUpdate { guild_id: String, state: PlayerState },

    Event(TrackEvent),

    #[serde(rename_all = "camelCase")]
    ValidationReq {
        guild_id: String,
        #[serde(default)]
        channel_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    IsConnectedReq {
        #[serde(deserialize_with = "de_shard_id")]
        shard_id: u64,
    },

    #[serde(rename = "sendWS", rename_all = "camelCase")]
    SendWs {
        #[serde(deserialize_with = "de_shard_id")]
        shard_id: u64,
        message: String,
    },

    #[serde(other)]
    Unknown,
}

impl IncomingMessage {
    /// Decodes a parsed frame; frames without an `op` yield `None`
    pub fn from_value(value: Value) -> Option<Result<Self, serde_json::Error>> {
        value.get("op")?;
        Some(serde_json::from_value(value))
    }
}

/// Playback snapshot reported by `playerUpdate`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    #[serde(default)]
    pub position: Option<u64>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Track lifecycle event (`op: event`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    pub guild_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Known values of [`TrackEvent::kind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEventKind {
    End,
    Exception,
    Stuck,
}

impl TrackEvent {
    pub fn event_kind(&self) -> Option<TrackEventKind> {
        match self.kind.as_str() {
            "TrackEndEvent" => Some(TrackEventKind::End),
            "TrackExceptionEvent" => Some(TrackEventKind::Exception),
            "TrackStuckEvent" => Some(TrackEventKind::Stuck),
            _ => None,
        }
    }

    /// A replace-in-place `play` ends the superseded track with this reason
    pub fn is_replaced(&self) -> bool {
        self.reason
            .as_deref()
            .is_some_and(|reason| reason.eq_ignore_ascii_case("replaced"))
    }
}

/// Raw gateway payload carried inside `sendWS.message`
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

/// Gateway opcode for voice state updates
pub const VOICE_STATE_UPDATE: u8 = 4;

/// Parses a non-zero snowflake from its string form
pub fn parse_snowflake(raw: &str) -> Option<NonZeroU64> {
    raw.trim().parse::<u64>().ok().and_then(NonZeroU64::new)
}

fn de_shard_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    // Algunos nodos mandan el shard como string
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("shardId must be a positive integer")),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "unexpected shardId: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_play_omits_unset_options() {
        let msg = OutgoingMessage::play(7u64, "trackA", &PlayOptions::starting_at(3000));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"op": "play", "guildId": "7", "track": "trackA", "startTime": 3000})
        );
    }

    #[test]
    fn test_voice_update_shape() {
        let msg = OutgoingMessage::VoiceUpdate {
            guild_id: "1".into(),
            session_id: "abc".into(),
            event: VoiceUpdateEvent {
                endpoint: "us-east1.discord.media".into(),
                guild_id: "1".into(),
                token: "tok".into(),
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["op"], "voiceUpdate");
        assert_eq!(value["sessionId"], "abc");
        assert_eq!(value["event"]["guild_id"], "1");
        assert_eq!(msg.op(), "voiceUpdate");
    }

    #[test]
    fn test_incoming_routes_by_op() {
        let update = IncomingMessage::from_value(json!({
            "op": "playerUpdate",
            "guildId": "1",
            "state": {"position": 1000, "time": 1_700_000_000_000i64, "connected": true}
        }))
        .unwrap()
        .unwrap();
        match update {
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                assert_eq!(guild_id, "1");
                assert_eq!(state.position, Some(1000));
                assert!(state.time.is_some());
                assert_eq!(state.extra.get("connected"), Some(&json!(true)));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let relay = IncomingMessage::from_value(json!({
            "op": "sendWS", "shardId": "3", "message": "{}"
        }))
        .unwrap()
        .unwrap();
        assert!(matches!(relay, IncomingMessage::SendWs { shard_id: 3, .. }));

        let unknown = IncomingMessage::from_value(json!({"op": "somethingNew"}))
            .unwrap()
            .unwrap();
        assert!(matches!(unknown, IncomingMessage::Unknown));

        assert!(IncomingMessage::from_value(json!({"guildId": "1"})).is_none());
    }

    #[test]
    fn test_track_event_reason() {
        let event: TrackEvent = serde_json::from_value(json!({
            "guildId": "1", "type": "TrackEndEvent", "reason": "REPLACED"
        }))
        .unwrap();
        assert_eq!(event.event_kind(), Some(TrackEventKind::End));
        assert!(event.is_replaced());

        let event: TrackEvent = serde_json::from_value(json!({
            "guildId": "1", "type": "TrackEndEvent", "reason": "FINISHED"
        }))
        .unwrap();
        assert!(!event.is_replaced());
    }

    #[test]
    fn test_parse_snowflake_rejects_zero() {
        assert_eq!(parse_snowflake("0"), None);
        assert_eq!(parse_snowflake("abc"), None);
        assert_eq!(parse_snowflake(" 12 ").map(NonZeroU64::get), Some(12));
    }
}
