use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Session mode a participant searches in. Participants are only ever paired
/// within the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Audio,
    Video,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Audio => write!(f, "audio"),
            SessionMode::Video => write!(f, "video"),
        }
    }
}

/// Direction of a media transport relative to the owning connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Recv => write!(f, "recv"),
        }
    }
}

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Messages sent from client to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announce an optional external P2P signaling identity for this connection
    Register {
        #[serde(default)]
        peer_ref: Option<String>,
    },
    /// Start searching for a partner in the given mode
    Search { mode: SessionMode },
    /// Stop searching without tearing down anything else
    CancelSearch,
    /// Opaque signaling payload for the current partner (offer/answer/candidate)
    Signal { payload: serde_json::Value },
    /// Leave the current partner and immediately search again
    RequestNext,
    /// Leave the current partner or stop waiting
    Leave,
    /// Ask for the media router's RTP capabilities
    GetRouterCapabilities,
    /// Ask the media engine for a transport in the given direction
    CreateTransport { direction: Direction },
    /// Provide the remote parameters for a previously created transport
    ConnectTransport {
        direction: Direction,
        remote_parameters: serde_json::Value,
    },
    /// Start producing media on the send transport
    Produce {
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    },
    /// Start consuming a partner's producer on the receive transport
    Consume {
        producer_id: String,
        rtp_capabilities: serde_json::Value,
    },
    /// Heartbeat to keep the connection alive
    Ping,
}

/// Messages sent from the server to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledge registration, echoing the public identifier
    Registered { connection_id: String },
    /// No partner available yet; the connection stays queued
    Waiting,
    /// A partner was found
    Paired {
        room_id: String,
        partner_id: String,
        mode: SessionMode,
        initiator: bool,
    },
    /// The partner left, disconnected, or skipped ahead
    PartnerLeft,
    /// The search was cancelled (explicitly or by the wait timeout)
    SearchCancelled,
    /// Opaque signaling payload relayed from the partner
    Signal {
        payload: serde_json::Value,
        from: String,
    },
    /// The partner started producing a new media track
    NewProducer { producer_id: String, kind: MediaKind },
    /// RTP capabilities of the media router
    RouterCapabilities { rtp_capabilities: serde_json::Value },
    /// A transport was created; `transport` carries the engine's descriptor verbatim
    TransportCreated {
        direction: Direction,
        transport: serde_json::Value,
    },
    /// A transport finished connecting
    TransportConnected { direction: Direction },
    /// Producing started
    Produced { producer_id: String },
    /// Consuming started; `consumer` carries the engine's descriptor verbatim
    Consumed { consumer: serde_json::Value },
    /// Response to ping
    Pong,
    /// Error message
    Error { message: String },
}

/// Generate a unique connection ID
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a room ID: timestamp plus random suffix, unique with
/// overwhelming probability.
pub fn generate_room_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("room_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_type_tagged() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"search","mode":"video"}"#)
            .expect("search should parse");
        match msg {
            ClientMessage::Search { mode } => assert_eq!(mode, SessionMode::Video),
            other => panic!("unexpected message: {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"register"}"#).expect("register should parse");
        match msg {
            ClientMessage::Register { peer_ref } => assert!(peer_ref.is_none()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn paired_notification_shape() {
        let msg = ServerMessage::Paired {
            room_id: "room_1_abc".into(),
            partner_id: "p2".into(),
            mode: SessionMode::Audio,
            initiator: true,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "paired");
        assert_eq!(value["room_id"], "room_1_abc");
        assert_eq!(value["mode"], "audio");
        assert_eq!(value["initiator"], true);
    }

    #[test]
    fn room_ids_are_unique() {
        let a = generate_room_id();
        let b = generate_room_id();
        assert_ne!(a, b);
        assert!(a.starts_with("room_"));
    }
}
