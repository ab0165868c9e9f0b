//! Wire packet model shared by the UDP discovery beacon and the TCP
//! control channel. Every packet is JSON with a `type` discriminator.
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Per-frame ceiling for control packets and stream chunks (50 MiB).
pub const MAX_PACKET_SIZE: usize = 50 * 1024 * 1024;

/// Sentinel room whose members never exchange chat history.
pub const LOBBY_ROOM: &str = "__LOBBY__";

/// Gossip packet kinds carried through the history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "MESSAGE")]
    Message,
    #[serde(rename = "FILE_REQ")]
    FileReq,
    #[serde(rename = "FILE_CANCEL")]
    FileCancel,
    #[serde(rename = "FILE_DOWNLOADED")]
    FileDownloaded,
}

/// A single gossip unit. File-transfer kinds carry the optional tail
/// fields; plain chat leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub msg_id: String,
    pub sender_session: String,
    #[serde(default)]
    pub sender_nickname: String,
    #[serde(default)]
    pub sender_short_id: String,
    #[serde(default)]
    pub content: String,
    /// Wall-clock seconds. Ordering hint only, never trusted for causality.
    pub timestamp: f64,
    #[serde(default)]
    pub vclock: HashMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_zip: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloader_nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloader_short_id: Option<String>,
}

/// Optional gossip fields filled in by the file-transfer paths.
#[derive(Debug, Clone, Default)]
pub struct MessageExtra {
    pub req_id: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub is_zip: Option<bool>,
    pub file_sha256: Option<String>,
    pub downloader_nickname: Option<String>,
    pub downloader_short_id: Option<String>,
}

/// Non-gossiped control packets (point-to-point, never enter the log).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlPacket {
    #[serde(rename = "CHAT_HISTORY")]
    ChatHistory { messages: Vec<Message> },
    #[serde(rename = "FILE_ACCEPT")]
    FileAccept { req_id: String, sender_session: String },
    #[serde(rename = "FILE_STREAM_START")]
    FileStreamStart {
        req_id: String,
        expected_size: u64,
        expected_sha256: String,
    },
}

/// UDP presence beacon. Intentionally unencrypted: room privacy comes
/// from the room key, not from hiding the room name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Announce {
    #[serde(rename = "type")]
    pub kind: String,
    pub nickname: String,
    pub session_id: String,
    pub tcp_port: u16,
    pub room_name: String,
    pub is_private: bool,
}

pub const ANNOUNCE_KIND: &str = "DISCOVERY";

/// Wall-clock seconds since the epoch, fractional.
pub fn unix_time_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_roundtrips_with_type_tag() {
        let msg = Message {
            kind: MessageKind::FileReq,
            msg_id: "aaaa1111_1".into(),
            sender_session: "aaaa1111".into(),
            sender_nickname: "Alice".into(),
            sender_short_id: "000.121".into(),
            content: "File share: a.txt".into(),
            timestamp: 1_700_000_000.25,
            vclock: HashMap::from([("aaaa1111".to_string(), 1)]),
            req_id: Some("r1".into()),
            file_name: Some("a.txt".into()),
            file_size: Some(42),
            is_zip: Some(false),
            file_sha256: Some("ab".into()),
            downloader_nickname: None,
            downloader_short_id: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "FILE_REQ");
        assert_eq!(json["vclock"]["aaaa1111"], 1);
        // Unused optional fields stay off the wire entirely.
        assert!(json.get("downloader_nickname").is_none());
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn control_packets_tag_by_type() {
        let accept = ControlPacket::FileAccept {
            req_id: "r1".into(),
            sender_session: "bbbb2222".into(),
        };
        let json = serde_json::to_value(&accept).unwrap();
        assert_eq!(json["type"], "FILE_ACCEPT");
        let back: ControlPacket = serde_json::from_value(json).unwrap();
        assert_eq!(back, accept);
    }

    #[test]
    fn announce_matches_discovery_wire_format() {
        let raw = r#"{"type":"DISCOVERY","nickname":"Bob","session_id":"bbbb2222","tcp_port":50001,"room_name":"R","is_private":false}"#;
        let ann: Announce = serde_json::from_str(raw).unwrap();
        assert_eq!(ann.kind, ANNOUNCE_KIND);
        assert_eq!(ann.tcp_port, 50001);
        assert!(!ann.is_private);
    }
}
