/// JSON documents exchanged with the OOB peer, plus base64 helpers for the
/// byte-carrying fields.
use serde::{Deserialize, Serialize};

pub const ACTION_GET_TARGET_INFO: &str = "get_target_info";
pub const ACTION_COMPLETE_HANDSHAKE: &str = "complete_handshake";
pub const ACTION_RELEASE_CONNECTION: &str = "release_connection";
pub const ACTION_STORE_CLIENT_MESSAGE: &str = "store_client_message";

pub fn encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(data.trim())
}

// ── Requests ─────────────────────────────────────────────────────────

/// `POST /get_target_info`. `client_hello` present ⇒ broker the handshake;
/// otherwise `sni` carries the hostname for resolution-only requests, and
/// neither means "query a brokered session".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfoRequest {
    pub session_id: String,
    pub action: String,
    #[serde(default)]
    pub client_hello: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// `POST /complete_handshake` and `POST /release_connection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
    pub action: String,
}

/// `POST /get_response`. Without `index`, dequeues the oldest buffered
/// response; with it, peeks without consuming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

/// `POST /store_client_message` — post-ClientHello client flights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMessageRequest {
    pub session_id: String,
    pub action: String,
    pub data: String,
}

// ── Responses ────────────────────────────────────────────────────────

/// Target metadata enabling the client's direct reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    pub target_host: String,
    pub target_ip: String,
    pub target_port: u16,
    pub sni: String,
    #[serde(default)]
    pub session_ticket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_secret: Option<String>,
    pub tls_version: u16,
    #[serde(default, rename = "alpn_protocol")]
    pub alpn: Option<String>,
}

/// One buffered target response; `data` is empty when the queue is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub data: String,
    pub handshake_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip() {
        let data = [0x16u8, 0x03, 0x01, 0xff, 0x00];
        assert_eq!(decode(&encode(&data)).unwrap(), data);
    }

    #[test]
    fn target_info_request_wire_shape() {
        let req = TargetInfoRequest {
            session_id: "1700000000-deadbeefdeadbeef".into(),
            action: ACTION_GET_TARGET_INFO.into(),
            client_hello: None,
            sni: None,
            port: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        // Bare document matches the published schema: no stray fields.
        assert_eq!(
            json,
            serde_json::json!({
                "session_id": "1700000000-deadbeefdeadbeef",
                "action": "get_target_info",
                "client_hello": null,
            })
        );
    }

    #[test]
    fn target_info_serializes_null_ticket() {
        let info = TargetInfo {
            target_host: "example.com".into(),
            target_ip: "93.184.216.34".into(),
            target_port: 443,
            sni: "example.com".into(),
            session_ticket: None,
            master_secret: None,
            tls_version: 0x0303,
            alpn: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["session_ticket"], serde_json::Value::Null);
        assert_eq!(json["alpn_protocol"], serde_json::Value::Null);
        assert!(json.get("master_secret").is_none());
    }
}
