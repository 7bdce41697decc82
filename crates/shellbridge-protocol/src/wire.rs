//! Client-facing wire protocol: newline-delimited JSON over the TCP ingress.

use serde::{Deserialize, Serialize};

/// One inbound line from the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "INIT")]
    Init { idname: String, reinit: bool },
    #[serde(rename = "INPUT")]
    Input { payload: String },
    #[serde(rename = "SIGNAL")]
    Signal { signum: i32 },
}

/// `idname` must be 1..=30 ASCII alphanumerics.
pub fn is_valid_idname(idname: &str) -> bool {
    !idname.is_empty()
        && idname.len() <= shellbridge_core::config::IDNAME_MAX_LEN
        && idname.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// One outbound line to the client. Exactly one variant is ever sent at a time.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "PROMPT")]
    Prompt { payload: String },
    #[serde(rename = "DIRECT")]
    Direct { payload: String },
    #[serde(rename = "DISPLAY")]
    Display { payload: String },
    #[serde(rename = "UPLOAD")]
    Upload { payload: String },
}

impl ServerMessage {
    pub fn upload(data: &[u8]) -> Self {
        use base64::Engine;
        ServerMessage::Upload {
            payload: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    /// Serialize as one line, newline-terminated, ready to write to the socket.
    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_default();
        s.push('\n');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"INIT","idname":"alice","reinit":false}"#).unwrap();
        match msg {
            ClientMessage::Init { idname, reinit } => {
                assert_eq!(idname, "alice");
                assert!(!reinit);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_input_and_signal() {
        let input: ClientMessage =
            serde_json::from_str(r#"{"type":"INPUT","payload":"echo hi\n"}"#).unwrap();
        assert!(matches!(input, ClientMessage::Input { .. }));

        let signal: ClientMessage =
            serde_json::from_str(r#"{"type":"SIGNAL","signum":20}"#).unwrap();
        match signal {
            ClientMessage::Signal { signum } => assert_eq!(signum, 20),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let result: Result<ClientMessage, _> = serde_json::from_str(r#"{"type":"BOGUS"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn idname_validation() {
        assert!(is_valid_idname("alice123"));
        assert!(!is_valid_idname(""));
        assert!(!is_valid_idname("has a space"));
        assert!(!is_valid_idname("has-dash"));
        assert!(!is_valid_idname(&"a".repeat(31)));
        assert!(is_valid_idname(&"a".repeat(30)));
    }

    #[test]
    fn direct_message_round_trips() {
        let msg = ServerMessage::Direct {
            payload: "hello world\n".to_string(),
        };
        let line = msg.to_line();
        assert_eq!(line, "{\"type\":\"DIRECT\",\"payload\":\"hello world\\n\"}\n");
    }

    #[test]
    fn upload_message_encodes_base64() {
        let msg = ServerMessage::upload(b"hello world\n");
        match msg {
            ServerMessage::Upload { payload } => assert_eq!(payload, "aGVsbG8gd29ybGQK"),
            _ => panic!("wrong variant"),
        }
    }
}
