//! Wire messages, shared with clients through the engine crate.
//!
//! Every frame is a JSON object tagged by `msg`.

pub use lagless_engine::protocol::{ClientMessage, ServerMessage};

/// Parse one text frame.
pub fn decode(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}

/// Render one outgoing message.
pub fn encode(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_client_frames() {
        let frame = r#"{"msg":"sub","id":"s1","name":"todos.all","params":null}"#;
        assert!(matches!(decode(frame), Ok(ClientMessage::Sub { id, .. }) if id == "s1"));
        assert!(decode(r#"{"msg":"pull"}"#).is_err());
    }

    #[test]
    fn encodes_server_frames() {
        let text = encode(&ServerMessage::Ready {
            subs: vec!["s1".into()],
        })
        .unwrap();
        assert_eq!(text, r#"{"msg":"ready","subs":["s1"]}"#);
    }
}
