//! Wire format tests for the websocket protocol.
//!
//! Frames are written out literally so that a change to the encoding shows
//! up here before it breaks deployed clients.

use lagless_engine::{fields_from_json, ClientMessage, FieldDiff, MethodError, ServerMessage};
use serde_json::json;

#[cfg(test)]
mod client_frames {
    use super::*;

    #[test]
    fn test_connect() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"msg": "connect", "client_id": "device-123"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Connect {
                client_id: "device-123".to_string()
            }
        );
    }

    #[test]
    fn test_method_with_seed() {
        let json = r#"{
            "msg": "method",
            "id": "7",
            "method": "todos.insert",
            "params": {"title": "Buy milk"},
            "random_seed": "device-123:7"
        }"#;

        match serde_json::from_str(json).unwrap() {
            ClientMessage::Method {
                id,
                method,
                params,
                random_seed,
            } => {
                assert_eq!(id, "7");
                assert_eq!(method, "todos.insert");
                assert_eq!(params, json!({"title": "Buy milk"}));
                assert_eq!(random_seed.as_deref(), Some("device-123:7"));
            }
            other => panic!("Expected method message, got {:?}", other),
        }
    }

    #[test]
    fn test_optional_fields_default() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"msg": "method", "id": "1", "method": "todos.clear"}"#)
                .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Method { params, random_seed: None, .. } if params.is_null()
        ));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"msg": "sub", "id": "s1", "name": "todos.all"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Sub { params, .. } if params.is_null()));

        let msg: ClientMessage = serde_json::from_str(r#"{"msg": "ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { id: None });
    }

    #[test]
    fn test_unsub() {
        let msg: ClientMessage = serde_json::from_str(r#"{"msg": "unsub", "id": "s1"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unsub { id: "s1".into() });
    }

    #[test]
    fn test_unknown_message_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"msg": "push"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"id": "1"}"#).is_err());
    }
}

#[cfg(test)]
mod server_frames {
    use super::*;

    #[test]
    fn test_added() {
        let msg = ServerMessage::Added {
            sub: "s1".into(),
            collection: "todos".into(),
            id: "t1".into(),
            fields: fields_from_json(json!({"title": "A", "checked": false})),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "msg": "added",
                "sub": "s1",
                "collection": "todos",
                "id": "t1",
                "fields": {"checked": false, "title": "A"}
            })
        );
    }

    #[test]
    fn test_changed_carries_set_and_unset() {
        let msg = ServerMessage::Changed {
            sub: "s1".into(),
            collection: "todos".into(),
            id: "t1".into(),
            diff: FieldDiff::new().set("checked", json!(true)).unset("owner"),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "msg": "changed",
                "sub": "s1",
                "collection": "todos",
                "id": "t1",
                "diff": {"set": {"checked": true}, "unset": ["owner"]}
            })
        );
    }

    #[test]
    fn test_method_error_kinds() {
        let msg = ServerMessage::MethodError {
            id: "3".into(),
            error: MethodError::domain("invalid-title", "title must not be empty")
                .with_details(json!({"field": "title"})),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "msg": "method_error",
                "id": "3",
                "error": {
                    "kind": "domain",
                    "error": "invalid-title",
                    "reason": "title must not be empty",
                    "details": {"field": "title"}
                }
            })
        );

        let msg = ServerMessage::MethodError {
            id: "4".into(),
            error: MethodError::authorization("login required"),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""kind":"authorization""#));
    }

    #[test]
    fn test_nosub_and_ready() {
        let json = serde_json::to_string(&ServerMessage::NoSub {
            id: "s1".into(),
            error: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"msg":"nosub","id":"s1"}"#);

        let json = serde_json::to_string(&ServerMessage::Ready {
            subs: vec!["s1".into(), "s2".into()],
        })
        .unwrap();
        assert_eq!(json, r#"{"msg":"ready","subs":["s1","s2"]}"#);
    }

    #[test]
    fn test_result_and_pong() {
        let json = serde_json::to_string(&ServerMessage::Result {
            id: "1".into(),
            result: json!("abc"),
        })
        .unwrap();
        assert_eq!(json, r#"{"msg":"result","id":"1","result":"abc"}"#);

        let json = serde_json::to_string(&ServerMessage::Pong { id: None }).unwrap();
        assert_eq!(json, r#"{"msg":"pong"}"#);
    }

    #[test]
    fn test_error() {
        let json = serde_json::to_string(&ServerMessage::error("Invalid message format")).unwrap();
        assert_eq!(json, r#"{"msg":"error","reason":"Invalid message format"}"#);
    }
}
