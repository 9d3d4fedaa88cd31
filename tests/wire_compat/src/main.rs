fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use happy_protocol::frame::Frame;
    use happy_protocol::messages::*;
    use serde_json::json;

    /// Serializes a value and compares the wire text against the expected
    /// JSON, order-independent. Goes through a string so `RawValue` fields
    /// compare by content.
    fn assert_wire<T: serde::Serialize>(value: &T, expected: serde_json::Value) {
        let text = serde_json::to_string(value).expect("serialize");
        let actual: serde_json::Value = serde_json::from_str(&text).expect("reparse");
        assert_eq!(actual, expected, "wire shape mismatch: {text}");
    }

    // --- Frame envelopes ---

    #[test]
    fn rpc_request_frame() {
        let text = r#"{"event":"rpc-request","ackId":"a1","data":{"method":"scope:foo","params":"cc==","requestId":"r1"}}"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.event, "rpc-request");
        assert_eq!(frame.ack_id.as_deref(), Some("a1"));
        assert!(!frame.is_ack());

        let request: RpcRequestPayload = frame.parse_data().unwrap().unwrap();
        assert_eq!(request.method, "scope:foo");
        assert_eq!(request.params, "cc==");
        assert_eq!(request.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn rpc_response_frame() {
        let frame = Frame::ack_reply("rpc-response", "a1", &"ZW5j").unwrap();
        assert_wire(
            &frame,
            json!({"event": "rpc-response", "ackId": "a1", "ack": "ZW5j"}),
        );
    }

    #[test]
    fn rpc_cancel_frame() {
        let text = r#"{"event":"rpc-cancel","data":{"requestId":"r1","method":"scope:foo"}}"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        let cancel: RpcCancelPayload = frame.parse_data().unwrap().unwrap();
        assert_eq!(cancel.request_id, "r1");
        assert_eq!(cancel.method, "scope:foo");
    }

    #[test]
    fn rpc_register_frame() {
        let frame = Frame::event(
            "rpc-register",
            Some(&RpcRegisterPayload {
                method: "scope:foo".into(),
            }),
        )
        .unwrap();
        assert_wire(
            &frame,
            json!({"event": "rpc-register", "data": {"method": "scope:foo"}}),
        );
    }

    // --- Session traffic ---

    #[test]
    fn session_message_frame() {
        let frame = Frame::event(
            "message",
            Some(&SessionMessagePayload {
                sid: "s1".into(),
                message: "ZW5j".into(),
            }),
        )
        .unwrap();
        assert_wire(
            &frame,
            json!({"event": "message", "data": {"sid": "s1", "message": "ZW5j"}}),
        );
    }

    #[test]
    fn session_update_state_payload() {
        assert_wire(
            &SessionUpdatePayload {
                sid: "s1".into(),
                expected_version: 4,
                blob: BlobField::new(BlobKind::AgentState, "ZW5j".into()),
            },
            json!({"sid": "s1", "expectedVersion": 4, "agentState": "ZW5j"}),
        );
    }

    #[test]
    fn session_update_metadata_payload() {
        assert_wire(
            &SessionUpdatePayload {
                sid: "s1".into(),
                expected_version: 0,
                blob: BlobField::new(BlobKind::Metadata, "ZW5j".into()),
            },
            json!({"sid": "s1", "expectedVersion": 0, "metadata": "ZW5j"}),
        );
    }

    #[test]
    fn machine_update_payloads() {
        assert_wire(
            &MachineUpdatePayload {
                machine_id: "m1".into(),
                expected_version: 2,
                blob: BlobField::new(BlobKind::DaemonState, "ZW5j".into()),
            },
            json!({"machineId": "m1", "expectedVersion": 2, "daemonState": "ZW5j"}),
        );
        assert_wire(
            &MachineUpdatePayload {
                machine_id: "m1".into(),
                expected_version: 2,
                blob: BlobField::new(BlobKind::Metadata, "ZW5j".into()),
            },
            json!({"machineId": "m1", "expectedVersion": 2, "metadata": "ZW5j"}),
        );
    }

    #[test]
    fn update_ack_discriminants() {
        for (raw, expected) in [
            (r#"{"result":"success","version":3}"#, UpdateResult::Success),
            (
                r#"{"result":"version-mismatch","version":7,"agentState":"ZW5j"}"#,
                UpdateResult::VersionMismatch,
            ),
            (r#"{"result":"error"}"#, UpdateResult::Error),
        ] {
            let ack: UpdateAck = serde_json::from_str(raw).unwrap();
            assert_eq!(ack.result, expected, "for {raw}");
        }
    }

    // --- Keepalives and usage ---

    #[test]
    fn session_alive_frame() {
        let frame = Frame::event(
            "session-alive",
            Some(&SessionAlivePayload {
                sid: "s1".into(),
                time: 1_700_000_000_000,
                thinking: true,
                mode: "default".into(),
            }),
        )
        .unwrap();
        assert_wire(
            &frame,
            json!({
                "event": "session-alive",
                "data": {"sid": "s1", "time": 1_700_000_000_000i64, "thinking": true, "mode": "default"},
            }),
        );
    }

    #[test]
    fn machine_alive_frame() {
        let frame = Frame::event(
            "machine-alive",
            Some(&MachineAlivePayload {
                machine_id: "m1".into(),
                time: 1_700_000_000_000,
            }),
        )
        .unwrap();
        assert_wire(
            &frame,
            json!({
                "event": "machine-alive",
                "data": {"machineId": "m1", "time": 1_700_000_000_000i64},
            }),
        );
    }

    #[test]
    fn usage_report_frame() {
        let payload = UsageReportPayload {
            key: "claude".into(),
            session_id: "s1".into(),
            model: Some("claude-opus-4".into()),
            tokens: TokenTotals {
                input: 10,
                output: 20,
                cache_read: 5,
                cache_write: 1,
                total: 36,
            },
            cost: CostTotals {
                input: 0.5,
                output: 1.5,
                total: 2.0,
            },
        };
        assert_wire(
            &payload,
            json!({
                "key": "claude",
                "sessionId": "s1",
                "model": "claude-opus-4",
                "tokens": {"input": 10, "output": 20, "cacheRead": 5, "cacheWrite": 1, "total": 36},
                "cost": {"input": 0.5, "output": 1.5, "total": 2.0},
            }),
        );
    }

    // --- Inbound pushes ---

    #[test]
    fn inbound_update_kinds() {
        let update: UpdateEnvelope = serde_json::from_value(json!({
            "body": {"t": "new-message", "sid": "s1", "message": "ZW5j"},
        }))
        .unwrap();
        assert!(matches!(update.body, UpdateBody::NewMessage { .. }));

        let update: UpdateEnvelope = serde_json::from_value(json!({
            "body": {
                "t": "update-session",
                "sid": "s1",
                "agentState": {"value": "ZW5j", "version": 9},
            },
        }))
        .unwrap();
        assert!(matches!(update.body, UpdateBody::UpdateSession { .. }));

        let update: UpdateEnvelope = serde_json::from_value(json!({
            "body": {
                "t": "update-machine",
                "machineId": "m1",
                "daemonState": {"value": "ZW5j", "version": 2},
            },
        }))
        .unwrap();
        assert!(matches!(update.body, UpdateBody::UpdateMachine { .. }));

        let update: UpdateEnvelope = serde_json::from_value(json!({
            "body": {"t": "delete-machine", "machineId": "m1"},
        }))
        .unwrap();
        assert!(matches!(update.body, UpdateBody::DeleteMachine { .. }));

        let update: UpdateEnvelope = serde_json::from_value(json!({
            "body": {
                "t": "kv-batch-update",
                "changes": [{"key": "contextNotificationsEnabled", "value": "true"}],
            },
        }))
        .unwrap();
        assert!(matches!(update.body, UpdateBody::KvBatchUpdate { .. }));
    }

    #[test]
    fn ephemeral_kinds() {
        for (raw, expected) in [
            (json!({"type": "activity", "sid": "s"}), EphemeralKind::Activity),
            (json!({"type": "usage"}), EphemeralKind::Usage),
            (
                json!({"type": "machine-activity", "machineId": "m"}),
                EphemeralKind::MachineActivity,
            ),
            (
                json!({"type": "machine-disconnected"}),
                EphemeralKind::MachineDisconnected,
            ),
        ] {
            let kind: EphemeralKind = serde_json::from_value(raw).unwrap();
            assert_eq!(kind, expected);
        }
    }

    // --- Revival broadcasts ---

    #[test]
    fn session_revived_frame() {
        let frame = Frame::event(
            "session-revived",
            Some(&SessionRevivedPayload {
                original_session_id: "old".into(),
                new_session_id: "new".into(),
                machine_id: "m1".into(),
            }),
        )
        .unwrap();
        assert_wire(
            &frame,
            json!({
                "event": "session-revived",
                "data": {"originalSessionId": "old", "newSessionId": "new", "machineId": "m1"},
            }),
        );
    }

    #[test]
    fn session_revival_paused_frame() {
        let frame = Frame::event(
            "session-revival-paused",
            Some(&SessionRevivalPausedPayload {
                reason: "circuit_breaker".into(),
                remaining_ms: 45_000,
                resumes_at: 1_700_000_045_000,
                machine_id: "m1".into(),
            }),
        )
        .unwrap();
        assert_wire(
            &frame,
            json!({
                "event": "session-revival-paused",
                "data": {
                    "reason": "circuit_breaker",
                    "remainingMs": 45_000,
                    "resumesAt": 1_700_000_045_000i64,
                    "machineId": "m1",
                },
            }),
        );
    }

    // --- Ciphertext framing ---

    #[test]
    fn ciphertext_is_base64_on_the_wire() {
        use happy_crypto::{EncryptionContext, KeyVariant};

        let crypto = EncryptionContext::new([1u8; 32], KeyVariant::Legacy);
        let sealed = crypto.encrypt(&json!({"role": "user"})).unwrap();
        // base64 alphabet only.
        assert!(
            sealed
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
        );
        // And it must round-trip through a JSON frame untouched.
        let frame = Frame::event(
            "message",
            Some(&SessionMessagePayload {
                sid: "s1".into(),
                message: sealed.clone(),
            }),
        )
        .unwrap();
        let text = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&text).unwrap();
        let payload: SessionMessagePayload = parsed.parse_data().unwrap().unwrap();
        assert_eq!(crypto.decrypt(&payload.message).unwrap(), json!({"role": "user"}));
    }
}
