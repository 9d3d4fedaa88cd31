use serde::{Deserialize, Serialize};

/// Envelope for all socket communication.
///
/// Every message on the wire is one JSON object with this shape. The `data`
/// and `ack` fields use `serde_json::value::RawValue` to defer
/// deserialization until a consumer knows the concrete payload type.
///
/// Three frame families share the envelope:
/// - plain events: `event` + optional `data`
/// - acknowledged emits: `event` + `data` + `ackId`
/// - acknowledgements: `ackId` + `ack` (the `event` names the reply channel,
///   e.g. `rpc-response`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<serde_json::value::RawValue>>,
    #[serde(
        default,
        rename = "ackId",
        skip_serializing_if = "Option::is_none"
    )]
    pub ack_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<Box<serde_json::value::RawValue>>,
}

impl Frame {
    /// Creates a plain event frame.
    pub fn event<T: Serialize>(
        event: impl Into<String>,
        data: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.into(),
            data: to_raw(data)?,
            ack_id: None,
            ack: None,
        })
    }

    /// Creates an event frame that requests an acknowledgement.
    pub fn with_ack_id<T: Serialize>(
        event: impl Into<String>,
        data: Option<&T>,
        ack_id: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.into(),
            data: to_raw(data)?,
            ack_id: Some(ack_id.into()),
            ack: None,
        })
    }

    /// Creates an acknowledgement frame correlated to a received `ackId`.
    pub fn ack_reply<T: Serialize>(
        event: impl Into<String>,
        ack_id: impl Into<String>,
        ack: &T,
    ) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(ack)?;
        Ok(Self {
            event: event.into(),
            data: None,
            ack_id: Some(ack_id.into()),
            ack: Some(serde_json::value::RawValue::from_string(json)?),
        })
    }

    /// `true` when this frame acknowledges an earlier acknowledged emit.
    pub fn is_ack(&self) -> bool {
        self.ack_id.is_some() && self.ack.is_some()
    }

    /// Deserializes the data payload into the given type.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Deserializes the ack payload into the given type.
    pub fn parse_ack<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.ack {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}

fn to_raw<T: Serialize>(
    value: Option<&T>,
) -> Result<Option<Box<serde_json::value::RawValue>>, serde_json::Error> {
    match value {
        Some(v) => {
            let json = serde_json::to_string(v)?;
            Ok(Some(serde_json::value::RawValue::from_string(json)?))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_frame_with_payload() {
        let payload = serde_json::json!({"sid": "s1"});
        let frame = Frame::event("session-alive", Some(&payload)).unwrap();
        assert_eq!(frame.event, "session-alive");
        assert!(frame.data.is_some());
        assert!(frame.ack_id.is_none());
        assert!(!frame.is_ack());
    }

    #[test]
    fn event_frame_without_payload() {
        let frame = Frame::event::<()>("connect", None).unwrap();
        assert!(frame.data.is_none());
    }

    #[test]
    fn acked_emit_carries_ack_id() {
        let data = serde_json::json!({"k": 1});
        let frame = Frame::with_ack_id("update-state", Some(&data), "ack-1").unwrap();
        assert_eq!(frame.ack_id.as_deref(), Some("ack-1"));
        assert!(frame.ack.is_none());
        assert!(!frame.is_ack());
    }

    #[test]
    fn ack_reply_is_ack() {
        let frame = Frame::ack_reply("rpc-response", "ack-2", &"cipher").unwrap();
        assert!(frame.is_ack());
        let ack: Option<String> = frame.parse_ack().unwrap();
        assert_eq!(ack.as_deref(), Some("cipher"));
    }

    #[test]
    fn frame_omits_null_fields() {
        let frame = Frame::event::<()>("connect", None).unwrap();
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("data"));
        assert!(!json.contains("ackId"));
        assert!(!json.contains("ack"));
    }

    #[test]
    fn frame_json_roundtrip() {
        let data = serde_json::json!({"method": "m", "params": "cc=="});
        let frame = Frame::with_ack_id("rpc-request", Some(&data), "a9").unwrap();
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event, "rpc-request");
        assert_eq!(parsed.ack_id.as_deref(), Some("a9"));
        let body: Option<serde_json::Value> = parsed.parse_data().unwrap();
        assert_eq!(body.unwrap()["method"], "m");
    }

    #[test]
    fn ack_id_uses_camel_case_on_wire() {
        let frame = Frame::with_ack_id::<()>("e", None, "x").unwrap();
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"ackId\":\"x\""));
        assert!(!json.contains("ack_id"));
    }

    #[test]
    fn parse_data_missing_is_none() {
        let frame = Frame::event::<()>("connect", None).unwrap();
        let parsed: Option<serde_json::Value> = frame.parse_data().unwrap();
        assert!(parsed.is_none());
    }
}
