//! Typed JSON command protocol so front-ends keep a stable method contract.
//!
//! Requests are single-line JSON objects with a `"method"` field plus named
//! arguments, e.g. `{"method":"startListening","recordTime":1000}`. Every
//! request gets exactly one reply line: `{"ok":<value>}` or
//! `{"error":{"code":"...","message":"..."}}`.

use crate::MonitorError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Commands (front-end → bridge)
// ============================================================================

/// Commands accepted from the front-end.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method")]
pub enum BridgeCommand {
    /// Begin sampling with the given averaging window (ms).
    #[serde(rename = "startListening")]
    StartListening {
        #[serde(rename = "recordTime")]
        record_time: f64,
    },

    /// Stop sampling and release the wake lock.
    #[serde(rename = "endListening")]
    EndListening,

    /// Latest noise level in dB.
    #[serde(rename = "getAudioLevel")]
    GetAudioLevel,

    #[serde(rename = "enableFlashLight")]
    EnableFlashLight,

    #[serde(rename = "disableFlashLight")]
    DisableFlashLight,

    #[serde(rename = "playAlarm")]
    PlayAlarm,

    #[serde(rename = "stopAlarm")]
    StopAlarm,

    #[serde(rename = "sendNotification")]
    SendNotification { title: String, message: String },
}

const KNOWN_METHODS: &[&str] = &[
    "startListening",
    "endListening",
    "getAudioLevel",
    "enableFlashLight",
    "disableFlashLight",
    "playAlarm",
    "stopAlarm",
    "sendNotification",
];

// ============================================================================
// Replies (bridge → front-end)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReplyValue {
    Bool(bool),
    Level(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidConfiguration,
    ResourceUnavailable,
    InvalidRequest,
    NotImplemented,
    DeviceFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeError {
    pub code: ErrorCode,
    pub message: String,
}

impl BridgeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<MonitorError> for BridgeError {
    fn from(err: MonitorError) -> Self {
        let code = match err {
            MonitorError::InvalidConfiguration(_) => ErrorCode::InvalidConfiguration,
            MonitorError::ResourceUnavailable(_) => ErrorCode::ResourceUnavailable,
        };
        Self::new(code, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeReply {
    Ok(ReplyValue),
    Error(BridgeError),
}

impl BridgeReply {
    pub fn ok(value: bool) -> Self {
        Self::Ok(ReplyValue::Bool(value))
    }

    pub fn level(db: f64) -> Self {
        Self::Ok(ReplyValue::Level(db))
    }

    /// Single JSON line without the trailing newline.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(r#"{{"error":{{"code":"invalid_request","message":"reply encoding failed: {err}"}}}}"#)
        })
    }
}

/// Parse one request line.
///
/// Unknown methods are reported as `not_implemented` so a newer front-end can
/// probe for optional commands; malformed JSON and bad arguments are
/// `invalid_request`.
pub fn parse_request(line: &str) -> Result<BridgeCommand, BridgeError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|err| BridgeError::new(ErrorCode::InvalidRequest, format!("invalid JSON: {err}")))?;
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::new(ErrorCode::InvalidRequest, "missing \"method\" field"))?;
    if !KNOWN_METHODS.contains(&method) {
        return Err(BridgeError::new(
            ErrorCode::NotImplemented,
            format!("method not implemented: {method}"),
        ));
    }
    serde_json::from_value(value).map_err(|err| {
        BridgeError::new(ErrorCode::InvalidRequest, format!("invalid arguments: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"method":"startListening","recordTime":1000}"#, BridgeCommand::StartListening { record_time: 1000.0 })]
    #[case(r#"{"method":"startListening","recordTime":250.5}"#, BridgeCommand::StartListening { record_time: 250.5 })]
    #[case(r#"{"method":"endListening"}"#, BridgeCommand::EndListening)]
    #[case(r#"{"method":"getAudioLevel"}"#, BridgeCommand::GetAudioLevel)]
    #[case(r#"{"method":"enableFlashLight"}"#, BridgeCommand::EnableFlashLight)]
    #[case(r#"{"method":"disableFlashLight"}"#, BridgeCommand::DisableFlashLight)]
    #[case(r#"{"method":"playAlarm"}"#, BridgeCommand::PlayAlarm)]
    #[case(r#"{"method":"stopAlarm"}"#, BridgeCommand::StopAlarm)]
    #[case(
        r#"{"method":"sendNotification","title":"Noise","message":"Loud"}"#,
        BridgeCommand::SendNotification { title: "Noise".to_string(), message: "Loud".to_string() }
    )]
    fn parses_known_methods(#[case] line: &str, #[case] expected: BridgeCommand) {
        assert_eq!(parse_request(line).expect("parse"), expected);
    }

    #[rstest]
    #[case("not json", ErrorCode::InvalidRequest)]
    #[case(r#"{"recordTime":1000}"#, ErrorCode::InvalidRequest)]
    #[case(r#"{"method":42}"#, ErrorCode::InvalidRequest)]
    #[case(r#"{"method":"startListening"}"#, ErrorCode::InvalidRequest)]
    #[case(r#"{"method":"startListening","recordTime":"soon"}"#, ErrorCode::InvalidRequest)]
    #[case(r#"{"method":"sendNotification","title":"x"}"#, ErrorCode::InvalidRequest)]
    #[case(r#"{"method":"selfDestruct"}"#, ErrorCode::NotImplemented)]
    fn rejects_bad_requests(#[case] line: &str, #[case] code: ErrorCode) {
        assert_eq!(parse_request(line).expect_err("must fail").code, code);
    }

    #[test]
    fn replies_serialize_to_ok_or_error_objects() {
        assert_eq!(BridgeReply::ok(true).to_json_line(), r#"{"ok":true}"#);
        assert_eq!(BridgeReply::level(30.5).to_json_line(), r#"{"ok":30.5}"#);
        let reply = BridgeReply::Error(BridgeError::new(ErrorCode::NotImplemented, "nope"));
        assert_eq!(
            reply.to_json_line(),
            r#"{"error":{"code":"not_implemented","message":"nope"}}"#
        );
    }

    #[test]
    fn monitor_errors_map_to_codes() {
        let err: BridgeError = MonitorError::ResourceUnavailable("busy".to_string()).into();
        assert_eq!(err.code, ErrorCode::ResourceUnavailable);
        assert!(err.message.contains("busy"));
        let err: BridgeError = MonitorError::InvalidConfiguration("bad".to_string()).into();
        assert_eq!(err.code, ErrorCode::InvalidConfiguration);
    }
}
