//! Stratum JSON-RPC message shapes and the error-code taxonomy shared by
//! the downstream and upstream sides.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stratum error codes surfaced to miners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StratumError {
    NoError = 0,
    Unknown = 20,
    JobNotFound = 21,
    DuplicateShare = 22,
    LowDifficulty = 23,
    Unauthorized = 24,
    NotSubscribed = 25,
    IllegalMethod = 26,
    IllegalParams = 27,
    IpBanned = 28,
    InvalidUsername = 29,
    InternalError = 30,
    TimeTooOld = 31,
    TimeTooNew = 32,
}

impl StratumError {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn message(self) -> &'static str {
        match self {
            StratumError::NoError => "no error",
            StratumError::Unknown => "Unknown",
            StratumError::JobNotFound => "Job not found (=stale)",
            StratumError::DuplicateShare => "Duplicate share",
            StratumError::LowDifficulty => "Low difficulty",
            StratumError::Unauthorized => "Unauthorized worker",
            StratumError::NotSubscribed => "Not subscribed",
            StratumError::IllegalMethod => "Illegal method",
            StratumError::IllegalParams => "Illegal params",
            StratumError::IpBanned => "Ip banned",
            StratumError::InvalidUsername => "Invalid username",
            StratumError::InternalError => "Internal error",
            StratumError::TimeTooOld => "Time too old",
            StratumError::TimeTooNew => "Time too new",
        }
    }
}

/// A loosely-typed inbound JSON-RPC request. `params` stays a raw
/// `Value` because its shape varies per method.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn parse(line: &str) -> serde_json::Result<Request> {
        serde_json::from_str(line.trim_end())
    }

    /// The request's params as an array, or an empty slice if params was
    /// missing, null, or not an array.
    pub fn params_array(&self) -> &[Value] {
        self.params.as_array().map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// `id` re-rendered for a reply: `null` stays `null`, numbers and
    /// strings pass through, matching the original's idStr handling.
    pub fn id_value(&self) -> Value {
        self.id.clone()
    }
}

/// Builds `{"id":<id>,"result":<result>,"error":null}\n`.
pub fn success_line(id: Value, result: Value) -> String {
    let mut line = serde_json::to_string(&serde_json::json!({
        "id": id,
        "result": result,
        "error": Value::Null,
    }))
    .expect("json serialization of stratum reply cannot fail");
    line.push('\n');
    line
}

/// Builds `{"id":<id>,"result":null,"error":[<code>,"<text>",null]}\n`.
pub fn error_line(id: Value, err: StratumError) -> String {
    let mut line = serde_json::to_string(&serde_json::json!({
        "id": id,
        "result": Value::Null,
        "error": [err.code(), err.message(), Value::Null],
    }))
    .expect("json serialization of stratum error cannot fail");
    line.push('\n');
    line
}

/// Builds a server-initiated notification `{"id":null,"method":<method>,"params":<params>}\n`.
pub fn notification_line(method: &str, params: Value) -> String {
    let mut line = serde_json::to_string(&serde_json::json!({
        "id": Value::Null,
        "method": method,
        "params": params,
    }))
    .expect("json serialization of stratum notification cannot fail");
    line.push('\n');
    line
}

/// Builds a client-initiated request, used by `UpstreamClient` to speak
/// to the real pool: `{"id":<id>,"method":<method>,"params":<params>}\n`.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundRequest {
    pub id: u64,
    pub method: &'static str,
    pub params: Value,
}

impl OutboundRequest {
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("outbound request always serializes");
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_response_shape_is_well_formed() {
        let id = Value::from(7);
        let hex = "000000ab";
        let result = serde_json::json!([
            [["mining.set_difficulty", hex], ["mining.notify", hex]],
            hex,
            4
        ]);
        let line = success_line(id, result);
        assert_eq!(
            line,
            "{\"error\":null,\"id\":7,\"result\":[[[\"mining.set_difficulty\",\"000000ab\"],[\"mining.notify\",\"000000ab\"]],\"000000ab\",4]}\n"
        );
    }

    #[test]
    fn not_subscribed_error_matches_scenario_3() {
        let line = error_line(Value::Null, StratumError::NotSubscribed);
        assert_eq!(
            line,
            "{\"error\":[25,\"Not subscribed\",null],\"id\":null,\"result\":null}\n"
        );
    }

    #[test]
    fn request_parses_params_array() {
        let req = Request::parse(
            "{\"id\":7,\"method\":\"mining.subscribe\",\"params\":[\"cgminer/1.0\"]}\n",
        )
        .unwrap();
        assert_eq!(req.method, "mining.subscribe");
        assert_eq!(req.params_array(), &[Value::from("cgminer/1.0")]);
    }
}
