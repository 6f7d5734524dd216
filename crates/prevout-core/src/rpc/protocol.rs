//! Electrum wire messages: one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;
use crate::transport::FRAME_DELIMITER;

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// A decoded inbound frame.
#[derive(Debug)]
pub(super) enum Message {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Serialize a request as a single delimited line.
pub(super) fn encode_request(id: u64, method: &str, params: &[Value]) -> Result<Vec<u8>, RpcError> {
    let mut line = serde_json::to_vec(&Request { id, method, params })?;
    line.push(FRAME_DELIMITER);
    Ok(line)
}

pub(super) fn decode_message(frame: &[u8]) -> Result<Message, RpcError> {
    let raw: RawMessage = serde_json::from_slice(frame)
        .map_err(|e| RpcError::InvalidResponse(format!("malformed frame: {e}")))?;

    match (raw.id, raw.method) {
        (Some(id), _) => {
            let id = parse_id(&id)?;
            let outcome = match raw.error {
                Some(err) => Err(parse_error(err)),
                None => Ok(raw.result.unwrap_or(Value::Null)),
            };
            Ok(Message::Response { id, outcome })
        }
        (None, Some(method)) => Ok(Message::Notification {
            method,
            params: raw.params.unwrap_or(Value::Null),
        }),
        (None, None) => Err(RpcError::InvalidResponse(
            "frame has neither id nor method".into(),
        )),
    }
}

/// Parse an error value into a structured `RpcError`.
///
/// Servers report `{"code": <int>, "message": <string>}`; anything else is
/// kept verbatim as an invalid response.
fn parse_error(err: Value) -> RpcError {
    #[derive(Deserialize)]
    struct ServerError {
        code: i64,
        message: String,
    }

    match serde_json::from_value::<ServerError>(err.clone()) {
        Ok(parsed) => RpcError::Server {
            code: parsed.code,
            message: parsed.message,
        },
        Err(_) => RpcError::InvalidResponse(format!("non-standard error object: {err}")),
    }
}

fn parse_id(id: &Value) -> Result<u64, RpcError> {
    if let Some(n) = id.as_u64() {
        return Ok(n);
    }
    if let Some(s) = id.as_str() {
        return s
            .parse::<u64>()
            .map_err(|e| RpcError::InvalidResponse(format!("invalid response id string: {e}")));
    }
    Err(RpcError::InvalidResponse(format!("invalid response id: {id}")))
}
