use serde_json::Value;

use crate::error::{MessageBusError, StructuredError};

pub type RequestId = u64;

/// A classified, decoded JSON-RPC 2.0 message.
#[derive(Debug, Clone)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Vec<Value>,
    },
    Response {
        id: RequestId,
        outcome: Result<Value, StructuredError>,
    },
    Signal {
        method: String,
        params: Vec<Value>,
    },
}

impl Message {
    /// Decode and classify one framed message. Any shape other than request,
    /// response, or signal is a fatal envelope error.
    pub fn decode(raw: &str) -> Result<Self, MessageBusError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| MessageBusError::InvalidEnvelope(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| MessageBusError::InvalidEnvelope("root is not an object".into()))?;

        match object.get("jsonrpc").and_then(Value::as_str) {
            Some("2.0") => {}
            _ => return Err(MessageBusError::InvalidEnvelope("missing jsonrpc 2.0".into())),
        }

        let id = object.get("id").and_then(Value::as_u64);
        let method = object.get("method").and_then(Value::as_str);
        let has_result = object.contains_key("result");
        let has_error = object.contains_key("error");

        match (id, method) {
            (Some(id), Some(method)) => {
                let params = params_of(object.get("params"));
                Ok(Message::Request {
                    id,
                    method: method.to_string(),
                    params,
                })
            }
            (Some(id), None) if has_result ^ has_error => {
                let outcome = if has_error {
                    Err(decode_error(object.get("error"))?)
                } else {
                    Ok(object.get("result").cloned().unwrap_or(Value::Null))
                };
                Ok(Message::Response { id, outcome })
            }
            (None, Some(method)) => {
                let params = params_of(object.get("params"));
                Ok(Message::Signal {
                    method: method.to_string(),
                    params,
                })
            }
            _ => Err(MessageBusError::InvalidEnvelope(
                "message is neither a request, a response, nor a signal".into(),
            )),
        }
    }

    pub fn to_request_value(id: RequestId, method: &str, params: &[Value]) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
    }

    pub fn to_signal_value(method: &str, params: &[Value]) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        })
    }

    pub fn to_result_value(id: RequestId, result: &Value) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        })
    }

    pub fn to_error_value(id: RequestId, error: &StructuredError) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error.code,
                "message": error.message,
                "data": error.data.clone().unwrap_or(Value::Null),
            },
        })
    }
}

fn params_of(params: Option<&Value>) -> Vec<Value> {
    match params {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    }
}

fn decode_error(error: Option<&Value>) -> Result<StructuredError, MessageBusError> {
    let error = error
        .ok_or_else(|| MessageBusError::InvalidEnvelope("error field missing body".into()))?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .ok_or_else(|| MessageBusError::InvalidEnvelope("error.code missing".into()))?
        .to_string();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let data = error.get("data").cloned().filter(|v| !v.is_null());
    Ok(StructuredError { code, message, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_request() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":["hi"]}"#)
            .unwrap();
        match msg {
            Message::Request { id, method, params } => {
                assert_eq!(id, 1);
                assert_eq!(method, "echo");
                assert_eq!(params, vec![Value::String("hi".into())]);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn classifies_response_result() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","id":1,"result":"hi"}"#).unwrap();
        match msg {
            Message::Response { id, outcome } => {
                assert_eq!(id, 1);
                assert_eq!(outcome.unwrap(), Value::String("hi".into()));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_response_error() {
        let msg = Message::decode(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":"Timeout","message":"timed out","data":null}}"#,
        )
        .unwrap();
        match msg {
            Message::Response { id, outcome } => {
                assert_eq!(id, 1);
                let err = outcome.unwrap_err();
                assert_eq!(err.code, "Timeout");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_signal() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","method":"ping","params":[]}"#).unwrap();
        assert!(matches!(msg, Message::Signal { method, .. } if method == "ping"));
    }

    #[test]
    fn rejects_wrong_jsonrpc_version() {
        let err = Message::decode(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#).unwrap_err();
        assert!(matches!(err, MessageBusError::InvalidEnvelope(_)));
    }

    #[test]
    fn rejects_shape_with_neither_id_nor_method() {
        let err = Message::decode(r#"{"jsonrpc":"2.0","result":1}"#).unwrap_err();
        assert!(matches!(err, MessageBusError::InvalidEnvelope(_)));
    }

    #[test]
    fn rejects_response_with_both_result_and_error() {
        let err = Message::decode(
            r#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":"X","message":"y"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, MessageBusError::InvalidEnvelope(_)));
    }
}
