//! Remote failure payloads.
//!
//! A failure raised on the far side of an `invoke` or a remote script
//! evaluation crosses the boundary as a tagged JSON object:
//!
//! ```json
//! { "__serializedError": true, "name": "TypeError", "message": "bad arg", "stack": "..." }
//! ```
//!
//! Payloads whose `name` is one of the built-in kinds are rehydrated into
//! [`RemoteError::Known`]; anything else is surfaced untouched as
//! [`RemoteError::Raw`].

use crate::IpcError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Marker key that identifies a serialized error payload.
pub const SERIALIZED_ERROR_TAG: &str = "__serializedError";

/// Built-in error kinds that survive the trip across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    Error,
    EvalError,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    URIError,
}

impl RemoteErrorKind {
    pub const ALL: [RemoteErrorKind; 7] = [
        Self::Error,
        Self::EvalError,
        Self::RangeError,
        Self::ReferenceError,
        Self::SyntaxError,
        Self::TypeError,
        Self::URIError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::EvalError => "EvalError",
            Self::RangeError => "RangeError",
            Self::ReferenceError => "ReferenceError",
            Self::SyntaxError => "SyntaxError",
            Self::TypeError => "TypeError",
            Self::URIError => "URIError",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemoteErrorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

/// Failure reported by the remote side of a correlated call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("{kind}: {message}")]
    Known {
        kind: RemoteErrorKind,
        message: String,
        stack: Option<String>,
    },

    #[error("Remote call rejected: {0}")]
    Raw(Value),

    /// The local reply slot was dropped before anything arrived.
    #[error("Remote call abandoned: reply channel closed")]
    Disconnected,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self::Known {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(self, stack: impl Into<String>) -> Self {
        match self {
            Self::Known { kind, message, .. } => Self::Known {
                kind,
                message,
                stack: Some(stack.into()),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::Known { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Rebuild a local error from a payload received over the wire.
    pub fn rehydrate(payload: Value) -> Self {
        let known = payload.as_object().and_then(|obj| {
            if obj.get(SERIALIZED_ERROR_TAG) != Some(&Value::Bool(true)) {
                return None;
            }
            let kind = obj.get("name")?.as_str()?.parse::<RemoteErrorKind>().ok()?;
            let message = obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let stack = obj.get("stack").and_then(Value::as_str).map(str::to_string);
            Some(Self::Known {
                kind,
                message,
                stack,
            })
        });
        known.unwrap_or(Self::Raw(payload))
    }

    /// Payload to put on the wire for this error.
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Known {
                kind,
                message,
                stack,
            } => {
                let mut payload = json!({
                    SERIALIZED_ERROR_TAG: true,
                    "name": kind.as_str(),
                    "message": message,
                });
                if let Some(stack) = stack {
                    payload["stack"] = Value::String(stack.clone());
                }
                payload
            }
            Self::Raw(value) => value.clone(),
            Self::Disconnected => json!({
                SERIALIZED_ERROR_TAG: true,
                "name": RemoteErrorKind::Error.as_str(),
                "message": "reply channel closed",
            }),
        }
    }
}

impl From<anyhow::Error> for RemoteError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RemoteError>() {
            Ok(remote) => remote,
            Err(err) => Self::new(RemoteErrorKind::Error, format!("{err:#}")),
        }
    }
}

// ============================================================================
// Reply Payload
// ============================================================================

/// Body of a correlated reply: `{"result": value}` or `{"error": payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokeOutcome {
    Result(Value),
    Error(Value),
}

impl InvokeOutcome {
    pub fn from_result(result: Result<Value, RemoteError>) -> Self {
        match result {
            Ok(value) => Self::Result(value),
            Err(err) => Self::Error(err.to_payload()),
        }
    }

    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error(payload) => Err(RemoteError::rehydrate(payload)),
        }
    }

    pub fn to_value(&self) -> Result<Value, IpcError> {
        serde_json::to_value(self).map_err(|e| IpcError::serialization(e.to_string()))
    }

    /// Parse the first argument of a reply message.
    pub fn from_args(args: &[Value]) -> Result<Self, IpcError> {
        let first = args
            .first()
            .cloned()
            .ok_or_else(|| IpcError::invalid_argument("reply carries no payload"))?;
        serde_json::from_value(first).map_err(|e| IpcError::serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rehydrates_known_kind() {
        let payload = json!({
            SERIALIZED_ERROR_TAG: true,
            "name": "TypeError",
            "message": "bad arg",
            "stack": "TypeError: bad arg\n    at handler",
        });
        let err = RemoteError::rehydrate(payload);
        assert_eq!(err.kind(), Some(RemoteErrorKind::TypeError));
        match err {
            RemoteError::Known { message, stack, .. } => {
                assert_eq!(message, "bad arg");
                assert!(stack.unwrap().starts_with("TypeError"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_stays_raw() {
        let payload = json!({
            SERIALIZED_ERROR_TAG: true,
            "name": "DOMException",
            "message": "nope",
        });
        assert_eq!(
            RemoteError::rehydrate(payload.clone()),
            RemoteError::Raw(payload)
        );
    }

    #[test]
    fn test_untagged_payloads_stay_raw() {
        let untagged = json!({"name": "TypeError", "message": "bad arg"});
        assert_eq!(
            RemoteError::rehydrate(untagged.clone()),
            RemoteError::Raw(untagged)
        );
        assert_eq!(
            RemoteError::rehydrate(json!("plain string")),
            RemoteError::Raw(json!("plain string"))
        );
    }

    #[test]
    fn test_payload_matches_wire_shape() {
        let payload = RemoteError::new(RemoteErrorKind::RangeError, "out of range").to_payload();
        assert_eq!(payload[SERIALIZED_ERROR_TAG], json!(true));
        assert_eq!(payload["name"], json!("RangeError"));
        assert_eq!(payload["message"], json!("out of range"));
        assert!(payload.get("stack").is_none());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(
            "URIError".parse::<RemoteErrorKind>(),
            Ok(RemoteErrorKind::URIError)
        );
        assert!("TypeErr".parse::<RemoteErrorKind>().is_err());
    }

    #[test]
    fn test_anyhow_conversion_keeps_remote_errors() {
        let original = RemoteError::new(RemoteErrorKind::SyntaxError, "unexpected token");
        let through: RemoteError = anyhow::Error::new(original.clone()).into();
        assert_eq!(through, original);

        let generic: RemoteError = anyhow::anyhow!("disk full").into();
        assert_eq!(generic.kind(), Some(RemoteErrorKind::Error));
    }

    #[test]
    fn test_outcome_wire_shape() {
        let ok = InvokeOutcome::from_result(Ok(json!(3))).to_value().unwrap();
        assert_eq!(ok, json!({"result": 3}));

        let err = InvokeOutcome::from_result(Err(RemoteError::new(
            RemoteErrorKind::TypeError,
            "bad arg",
        )))
        .to_value()
        .unwrap();
        assert_eq!(err["error"]["name"], json!("TypeError"));

        let parsed = InvokeOutcome::from_args(&[err]).unwrap().into_result();
        assert_eq!(parsed.unwrap_err().kind(), Some(RemoteErrorKind::TypeError));
    }

    #[test]
    fn test_outcome_requires_payload() {
        assert!(matches!(
            InvokeOutcome::from_args(&[]),
            Err(IpcError::InvalidArgument { .. })
        ));
    }
}
