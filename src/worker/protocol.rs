//! Follower wire protocol (SPEC_FULL §6.4): line-delimited JSON exchanged
//! between the dispatcher and a follower subprocess over its stdin/stdout.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One line the dispatcher writes to a follower's stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum FollowerRequest {
    Activity { id: Uuid },
    Workflow { id: Uuid },
    Exit,
}

/// One line a follower writes to stdout in response to a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowerResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FollowerResponse {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_request_round_trips_as_tagged_json() {
        let id = Uuid::now_v7();
        let request = FollowerRequest::Activity { id };
        let line = serde_json::to_string(&request).unwrap();
        assert_eq!(line, format!(r#"{{"cmd":"activity","id":"{id}"}}"#));
        let parsed: FollowerRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn exit_request_has_no_extra_fields() {
        let line = serde_json::to_string(&FollowerRequest::Exit).unwrap();
        assert_eq!(line, r#"{"cmd":"exit"}"#);
    }

    #[test]
    fn ok_response_omits_error_field() {
        let line = serde_json::to_string(&FollowerResponse::ok()).unwrap();
        assert_eq!(line, r#"{"ok":true}"#);
    }
}
