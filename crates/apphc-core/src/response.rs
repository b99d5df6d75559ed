//! Response envelope returned by every mutating and listing operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Error,
    InProgress,
    Unchanged,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub timestamp: DateTime<Utc>,
    pub status: ResponseStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl Response {
    pub fn new(status: ResponseStatus, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == ResponseStatus::Error {
            error!(%message, "request failed");
        }
        Self {
            timestamp: Utc::now(),
            status,
            message,
            body: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::Error, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::NotFound, message)
    }

    pub fn unchanged(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::Unchanged, message)
    }

    pub fn in_progress(message: impl Into<String>) -> Self {
        Self::new(ResponseStatus::InProgress, message)
    }

    /// Attach a serializable body. Serialization failures leave the body empty.
    pub fn with_body<T: Serialize>(mut self, body: &T) -> Self {
        self.body = serde_json::to_value(body).ok();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_string(&ResponseStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        let json = serde_json::to_string(&ResponseStatus::NotFound).unwrap();
        assert_eq!(json, "\"NOT_FOUND\"");
    }

    #[test]
    fn body_is_omitted_when_empty() {
        let resp = Response::success("ok");
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("body").is_none());
        assert_eq!(json["status"], "SUCCESS");

        let resp = Response::success("ok").with_body(&vec!["foo-g1"]);
        assert_eq!(resp.body.unwrap()[0], "foo-g1");
    }
}
