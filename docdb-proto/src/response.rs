use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ResponseNote, ResponseType};

/// Response from the server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// Token of the query this response belongs to (taken from the frame header)
    #[serde(skip)]
    pub token: u64,

    /// Raw response type; see [`Response::response_type`]
    #[serde(rename = "t")]
    pub type_code: i64,

    /// Result documents, or a single error message for error responses
    #[serde(rename = "r", default)]
    pub responses: Vec<Value>,

    #[serde(rename = "b", default, skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<Value>,

    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,

    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<i64>,

    #[serde(rename = "n", default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<i64>,
}

impl Response {
    /// Known response type, `None` if the server sent a code this driver does not understand
    pub fn response_type(&self) -> Option<ResponseType> {
        ResponseType::try_from(self.type_code).ok()
    }

    /// Notes this driver understands, unknown codes are skipped
    pub fn notes(&self) -> impl Iterator<Item = ResponseNote> + '_ {
        self.notes
            .iter()
            .filter_map(|code| ResponseNote::try_from(*code).ok())
    }

    /// Whether the response belongs to a changefeed, which never terminates on its own
    pub fn is_feed(&self) -> bool {
        self.notes().any(ResponseNote::is_feed)
    }

    /// Error text carried by an error response
    pub fn error_message(&self) -> String {
        match self.responses.first() {
            Some(Value::String(msg)) => msg.clone(),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        }
    }
}

/// Server identity returned by a SERVER_INFO query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub proxy: bool,
}
