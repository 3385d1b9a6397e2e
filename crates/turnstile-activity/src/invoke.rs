use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::{activity_types, Activity};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Status + body envelope answering an invoke activity.
pub struct InvokeResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl InvokeResponse {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Option<Value>) -> Self {
        Self::new(200, body)
    }

    pub fn bad_request(body: Value) -> Self {
        Self::new(400, Some(body))
    }

    pub fn internal_error(body: Value) -> Self {
        Self::new(500, Some(body))
    }

    pub fn not_implemented() -> Self {
        Self::new(501, None)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Wraps the response in an `invokeResponse` activity for the outbound path.
    pub fn into_activity(self) -> Activity {
        Activity::invoke_response(serde_json::to_value(self).unwrap_or(Value::Null))
    }

    /// Reads the response back out of an `invokeResponse` activity.
    pub fn from_activity(activity: &Activity) -> Option<Self> {
        if !activity.is_type(activity_types::INVOKE_RESPONSE) {
            return None;
        }
        activity
            .value
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}
