//! Activity schema shared by routing, authorization and outbound sends.
//!
//! Only the fields the turn pipeline reads are modelled; everything is
//! serialized camelCase so stored continuation activities stay readable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod activity_types {
    pub const MESSAGE: &str = "message";
    pub const INVOKE: &str = "invoke";
    pub const INVOKE_RESPONSE: &str = "invokeResponse";
    pub const EVENT: &str = "event";
    pub const CONVERSATION_UPDATE: &str = "conversationUpdate";
}

pub mod roles {
    pub const USER: &str = "user";
    pub const BOT: &str = "bot";
    pub const AGENTIC_USER: &str = "agenticUser";
    pub const AGENTIC_APP_INSTANCE: &str = "agenticAppInstance";
}

/// Invoke and event names of the sign-in protocol.
pub mod sign_in_names {
    pub const TOKEN_EXCHANGE: &str = "signin/tokenExchange";
    pub const VERIFY_STATE: &str = "signin/verifyState";
    pub const FAILURE: &str = "signin/failure";
    pub const TOKEN_RESPONSE_EVENT: &str = "tokens/response";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Public struct `ChannelAccount` used across turnstile components.
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl ChannelAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id).with_role(roles::USER)
    }

    pub fn bot(id: impl Into<String>) -> Self {
        Self::new(id).with_role(roles::BOT)
    }

    pub fn agentic_user(id: impl Into<String>) -> Self {
        Self::new(id).with_role(roles::AGENTIC_USER)
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn is_agentic(&self) -> bool {
        matches!(
            self.role.as_deref(),
            Some(roles::AGENTIC_USER) | Some(roles::AGENTIC_APP_INSTANCE)
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Public struct `ConversationAccount` used across turnstile components.
pub struct ConversationAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_group: Option<bool>,
}

impl ConversationAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Addressing fields needed to send into an existing conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    pub conversation: ConversationAccount,
    pub user: ChannelAccount,
    pub agent: ChannelAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl ConversationReference {
    /// Fills any blank addressing field of an outbound activity.
    pub fn apply(&self, mut activity: Activity) -> Activity {
        if activity.channel_id.is_empty() {
            activity.channel_id = self.channel_id.clone();
        }
        if activity.conversation.id.is_empty() {
            activity.conversation = self.conversation.clone();
        }
        if activity.from.id.is_empty() {
            activity.from = self.agent.clone();
        }
        if activity.recipient.id.is_empty() {
            activity.recipient = self.user.clone();
        }
        if activity.service_url.is_none() {
            activity.service_url = self.service_url.clone();
        }
        if activity.locale.is_none() {
            activity.locale = self.locale.clone();
        }
        activity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Public struct `Attachment` used across turnstile components.
pub struct Attachment {
    pub content_type: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Public struct `Activity` used across turnstile components.
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default)]
    pub conversation: ConversationAccount,
    #[serde(default)]
    pub from: ChannelAccount,
    #[serde(default)]
    pub recipient: ChannelAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Activity {
    pub fn new(
        activity_type: impl Into<String>,
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            activity_type: activity_type.into(),
            channel_id: channel_id.into(),
            conversation: ConversationAccount::new(conversation_id),
            ..Self::default()
        }
    }

    pub fn message(
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let mut activity = Self::new(activity_types::MESSAGE, channel_id, conversation_id);
        activity.text = Some(text.into());
        activity
    }

    pub fn invoke(
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
        name: impl Into<String>,
        value: Value,
    ) -> Self {
        let mut activity = Self::new(activity_types::INVOKE, channel_id, conversation_id);
        activity.name = Some(name.into());
        activity.value = Some(value);
        activity
    }

    pub fn event(
        channel_id: impl Into<String>,
        conversation_id: impl Into<String>,
        name: impl Into<String>,
        value: Value,
    ) -> Self {
        let mut activity = Self::new(activity_types::EVENT, channel_id, conversation_id);
        activity.name = Some(name.into());
        activity.value = Some(value);
        activity
    }

    /// Bare `invokeResponse` activity carrying `value`.
    pub fn invoke_response(value: Value) -> Self {
        Self {
            activity_type: activity_types::INVOKE_RESPONSE.to_string(),
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_from(mut self, from: ChannelAccount) -> Self {
        self.from = from;
        self
    }

    pub fn with_recipient(mut self, recipient: ChannelAccount) -> Self {
        self.recipient = recipient;
        self
    }

    pub fn with_service_url(mut self, service_url: impl Into<String>) -> Self {
        self.service_url = Some(service_url.into());
        self
    }

    pub fn is_type(&self, activity_type: &str) -> bool {
        self.activity_type.eq_ignore_ascii_case(activity_type)
    }

    pub fn is_message(&self) -> bool {
        self.is_type(activity_types::MESSAGE)
    }

    pub fn is_invoke(&self) -> bool {
        self.is_type(activity_types::INVOKE)
    }

    pub fn is_event(&self) -> bool {
        self.is_type(activity_types::EVENT)
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name
            .as_deref()
            .is_some_and(|value| value.eq_ignore_ascii_case(name))
    }

    /// True for the out-of-band sign-in invokes a channel sends while a flow is active.
    pub fn is_oauth_invoke(&self) -> bool {
        self.is_invoke()
            && (self.is_named(sign_in_names::TOKEN_EXCHANGE)
                || self.is_named(sign_in_names::VERIFY_STATE))
    }

    /// True when the request targets an agentic identity instead of a human user.
    pub fn is_agentic_request(&self) -> bool {
        self.recipient.is_agentic()
    }

    /// Identity comparison used to decide whether a banked activity is the one in flight.
    pub fn same_activity(&self, other: &Activity) -> bool {
        match (self.id.as_deref(), other.id.as_deref()) {
            (Some(left), Some(right)) => {
                left == right
                    && self.activity_type == other.activity_type
                    && self.channel_id == other.channel_id
                    && self.conversation.id == other.conversation.id
            }
            _ => self == other,
        }
    }

    /// Builds an outbound message addressed back to the sender of `self`.
    pub fn create_reply(&self, text: impl Into<String>) -> Activity {
        Activity {
            activity_type: activity_types::MESSAGE.to_string(),
            id: None,
            channel_id: self.channel_id.clone(),
            service_url: self.service_url.clone(),
            conversation: self.conversation.clone(),
            from: self.recipient.clone(),
            recipient: self.from.clone(),
            text: Some(text.into()),
            name: None,
            value: None,
            reply_to_id: self.id.clone(),
            locale: self.locale.clone(),
            attachments: Vec::new(),
        }
    }

    /// Reference for replying into this activity's conversation as its recipient.
    pub fn conversation_reference(&self) -> ConversationReference {
        ConversationReference {
            activity_id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            service_url: self.service_url.clone(),
            conversation: self.conversation.clone(),
            user: self.from.clone(),
            agent: self.recipient.clone(),
            locale: self.locale.clone(),
        }
    }
}
