//! Stock selectors for common activity shapes.

use regex::Regex;
use turnstile_activity::activity_types;

use crate::route::{activity_selector, RouteError, RouteSelector};

pub fn any_activity() -> RouteSelector {
    activity_selector(|_| true)
}

pub fn activity_type(activity_type: impl Into<String>) -> RouteSelector {
    let activity_type = activity_type.into();
    activity_selector(move |activity| activity.is_type(&activity_type))
}

/// Message whose trimmed text equals `text`, ignoring case.
pub fn message_text(text: impl Into<String>) -> RouteSelector {
    let text = text.into();
    activity_selector(move |activity| {
        activity.is_message()
            && activity
                .text
                .as_deref()
                .is_some_and(|value| value.trim().eq_ignore_ascii_case(text.trim()))
    })
}

pub fn message_regex(pattern: &str) -> Result<RouteSelector, RouteError> {
    let regex = Regex::new(pattern).map_err(|error| RouteError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: error.to_string(),
    })?;
    Ok(activity_selector(move |activity| {
        activity.is_message() && activity.text.as_deref().is_some_and(|text| regex.is_match(text))
    }))
}

pub fn invoke_name(name: impl Into<String>) -> RouteSelector {
    let name = name.into();
    activity_selector(move |activity| activity.is_invoke() && activity.is_named(&name))
}

pub fn event_name(name: impl Into<String>) -> RouteSelector {
    let name = name.into();
    activity_selector(move |activity| activity.is_event() && activity.is_named(&name))
}

pub fn conversation_update() -> RouteSelector {
    activity_type(activity_types::CONVERSATION_UPDATE)
}
