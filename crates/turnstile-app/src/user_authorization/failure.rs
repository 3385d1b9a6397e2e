//! User-visible failure reporting for sign-in flows.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use turnstile_activity::{Activity, InvokeResponse, TurnContext};

use super::{AuthorizationError, SignInResponse, UserAuthorization};
use crate::turn_state::TurnState;

pub const DEFAULT_SIGN_IN_FAILURE_MESSAGE: &str =
    "Sign in for '{handler}' completed without a token. Status={cause}";

const NO_ACTIVE_FLOW_CAUSE: &str = "no_active_flow";

/// Passed to a registered failure callback.
#[derive(Debug, Clone, PartialEq)]
pub struct SignInFailure {
    pub handler_name: String,
    pub response: SignInResponse,
    /// Activity banked when the flow started, if any.
    pub continuation_activity: Option<Activity>,
}

/// Body of the 400/500 invoke responses the engine synthesizes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignInFailureBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
}

fn invoke_connection_name(activity: &Activity) -> Option<String> {
    activity
        .value
        .as_ref()
        .and_then(|value| value.get("connectionName"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn body_value(body: &SignInFailureBody) -> Value {
    serde_json::to_value(body).unwrap_or(Value::Null)
}

pub(super) fn render_default_message(handler_name: &str, response: &SignInResponse) -> String {
    DEFAULT_SIGN_IN_FAILURE_MESSAGE
        .replace("{handler}", handler_name)
        .replace("{cause}", response.cause_or_unknown())
}

impl UserAuthorization {
    /// Answers a sign-in invoke that arrived while no flow was active.
    pub(super) async fn reject_out_of_band_invoke(
        &self,
        context: &TurnContext,
    ) -> Result<(), AuthorizationError> {
        let activity = context.activity();
        let body = SignInFailureBody {
            activity_id: activity.id.clone(),
            connection_name: invoke_connection_name(activity),
            cause: NO_ACTIVE_FLOW_CAUSE.to_string(),
            failure_detail: Some(format!(
                "'{}' received without an active sign-in flow",
                activity.name.as_deref().unwrap_or_default()
            )),
            ..SignInFailureBody::default()
        };
        context
            .send_invoke_response(InvokeResponse::bad_request(body_value(&body)))
            .await
            .map_err(AuthorizationError::Send)?;
        Ok(())
    }

    /// Custom callback first; otherwise a 500 for unanswered invokes or a chat message.
    pub(super) async fn report_failure(
        &self,
        context: &Arc<TurnContext>,
        turn_state: &TurnState,
        handler_name: &str,
        response: SignInResponse,
        continuation_activity: Option<Activity>,
    ) -> Result<(), AuthorizationError> {
        if let Some(on_failure) = &self.options.on_sign_in_failure {
            let failure = SignInFailure {
                handler_name: handler_name.to_string(),
                response,
                continuation_activity,
            };
            return on_failure(Arc::clone(context), turn_state.clone(), failure)
                .await
                .map_err(AuthorizationError::Callback);
        }

        let activity = context.activity();
        if activity.is_invoke() && !context.invoke_response_sent() {
            let body = SignInFailureBody {
                activity_id: activity.id.clone(),
                activity_type: Some(activity.activity_type.clone()),
                name: activity.name.clone(),
                conversation_id: Some(activity.conversation.id.clone()),
                handler_name: Some(handler_name.to_string()),
                connection_name: invoke_connection_name(activity),
                cause: response.cause_or_unknown().to_string(),
                failure_detail: response.error.clone(),
            };
            context
                .send_invoke_response(InvokeResponse::internal_error(body_value(&body)))
                .await
                .map_err(AuthorizationError::Send)?;
            return Ok(());
        }

        let text = match &self.options.failure_message {
            Some(formatter) => formatter(handler_name, &response),
            None => render_default_message(handler_name, &response),
        };
        context
            .send_text(text)
            .await
            .map_err(AuthorizationError::Send)
    }
}
