use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use turnstile_activity::{
    sign_in_names, Activity, ChannelAccount, RecordingSender, TurnContext,
};
use turnstile_core::CooperativeCancellationToken;
use turnstile_storage::{read_typed, write_typed, MemoryStorage};

use super::{
    failure_handler, success_handler, AuthorizationError, AutoSignIn, SignInFailure, SignInRequest,
    SignInResponse, SignInState, TokenResponse, UserAuthorization, UserAuthorizationDriver,
    UserAuthorizationOptions, DRIVER_ERROR_DETAIL,
};
use crate::continuation::{continuation_channel, ContinuationReceiver};
use crate::oauth_flow::InMemoryUserTokenClient;
use crate::settings::{AuthorizationSettings, HandlerSettings};
use crate::turn_state::TurnState;

const STATE_KEY: &str = "oauth/c-1/b-1/userAuthorizationState";

#[derive(Default)]
struct ScriptedDriver {
    sign_in: Mutex<VecDeque<anyhow::Result<SignInResponse>>>,
    refreshed: Mutex<VecDeque<Option<TokenResponse>>>,
    force_flags: Mutex<Vec<bool>>,
    refresh_calls: Mutex<Vec<(Option<String>, Vec<String>)>>,
    resets: AtomicUsize,
    sign_outs: AtomicUsize,
}

impl ScriptedDriver {
    async fn push(&self, response: SignInResponse) {
        self.sign_in.lock().await.push_back(Ok(response));
    }

    async fn push_failure(&self, message: &str) {
        self.sign_in
            .lock()
            .await
            .push_back(Err(anyhow::anyhow!(message.to_string())));
    }

    async fn push_refresh(&self, token: Option<TokenResponse>) {
        self.refreshed.lock().await.push_back(token);
    }

    async fn force_flags(&self) -> Vec<bool> {
        self.force_flags.lock().await.clone()
    }

    async fn refresh_count(&self) -> usize {
        self.refresh_calls.lock().await.len()
    }
}

#[async_trait]
impl UserAuthorizationDriver for ScriptedDriver {
    async fn sign_user_in(
        &self,
        _context: &TurnContext,
        force_sign_in: bool,
        _exchange_connection: Option<&str>,
        _exchange_scopes: &[String],
    ) -> anyhow::Result<SignInResponse> {
        self.force_flags.lock().await.push(force_sign_in);
        self.sign_in
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(SignInResponse::pending()))
    }

    async fn get_refreshed_user_token(
        &self,
        _context: &TurnContext,
        exchange_connection: Option<&str>,
        exchange_scopes: &[String],
    ) -> anyhow::Result<Option<TokenResponse>> {
        self.refresh_calls
            .lock()
            .await
            .push((exchange_connection.map(str::to_string), exchange_scopes.to_vec()));
        Ok(self.refreshed.lock().await.pop_front().flatten())
    }

    async fn reset_state(&self, _context: &TurnContext) -> anyhow::Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sign_out(&self, _context: &TurnContext) -> anyhow::Result<()> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    storage: Arc<MemoryStorage>,
    driver: Arc<ScriptedDriver>,
    engine: UserAuthorization,
    resumed: ContinuationReceiver,
    sender: Arc<RecordingSender>,
}

impl Fixture {
    fn new(options: UserAuthorizationOptions) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let driver = Arc::new(ScriptedDriver::default());
        let as_driver: Arc<dyn UserAuthorizationDriver> = driver.clone();
        let (bridge, resumed) = continuation_channel();
        let engine = UserAuthorization::new(
            storage.clone(),
            BTreeMap::from([("graph".to_string(), as_driver)]),
            Arc::new(bridge),
            options,
        )
        .expect("engine");
        Self {
            storage,
            driver,
            engine,
            resumed,
            sender: Arc::new(RecordingSender::new()),
        }
    }

    fn context(&self, activity: Activity) -> Arc<TurnContext> {
        Arc::new(TurnContext::new(activity, self.sender.clone()))
    }

    async fn ensure(&self, activity: Activity) -> Result<bool, AuthorizationError> {
        let context = self.context(activity);
        self.engine
            .ensure_signed_in(&context, &TurnState::new(), None, false)
            .await
    }

    async fn state(&self) -> Option<SignInState> {
        read_typed::<SignInState>(self.storage.as_ref(), STATE_KEY)
            .await
            .expect("read state")
    }
}

fn address(activity: Activity) -> Activity {
    activity
        .with_from(ChannelAccount::user("u-1"))
        .with_recipient(ChannelAccount::bot("b-1"))
}

fn message(id: &str, text: &str) -> Activity {
    address(Activity::message("test", "c-1", text).with_id(id))
}

fn verify_state(id: &str) -> Activity {
    address(
        Activity::invoke("test", "c-1", sign_in_names::VERIFY_STATE, json!({ "state": "123456" }))
            .with_id(id),
    )
}

fn token_exchange(id: &str) -> Activity {
    address(
        Activity::invoke(
            "test",
            "c-1",
            sign_in_names::TOKEN_EXCHANGE,
            json!({ "id": "x", "connectionName": "graph-conn", "token": "sso" }),
        )
        .with_id(id),
    )
}

fn token_expiring_in(minutes: i64) -> TokenResponse {
    TokenResponse::new("T").with_expiration(Utc::now() + ChronoDuration::minutes(minutes))
}

#[tokio::test]
async fn functional_pending_banks_the_first_activity_only_once() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    assert!(!fixture.ensure(message("a-1", "show my mail")).await.expect("turn 1"));
    let first = fixture.state().await.expect("state");
    assert_eq!(first.active_handler_name.as_deref(), Some("graph"));

    assert!(!fixture.ensure(message("a-2", "hello?")).await.expect("turn 2"));
    let second = fixture.state().await.expect("state");
    assert_eq!(second, first);
    assert_eq!(
        second
            .continuation_activity
            .and_then(|activity| activity.id),
        Some("a-1".to_string())
    );
    assert_eq!(fixture.driver.force_flags().await, vec![true, false]);
}

#[tokio::test]
async fn integration_completion_on_a_new_activity_resumes_the_banked_one() {
    let mut fixture = Fixture::new(UserAuthorizationOptions::default());
    let turn_one = message("a-1", "list files");
    assert!(!fixture.ensure(turn_one.clone()).await.expect("turn 1"));

    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("T")))
        .await;
    let proceed = fixture.ensure(verify_state("a-2")).await.expect("turn 2");
    assert!(!proceed);
    assert!(fixture.state().await.is_none());

    let resumed = fixture.resumed.try_recv().expect("resumed turn");
    assert_eq!(resumed.activity, turn_one);
    assert!(fixture.resumed.try_recv().is_none());

    let context = fixture.context(message("a-3", "again"));
    assert_eq!(
        fixture.engine.get_token(&context, "graph").await.expect("token"),
        Some("T".to_string())
    );
}

#[tokio::test]
async fn functional_immediate_completion_continues_the_current_turn() {
    let mut fixture = Fixture::new(UserAuthorizationOptions::default());
    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("T")))
        .await;
    assert!(fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    assert!(fixture.resumed.try_recv().is_none());
    assert!(fixture.state().await.is_none());
}

#[tokio::test]
async fn regression_flow_error_reports_500_and_next_call_starts_fresh() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    assert!(!fixture.ensure(message("a-1", "hi")).await.expect("turn 1"));
    fixture
        .driver
        .push(SignInResponse::error("user_declined", "dialog closed"))
        .await;
    assert!(!fixture.ensure(verify_state("a-2")).await.expect("turn 2"));

    let responses = fixture.sender.invoke_responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 500);
    let body = responses[0].body.clone().expect("body");
    assert_eq!(body["cause"], "user_declined");
    assert_eq!(body["activityId"], "a-2");
    assert_eq!(body["handlerName"], "graph");
    assert!(fixture.state().await.is_none());
    assert_eq!(fixture.driver.resets.load(Ordering::SeqCst), 1);

    assert!(!fixture.ensure(message("a-3", "retry")).await.expect("turn 3"));
    assert_eq!(fixture.driver.force_flags().await, vec![true, false, true]);
}

#[tokio::test]
async fn functional_flow_error_on_message_sends_default_text() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    fixture
        .driver
        .push(SignInResponse::error("flow_timeout", "expired"))
        .await;
    assert!(!fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    assert_eq!(
        fixture.sender.sent_texts().await,
        vec!["Sign in for 'graph' completed without a token. Status=flow_timeout".to_string()]
    );
}

#[tokio::test]
async fn functional_failure_formatter_overrides_default_text() {
    let options = UserAuthorizationOptions {
        failure_message: Some(Arc::new(|handler: &str, response: &SignInResponse| {
            format!("{handler} failed: {}", response.cause_or_unknown())
        })),
        ..UserAuthorizationOptions::default()
    };
    let fixture = Fixture::new(options);
    fixture.driver.push_failure("token service unreachable").await;
    assert!(!fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    assert_eq!(
        fixture.sender.sent_texts().await,
        vec!["graph failed: driver_error".to_string()]
    );
}

#[tokio::test]
async fn regression_custom_failure_handler_owns_the_invoke_response() {
    let captured = Arc::new(Mutex::new(Vec::<SignInFailure>::new()));
    let sink = captured.clone();
    let options = UserAuthorizationOptions {
        on_sign_in_failure: Some(failure_handler(move |_context, _state, failure| {
            let sink = sink.clone();
            async move {
                sink.lock().await.push(failure);
                Ok(())
            }
        })),
        ..UserAuthorizationOptions::default()
    };
    let fixture = Fixture::new(options);
    assert!(!fixture.ensure(message("a-1", "hi")).await.expect("turn 1"));
    fixture
        .driver
        .push(SignInResponse::error("user_declined", "closed"))
        .await;
    assert!(!fixture.ensure(verify_state("a-2")).await.expect("turn 2"));

    assert!(fixture.sender.sent().await.is_empty());
    let captured = captured.lock().await;
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].handler_name, "graph");
    assert_eq!(captured[0].response.cause_or_unknown(), "user_declined");
    assert_eq!(
        captured[0]
            .continuation_activity
            .as_ref()
            .and_then(|activity| activity.id.as_deref()),
        Some("a-1")
    );
}

#[tokio::test]
async fn regression_complete_without_token_is_reported_as_failure() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    let mut response = SignInResponse::complete(TokenResponse::new("ignored"));
    response.token = None;
    fixture.driver.push(response).await;
    assert!(!fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    assert_eq!(
        fixture.sender.sent_texts().await,
        vec!["Sign in for 'graph' completed without a token. Status=missing_token".to_string()]
    );
}

#[tokio::test]
async fn functional_out_of_band_sign_in_invoke_gets_structured_400() {
    let fixture = Fixture::new(UserAuthorizationOptions {
        auto_sign_in: AutoSignIn::Never,
        ..UserAuthorizationOptions::default()
    });
    assert!(!fixture.ensure(token_exchange("a-1")).await.expect("turn"));
    let responses = fixture.sender.invoke_responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 400);
    let body = responses[0].body.clone().expect("body");
    assert_eq!(body["activityId"], "a-1");
    assert_eq!(body["connectionName"], "graph-conn");
    assert_eq!(body["cause"], "no_active_flow");
    assert!(fixture.driver.force_flags().await.is_empty());
}

#[tokio::test]
async fn unit_no_auto_sign_in_lets_ordinary_turns_through() {
    let fixture = Fixture::new(UserAuthorizationOptions {
        auto_sign_in: AutoSignIn::Predicate(Arc::new(|context: &TurnContext| {
            context.activity().text.as_deref() == Some("login")
        })),
        ..UserAuthorizationOptions::default()
    });
    assert!(fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    assert!(fixture.driver.force_flags().await.is_empty());
    assert!(!fixture.ensure(message("a-2", "login")).await.expect("turn"));
    assert_eq!(fixture.driver.force_flags().await, vec![true]);
}

#[tokio::test]
async fn functional_get_token_reuses_fresh_tokens_and_refreshes_stale_ones() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    fixture
        .driver
        .push(SignInResponse::complete(token_expiring_in(10)))
        .await;
    assert!(fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    let context = fixture.context(message("a-2", "again"));
    assert_eq!(
        fixture.engine.get_token(&context, "graph").await.expect("token"),
        Some("T".to_string())
    );
    assert_eq!(fixture.driver.refresh_count().await, 0);

    let stale = Fixture::new(UserAuthorizationOptions::default());
    stale
        .driver
        .push(SignInResponse::complete(token_expiring_in(2)))
        .await;
    assert!(stale.ensure(message("a-1", "hi")).await.expect("turn"));
    stale
        .driver
        .push_refresh(Some(TokenResponse::new("T2").with_expiration(
            Utc::now() + ChronoDuration::minutes(60),
        )))
        .await;
    let context = stale.context(message("a-2", "again"));
    assert_eq!(
        stale.engine.get_token(&context, "graph").await.expect("token"),
        Some("T2".to_string())
    );
    assert_eq!(
        stale.engine.get_token(&context, "graph").await.expect("cached"),
        Some("T2".to_string())
    );
    assert_eq!(stale.driver.refresh_count().await, 1);
}

#[tokio::test]
async fn regression_refresh_returning_nothing_is_an_invariant_error() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    let context = fixture.context(message("a-1", "hi"));
    assert_eq!(
        fixture.engine.get_token(&context, "graph").await.expect("none"),
        None
    );

    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("T").exchangeable()))
        .await;
    assert!(fixture.ensure(message("a-2", "hi")).await.expect("turn"));
    let error = fixture
        .engine
        .get_token(&context, "graph")
        .await
        .expect_err("invariant");
    assert!(matches!(error, AuthorizationError::TokenRefreshMissing(name) if name == "graph"));
}

#[tokio::test]
async fn functional_agentic_requests_always_go_through_the_driver() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("T")))
        .await;
    assert!(fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    fixture
        .driver
        .push_refresh(Some(TokenResponse::new("agent-token")))
        .await;
    let agentic = Activity::message("test", "c-1", "hi")
        .with_from(ChannelAccount::user("u-1"))
        .with_recipient(ChannelAccount::agentic_user("b-1"));
    let context = fixture.context(agentic);
    assert_eq!(
        fixture.engine.get_token(&context, "graph").await.expect("token"),
        Some("agent-token".to_string())
    );
    assert_eq!(fixture.driver.refresh_count().await, 1);
}

#[tokio::test]
async fn functional_exchange_params_from_the_first_turn_drive_later_refreshes() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    let context = fixture.context(message("a-1", "hi"));
    let request = SignInRequest {
        handler_name: Some("graph".to_string()),
        force_auto: true,
        exchange_connection: Some("graph-obo".to_string()),
        exchange_scopes: vec!["User.Read".to_string()],
    };
    assert!(!fixture
        .engine
        .ensure_signed_in_with(&context, &TurnState::new(), request)
        .await
        .expect("turn 1"));

    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("obo").exchangeable()))
        .await;
    assert!(!fixture.ensure(verify_state("a-2")).await.expect("turn 2"));
    fixture
        .driver
        .push_refresh(Some(TokenResponse::new("obo-2").exchangeable()))
        .await;
    assert_eq!(
        fixture.engine.get_token(&context, "graph").await.expect("token"),
        Some("obo-2".to_string())
    );
    let calls = fixture.driver.refresh_calls.lock().await.clone();
    assert_eq!(
        calls,
        vec![(Some("graph-obo".to_string()), vec!["User.Read".to_string()])]
    );
}

#[tokio::test]
async fn functional_exchange_token_is_never_cached() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("T")))
        .await;
    assert!(fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    fixture
        .driver
        .push_refresh(Some(TokenResponse::new("obo").exchangeable()))
        .await;
    let context = fixture.context(message("a-2", "hi"));
    let scopes = vec!["Files.Read".to_string()];
    assert_eq!(
        fixture
            .engine
            .exchange_token(&context, "graph", "files-obo", &scopes)
            .await
            .expect("exchange"),
        Some("obo".to_string())
    );
    assert_eq!(
        fixture.engine.get_token(&context, "graph").await.expect("token"),
        Some("T".to_string())
    );
}

#[tokio::test]
async fn functional_sign_out_is_idempotent_and_clears_the_cache() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("T")))
        .await;
    assert!(fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    let context = fixture.context(message("a-2", "logout"));
    fixture.engine.sign_out(&context, None).await.expect("sign out");
    fixture
        .engine
        .sign_out(&context, Some("graph"))
        .await
        .expect("again");
    assert_eq!(fixture.driver.sign_outs.load(Ordering::SeqCst), 2);
    assert_eq!(
        fixture.engine.get_token(&context, "graph").await.expect("token"),
        None
    );
    assert!(matches!(
        fixture.engine.sign_out(&context, Some("mail")).await,
        Err(AuthorizationError::UnknownHandler(name)) if name == "mail"
    ));
}

#[tokio::test]
async fn regression_abandoned_pending_flow_expires_after_ttl() {
    let fixture = Fixture::new(UserAuthorizationOptions {
        pending_flow_ttl: Some(Duration::from_secs(60)),
        ..UserAuthorizationOptions::default()
    });
    let abandoned = SignInState {
        active_handler_name: Some("graph".to_string()),
        continuation_activity: Some(message("a-0", "old")),
        started_unix_ms: Some(1_000),
        ..SignInState::default()
    };
    write_typed(fixture.storage.as_ref(), STATE_KEY, &abandoned)
        .await
        .expect("seed");
    assert!(!fixture.ensure(message("a-1", "hi")).await.expect("turn"));
    assert_eq!(fixture.driver.force_flags().await, vec![true]);
    let state = fixture.state().await.expect("fresh state");
    assert_eq!(
        state.continuation_activity.and_then(|activity| activity.id),
        Some("a-1".to_string())
    );
}

#[tokio::test]
async fn regression_cancelled_turn_applies_no_transition() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    let cancellation = CooperativeCancellationToken::new();
    cancellation.cancel();
    let context = Arc::new(
        TurnContext::new(message("a-1", "hi"), fixture.sender.clone())
            .with_cancellation(cancellation),
    );
    let error = fixture
        .engine
        .ensure_signed_in(&context, &TurnState::new(), None, false)
        .await
        .expect_err("cancelled");
    assert!(matches!(error, AuthorizationError::Cancelled));
    assert!(fixture.storage.is_empty().await);
    assert!(fixture.driver.force_flags().await.is_empty());
}

#[tokio::test]
async fn unit_configuration_errors_are_reported_at_construction() {
    let storage = Arc::new(MemoryStorage::new());
    let (bridge, _receiver) = continuation_channel();
    let bridge = Arc::new(bridge);
    let empty = UserAuthorization::new(
        storage.clone(),
        BTreeMap::new(),
        bridge.clone(),
        UserAuthorizationOptions::default(),
    );
    assert!(matches!(empty, Err(AuthorizationError::NoHandlersConfigured)));

    let driver: Arc<dyn UserAuthorizationDriver> = Arc::new(ScriptedDriver::default());
    let missing_default = UserAuthorization::new(
        storage,
        BTreeMap::from([("graph".to_string(), driver)]),
        bridge,
        UserAuthorizationOptions {
            default_handler_name: Some("mail".to_string()),
            ..UserAuthorizationOptions::default()
        },
    );
    assert!(matches!(
        missing_default,
        Err(AuthorizationError::DefaultHandlerMissing(name)) if name == "mail"
    ));
}

#[tokio::test]
async fn unit_unknown_handler_request_is_a_configuration_error() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    let context = fixture.context(message("a-1", "hi"));
    let error = fixture
        .engine
        .ensure_signed_in(&context, &TurnState::new(), Some("mail"), true)
        .await
        .expect_err("unknown");
    assert!(matches!(error, AuthorizationError::UnknownHandler(name) if name == "mail"));
    assert_eq!(fixture.engine.default_handler_name(), "graph");
    assert!(fixture.engine.has_handler("graph"));
    assert_eq!(fixture.engine.handler_names(), vec!["graph".to_string()]);
}

#[tokio::test]
async fn regression_cancel_inside_success_callback_still_resumes_the_banked_activity() {
    let options = UserAuthorizationOptions {
        on_sign_in_success: Some(success_handler(|context, _state, _handler| async move {
            context.cancellation().cancel();
            anyhow::Ok(())
        })),
        ..UserAuthorizationOptions::default()
    };
    let mut fixture = Fixture::new(options);
    let turn_one = message("a-1", "list files");
    assert!(!fixture.ensure(turn_one.clone()).await.expect("turn 1"));

    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("T")))
        .await;
    let proceed = fixture.ensure(verify_state("a-2")).await.expect("turn 2");
    assert!(!proceed);
    assert!(fixture.state().await.is_none());
    let resumed = fixture.resumed.try_recv().expect("resumed turn");
    assert_eq!(resumed.activity, turn_one);
}

#[tokio::test]
async fn regression_failing_success_callback_reports_after_the_resume_hand_off() {
    let options = UserAuthorizationOptions {
        on_sign_in_success: Some(success_handler(|_context, _state, _handler| async move {
            Err::<(), _>(anyhow::anyhow!("audit sink offline"))
        })),
        ..UserAuthorizationOptions::default()
    };
    let mut fixture = Fixture::new(options);
    let turn_one = message("a-1", "list files");
    assert!(!fixture.ensure(turn_one.clone()).await.expect("turn 1"));

    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("T")))
        .await;
    let error = fixture
        .ensure(verify_state("a-2"))
        .await
        .expect_err("callback failure");
    assert!(matches!(error, AuthorizationError::Callback(_)));
    assert!(fixture.state().await.is_none());
    assert_eq!(
        fixture.resumed.try_recv().expect("resumed turn").activity,
        turn_one
    );
}

#[tokio::test]
async fn regression_cancelled_before_commit_keeps_the_pending_record() {
    let mut fixture = Fixture::new(UserAuthorizationOptions::default());
    assert!(!fixture.ensure(message("a-1", "list files")).await.expect("turn 1"));
    let pending = fixture.state().await.expect("pending state");

    fixture
        .driver
        .push(SignInResponse::complete(TokenResponse::new("T")))
        .await;
    let token = CooperativeCancellationToken::new();
    token.cancel();
    let context = Arc::new(
        TurnContext::new(verify_state("a-2"), fixture.sender.clone()).with_cancellation(token),
    );
    let error = fixture
        .engine
        .ensure_signed_in(&context, &TurnState::new(), None, false)
        .await
        .expect_err("cancelled");
    assert!(matches!(error, AuthorizationError::Cancelled));
    assert_eq!(fixture.state().await, Some(pending));
    assert!(fixture.resumed.try_recv().is_none());
}

#[tokio::test]
async fn regression_driver_error_detail_never_carries_the_error_chain() {
    let fixture = Fixture::new(UserAuthorizationOptions::default());
    assert!(!fixture.ensure(message("a-1", "hi")).await.expect("turn 1"));
    fixture
        .driver
        .push_failure("GET https://tokens.invalid/api?code=s3cr3t failed")
        .await;
    assert!(!fixture.ensure(verify_state("a-2")).await.expect("turn 2"));

    let responses = fixture.sender.invoke_responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 500);
    let body = responses[0].body.clone().expect("body");
    assert_eq!(body["cause"], "driver_error");
    assert_eq!(body["failureDetail"], DRIVER_ERROR_DETAIL);
    assert!(!body.to_string().contains("s3cr3t"));
}

#[tokio::test]
async fn integration_settings_configured_obo_is_re_exchanged_on_every_get_token() {
    let mut handler = HandlerSettings::new("graph-connection");
    handler.obo_connection_name = Some("graph-obo".to_string());
    handler.obo_scopes = vec!["User.Read".to_string()];
    let settings = AuthorizationSettings::new(BTreeMap::from([("graph".to_string(), handler)]));
    let client = Arc::new(InMemoryUserTokenClient::new());
    client
        .set_token("u-1", "graph-connection", TokenResponse::new("RAW"))
        .await;
    let (bridge, _resumed) = continuation_channel();
    let engine = UserAuthorization::from_settings(
        Arc::new(MemoryStorage::new()),
        &settings,
        client.clone(),
        Arc::new(bridge),
    )
    .expect("engine");
    let sender = Arc::new(RecordingSender::new());

    let first = Arc::new(TurnContext::new(message("a-1", "files"), sender.clone()));
    assert!(engine
        .ensure_signed_in(&first, &TurnState::new(), Some("graph"), true)
        .await
        .expect("sign in"));
    assert_eq!(client.call_count("exchange_token").await, 1);

    for (round, id) in ["a-2", "a-3"].into_iter().enumerate() {
        let context = TurnContext::new(message(id, "files"), sender.clone());
        let token = engine
            .get_token(&context, "graph")
            .await
            .expect("token")
            .expect("signed in");
        assert_ne!(token, "RAW");
        assert!(token.contains("-obo-"));
        assert_eq!(client.call_count("exchange_token").await, round + 2);
    }
}
