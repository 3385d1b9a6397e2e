use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use turnstile_activity::{sign_in_names, Activity, ChannelAccount, RecordingSender, TurnContext};
use turnstile_app::{
    continuation_channel, handler, load_authorization_settings, oauth_handlers, route_selectors,
    AgentApplication, AuthorizationSettings, ContinuationReceiver, HandlerSettings,
    InMemoryUserTokenClient, RouteSpec, TokenResponse, UserAuthorization,
};
use turnstile_storage::{FileStorage, MemoryStorage, Storage};

const CONNECTION: &str = "graph-connection";

struct Host {
    app: AgentApplication,
    resumed: ContinuationReceiver,
}

fn settings() -> AuthorizationSettings {
    let mut settings = AuthorizationSettings::new(BTreeMap::from([(
        "graph".to_string(),
        HandlerSettings::new(CONNECTION),
    )]));
    settings.auto_sign_in = false;
    settings
}

fn build_host(
    storage: Arc<dyn Storage>,
    settings: &AuthorizationSettings,
    client: Arc<InMemoryUserTokenClient>,
) -> Host {
    let (bridge, resumed) = continuation_channel();
    let authorization = Arc::new(
        UserAuthorization::from_settings(Arc::clone(&storage), settings, client, Arc::new(bridge))
            .expect("authorization"),
    );
    let app = AgentApplication::new(storage).with_authorization(Arc::clone(&authorization));
    let mut spec = RouteSpec::new(
        route_selectors::message_text("list files"),
        handler(move |context, _state| {
            let authorization = Arc::clone(&authorization);
            async move {
                let token = authorization.get_token(&context, "graph").await?;
                context
                    .send_text(format!("files for {}", token.unwrap_or_default()))
                    .await
            }
        }),
    );
    spec.oauth_handlers = oauth_handlers(["graph"]);
    app.add_route(spec).expect("route");
    Host { app, resumed }
}

fn address(activity: Activity) -> Activity {
    activity
        .with_from(ChannelAccount::user("u-1"))
        .with_recipient(ChannelAccount::bot("b-1"))
}

fn list_files(id: &str) -> Activity {
    address(Activity::message("test", "c-1", "list files").with_id(id))
}

fn verify_state(id: &str, code: &str) -> Activity {
    address(
        Activity::invoke("test", "c-1", sign_in_names::VERIFY_STATE, json!({ "state": code }))
            .with_id(id),
    )
}

fn declined(id: &str) -> Activity {
    address(
        Activity::invoke(
            "test",
            "c-1",
            sign_in_names::FAILURE,
            json!({ "code": "resourcematchfailed", "message": "user declined" }),
        )
        .with_id(id),
    )
}

async fn turn(host: &Host, sender: &Arc<RecordingSender>, activity: Activity) {
    host.app
        .on_turn(Arc::new(TurnContext::new(activity, sender.clone())))
        .await
        .expect("turn");
}

fn file_storage(dir: &Path) -> Arc<dyn Storage> {
    Arc::new(FileStorage::new(dir))
}

#[tokio::test]
async fn integration_pending_sign_in_resumes_after_process_restart() {
    let dir = tempdir().expect("tempdir");
    let client = Arc::new(InMemoryUserTokenClient::new());
    let sender = Arc::new(RecordingSender::new());

    {
        let first = build_host(file_storage(dir.path()), &settings(), client.clone());
        turn(&first, &sender, list_files("a-1")).await;
        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attachments.len(), 1);
    }

    client
        .issue_magic_code("u-1", CONNECTION, "314159", TokenResponse::new("T-1"))
        .await;
    sender.clear().await;
    let mut second = build_host(file_storage(dir.path()), &settings(), client.clone());
    turn(&second, &sender, verify_state("a-2", "314159")).await;
    assert_eq!(sender.invoke_responses().await.len(), 1);
    assert!(sender.invoke_responses().await[0].is_success());
    assert!(sender.sent_texts().await.is_empty());

    let processed = second
        .app
        .drain_continuations(&mut second.resumed, sender.clone())
        .await
        .expect("drain");
    assert_eq!(processed, 1);
    assert_eq!(sender.sent_texts().await, vec!["files for T-1".to_string()]);

    sender.clear().await;
    turn(&second, &sender, list_files("a-3")).await;
    assert_eq!(sender.sent_texts().await, vec!["files for T-1".to_string()]);
    assert!(second.resumed.try_recv().is_none());
}

#[tokio::test]
async fn regression_declined_sign_in_reports_failure_and_next_request_starts_fresh() {
    let client = Arc::new(InMemoryUserTokenClient::new());
    let mut host = build_host(Arc::new(MemoryStorage::new()), &settings(), client.clone());
    let sender = Arc::new(RecordingSender::new());

    turn(&host, &sender, list_files("a-1")).await;
    assert_eq!(sender.sent().await[0].attachments.len(), 1);

    sender.clear().await;
    turn(&host, &sender, declined("a-2")).await;
    let responses = sender.invoke_responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 200);
    assert_eq!(
        sender.sent_texts().await,
        vec!["Sign in for 'graph' completed without a token. Status=sign_in_failure".to_string()]
    );
    assert!(host.resumed.try_recv().is_none());

    sender.clear().await;
    turn(&host, &sender, list_files("a-3")).await;
    let sent = sender.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].attachments.len(), 1);
    assert!(sender
        .sent_texts()
        .await
        .iter()
        .all(|text| !text.starts_with("files for")));
}

#[tokio::test]
async fn functional_settings_file_template_shapes_failure_message() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("authorization.toml");
    std::fs::write(
        &path,
        r#"
auto_sign_in = false
sign_in_failure_message = "Could not sign you in to {handler} ({cause})."

[handlers.graph]
connection_name = "graph-connection"
"#,
    )
    .expect("write settings");
    let settings = load_authorization_settings(&path).expect("settings");
    let client = Arc::new(InMemoryUserTokenClient::new());
    let host = build_host(Arc::new(MemoryStorage::new()), &settings, client);
    let sender = Arc::new(RecordingSender::new());

    turn(&host, &sender, list_files("a-1")).await;
    sender.clear().await;
    turn(&host, &sender, declined("a-2")).await;
    assert_eq!(
        sender.sent_texts().await,
        vec!["Could not sign you in to graph (sign_in_failure).".to_string()]
    );
}

#[tokio::test]
async fn functional_out_of_band_verify_state_without_a_flow_gets_400() {
    let client = Arc::new(InMemoryUserTokenClient::new());
    let host = build_host(Arc::new(MemoryStorage::new()), &settings(), client);
    let sender = Arc::new(RecordingSender::new());

    turn(&host, &sender, verify_state("a-1", "000000")).await;
    let responses = sender.invoke_responses().await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, 400);
    let body = responses[0].body.clone().expect("body");
    assert_eq!(body["activityId"], "a-1");
    assert_eq!(body["cause"], "no_active_flow");
    assert!(sender.sent_texts().await.is_empty());
}
