use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use turnstile_activity::{sign_in_names, Activity, ChannelAccount, RecordingSender, TurnContext};
use turnstile_app::{
    continuation_channel, handler, load_authorization_settings, oauth_handlers, route_selectors,
    AgentApplication, AuthorizationSettings, HandlerSettings, InMemoryUserTokenClient, RouteSpec,
    TokenResponse, UserAuthorization,
};
use turnstile_core::{current_unix_timestamp_ms, write_text_atomic};
use turnstile_storage::{FileStorage, MemoryStorage, Storage};

const HARNESS_SCHEMA_VERSION: u32 = 1;
const CHANNEL_ID: &str = "harness";
const CONVERSATION_ID: &str = "harness-conversation";
const AGENT_ID: &str = "harness-agent";
const MAGIC_CODE: &str = "424242";

#[derive(Debug, Clone)]
struct CliArgs {
    settings_path: Option<PathBuf>,
    storage_dir: Option<PathBuf>,
    summary_json_out: Option<PathBuf>,
    user_id: String,
}

impl CliArgs {
    fn parse() -> Result<Self> {
        let mut settings_path = None;
        let mut storage_dir = None;
        let mut summary_json_out = None;
        let mut user_id = "harness-user".to_string();

        let args = env::args().skip(1).collect::<Vec<_>>();
        let mut index = 0usize;
        while index < args.len() {
            let next = args.get(index + 1).cloned();
            match args[index].as_str() {
                "--settings" => {
                    settings_path = Some(PathBuf::from(required(next, "--settings")?));
                    index += 2;
                }
                "--storage-dir" => {
                    storage_dir = Some(PathBuf::from(required(next, "--storage-dir")?));
                    index += 2;
                }
                "--summary-json-out" => {
                    summary_json_out = Some(PathBuf::from(required(next, "--summary-json-out")?));
                    index += 2;
                }
                "--user-id" => {
                    user_id = required(next, "--user-id")?;
                    index += 2;
                }
                "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                unknown => return Err(anyhow!("unknown argument: {unknown}")),
            }
        }

        Ok(Self {
            settings_path,
            storage_dir,
            summary_json_out,
            user_id,
        })
    }
}

fn required(value: Option<String>, flag: &str) -> Result<String> {
    value.ok_or_else(|| anyhow!("missing value for {flag}"))
}

fn print_usage() {
    println!(
        "Usage: signin_flow_harness [--settings PATH] [--storage-dir PATH] [--summary-json-out PATH] [--user-id VALUE]"
    );
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[derive(Debug, Serialize)]
struct TurnSummary {
    label: String,
    activity_type: String,
    sent_texts: Vec<String>,
    attachment_types: Vec<String>,
    invoke_statuses: Vec<u16>,
}

#[derive(Debug, Serialize)]
struct HarnessSummary {
    schema_version: u32,
    generated_unix_ms: u64,
    handler_name: String,
    connection_name: String,
    turns: Vec<TurnSummary>,
    resumed_turns: usize,
    route_completed: bool,
}

fn default_settings() -> AuthorizationSettings {
    let mut handler = HandlerSettings::new("graph-connection");
    handler.title = "Sign in to Graph".to_string();
    let mut settings = AuthorizationSettings::new(BTreeMap::from([("graph".to_string(), handler)]));
    settings.auto_sign_in = false;
    settings
}

fn address(activity: Activity, user_id: &str) -> Activity {
    activity
        .with_from(ChannelAccount::user(user_id))
        .with_recipient(ChannelAccount::bot(AGENT_ID))
}

async fn run_turn(
    app: &AgentApplication,
    sender: &Arc<RecordingSender>,
    label: &str,
    activity: Activity,
) -> Result<TurnSummary> {
    sender.clear().await;
    let activity_type = activity.activity_type.clone();
    app.on_turn(Arc::new(TurnContext::new(activity, sender.clone())))
        .await
        .with_context(|| format!("{label} failed"))?;
    summarize(sender, label, activity_type).await
}

async fn summarize(
    sender: &RecordingSender,
    label: &str,
    activity_type: String,
) -> Result<TurnSummary> {
    let sent = sender.sent().await;
    Ok(TurnSummary {
        label: label.to_string(),
        activity_type,
        sent_texts: sender.sent_texts().await,
        attachment_types: sent
            .iter()
            .flat_map(|activity| activity.attachments.iter())
            .map(|attachment| attachment.content_type.clone())
            .collect(),
        invoke_statuses: sender
            .invoke_responses()
            .await
            .into_iter()
            .map(|response| response.status)
            .collect(),
    })
}

fn write_summary(path: Option<&Path>, summary: &HarnessSummary) -> Result<()> {
    let rendered = serde_json::to_string_pretty(summary).context("failed to encode summary")?;
    match path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            write_text_atomic(path, &format!("{rendered}\n"))
        }
        None => {
            println!("{rendered}");
            Ok(())
        }
    }
}

async fn run() -> Result<()> {
    let args = CliArgs::parse()?;
    let settings = match args.settings_path.as_deref() {
        Some(path) => load_authorization_settings(path)?,
        None => default_settings(),
    };
    let handler_name = settings
        .resolved_default_handler_name()
        .ok_or_else(|| anyhow!("settings declare no handlers"))?
        .to_string();
    let connection_name = settings
        .handlers
        .get(&handler_name)
        .map(|handler| handler.connection_name.clone())
        .ok_or_else(|| anyhow!("default handler '{handler_name}' is not configured"))?;

    let storage: Arc<dyn Storage> = match args.storage_dir.as_deref() {
        Some(dir) => Arc::new(FileStorage::new(dir)),
        None => Arc::new(MemoryStorage::new()),
    };
    let client = Arc::new(InMemoryUserTokenClient::new());
    let (bridge, mut continuations) = continuation_channel();
    let authorization = Arc::new(UserAuthorization::from_settings(
        Arc::clone(&storage),
        &settings,
        client.clone(),
        Arc::new(bridge),
    )?);

    let app = AgentApplication::new(storage).with_authorization(Arc::clone(&authorization));
    let gated_handler = handler_name.clone();
    let mut spec = RouteSpec::new(
        route_selectors::message_text("list files"),
        handler(move |context, _state| {
            let authorization = Arc::clone(&authorization);
            let handler_name = gated_handler.clone();
            async move {
                let signed_in = authorization
                    .get_token(&context, &handler_name)
                    .await?
                    .is_some();
                context
                    .send_text(format!("listing files (signed in: {signed_in})"))
                    .await
            }
        }),
    );
    spec.oauth_handlers = oauth_handlers([handler_name.clone()]);
    app.add_route(spec)?;

    let sender = Arc::new(RecordingSender::new());
    let mut turns = Vec::new();
    let turn_one = address(
        Activity::message(CHANNEL_ID, CONVERSATION_ID, "list files").with_id("turn-1"),
        &args.user_id,
    );
    turns.push(run_turn(&app, &sender, "turn-1", turn_one).await?);

    client
        .issue_magic_code(
            &args.user_id,
            &connection_name,
            MAGIC_CODE,
            TokenResponse::new("harness-token").with_connection_name(&connection_name),
        )
        .await;
    let turn_two = address(
        Activity::invoke(
            CHANNEL_ID,
            CONVERSATION_ID,
            sign_in_names::VERIFY_STATE,
            json!({ "state": MAGIC_CODE }),
        )
        .with_id("turn-2"),
        &args.user_id,
    );
    turns.push(run_turn(&app, &sender, "turn-2", turn_two).await?);

    sender.clear().await;
    let resumed_turns = app
        .drain_continuations(&mut continuations, sender.clone())
        .await
        .context("continuation failed")?;
    let resumed = summarize(&sender, "resumed", "message".to_string()).await?;
    let route_completed = resumed
        .sent_texts
        .iter()
        .any(|text| text.starts_with("listing files"));
    turns.push(resumed);

    let summary = HarnessSummary {
        schema_version: HARNESS_SCHEMA_VERSION,
        generated_unix_ms: current_unix_timestamp_ms(),
        handler_name,
        connection_name,
        turns,
        resumed_turns,
        route_completed,
    };
    write_summary(args.summary_json_out.as_deref(), &summary)?;
    if !route_completed {
        return Err(anyhow!("gated route did not complete after sign-in"));
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(error) = run().await {
        eprintln!("[signin-flow-harness] {error:#}");
        std::process::exit(1);
    }
}
