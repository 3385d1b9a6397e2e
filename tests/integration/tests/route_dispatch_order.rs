use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use turnstile_activity::{Activity, ChannelAccount, InvokeResponse, RecordingSender, TurnContext};
use turnstile_app::{
    handler, route_selectors, AgentApplication, RouteFlags, RouteHandler, RouteRank, RouteSpec,
};
use turnstile_storage::MemoryStorage;

type Trace = Arc<Mutex<Vec<String>>>;

fn recording(trace: &Trace, label: impl Into<String>) -> RouteHandler {
    let trace = trace.clone();
    let label = label.into();
    handler(move |_context, _state| {
        let trace = trace.clone();
        let label = label.clone();
        async move {
            trace.lock().await.push(label);
            Ok(())
        }
    })
}

fn audit(trace: &Trace, label: &str, flags: RouteFlags, rank: RouteRank) -> RouteSpec {
    RouteSpec {
        flags: RouteFlags {
            non_terminal: true,
            ..flags
        },
        rank,
        ..RouteSpec::new(route_selectors::any_activity(), recording(trace, label))
    }
}

fn agentic_invoke(name: &str) -> Activity {
    Activity::invoke("test", "c-1", name, json!({}))
        .with_id("a-1")
        .with_from(ChannelAccount::user("u-1"))
        .with_recipient(ChannelAccount::agentic_user("agent-1"))
}

async fn run(app: &AgentApplication, activity: Activity) -> Arc<RecordingSender> {
    let sender = Arc::new(RecordingSender::new());
    app.on_turn(Arc::new(TurnContext::new(activity, sender.clone())))
        .await
        .expect("turn");
    sender
}

#[tokio::test]
async fn integration_priority_classes_outrank_registration_order() {
    let app = AgentApplication::new(Arc::new(MemoryStorage::new()));
    let trace = Trace::default();
    app.add_route(audit(&trace, "plain", RouteFlags::NONE, RouteRank::FIRST))
        .expect("plain");
    app.add_route(audit(&trace, "agentic", RouteFlags::agentic(), RouteRank::UNSPECIFIED))
        .expect("agentic");
    let mut invoke = RouteSpec::new(
        route_selectors::invoke_name("task/fetch"),
        handler(|context, _state| async move {
            context
                .send_invoke_response(InvokeResponse::ok(Some(json!({ "task": "done" }))))
                .await?;
            Ok(())
        }),
    );
    invoke.flags = RouteFlags::invoke();
    app.add_route(invoke).expect("invoke");
    app.add_route(RouteSpec {
        flags: RouteFlags {
            agentic: true,
            invoke: true,
            non_terminal: false,
        },
        ..RouteSpec::new(
            route_selectors::invoke_name("never/matches"),
            recording(&trace, "agentic-invoke"),
        )
    })
    .expect("agentic invoke");

    let sender = run(&app, agentic_invoke("task/fetch")).await;
    // The terminal invoke route runs before both audits, so neither fires.
    assert!(trace.lock().await.is_empty());
    assert_eq!(
        sender.invoke_responses().await,
        vec![InvokeResponse::ok(Some(json!({ "task": "done" })))]
    );

    let message = Activity::message("test", "c-1", "hello")
        .with_from(ChannelAccount::user("u-1"))
        .with_recipient(ChannelAccount::agentic_user("agent-1"));
    run(&app, message).await;
    assert_eq!(
        *trace.lock().await,
        vec!["agentic".to_string(), "plain".to_string()]
    );
}

#[tokio::test]
async fn functional_rank_orders_routes_within_a_class() {
    let app = AgentApplication::new(Arc::new(MemoryStorage::new()));
    let trace = Trace::default();
    app.add_route(audit(&trace, "unspecified", RouteFlags::NONE, RouteRank::UNSPECIFIED))
        .expect("unspecified");
    app.add_route(audit(&trace, "last", RouteFlags::NONE, RouteRank::LAST))
        .expect("last");
    app.add_route(audit(&trace, "ten-a", RouteFlags::NONE, RouteRank(10)))
        .expect("ten-a");
    app.add_route(audit(&trace, "first", RouteFlags::NONE, RouteRank::FIRST))
        .expect("first");
    app.add_route(audit(&trace, "ten-b", RouteFlags::NONE, RouteRank(10)))
        .expect("ten-b");

    let message = Activity::message("test", "c-1", "anything")
        .with_from(ChannelAccount::user("u-1"))
        .with_recipient(ChannelAccount::bot("b-1"));
    run(&app, message).await;
    assert_eq!(
        *trace.lock().await,
        vec!["first", "ten-a", "ten-b", "last", "unspecified"]
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_registration_keeps_every_route_and_the_order() {
    let app = Arc::new(AgentApplication::new(Arc::new(MemoryStorage::new())));
    let trace = Trace::default();
    let mut tasks = Vec::new();
    for worker in 0..8u16 {
        let app = Arc::clone(&app);
        let trace = trace.clone();
        tasks.push(tokio::spawn(async move {
            for step in 0..8u16 {
                let rank = RouteRank(worker * 8 + step);
                app.add_route(audit(&trace, &format!("{:03}", rank.0), RouteFlags::NONE, rank))
                    .expect("register");
            }
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }
    assert_eq!(app.routes().len(), 64);

    let message = Activity::message("test", "c-1", "anything")
        .with_from(ChannelAccount::user("u-1"))
        .with_recipient(ChannelAccount::bot("b-1"));
    run(&app, message).await;
    let observed = trace.lock().await.clone();
    let expected = (0..64u16).map(|rank| format!("{rank:03}")).collect::<Vec<_>>();
    assert_eq!(observed, expected);
}

#[tokio::test]
async fn regression_channel_restricted_route_skips_other_channels() {
    let app = AgentApplication::new(Arc::new(MemoryStorage::new()));
    let trace = Trace::default();
    app.add_route(RouteSpec {
        channel_id: Some("msteams".to_string()),
        ..RouteSpec::new(route_selectors::any_activity(), recording(&trace, "teams"))
    })
    .expect("teams");
    app.add_route(RouteSpec::new(
        route_selectors::any_activity(),
        recording(&trace, "fallback"),
    ))
    .expect("fallback");

    let webchat = Activity::message("webchat", "c-1", "hi")
        .with_from(ChannelAccount::user("u-1"))
        .with_recipient(ChannelAccount::bot("b-1"));
    let teams = Activity::message("msteams", "c-2", "hi")
        .with_from(ChannelAccount::user("u-1"))
        .with_recipient(ChannelAccount::bot("b-1"));
    run(&app, webchat).await;
    run(&app, teams).await;
    assert_eq!(
        *trace.lock().await,
        vec!["fallback".to_string(), "teams".to_string()]
    );
}
