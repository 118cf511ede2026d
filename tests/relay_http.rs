#![cfg(feature = "gateway")]

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use ditto_relay::adaptor::AdaptorRegistry;
use ditto_relay::channel::{
    Channel, ChannelRegistry, ChannelSelector, ChannelStatus, CircuitBreakerConfig,
};
use ditto_relay::clock::SystemClock;
use ditto_relay::config::TokenConfig;
use ditto_relay::ledger::{LedgerConfig, QuotaLedger};
use ditto_relay::observability::Observability;
use ditto_relay::pricing::{PricingConfig, PricingTable};
use ditto_relay::relay::{RelayOrchestrator, RelaySettings};
use ditto_relay::store::{LedgerStore, MemoryStore, UserRecord};
use ditto_relay::task::{TaskPollConfig, TaskPoller, TaskService};
use ditto_relay::{RelayHttpState, router};
use httpmock::prelude::*;
use serde_json::{Value, json};
use tower::util::ServiceExt;

struct App {
    router: Router,
    store: Arc<MemoryStore>,
    poller: TaskPoller,
}

impl App {
    async fn balance(&self) -> i64 {
        self.store.user(1).await.expect("user").quota
    }
}

fn upstream_channel(id: i64, platform: &str, base_url: String, key: &str, models: &[&str]) -> Channel {
    Channel {
        id,
        name: format!("{platform}-{id}"),
        platform: platform.to_string(),
        base_url,
        key: key.to_string(),
        models: models.iter().map(|m| m.to_string()).collect(),
        status: ChannelStatus::Enabled,
        priority: 0,
        weight: 1,
    }
}

async fn app(upstream: &MockServer) -> App {
    let store = Arc::new(MemoryStore::new());
    store.upsert_user(UserRecord::new(1, "default", 1000)).await;
    store.upsert_user(UserRecord::new(2, "default", 1000)).await;

    let clock = Arc::new(SystemClock);
    let observability = Arc::new(Observability::new());
    let registry = Arc::new(ChannelRegistry::new(
        vec![
            upstream_channel(1, "suno", upstream.base_url(), "sk-suno", &[
                "suno_music",
                "suno_lyrics",
            ]),
            upstream_channel(2, "openai", upstream.base_url(), "sk-openai", &["gpt-4o-mini"]),
        ],
        CircuitBreakerConfig::default(),
        clock.clone(),
    ));
    let ledger = Arc::new(QuotaLedger::new(
        store.clone(),
        &LedgerConfig::default(),
        clock,
        observability.clone(),
    ));
    let tasks = Arc::new(TaskService::new(
        store.clone(),
        ledger.clone(),
        observability.clone(),
    ));
    let adaptors = Arc::new(AdaptorRegistry::with_defaults(reqwest::Client::new()));

    let mut pricing = PricingConfig {
        quota_per_unit: 1000.0,
        ..PricingConfig::default()
    };
    pricing.model_prices.insert("gpt-4o-mini".to_string(), 0.05);

    let orchestrator = Arc::new(RelayOrchestrator::new(
        ChannelSelector::new(registry.clone()),
        ledger,
        tasks.clone(),
        adaptors.clone(),
        Arc::new(PricingTable::new(pricing)),
        RelaySettings::default(),
        observability.clone(),
    ));
    let poller = TaskPoller::new(tasks, registry, adaptors, TaskPollConfig::default());

    let tokens = vec![
        TokenConfig {
            id: 11,
            key: "sk-user-1".to_string(),
            name: "primary".to_string(),
            user_id: 1,
            enabled: true,
        },
        TokenConfig {
            id: 21,
            key: "sk-user-2".to_string(),
            name: "other".to_string(),
            user_id: 2,
            enabled: true,
        },
        TokenConfig {
            id: 12,
            key: "sk-revoked".to_string(),
            name: "revoked".to_string(),
            user_id: 1,
            enabled: false,
        },
    ];
    let state = RelayHttpState::new(orchestrator, tokens, observability);
    App {
        router: router(state),
        store,
        poller,
    }
}

fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn suno_submit_poll_and_fetch_round_trip() {
    let upstream = MockServer::start();
    let submit = upstream.mock(|when, then| {
        when.method(POST)
            .path("/suno/submit/music")
            .header("authorization", "Bearer sk-suno")
            .json_body(json!({"prompt": "lofi beats", "mv": "chirp-v3-0"}));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({"code": "success", "message": "", "data": "up-1"}));
    });
    let fetch = upstream.mock(|when, then| {
        when.method(POST)
            .path("/suno/fetch")
            .header("authorization", "Bearer sk-suno")
            .json_body(json!({"ids": ["up-1"]}));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "code": "success",
                "message": "",
                "data": [{
                    "task_id": "up-1",
                    "status": "SUCCESS",
                    "progress": "100%",
                    "data": {"audio_url": "https://cdn.example/up-1.mp3"}
                }]
            }));
    });
    let app = app(&upstream).await;

    let (status, body) = send(
        &app.router,
        post(
            "/suno/submit/music",
            Some("sk-user-1"),
            json!({"prompt": "lofi beats"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["code"], "success");
    let task_id = body["data"].as_str().expect("task id").to_string();
    submit.assert();
    assert_eq!(app.balance().await, 900);

    let (status, body) = send(&app.router, get(&format!("/suno/fetch/{task_id}"), "sk-user-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(body["data"]["provider_task_id"], "up-1");

    let summary = app.poller.poll_once().await.expect("poll");
    assert_eq!(summary.polled, 1);
    assert_eq!(summary.applied, 1);
    fetch.assert();

    let (status, body) = send(
        &app.router,
        post("/suno/fetch", Some("sk-user-1"), json!({"ids": [task_id]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let tasks = body["data"].as_array().expect("task list");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["status"], "succeeded");
    assert_eq!(tasks[0]["progress"], "100%");
    assert_eq!(tasks[0]["data"]["audio_url"], "https://cdn.example/up-1.mp3");
    assert_eq!(app.balance().await, 900);

    // Tasks are scoped to their owner.
    let (status, body) = send(&app.router, get(&format!("/suno/fetch/{task_id}"), "sk-user-2")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
    assert_eq!(body["error"]["code"], "task_not_exist");
}

#[tokio::test]
async fn continuation_sends_the_provider_task_id_upstream() {
    let upstream = MockServer::start();
    let first = upstream.mock(|when, then| {
        when.method(POST)
            .path("/suno/submit/music")
            .json_body(json!({"prompt": "lofi beats", "mv": "chirp-v3-0"}));
        then.status(200)
            .json_body(json!({"code": "success", "message": "", "data": "up-1"}));
    });
    let continued = upstream.mock(|when, then| {
        when.method(POST)
            .path("/suno/submit/music")
            .header("authorization", "Bearer sk-suno")
            .json_body(json!({"prompt": "second verse", "task_id": "up-1", "mv": "chirp-v3-0"}));
        then.status(200)
            .json_body(json!({"code": "success", "message": "", "data": "up-2"}));
    });
    let app = app(&upstream).await;

    let (status, body) = send(
        &app.router,
        post("/suno/submit/music", Some("sk-user-1"), json!({"prompt": "lofi beats"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let origin_id = body["data"].as_str().unwrap().to_string();
    assert_ne!(origin_id, "up-1");
    first.assert();

    let (status, body) = send(
        &app.router,
        post(
            "/suno/submit/music",
            Some("sk-user-1"),
            json!({"prompt": "second verse", "task_id": origin_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    continued.assert();
    assert_eq!(app.balance().await, 800);

    let next_id = body["data"].as_str().unwrap().to_string();
    let (_, body) = send(&app.router, get(&format!("/suno/fetch/{next_id}"), "sk-user-1")).await;
    assert_eq!(body["data"]["provider_task_id"], "up-2");
    assert_eq!(body["data"]["channel_id"], 1);
}

#[tokio::test]
async fn failed_suno_task_is_refunded_after_poll() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/suno/submit/lyrics");
        then.status(200)
            .json_body(json!({"code": "success", "message": "", "data": "up-9"}));
    });
    let fetch = upstream.mock(|when, then| {
        when.method(POST).path("/suno/fetch");
        then.status(200).json_body(json!({
            "code": "success",
            "message": "",
            "data": [{"task_id": "up-9", "status": "FAILURE", "fail_reason": "content policy"}]
        }));
    });
    let app = app(&upstream).await;

    let (status, body) = send(
        &app.router,
        post("/suno/submit/lyrics", Some("sk-user-1"), json!({"prompt": "rain"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let task_id = body["data"].as_str().unwrap().to_string();
    assert_eq!(app.balance().await, 990);

    app.poller.poll_once().await.expect("poll");
    assert_eq!(app.balance().await, 1000);

    // Terminal tasks are no longer polled, so the refund cannot repeat.
    let summary = app.poller.poll_once().await.expect("second poll");
    assert_eq!(summary.polled, 0);
    fetch.assert_calls(1);
    assert_eq!(app.balance().await, 1000);

    let (_, body) = send(&app.router, get(&format!("/suno/fetch/{task_id}"), "sk-user-1")).await;
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["fail_reason"], "content policy");
}

#[tokio::test]
async fn missing_or_revoked_tokens_are_rejected() {
    let upstream = MockServer::start();
    let submit = upstream.mock(|when, then| {
        when.method(POST).path("/suno/submit/music");
        then.status(200)
            .json_body(json!({"code": "success", "message": "", "data": "up-1"}));
    });
    let app = app(&upstream).await;

    for token in [None, Some("sk-revoked"), Some("sk-unknown")] {
        let (status, body) = send(
            &app.router,
            post("/suno/submit/music", token, json!({"prompt": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "invalid_token");
    }
    submit.assert_calls(0);
    assert_eq!(app.balance().await, 1000);
}

#[tokio::test]
async fn invalid_suno_prompt_never_reaches_upstream() {
    let upstream = MockServer::start();
    let submit = upstream.mock(|when, then| {
        when.method(POST).path("/suno/submit/lyrics");
        then.status(200)
            .json_body(json!({"code": "success", "message": "", "data": "up-1"}));
    });
    let app = app(&upstream).await;

    let (status, body) = send(
        &app.router,
        post("/suno/submit/lyrics", Some("sk-user-1"), json!({"prompt": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "prompt_empty");
    submit.assert_calls(0);
    assert_eq!(app.balance().await, 1000);
}

#[tokio::test]
async fn openai_chat_is_passed_through_and_billed() {
    let upstream = MockServer::start();
    let chat = upstream.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .header("authorization", "Bearer sk-openai");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":"chatcmpl-1","choices":[]}"#);
    });
    let app = app(&upstream).await;

    let request = post(
        "/v1/chat/completions",
        Some("sk-user-1"),
        json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}),
    );
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default(),
        "application/json"
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes, r#"{"id":"chatcmpl-1","choices":[]}"#);
    chat.assert();
    assert_eq!(app.balance().await, 950);
}

#[tokio::test]
async fn upstream_failure_surfaces_error_and_keeps_balance() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500).body("boom");
    });
    let app = app(&upstream).await;

    let (status, body) = send(
        &app.router,
        post(
            "/v1/chat/completions",
            Some("sk-user-1"),
            json!({"model": "gpt-4o-mini", "messages": []}),
        ),
    )
    .await;
    assert!(status.is_server_error(), "{status}");
    assert_eq!(body["error"]["code"], "fail_to_fetch_task");
    assert_eq!(app.balance().await, 1000);

    let (status, body) = send(&app.router, get("/metrics", "sk-user-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["counters"]["upstream_failures"], 1);
}
