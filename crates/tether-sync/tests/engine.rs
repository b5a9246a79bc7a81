//! End-to-end engine tests against a mock server.

use std::time::Duration;

use serde_json::json;
use tether_sync::bootstrap;
use tether_sync::client::ServerClient;
use tether_sync::store::SharedScope;
use tether_sync::{BootstrapStatus, ConcurrencyMode, Phase, SyncConfig, SyncEngine, SyncErrorKind};
use tether_types::VcsInfo;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config(uri: &str) -> SyncConfig {
    let mut config = SyncConfig::for_endpoint(uri);
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config
}

async fn mount_json(server: &MockServer, route: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Happy-path responses for every scope bootstrap route except `/agent`,
/// which each test mounts itself.
async fn mount_scope_routes(server: &MockServer) {
    mount_json(
        server,
        "/project/current",
        json!({"id": "prj_1", "worktree": "/work/app"}),
    )
    .await;
    mount_json(
        server,
        "/provider",
        json!({"all": [], "connected": [], "default": {}}),
    )
    .await;
    mount_json(server, "/config", json!({"theme": "dark"})).await;
    mount_json(server, "/path", json!({"directory": "/work/app"})).await;
    mount_json(server, "/command", json!([])).await;
    mount_json(server, "/session/status", json!({"ses_1": {"type": "busy"}})).await;
    let now = chrono::Utc::now().timestamp_millis();
    mount_json(
        server,
        "/session",
        json!([{
            "id": "ses_1",
            "title": "demo",
            "version": "1",
            "time": {"created": now, "updated": now}
        }]),
    )
    .await;
    mount_json(server, "/mcp", json!({})).await;
    mount_json(server, "/lsp", json!([])).await;
    mount_json(server, "/vcs", json!({"branch": "main"})).await;
    mount_json(server, "/permission", json!([])).await;
}

#[tokio::test]
async fn scope_bootstrap_degrades_but_completes_on_a_blocking_failure() {
    let server = MockServer::start().await;
    mount_scope_routes(&server).await;
    Mock::given(method("GET"))
        .and(path("/agent"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_string(r#"{"error":{"message":"agent registry offline"}}"#),
        )
        .mount(&server)
        .await;

    let config = fast_config(&server.uri());
    let client = ServerClient::new(&config, CancellationToken::new()).unwrap();
    let scope = SharedScope::new(config.session_limit);
    bootstrap::run_scope(&client, &config, &scope, "/work/app").await;

    // One blocking failure leaves the scope degraded, not stuck.
    assert_eq!(scope.read(|state| state.phase), Phase::Complete);
    let err = scope.read(|state| state.error.clone()).unwrap();
    assert_eq!(err.kind, SyncErrorKind::HttpStatus);
    assert!(err.message.contains("agent registry offline"));

    // Everything else still landed.
    assert_eq!(scope.read(|state| state.project.clone()), "prj_1");
    assert_eq!(scope.read(|state| state.config["theme"].clone()), json!("dark"));
    assert!(scope.read(|state| state.sessions.contains("ses_1")));
    assert!(scope.read(|state| state.session_status.contains_key("ses_1")));
    assert_eq!(
        scope.read(|state| state.vcs.clone()),
        Some(VcsInfo { branch: "main".into() })
    );
}

#[tokio::test]
async fn sequential_bootstrap_still_completes_the_scope() {
    let server = MockServer::start().await;
    mount_scope_routes(&server).await;
    mount_json(&server, "/agent", json!([{"name": "builder"}])).await;

    let mut config = fast_config(&server.uri());
    config.concurrency = ConcurrencyMode::Sequential;
    let client = ServerClient::new(&config, CancellationToken::new()).unwrap();
    let scope = SharedScope::new(config.session_limit);
    bootstrap::run_scope(&client, &config, &scope, "/work/app").await;

    assert_eq!(scope.read(|state| state.phase), Phase::Complete);
    assert!(scope.read(|state| state.error.is_none()));
    assert_eq!(scope.read(|state| state.project.clone()), "prj_1");
    assert_eq!(scope.read(|state| state.agents.len()), 1);
    assert!(scope.read(|state| state.sessions.contains("ses_1")));
    assert_eq!(
        scope.read(|state| state.vcs.clone()),
        Some(VcsInfo { branch: "main".into() })
    );
}

#[tokio::test]
async fn engine_run_bootstraps_global_and_dispatches_stream_events() {
    let server = MockServer::start().await;
    mount_json(&server, "/global/health", json!({"healthy": true})).await;
    mount_json(&server, "/path", json!({"home": "/home/u"})).await;
    mount_json(
        &server,
        "/project",
        json!([
            {"id": "prj_1", "worktree": "/work/app"},
            {"id": "prj_ghost", "worktree": ""}
        ]),
    )
    .await;
    mount_json(
        &server,
        "/provider",
        json!({"all": [], "connected": [], "default": {}}),
    )
    .await;
    mount_json(&server, "/provider/auth", json!({})).await;
    let body = concat!(
        "data: {\"type\":\"session.updated\",\"directory\":\"/work/app\",",
        "\"properties\":{\"info\":{\"id\":\"ses_1\",\"title\":\"demo\",",
        "\"version\":\"1\",\"time\":{\"created\":1}}}}\n\n",
        "data: {\"type\":\"made.up.event\",\"properties\":{}}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/global/event"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(body, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let engine = SyncEngine::new(fast_config(&server.uri())).unwrap();
    engine.run().await.unwrap();

    // The stream-end flush dispatched the session to its scope.
    assert!(engine
        .scope("/work/app")
        .read(|state| state.sessions.contains("ses_1")));

    let mut status_rx = engine.status();
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        status_rx.wait_for(|status| *status != BootstrapStatus::Pending),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(*status, BootstrapStatus::Ready);
    drop(status);

    let global = engine.global();
    assert!(global.read(|state| state.projects.contains("prj_1")));
    // Projects without a worktree are dropped at bootstrap.
    assert!(!global.read(|state| state.projects.contains("prj_ghost")));
    assert_eq!(global.read(|state| state.path.home.clone()), "/home/u");
}

#[tokio::test]
async fn shutdown_interrupts_a_pending_stream_connect() {
    let server = MockServer::start().await;
    mount_json(&server, "/global/health", json!({"healthy": true})).await;
    // The stream connect stalls far beyond the test horizon.
    Mock::given(method("GET"))
        .and(path("/global/event"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw("", "text/event-stream")
                .set_delay(Duration::from_secs(60)),
        )
        .mount(&server)
        .await;

    let engine = SyncEngine::new(fast_config(&server.uri())).unwrap();
    let run = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run should observe shutdown while connecting")
        .unwrap();
    assert!(result.is_ok(), "shutdown mid-connect is silent");
}

#[tokio::test]
async fn unreachable_server_fails_bootstrap_with_a_terminal_error() {
    let mut config = SyncConfig::for_endpoint("http://127.0.0.1:1");
    config.health.max_wait_ms = 100;
    config.health.interval_ms = 10;
    config.health.attempt_timeout_ms = 50;

    let engine = SyncEngine::new(config).unwrap();
    assert!(engine.run().await.is_err());

    let mut status_rx = engine.status();
    let status = tokio::time::timeout(
        Duration::from_secs(5),
        status_rx.wait_for(|status| *status != BootstrapStatus::Pending),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(matches!(&*status, BootstrapStatus::Failed(_)));
}
