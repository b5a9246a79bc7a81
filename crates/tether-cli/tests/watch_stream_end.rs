use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn watch_exits_when_the_server_ends_the_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/global/health"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"healthy": true})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/global/event"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(
                    "data: {\"type\":\"made.up.event\",\"properties\":{}}\n\n",
                    "text/event-stream",
                ),
        )
        .mount(&server)
        .await;

    let uri = server.uri();
    let assert = tokio::task::spawn_blocking(move || {
        cargo_bin_cmd!("tether")
            .args(["watch", "--endpoint", &uri])
            .timeout(Duration::from_secs(10))
            .assert()
    })
    .await
    .unwrap();
    assert.success();
}
