//! End-to-end adapter tests against real child processes.
//!
//! Tests are skipped quietly when python3 is not installed.

use std::collections::HashMap;
use std::net::TcpListener;
use std::time::Duration;

use mcpgw_adapter::AdapterManager;
use mcpgw_core::{
    AdapterSettings, BackendDescriptor, EventBus, Protocol, SupervisorSettings,
};
use mcpgw_runtime::Supervisor;

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok()
}

fn free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn manager() -> AdapterManager {
    let events = EventBus::new();
    let supervisor = Supervisor::new(SupervisorSettings::default(), events.clone());
    AdapterManager::new(supervisor, AdapterSettings::default(), events)
}

fn echo_descriptor(name: &str) -> BackendDescriptor {
    // Echoes each request line straight back.
    let script = "import sys\nfor line in sys.stdin:\n    sys.stdout.write(line)\n    sys.stdout.flush()\n";
    BackendDescriptor::stdio(name, "python3", vec!["-c".to_string(), script.to_string()]).unwrap()
}

fn replying_descriptor(name: &str) -> BackendDescriptor {
    // Parses each request and answers with a well-formed reply object.
    let script = "import sys, json\nfor line in sys.stdin:\n    req = json.loads(line)\n    sys.stdout.write(json.dumps({'statusCode': 201, 'body': req['url']}) + '\\n')\n    sys.stdout.flush()\n";
    BackendDescriptor::stdio(name, "python3", vec!["-c".to_string(), script.to_string()]).unwrap()
}

#[tokio::test]
async fn echo_child_round_trips_request_body() {
    if !python3_available() {
        return;
    }
    let manager = manager();
    let port = free_port();
    manager
        .create_adapter(&echo_descriptor("mem"), port)
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{port}/ping?x=1"))
        .body("hello")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    // A raw echoer is not speaking the reply shape, so the client sees
    // the whole translated request object.
    let echoed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["url"], "/ping?x=1");
    assert_eq!(echoed["body"], "hello");
    assert!(echoed["headers"].is_object());

    manager.stop_adapter("mem").await;
}

#[tokio::test]
async fn replying_child_controls_status_and_body() {
    if !python3_available() {
        return;
    }
    let manager = manager();
    let port = free_port();
    manager
        .create_adapter(&replying_descriptor("rep"), port)
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{port}/made/up?q=2"))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    assert_eq!(response.text().await.unwrap(), "/made/up?q=2");

    // Requests are strictly serialised; a quick burst keeps its pairing.
    for i in 0..5 {
        let response = client
            .post(format!("http://127.0.0.1:{port}/seq/{i}"))
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), format!("/seq/{i}"));
    }

    manager.stop_adapter("rep").await;
}

#[tokio::test]
async fn health_endpoint_reports_child_state() {
    if !python3_available() {
        return;
    }
    let manager = manager();
    let port = free_port();
    manager
        .create_adapter(&echo_descriptor("healthy"), port)
        .await
        .unwrap();

    let response = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["server"], "healthy");
    assert_eq!(body["hasChildProcess"], true);

    manager.stop_adapter("healthy").await;
}

#[tokio::test]
async fn commandless_adapter_serves_503() {
    let manager = manager();
    let port = free_port();
    let descriptor = BackendDescriptor::new(
        "external",
        Protocol::Stdio,
        None,
        Vec::new(),
        HashMap::new(),
        None,
        false,
        None,
    )
    .unwrap();
    manager.create_adapter(&descriptor, port).await.unwrap();

    let response = reqwest::get(format!("http://127.0.0.1:{port}/anything"))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    // The adapter itself is healthy while waiting for an external process.
    let health = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    manager.stop_adapter("external").await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_the_child() {
    if !python3_available() {
        return;
    }
    let manager = manager();
    let port = free_port();
    manager
        .create_adapter(&echo_descriptor("strict"), port)
        .await
        .unwrap();

    let client = reqwest::Client::new();

    // Unknown method.
    let response = client
        .request(
            reqwest::Method::from_bytes(b"TRACE").unwrap(),
            format!("http://127.0.0.1:{port}/x"),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Oversized body.
    let small_manager = {
        let events = EventBus::new();
        let supervisor = Supervisor::new(SupervisorSettings::default(), events.clone());
        let settings = AdapterSettings {
            max_buffer_size: 16,
            ..Default::default()
        };
        AdapterManager::new(supervisor, settings, events)
    };
    let small_port = free_port();
    small_manager
        .create_adapter(&echo_descriptor("small"), small_port)
        .await
        .unwrap();

    let at_limit = client
        .post(format!("http://127.0.0.1:{small_port}/x"))
        .body("a".repeat(16))
        .send()
        .await
        .unwrap();
    assert_eq!(at_limit.status(), 200);

    let over_limit = client
        .post(format!("http://127.0.0.1:{small_port}/x"))
        .body("a".repeat(17))
        .send()
        .await
        .unwrap();
    assert_eq!(over_limit.status(), 413);

    manager.stop_adapter("strict").await;
    small_manager.stop_adapter("small").await;
}

#[tokio::test]
async fn preflight_carries_cors_headers() {
    let manager = manager();
    let port = free_port();
    let descriptor = BackendDescriptor::new(
        "cors",
        Protocol::Stdio,
        None,
        Vec::new(),
        HashMap::new(),
        None,
        false,
        None,
    )
    .unwrap();
    manager.create_adapter(&descriptor, port).await.unwrap();

    let client = reqwest::Client::new();
    let response = client
        .request(
            reqwest::Method::OPTIONS,
            format!("http://127.0.0.1:{port}/anything"),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );

    manager.stop_adapter("cors").await;
}

#[tokio::test]
async fn stop_adapter_is_idempotent_and_frees_the_port() {
    let manager = manager();
    // Unknown name is a no-op.
    manager.stop_adapter("ghost").await;

    let port = free_port();
    let descriptor = BackendDescriptor::new(
        "gone",
        Protocol::Stdio,
        None,
        Vec::new(),
        HashMap::new(),
        None,
        false,
        None,
    )
    .unwrap();
    manager.create_adapter(&descriptor, port).await.unwrap();
    assert!(manager.adapter_info("gone").is_some());

    manager.stop_adapter("gone").await;
    assert!(manager.adapter_info("gone").is_none());

    // Give the graceful shutdown a beat, then the port is bindable again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
}
