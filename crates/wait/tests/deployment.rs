#![forbid(unsafe_code)]

use std::time::Duration;

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use rollway_wait::{wait_for_deployment, CancellationToken, PollConfig, WaitError};
use tower_test::mock;

const PATH: &str = "/apis/apps/v1/namespaces/ops/deployments/web";

fn status(code: u16, reason: &str) -> Response<Body> {
    let body = serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("deployments.apps \"web\" {}", reason),
        "reason": reason,
        "code": code,
    });
    Response::builder()
        .status(StatusCode::from_u16(code).unwrap())
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn deployment(ready: i32) -> Response<Body> {
    let body = serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "web", "namespace": "ops" },
        "spec": { "selector": { "matchLabels": { "app": "web" } }, "template": {} },
        "status": { "replicas": 2, "readyReplicas": ready },
    });
    Response::builder().status(StatusCode::OK).body(Body::from(serde_json::to_vec(&body).unwrap())).unwrap()
}

fn fast() -> PollConfig {
    PollConfig::new(Duration::from_millis(10), Duration::from_secs(5))
}

#[tokio::test]
async fn absent_then_unready_then_ready() {
    let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let server = tokio::spawn(async move {
        for resp in [status(404, "NotFound"), deployment(0), deployment(1)] {
            let (req, send) = handle.next_request().await.expect("service not called");
            assert_eq!(req.method(), Method::GET);
            assert_eq!(req.uri().path(), PATH);
            send.send_response(resp);
        }
    });
    let client = kube::Client::new(service, "default");
    wait_for_deployment(&client, "ops", "web", fast(), &CancellationToken::new()).await.expect("ready");
    server.await.expect("mock server");
}

#[tokio::test]
async fn forbidden_fails_on_first_fetch() {
    let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let server = tokio::spawn(async move {
        let (_req, send) = handle.next_request().await.expect("service not called");
        send.send_response(status(403, "Forbidden"));
    });
    let client = kube::Client::new(service, "default");
    let err = wait_for_deployment(&client, "ops", "web", fast(), &CancellationToken::new()).await.unwrap_err();
    match err {
        WaitError::Condition(kube::Error::Api(ae)) => assert_eq!(ae.code, 403),
        other => panic!("unexpected {other}"),
    }
    server.await.expect("mock server");
}

#[tokio::test]
async fn never_created_times_out() {
    let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    tokio::spawn(async move {
        while let Some((_req, send)) = handle.next_request().await {
            send.send_response(status(404, "NotFound"));
        }
    });
    let client = kube::Client::new(service, "default");
    let cfg = PollConfig::new(Duration::from_millis(10), Duration::from_millis(60));
    let err = wait_for_deployment(&client, "ops", "web", cfg, &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_deadline(), "{err}");
}
