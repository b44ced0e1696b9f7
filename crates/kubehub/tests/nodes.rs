#![forbid(unsafe_code)]

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use rollway_kubehub::{label_workers, WORKER_LABEL};
use tower_test::mock;

fn ok(v: serde_json::Value) -> Response<Body> {
    Response::builder().status(StatusCode::OK).body(Body::from(serde_json::to_vec(&v).unwrap())).unwrap()
}

fn node(name: &str, labels: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": { "name": name, "labels": labels }
    })
}

fn worker_nodes() -> Response<Body> {
    ok(serde_json::json!({
        "apiVersion": "v1",
        "kind": "NodeList",
        "metadata": { "resourceVersion": "10" },
        "items": [
            node("worker-a", serde_json::json!({ "kubernetes.io/os": "linux", WORKER_LABEL: "" })),
            node("worker-b", serde_json::json!({ "kubernetes.io/os": "linux" })),
        ]
    }))
}

#[tokio::test]
async fn labels_only_unlabeled_workers() {
    let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let server = tokio::spawn(async move {
        let (req, send) = handle.next_request().await.expect("service not called");
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().path(), "/api/v1/nodes");
        let query = req.uri().query().unwrap_or_default().to_string();
        assert!(query.contains("labelSelector=%21node-role.kubernetes.io%2Fcontrol-plane"), "query={query}");
        send.send_response(worker_nodes());

        let mut patches = Vec::new();
        while let Some((req, send)) = handle.next_request().await {
            let content_type = req.headers().get("content-type").map(|v| v.to_str().unwrap().to_string());
            let (method, path) = (req.method().clone(), req.uri().path().to_string());
            let bytes = req.into_body().collect_bytes().await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["metadata"]["labels"][WORKER_LABEL], "");
            send.send_response(ok(node("worker-b", body["metadata"]["labels"].clone())));
            patches.push((method, path, content_type));
        }
        patches
    });

    let client = kube::Client::new(service, "default");
    let labeled = label_workers(&client).await.expect("label workers");
    assert_eq!(labeled, 1);
    drop(client);

    let patches = server.await.unwrap();
    assert_eq!(
        patches,
        vec![(Method::PATCH, "/api/v1/nodes/worker-b".to_string(), Some("application/merge-patch+json".to_string()))]
    );
}

#[tokio::test]
async fn no_workers_means_no_patches() {
    let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let server = tokio::spawn(async move {
        let (_req, send) = handle.next_request().await.expect("service not called");
        send.send_response(ok(serde_json::json!({
            "apiVersion": "v1", "kind": "NodeList", "metadata": {}, "items": []
        })));
        let mut extra = 0usize;
        while handle.next_request().await.is_some() {
            extra += 1;
        }
        extra
    });
    let client = kube::Client::new(service, "default");
    assert_eq!(label_workers(&client).await.expect("label workers"), 0);
    drop(client);
    assert_eq!(server.await.unwrap(), 0);
}
