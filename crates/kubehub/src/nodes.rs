use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::Value as Json;
use tracing::{debug, info};

pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";
pub const WORKER_LABEL: &str = "node-role.kubernetes.io/worker";

fn worker_selector() -> String {
    format!("!{}", CONTROL_PLANE_LABEL)
}

fn needs_worker_label(node: &Node) -> bool {
    !node.labels().contains_key(WORKER_LABEL)
}

fn worker_label_patch() -> Json {
    serde_json::json!({ "metadata": { "labels": { WORKER_LABEL: "" } } })
}

/// Label every non control-plane node as a worker. Returns how many nodes were patched.
pub async fn label_workers(client: &Client) -> Result<usize, kube::Error> {
    let api: Api<Node> = Api::all(client.clone());
    let lp = ListParams::default().labels(&worker_selector());
    let workers = api.list(&lp).await?;
    let pp = PatchParams::default();
    let patch = worker_label_patch();
    let mut labeled = 0usize;
    for node in workers.items.iter() {
        let name = node.name_any();
        if !needs_worker_label(node) {
            debug!(node = %name, "already labeled");
            continue;
        }
        api.patch(&name, &pp, &Patch::Merge(&patch)).await?;
        info!(node = %name, label = WORKER_LABEL, "labeled worker");
        labeled += 1;
    }
    Ok(labeled)
}
