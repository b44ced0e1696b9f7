use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client};
use tracing::info;

use crate::{wait_until, CancellationToken, Condition, PollConfig, WaitError};

/// At least one ready replica. Desired replicas are not compared.
pub fn is_rolled_out(dep: &Deployment) -> bool {
    dep.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0) > 0
}

/// Readiness of one named Deployment. A missing Deployment reads as not ready.
pub struct DeploymentReady {
    api: Api<Deployment>,
    name: String,
}

impl DeploymentReady {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), name: name.to_string() }
    }
}

#[async_trait::async_trait]
impl Condition for DeploymentReady {
    type Error = kube::Error;

    async fn check(&mut self) -> Result<bool, kube::Error> {
        let dep = self.api.get(&self.name).await?;
        Ok(is_rolled_out(&dep))
    }
}

/// Block until `namespace/name` reports a ready replica.
pub async fn wait_for_deployment(
    client: &Client,
    namespace: &str,
    name: &str,
    cfg: PollConfig,
    cancel: &CancellationToken,
) -> Result<(), WaitError<kube::Error>> {
    info!(ns = %namespace, deployment = %name, interval = ?cfg.interval, timeout = ?cfg.timeout, "waiting for deployment");
    wait_until(DeploymentReady::new(client.clone(), namespace, name), cfg, cancel).await
}
