//! Rollway kubehub – connections, cached type discovery and node labeling.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    discovery::{Discovery, Scope as KubeScope},
    Client, Config,
};
use rollway_core::{Scope, TypeMapping};
use tracing::{debug, info};

mod discovery;
mod nodes;

pub use discovery::{CachedDiscovery, DiscoveryClient, DiscoveryError, KubeDiscovery};
pub use nodes::{label_workers, CONTROL_PLANE_LABEL, WORKER_LABEL};

/// Load a kube config from an explicit kubeconfig path, falling back to
/// `KUBECONFIG`, `~/.kube/config` and in-cluster settings.
pub async fn load_config(kubeconfig: Option<&Path>) -> Result<Config> {
    match kubeconfig {
        Some(path) => {
            debug!(path = %path.display(), "reading kubeconfig");
            let kc = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("building config from kubeconfig")
        }
        None => Config::infer().await.context("inferring kube config"),
    }
}

/// A client plus the discovery cache that lives as long as it does.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct Connection {
    client: Client,
    discovery: Arc<CachedDiscovery>,
}

impl Connection {
    pub fn new(client: Client) -> Self {
        let discovery = Arc::new(CachedDiscovery::new(KubeDiscovery::new(client.clone())));
        Self { client, discovery }
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let client = Client::try_from(config).context("building kube client")?;
        Ok(Self::new(client))
    }

    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let config = load_config(kubeconfig).await?;
        info!(cluster_url = %config.cluster_url, "connecting");
        Self::from_config(config)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn discovery(&self) -> &Arc<CachedDiscovery> {
        &self.discovery
    }
}

/// Every kind the server recommends, CRDs included, ordered by group, version and kind.
pub async fn discover(client: &Client) -> Result<Vec<TypeMapping>> {
    let discovery = Discovery::new(client.clone()).run().await.context("running API discovery")?;
    let mut kinds: Vec<TypeMapping> = discovery
        .groups()
        .flat_map(|g| g.recommended_resources())
        .map(|(ar, caps)| TypeMapping {
            group: ar.group,
            version: ar.version,
            kind: ar.kind,
            plural: ar.plural,
            scope: scope_of(&caps.scope),
        })
        .collect();
    kinds.sort_by(|a, b| (&a.group, &a.version, &a.kind).cmp(&(&b.group, &b.version, &b.kind)));
    debug!(kinds = kinds.len(), "discovery listed");
    Ok(kinds)
}

pub(crate) fn scope_of(scope: &KubeScope) -> Scope {
    match scope {
        KubeScope::Namespaced => Scope::Namespaced,
        KubeScope::Cluster => Scope::Cluster,
    }
}
