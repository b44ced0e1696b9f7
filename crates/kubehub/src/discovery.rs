//! Type discovery with an in-memory cache keyed by group-version.

use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::{
    core::{GroupVersion, GroupVersionKind},
    discovery::oneshot,
    Client,
};
use metrics::counter;
use rollway_core::{api_version, gvk_key, TypeMapping};
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("{gvk} is not served by the API server")]
    KindNotServed { gvk: String },
    #[error("discovery for {group_version} failed: {source}")]
    Discovery {
        group_version: String,
        #[source]
        source: kube::Error,
    },
}

/// Raw access to the server's type catalogue.
#[async_trait::async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Resources served under one group-version; `Ok(None)` when the
    /// group-version itself is unknown to the server.
    async fn resources_for(&self, group: &str, version: &str) -> Result<Option<Vec<TypeMapping>>, kube::Error>;
}

/// Discovery straight against the API server.
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl DiscoveryClient for KubeDiscovery {
    async fn resources_for(&self, group: &str, version: &str) -> Result<Option<Vec<TypeMapping>>, kube::Error> {
        let gv = GroupVersion::gv(group, version);
        let api_group = match oneshot::pinned_group(&self.client, &gv).await {
            Ok(g) => g,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
            Err(e) => return Err(e),
        };
        let out = api_group
            .versioned_resources(version)
            .into_iter()
            .map(|(ar, caps)| TypeMapping {
                group: ar.group,
                version: ar.version,
                kind: ar.kind,
                plural: ar.plural,
                scope: crate::scope_of(&caps.scope),
            })
            .collect();
        Ok(Some(out))
    }
}

type Entries = FxHashMap<String, Arc<Vec<TypeMapping>>>;

/// Memory cache in front of a [`DiscoveryClient`].
///
/// Reads are lock-free. Concurrent refreshes of the same group-version may
/// race; the last writer wins and readers always see a complete entry.
pub struct CachedDiscovery {
    inner: Box<dyn DiscoveryClient>,
    entries: ArcSwap<Entries>,
}

impl CachedDiscovery {
    pub fn new(inner: impl DiscoveryClient + 'static) -> Self {
        Self { inner: Box::new(inner), entries: ArcSwap::from_pointee(Entries::default()) }
    }

    /// Resolve a kind to its collection and scope.
    ///
    /// A cached group-version that lacks the kind is refetched once before the
    /// kind is reported as not served.
    pub async fn resolve(&self, gvk: &GroupVersionKind) -> Result<TypeMapping, DiscoveryError> {
        let gv = api_version(&gvk.group, &gvk.version);
        if let Some(list) = self.entries.load().get(&gv).cloned() {
            if let Some(m) = list.iter().find(|m| m.matches(gvk)) {
                counter!("discovery_cache_hits", 1u64);
                return Ok(m.clone());
            }
            debug!(group_version = %gv, kind = %gvk.kind, "kind missing from cached group-version; refreshing");
        }
        let list = self.refresh(&gvk.group, &gvk.version).await?;
        list.iter()
            .find(|m| m.matches(gvk))
            .cloned()
            .ok_or_else(|| DiscoveryError::KindNotServed { gvk: gvk_key(&gvk.group, &gvk.version, &gvk.kind) })
    }

    /// Drop every cached group-version.
    pub fn invalidate(&self) {
        self.entries.store(Arc::new(Entries::default()));
    }

    pub fn cached_group_versions(&self) -> usize {
        self.entries.load().len()
    }

    async fn refresh(&self, group: &str, version: &str) -> Result<Arc<Vec<TypeMapping>>, DiscoveryError> {
        let gv = api_version(group, version);
        counter!("discovery_fetches", 1u64);
        let fetched = self
            .inner
            .resources_for(group, version)
            .await
            .map_err(|source| DiscoveryError::Discovery { group_version: gv.clone(), source })?;
        let Some(list) = fetched else {
            self.entries.rcu(|cur| {
                let mut next = Entries::clone(cur);
                next.remove(&gv);
                next
            });
            return Err(DiscoveryError::KindNotServed { gvk: format!("{}/*", gv) });
        };
        debug!(group_version = %gv, resources = list.len(), "discovery cached");
        let list = Arc::new(list);
        self.entries.rcu(|cur| {
            let mut next = Entries::clone(cur);
            next.insert(gv.clone(), Arc::clone(&list));
            next
        });
        Ok(list)
    }
}
