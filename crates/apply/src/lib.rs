//! Rollway apply: server-side apply of schema-agnostic manifests.
//!
//! A raw document is decoded, its kind resolved through the connection's
//! discovery cache, and a single apply patch is sent under [`FIELD_MANAGER`].
//! Re-applying an unchanged document is a no-op merge on the server.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::{
    api::{Api, Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use metrics::{counter, histogram};
use rollway_core::{DecodeError, ResourceDocument, TypeMapping};
use rollway_kubehub::{CachedDiscovery, Connection, DiscoveryError};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

/// Field owner recorded on everything this crate applies.
pub const FIELD_MANAGER: &str = "rollway";

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("decoding manifest: {0}")]
    Decode(#[from] DecodeError),
    #[error("resolving {target}: {source}")]
    Resolution {
        target: String,
        #[source]
        source: DiscoveryError,
    },
    #[error("scope mismatch for {target}: {reason}")]
    ScopeMismatch { target: String, reason: String },
    #[error("server-side apply of {target} failed: {source}")]
    RemoteApply {
        target: String,
        #[source]
        source: kube::Error,
    },
}

impl ApplyError {
    /// The server's error, untouched, when the patch itself was rejected.
    pub fn remote(&self) -> Option<&kube::Error> {
        match self {
            ApplyError::RemoteApply { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Field ownership conflict reported by the server (HTTP 409).
    pub fn is_conflict(&self) -> bool {
        matches!(self.remote(), Some(kube::Error::Api(ae)) if ae.code == 409)
    }
}

/// Which collection endpoint a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestScope {
    /// Namespace-scoped collection; the namespace may be empty and is passed through.
    Namespaced(String),
    Cluster,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Target namespace for namespaced kinds, replacing `metadata.namespace`.
    /// Cluster-scoped kinds ignore it.
    pub namespace_override: Option<String>,
    /// Ask the server to validate without persisting.
    pub dry_run: bool,
    /// Take ownership of fields owned by other managers.
    pub force: bool,
}

/// A fully resolved apply patch, checked against its type mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    mapping: TypeMapping,
    scope: RequestScope,
    name: String,
    body: Json,
    dry_run: bool,
    force: bool,
}

impl ApplyRequest {
    /// Build a request, refusing a scope that contradicts the mapping.
    pub fn new(mapping: TypeMapping, scope: RequestScope, name: impl Into<String>, body: Json) -> Result<Self, ApplyError> {
        let name = name.into();
        let reason = match (&scope, mapping.scope.is_namespaced()) {
            (RequestScope::Cluster, true) => Some(format!("{} is namespaced but the request is cluster-wide", mapping.kind)),
            (RequestScope::Namespaced(ns), false) => {
                Some(format!("{} is cluster-scoped but the request targets namespace {:?}", mapping.kind, ns))
            }
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(ApplyError::ScopeMismatch { target: format!("{} {}", mapping.gvk_key(), name), reason });
        }
        Ok(Self { mapping, scope, name, body, dry_run: false, force: false })
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    pub fn force(mut self, on: bool) -> Self {
        self.force = on;
        self
    }

    pub fn mapping(&self) -> &TypeMapping {
        &self.mapping
    }

    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &Json {
        &self.body
    }

    pub fn field_manager(&self) -> &'static str {
        FIELD_MANAGER
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn is_forced(&self) -> bool {
        self.force
    }

    pub fn patch_params(&self) -> PatchParams {
        let mut pp = PatchParams::apply(FIELD_MANAGER);
        if self.force {
            pp = pp.force();
        }
        if self.dry_run {
            pp = pp.dry_run();
        }
        pp
    }

    /// Target for logs and errors, e.g. `apps/v1/Deployment ops/web`.
    pub fn describe(&self) -> String {
        match &self.scope {
            RequestScope::Namespaced(ns) => format!("{} {}/{}", self.mapping.gvk_key(), ns, self.name),
            RequestScope::Cluster => format!("{} {}", self.mapping.gvk_key(), self.name),
        }
    }
}

/// Where apply patches go. The kube-backed sink talks to the API server.
#[async_trait::async_trait]
pub trait PatchSink: Send + Sync {
    /// Send one apply patch and return the stored object's resourceVersion.
    async fn apply_patch(&self, req: &ApplyRequest) -> Result<Option<String>, kube::Error>;
}

/// Sends apply patches through a dynamic `Api<DynamicObject>`.
pub struct KubePatcher {
    client: Client,
}

impl KubePatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PatchSink for KubePatcher {
    async fn apply_patch(&self, req: &ApplyRequest) -> Result<Option<String>, kube::Error> {
        let ar = req.mapping().api_resource();
        // An empty namespace drops the `namespaces/<ns>` segment, as client-go does.
        let api: Api<DynamicObject> = match req.scope() {
            RequestScope::Namespaced(ns) if !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let obj = api.patch(req.name(), &req.patch_params(), &Patch::Apply(req.body())).await?;
        Ok(obj.metadata.resource_version)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub target: String,
    pub kind: String,
    pub name: String,
    /// Namespace the object landed in; `None` for cluster-scoped or unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub dry_run: bool,
    pub resource_version: Option<String>,
}

/// Resolves and applies documents. Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct Applier {
    discovery: Arc<CachedDiscovery>,
    sink: Arc<dyn PatchSink>,
}

impl Applier {
    pub fn new(conn: &Connection) -> Self {
        Self::with_parts(Arc::clone(conn.discovery()), Arc::new(KubePatcher::new(conn.client().clone())))
    }

    pub fn with_parts(discovery: Arc<CachedDiscovery>, sink: Arc<dyn PatchSink>) -> Self {
        Self { discovery, sink }
    }

    pub async fn apply(&self, raw: &[u8]) -> Result<ApplyOutcome, ApplyError> {
        self.apply_with(raw, &ApplyOptions::default()).await
    }

    pub async fn apply_with(&self, raw: &[u8], opts: &ApplyOptions) -> Result<ApplyOutcome, ApplyError> {
        counter!("apply_attempts", 1u64);
        let doc = ResourceDocument::from_slice(raw).map_err(|e| {
            counter!("apply_err", 1u64);
            e
        })?;
        self.apply_document(&doc, opts).await
    }

    pub async fn apply_document(&self, doc: &ResourceDocument, opts: &ApplyOptions) -> Result<ApplyOutcome, ApplyError> {
        let t0 = std::time::Instant::now();
        let res = self.apply_inner(doc, opts).await;
        match &res {
            Ok(out) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                info!(target_ref = %out.target, dry_run = out.dry_run, rv = ?out.resource_version, "applied");
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(doc = %doc.describe(), error = %e, "apply failed");
            }
        }
        res
    }

    async fn apply_inner(&self, doc: &ResourceDocument, opts: &ApplyOptions) -> Result<ApplyOutcome, ApplyError> {
        let mapping = self
            .discovery
            .resolve(doc.gvk())
            .await
            .map_err(|source| ApplyError::Resolution { target: doc.describe(), source })?;
        debug!(gvk = %mapping.gvk_key(), plural = %mapping.plural, scope = ?mapping.scope, "resolved");

        let mut body = doc.body().clone();
        let scope = if mapping.scope.is_namespaced() {
            let ns = match opts.namespace_override.as_deref() {
                Some(ns) => {
                    set_namespace(&mut body, ns);
                    ns.to_string()
                }
                None => doc.namespace().unwrap_or_default().to_string(),
            };
            RequestScope::Namespaced(ns)
        } else {
            RequestScope::Cluster
        };
        let req = ApplyRequest::new(mapping, scope, doc.name(), body)?
            .dry_run(opts.dry_run)
            .force(opts.force);

        let target = req.describe();
        let resource_version = self
            .sink
            .apply_patch(&req)
            .await
            .map_err(|source| ApplyError::RemoteApply { target: target.clone(), source })?;
        let namespace = match req.scope() {
            RequestScope::Namespaced(ns) if !ns.is_empty() => Some(ns.clone()),
            _ => None,
        };
        Ok(ApplyOutcome {
            target,
            kind: req.mapping().kind.clone(),
            name: req.name().to_string(),
            namespace,
            dry_run: req.is_dry_run(),
            resource_version,
        })
    }
}

/// Apply one raw document over `conn`, sharing its discovery cache.
pub async fn apply_manifest(conn: &Connection, raw: &[u8]) -> Result<ApplyOutcome, ApplyError> {
    Applier::new(conn).apply(raw).await
}

fn set_namespace(v: &mut Json, ns: &str) {
    if let Some(obj) = v.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
    }
}
