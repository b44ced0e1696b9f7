//! Decoding of a single raw manifest into a schema-agnostic document.

use kube::core::GroupVersionKind;
use serde_json::Value as Json;

/// Request body ceiling of a stock API server.
const DEFAULT_MAX_BYTES: usize = 3 * 1024 * 1024;
const DEFAULT_MAX_NODES: usize = 100_000;

fn limit_from_env(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

/// Why a raw document could not become a [`ResourceDocument`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("document too large (>{limit} bytes)")]
    TooLarge { limit: usize },
    #[error("document too complex (>{limit} nodes)")]
    TooComplex { limit: usize },
    #[error("parsing document: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("converting document to JSON: {0}")]
    Convert(#[from] serde_json::Error),
    #[error("document is not a mapping")]
    NotAMapping,
    #[error("document missing apiVersion")]
    MissingApiVersion,
    #[error("document missing kind")]
    MissingKind,
    #[error("document missing metadata.name (kind {kind})")]
    MissingName { kind: String },
    #[error("invalid apiVersion {0:?} (expect v1 or group/v1)")]
    InvalidApiVersion(String),
}

/// A decoded manifest: the untouched JSON tree plus its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDocument {
    body: Json,
    gvk: GroupVersionKind,
    name: String,
    namespace: Option<String>,
}

impl ResourceDocument {
    /// Decode YAML (or JSON, which YAML accepts) from raw bytes.
    pub fn from_slice(raw: &[u8]) -> Result<Self, DecodeError> {
        let limit = limit_from_env("ROLLWAY_MAX_YAML_BYTES", DEFAULT_MAX_BYTES);
        if raw.len() > limit {
            return Err(DecodeError::TooLarge { limit });
        }
        let val: serde_yaml::Value = serde_yaml::from_slice(raw)?;
        let json = serde_json::to_value(val)?;
        Self::from_value(json)
    }

    pub fn from_value(json: Json) -> Result<Self, DecodeError> {
        let limit = limit_from_env("ROLLWAY_MAX_YAML_NODES", DEFAULT_MAX_NODES);
        if exceeds_node_count(&json, limit) {
            return Err(DecodeError::TooComplex { limit });
        }
        if !json.is_object() {
            return Err(DecodeError::NotAMapping);
        }
        let api_version = json
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(DecodeError::MissingApiVersion)?;
        let kind = json
            .get("kind")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(DecodeError::MissingKind)?
            .to_string();
        let (group, version) = split_api_version(api_version)?;
        let meta = json.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DecodeError::MissingName { kind: kind.clone() })?
            .to_string();
        let namespace = meta
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(Self { gvk: GroupVersionKind { group, version, kind }, name, namespace, body: json })
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace as declared in `metadata.namespace`; never defaulted.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn body(&self) -> &Json {
        &self.body
    }

    /// Canonical JSON encoding of the document, as sent in an apply patch.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.body)
    }

    /// Human-readable identity for logs and errors, e.g. `apps/v1/Deployment ops/web`.
    pub fn describe(&self) -> String {
        let key = crate::gvk_key(&self.gvk.group, &self.gvk.version, &self.gvk.kind);
        match self.namespace.as_deref() {
            Some(ns) => format!("{} {}/{}", key, ns, self.name),
            None => format!("{} {}", key, self.name),
        }
    }
}

fn split_api_version(s: &str) -> Result<(String, String), DecodeError> {
    match s.split('/').collect::<Vec<_>>().as_slice() {
        [version] => Ok((String::new(), (*version).to_string())),
        [group, version] if !group.is_empty() && !version.is_empty() => {
            Ok(((*group).to_string(), (*version).to_string()))
        }
        _ => Err(DecodeError::InvalidApiVersion(s.to_string())),
    }
}

/// True once the tree holds at least `max` values. Stops walking at `max`.
fn exceeds_node_count(root: &Json, max: usize) -> bool {
    let mut pending = vec![root];
    let mut seen = 0usize;
    while let Some(v) = pending.pop() {
        seen += 1;
        if seen >= max {
            return true;
        }
        match v {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = "apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: ops
spec:
  replicas: 2
";

    #[test]
    fn decodes_identity_from_yaml() {
        let doc = ResourceDocument::from_slice(DEPLOYMENT.as_bytes()).expect("decode");
        assert_eq!(doc.gvk().group, "apps");
        assert_eq!(doc.gvk().version, "v1");
        assert_eq!(doc.gvk().kind, "Deployment");
        assert_eq!(doc.name(), "web");
        assert_eq!(doc.namespace(), Some("ops"));
        assert_eq!(doc.body()["spec"]["replicas"], 2);
        assert_eq!(doc.describe(), "apps/v1/Deployment ops/web");
    }

    #[test]
    fn core_group_and_json_input() {
        let raw = br#"{"apiVersion":"v1","kind":"Namespace","metadata":{"name":"ops"}}"#;
        let doc = ResourceDocument::from_slice(raw).expect("decode");
        assert_eq!(doc.gvk().group, "");
        assert_eq!(doc.namespace(), None);
        assert_eq!(doc.describe(), "v1/Namespace ops");
    }

    #[test]
    fn json_body_round_trips() {
        let doc = ResourceDocument::from_slice(DEPLOYMENT.as_bytes()).unwrap();
        let bytes = doc.to_json_bytes().unwrap();
        let back: Json = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(&back, doc.body());
    }

    #[test]
    fn decode_errors_are_specific() {
        let e = ResourceDocument::from_slice(b"kind: Foo\nmetadata:\n  name: x\n").unwrap_err();
        assert!(matches!(e, DecodeError::MissingApiVersion), "{e}");

        let e = ResourceDocument::from_slice(b"apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err();
        assert!(matches!(e, DecodeError::MissingKind), "{e}");

        let e = ResourceDocument::from_slice(b"apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"), "{e}");

        let e = ResourceDocument::from_slice(b"apiVersion: a/b/c\nkind: X\nmetadata:\n  name: x\n").unwrap_err();
        assert!(matches!(e, DecodeError::InvalidApiVersion(_)), "{e}");

        let e = ResourceDocument::from_slice(b"- just\n- a list\n").unwrap_err();
        assert!(matches!(e, DecodeError::NotAMapping), "{e}");

        let e = ResourceDocument::from_slice(b"key: [unclosed").unwrap_err();
        assert!(matches!(e, DecodeError::Parse(_)), "{e}");
    }

    #[test]
    fn node_count_trips_on_large_trees() {
        let wide = Json::Array((0..50).map(Json::from).collect());
        assert!(exceeds_node_count(&wide, 10));
        assert!(exceeds_node_count(&wide, 51));
        assert!(!exceeds_node_count(&wide, 52));
    }

    #[test]
    fn documents_over_one_megabyte_are_accepted() {
        // Large CRDs routinely sit between 1 MiB and the server's object limit.
        let blob = "x".repeat(1_400_000);
        let raw = format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: big\ndata:\n  blob: {}\n", blob);
        assert!(raw.len() > 1_000_000 && raw.len() < DEFAULT_MAX_BYTES);
        let doc = ResourceDocument::from_slice(raw.as_bytes()).expect("decode");
        assert_eq!(doc.body()["data"]["blob"].as_str().map(str::len), Some(1_400_000));
    }
}
