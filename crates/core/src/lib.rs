//! Rollway core types: schema-agnostic resource documents and the type
//! mappings used to route them to REST collections.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod document;

pub use document::{DecodeError, ResourceDocument};
pub use kube::core::GroupVersionKind;

/// Whether a kind is partitioned by namespace or globally unique.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Scope {
    Namespaced,
    Cluster,
}

impl Scope {
    pub fn is_namespaced(self) -> bool {
        matches!(self, Scope::Namespaced)
    }
}

/// Resolved route for a group/version/kind: plural collection name plus scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeMapping {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub scope: Scope,
}

impl TypeMapping {
    pub fn api_version(&self) -> String {
        api_version(&self.group, &self.version)
    }

    pub fn gvk_key(&self) -> String {
        gvk_key(&self.group, &self.version, &self.kind)
    }

    pub fn matches(&self, gvk: &GroupVersionKind) -> bool {
        self.group == gvk.group && self.version == gvk.version && self.kind == gvk.kind
    }

    /// Convert into the dynamic descriptor kube uses to build URLs.
    pub fn api_resource(&self) -> kube::core::ApiResource {
        kube::core::ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// `v1` for the core group, `group/version` otherwise.
pub fn api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}

/// `v1/Kind` or `group/v1/Kind`.
pub fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    format!("{}/{}", api_version(group, version), kind)
}
