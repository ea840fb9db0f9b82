//! Resource type catalog: flattens discovery metadata into the list of types a sweep visits.

#![forbid(unsafe_code)]

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ResourceTypeDescriptor;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryMetadata {
    pub groups: Vec<ApiGroupInfo>,
}

/// An API group; the core group has an empty name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiGroupInfo {
    pub name: String,
    pub versions: Vec<ApiVersionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiVersionInfo {
    pub version: String,
    pub resources: Vec<ApiResourceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResourceInfo {
    /// Plural name; sub-resources look like `pods/log`.
    pub name: String,
    pub kind: String,
    pub namespaced: bool,
    #[serde(default)]
    pub verbs: Vec<String>,
}

/// Flatten group → version → resource, dropping sub-resources.
pub fn enumerate(discovery: &DiscoveryMetadata) -> Vec<ResourceTypeDescriptor> {
    let mut out = Vec::new();
    for group in &discovery.groups {
        for version in &group.versions {
            for res in &version.resources {
                if res.name.contains('/') {
                    continue;
                }
                out.push(ResourceTypeDescriptor {
                    group: group.name.clone(),
                    version: version.version.clone(),
                    kind: res.kind.clone(),
                    plural: res.name.clone(),
                    namespaced: res.namespaced,
                    verbs: res.verbs.clone(),
                });
            }
        }
    }
    out
}

/// Drops catalog entries whose `resource_key()` matches any configured pattern.
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    patterns: Vec<Regex>,
}

impl ResourceFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns.iter().map(|p| Regex::new(p.as_ref())).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_ignored(&self, descriptor: &ResourceTypeDescriptor) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let key = descriptor.resource_key();
        self.patterns.iter().any(|p| p.is_match(&key))
    }

    pub fn retain(&self, catalog: Vec<ResourceTypeDescriptor>) -> Vec<ResourceTypeDescriptor> {
        catalog.into_iter().filter(|d| !self.is_ignored(d)).collect()
    }
}
