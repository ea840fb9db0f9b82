//! Kval core types: what a sweep looks at and what it reports.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod catalog;
pub mod lister;

pub use catalog::{enumerate, ApiGroupInfo, ApiResourceInfo, ApiVersionInfo, DiscoveryMetadata, ResourceFilter};
pub use lister::{ListOutcome, Lister, MappingError};

/// One entry of the cluster API surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceTypeDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name as served, e.g. `deployments`.
    pub plural: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl ResourceTypeDescriptor {
    pub fn api_version(&self) -> String {
        api_version(&self.group, &self.version)
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// `group/version/plural`, or `version/plural` for the core group.
    pub fn resource_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.plural)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.plural)
        }
    }

    pub fn is_subresource(&self) -> bool {
        self.plural.contains('/')
    }

    pub fn listable(&self) -> bool {
        self.verbs.iter().any(|v| v == "list")
    }
}

fn api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}

/// A live object as returned by a list call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Raw object document; never interpreted beyond `metadata`, `apiVersion` and `kind`.
    pub raw: serde_json::Value,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("{identity}: document is {found}, expected an object")]
    NotAnObject { identity: String, found: &'static str },
}

impl ResourceInstance {
    pub fn api_version(&self) -> String {
        api_version(&self.group, &self.version)
    }

    /// Label used by output sinks, e.g. `apps/v1/Deployment/default/web`.
    pub fn identity(&self) -> String {
        let gvk = if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        };
        match self.namespace.as_deref() {
            Some(ns) => format!("{}/{}/{}", gvk, ns, self.name),
            None => format!("{}/{}", gvk, self.name),
        }
    }

    /// Produce the document handed to the validator.
    ///
    /// List items usually come back without `apiVersion`/`kind`; both are filled in
    /// from the instance envelope. `metadata.managedFields` is server bookkeeping
    /// and is dropped.
    pub fn render(&self) -> Result<serde_json::Value, RenderError> {
        let mut doc = self.raw.clone();
        let obj = match doc.as_object_mut() {
            Some(o) => o,
            None => {
                return Err(RenderError::NotAnObject { identity: self.identity(), found: json_type(&self.raw) });
            }
        };
        if !obj.get("apiVersion").map(|v| v.is_string()).unwrap_or(false) {
            obj.insert("apiVersion".into(), serde_json::Value::String(self.api_version()));
        }
        if !obj.get("kind").map(|v| v.is_string()).unwrap_or(false) {
            obj.insert("kind".into(), serde_json::Value::String(self.kind.clone()));
        }
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
        }
        Ok(doc)
    }
}

fn json_type(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// A single structural problem found in a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON pointer into the document; empty for document-level problems.
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into() }
    }

    pub fn document(message: impl Into<String>) -> Self {
        Self::new("", message)
    }
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

pub type Violations = SmallVec<[SchemaViolation; 4]>;

/// Outcome for one instance.
///
/// `validated_against_schema == false` always comes with an empty error list;
/// a missing schema is a caveat, not a failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub identity: String,
    pub kind: String,
    pub api_version: String,
    pub validated_against_schema: bool,
    errors: Violations,
}

impl ValidationResult {
    pub fn not_validated(identity: impl Into<String>, kind: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            kind: kind.into(),
            api_version: api_version.into(),
            validated_against_schema: false,
            errors: SmallVec::new(),
        }
    }

    pub fn checked(
        identity: impl Into<String>,
        kind: impl Into<String>,
        api_version: impl Into<String>,
        errors: impl IntoIterator<Item = SchemaViolation>,
    ) -> Self {
        Self {
            identity: identity.into(),
            kind: kind.into(),
            api_version: api_version.into(),
            validated_against_schema: true,
            errors: errors.into_iter().collect(),
        }
    }

    pub fn errors(&self) -> &[SchemaViolation] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Run-wide verdict. Starts as success; the first errored result flips it for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateOutcome {
    success: bool,
}

impl Default for AggregateOutcome {
    fn default() -> Self {
        Self { success: true }
    }
}

impl AggregateOutcome {
    pub fn fold(self, result: &ValidationResult) -> Self {
        Self { success: self.success && !result.has_errors() }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

pub mod prelude {
    pub use super::{
        AggregateOutcome, ListOutcome, Lister, MappingError, RenderError, ResourceInstance, ResourceTypeDescriptor,
        SchemaViolation, ValidationResult, Violations,
    };
}
