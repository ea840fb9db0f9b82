//! Schema sources: a kubeval-style schema directory, in-cluster CRDs, and a chain of both.

use std::path::{Path, PathBuf};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use kube::{api::ListParams, Api, Client};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{split_api_version, SchemaError, SchemaRef, SchemaSource};

/// Schemas laid out as `<root>/<version>-standalone[-strict]/<kind>-<group>-<version>.json`.
///
/// `<version>` is `master` or `v<kubernetes version>`; `<group>` is the first
/// dot-separated label of the API group, or the core version for core kinds
/// (`pod-v1.json`, `deployment-apps-v1.json`, `certificate-cert-manager-v1.json`).
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    kubernetes_version: String,
    strict: bool,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, kubernetes_version: impl Into<String>, strict: bool) -> Self {
        Self { root: root.into(), kubernetes_version: kubernetes_version.into(), strict }
    }

    pub fn schema_path(&self, kind: &str, api_version: &str) -> PathBuf {
        let version_dir = if self.kubernetes_version == "master" {
            "master".to_string()
        } else {
            format!("v{}", self.kubernetes_version.trim_start_matches('v'))
        };
        let strict = if self.strict { "-strict" } else { "" };
        let mut suffix = match api_version.split_once('/') {
            Some((group, version)) => {
                let label = group.split('.').next().unwrap_or(group);
                format!("-{}-{}", label.to_lowercase(), version.to_lowercase())
            }
            None => format!("-{}", api_version.to_lowercase()),
        };
        suffix.push_str(".json");
        self.root
            .join(format!("{}-standalone{}", version_dir, strict))
            .join(format!("{}{}", kind.to_lowercase(), suffix))
    }
}

fn read_schema(path: &Path) -> Result<serde_json::Value, SchemaError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SchemaError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_str(&raw).map_err(|source| SchemaError::Parse { path: path.to_path_buf(), source })
}

impl SchemaSource for DirectorySource {
    fn locate(&self, kind: &str, api_version: &str) -> Option<SchemaRef> {
        let path = self.schema_path(kind, api_version);
        if path.is_file() {
            Some(SchemaRef::File(path))
        } else {
            None
        }
    }

    fn load(&self, schema: &SchemaRef) -> Option<Result<serde_json::Value, SchemaError>> {
        match schema {
            SchemaRef::File(path) if path.starts_with(&self.root) => Some(read_schema(path)),
            _ => None,
        }
    }
}

/// `openAPIV3Schema` of every served CRD version, captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct CrdSource {
    schemas: FxHashMap<(String, String, String), serde_json::Value>,
}

impl CrdSource {
    /// List all CRDs in the cluster.
    pub async fn fetch(client: Client) -> Result<Self, SchemaError> {
        let api: Api<apiextv1::CustomResourceDefinition> = Api::all(client);
        let crds = api.list(&ListParams::default()).await.map_err(SchemaError::Crd)?;
        Self::from_crds(crds)
    }

    pub fn from_crds(
        crds: impl IntoIterator<Item = apiextv1::CustomResourceDefinition>,
    ) -> Result<Self, SchemaError> {
        let mut schemas = FxHashMap::default();
        for crd in crds {
            let group = crd.spec.group.clone();
            let kind = crd.spec.names.kind.clone();
            for ver in crd.spec.versions.iter().filter(|v| v.served) {
                let Some(props) = ver.schema.as_ref().and_then(|s| s.open_api_v3_schema.as_ref()) else {
                    continue;
                };
                let mut value = serde_json::to_value(props)
                    .map_err(|e| SchemaError::Encode(format!("{}/{}/{}", group, ver.name, kind), e))?;
                admit_nullable(&mut value);
                schemas.insert((group.clone(), ver.name.clone(), kind.clone()), value);
            }
        }
        debug!(count = schemas.len(), "CRD schemas captured");
        Ok(Self { schemas })
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Rewrite OpenAPI `nullable: true` into the JSON Schema form the validator understands:
/// `type: T` becomes `type: [T, "null"]`, and `null` joins any `enum`.
fn admit_nullable(node: &mut serde_json::Value) {
    match node {
        serde_json::Value::Object(map) => {
            if map.remove("nullable") == Some(serde_json::Value::Bool(true)) {
                if let Some(serde_json::Value::String(t)) = map.get("type") {
                    let t = t.clone();
                    map.insert("type".into(), serde_json::json!([t, "null"]));
                }
                if let Some(serde_json::Value::Array(values)) = map.get_mut("enum") {
                    if !values.contains(&serde_json::Value::Null) {
                        values.push(serde_json::Value::Null);
                    }
                }
            }
            for child in map.values_mut() {
                admit_nullable(child);
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(admit_nullable),
        _ => {}
    }
}

impl SchemaSource for CrdSource {
    fn locate(&self, kind: &str, api_version: &str) -> Option<SchemaRef> {
        let (group, version) = split_api_version(api_version);
        let key = (group.to_string(), version.to_string(), kind.to_string());
        if self.schemas.contains_key(&key) {
            Some(SchemaRef::Crd { group: key.0, version: key.1, kind: key.2 })
        } else {
            None
        }
    }

    fn load(&self, schema: &SchemaRef) -> Option<Result<serde_json::Value, SchemaError>> {
        match schema {
            SchemaRef::Crd { group, version, kind } => {
                let key = (group.clone(), version.clone(), kind.clone());
                Some(self.schemas.get(&key).cloned().ok_or_else(|| SchemaError::Missing(schema.to_string())))
            }
            SchemaRef::File(_) => None,
        }
    }
}

/// Sources tried in order; the first one that locates a schema wins.
#[derive(Default)]
pub struct ChainSource {
    sources: Vec<Box<dyn SchemaSource + Send + Sync>>,
}

impl ChainSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: impl SchemaSource + Send + Sync + 'static) {
        self.sources.push(Box::new(source));
    }

    pub fn with(mut self, source: impl SchemaSource + Send + Sync + 'static) -> Self {
        self.push(source);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl SchemaSource for ChainSource {
    fn locate(&self, kind: &str, api_version: &str) -> Option<SchemaRef> {
        self.sources.iter().find_map(|s| s.locate(kind, api_version))
    }

    fn load(&self, schema: &SchemaRef) -> Option<Result<serde_json::Value, SchemaError>> {
        self.sources.iter().find_map(|s| s.load(schema))
    }
}
