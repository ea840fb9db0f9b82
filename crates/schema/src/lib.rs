//! Kval schema: where schemas come from, how documents are checked against them,
//! and the per-kind cache that keeps a sweep from asking twice about a missing schema.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use kval_core::Violations;

pub mod cache;
pub mod engine;
pub mod source;

pub use cache::{Applicability, KindPolicy, SchemaValidationCache, PROHIBITED_KIND};
pub use engine::JsonSchemaEngine;
pub use source::{ChainSource, CrdSource, DirectorySource};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("reading schema {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing schema {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("listing CustomResourceDefinitions: {0}")]
    Crd(#[source] kube::Error),
    #[error("encoding CRD schema for {0}: {1}")]
    Encode(String, #[source] serde_json::Error),
    #[error("schema {0} disappeared from its source")]
    Missing(String),
}

/// Identifies a located schema; the key of the compiled-schema cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaRef {
    File(PathBuf),
    Crd { group: String, version: String, kind: String },
}

impl std::fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaRef::File(p) => write!(f, "{}", p.display()),
            SchemaRef::Crd { group, version, kind } => write!(f, "crd:{}/{}/{}", group, version, kind),
        }
    }
}

/// A place schemas can be found.
pub trait SchemaSource {
    /// Find the schema for a kind, without loading it.
    fn locate(&self, kind: &str, api_version: &str) -> Option<SchemaRef>;

    /// Load a schema previously located. `None` when the reference belongs to another source.
    fn load(&self, schema: &SchemaRef) -> Option<Result<serde_json::Value, SchemaError>>;
}

impl<S: SchemaSource + ?Sized> SchemaSource for Box<S> {
    fn locate(&self, kind: &str, api_version: &str) -> Option<SchemaRef> {
        (**self).locate(kind, api_version)
    }

    fn load(&self, schema: &SchemaRef) -> Option<Result<serde_json::Value, SchemaError>> {
        (**self).load(schema)
    }
}

/// What the validator engine has to say about one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineVerdict {
    /// No schema is known for this kind/version.
    NoSchema,
    /// Checked; empty means valid.
    Checked(Violations),
}

/// The validation engine behind the cache.
pub trait SchemaEngine {
    fn check(&mut self, kind: &str, api_version: &str, document: &serde_json::Value) -> EngineVerdict;
}

/// Split `group/version` (or a bare core version) into its parts.
pub(crate) fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}
