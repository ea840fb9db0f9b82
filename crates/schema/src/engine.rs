//! JSON Schema engine over a `SchemaSource`, with a compiled-schema cache.

use jsonschema::{Draft, JSONSchema};
use kval_core::{SchemaViolation, Violations};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{EngineVerdict, SchemaEngine, SchemaRef, SchemaSource};

/// Compiles each located schema once. Load or compile failures are remembered as well,
/// so a broken schema file is read a single time per run.
pub struct JsonSchemaEngine<S> {
    source: S,
    draft: Draft,
    compiled: FxHashMap<SchemaRef, Result<JSONSchema, String>>,
}

impl<S: SchemaSource> JsonSchemaEngine<S> {
    pub fn new(source: S) -> Self {
        // Kubernetes schemas (standalone and CRD openAPIV3Schema) are draft-04 dialects.
        Self { source, draft: Draft::Draft4, compiled: FxHashMap::default() }
    }

    pub fn with_draft(mut self, draft: Draft) -> Self {
        self.draft = draft;
        self
    }

    pub fn compiled_len(&self) -> usize {
        self.compiled.len()
    }
}

fn compile<S: SchemaSource>(source: &S, schema: &SchemaRef, draft: Draft) -> Result<JSONSchema, String> {
    let value = match source.load(schema) {
        Some(Ok(v)) => v,
        Some(Err(e)) => return Err(e.to_string()),
        None => return Err(format!("no source can load schema {}", schema)),
    };
    // compile errors borrow the schema value; keep only the message
    JSONSchema::options()
        .with_draft(draft)
        .compile(&value)
        .map_err(|e| format!("compiling schema {}: {}", schema, e))
}

impl<S: SchemaSource> SchemaEngine for JsonSchemaEngine<S> {
    fn check(&mut self, kind: &str, api_version: &str, document: &serde_json::Value) -> EngineVerdict {
        let Some(schema_ref) = self.source.locate(kind, api_version) else {
            return EngineVerdict::NoSchema;
        };
        let source = &self.source;
        let draft = self.draft;
        let compiled = self.compiled.entry(schema_ref).or_insert_with_key(|r| {
            let c = compile(source, r, draft);
            match &c {
                Ok(_) => debug!(schema = %r, "schema compiled"),
                Err(e) => warn!(schema = %r, error = %e, "schema unusable"),
            }
            c
        });
        let violations: Violations = match compiled {
            Ok(schema) => match schema.validate(document) {
                Ok(()) => Violations::new(),
                Err(errors) => errors.map(|e| SchemaViolation::new(e.instance_path.to_string(), e.to_string())).collect(),
            },
            Err(msg) => std::iter::once(SchemaViolation::document(msg.clone())).collect(),
        };
        EngineVerdict::Checked(violations)
    }
}
