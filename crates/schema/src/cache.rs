//! Schema validation cache: per-run memo of which (kind, apiVersion) pairs have a schema.
//!
//! Schema absence belongs to the pair, so it is remembered and never asked again.
//! Violations belong to a document and are never cached.

use kval_core::{SchemaViolation, ValidationResult};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::{EngineVerdict, SchemaEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applicability {
    SchemaFound,
    SchemaNotFound,
}

/// Kinds to leave alone and kinds that are not allowed at all. Exact, case-sensitive names.
#[derive(Debug, Clone, Default)]
pub struct KindPolicy {
    skip: FxHashSet<String>,
    reject: FxHashSet<String>,
}

impl KindPolicy {
    pub fn new<I, J>(skip: I, reject: J) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        J: IntoIterator,
        J::Item: Into<String>,
    {
        Self { skip: skip.into_iter().map(Into::into).collect(), reject: reject.into_iter().map(Into::into).collect() }
    }

    pub fn skips(&self, kind: &str) -> bool {
        self.skip.contains(kind)
    }

    pub fn rejects(&self, kind: &str) -> bool {
        self.reject.contains(kind)
    }
}

pub const PROHIBITED_KIND: &str = "prohibited resource kind";

/// Wraps a `SchemaEngine`; owned by exactly one sweep.
pub struct SchemaValidationCache<E> {
    engine: E,
    policy: KindPolicy,
    entries: FxHashMap<(String, String), Applicability>,
    engine_calls: u64,
}

impl<E: SchemaEngine> SchemaValidationCache<E> {
    pub fn new(engine: E) -> Self {
        Self::with_policy(engine, KindPolicy::default())
    }

    pub fn with_policy(engine: E, policy: KindPolicy) -> Self {
        Self { engine, policy, entries: FxHashMap::default(), engine_calls: 0 }
    }

    pub fn validate(
        &mut self,
        identity: &str,
        kind: &str,
        api_version: &str,
        document: &serde_json::Value,
    ) -> ValidationResult {
        if self.policy.rejects(kind) {
            return ValidationResult::checked(identity, kind, api_version, [SchemaViolation::document(PROHIBITED_KIND)]);
        }
        if self.applicability(kind, api_version) == Some(Applicability::SchemaNotFound) {
            return ValidationResult::not_validated(identity, kind, api_version);
        }
        let key = (kind.to_string(), api_version.to_string());
        if self.policy.skips(kind) {
            self.entries.insert(key, Applicability::SchemaNotFound);
            return ValidationResult::not_validated(identity, kind, api_version);
        }

        self.engine_calls += 1;
        match self.engine.check(kind, api_version, document) {
            EngineVerdict::NoSchema => {
                debug!(kind, api_version, "no schema; later instances are not re-checked");
                self.entries.insert(key, Applicability::SchemaNotFound);
                ValidationResult::not_validated(identity, kind, api_version)
            }
            EngineVerdict::Checked(violations) => {
                self.entries.entry(key).or_insert(Applicability::SchemaFound);
                ValidationResult::checked(identity, kind, api_version, violations)
            }
        }
    }

    pub fn applicability(&self, kind: &str, api_version: &str) -> Option<Applicability> {
        self.entries.get(&(kind.to_string(), api_version.to_string())).copied()
    }

    /// How many times the engine has been consulted.
    pub fn engine_calls(&self) -> u64 {
        self.engine_calls
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}
