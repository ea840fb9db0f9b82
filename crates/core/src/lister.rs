//! Lister boundary: how a sweep asks for the live instances of one resource type.

#![forbid(unsafe_code)]

use crate::{ResourceInstance, ResourceTypeDescriptor};

/// Classified result of listing one resource type. Decided once, at the collaborator boundary.
#[derive(Debug, Clone)]
pub enum ListOutcome {
    Ok(Vec<ResourceInstance>),
    /// The cluster reports nothing of this type (or the type cannot be listed).
    TypeAbsent,
    /// Any other API failure; the type is skipped and the run continues.
    FetchError(String),
}

/// A descriptor that cannot be turned into a request. Fatal for the run.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("no REST mapping for {gvk}: {reason}")]
pub struct MappingError {
    pub gvk: String,
    pub reason: String,
}

#[async_trait::async_trait]
pub trait Lister: Send + Sync {
    async fn list(&self, descriptor: &ResourceTypeDescriptor) -> Result<ListOutcome, MappingError>;
}
