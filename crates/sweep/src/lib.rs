//! Kval sweep: walks the catalog, lists each type, validates each instance and
//! streams results to the sink, folding them into one aggregate outcome.
//!
//! Traversal is strictly sequential. Sink order is catalog order, then listing order.

#![forbid(unsafe_code)]

use std::time::Instant;

use kval_core::{AggregateOutcome, ListOutcome, Lister, MappingError, ResourceInstance, ResourceTypeDescriptor, ValidationResult};
use kval_output::{OutputSink, SinkError};
use kval_schema::{SchemaEngine, SchemaValidationCache};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub use tokio_util::sync::CancellationToken;

/// Fatal conditions. Everything else is absorbed into the report.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("emitting result for {identity}: {source}")]
    Put {
        identity: String,
        #[source]
        source: SinkError,
    },
    #[error("flushing output: {0}")]
    Flush(#[source] SinkError),
}

/// What the per-instance step tells the per-type loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// The kind/version has no schema; siblings would say the same.
    SkipRestOfType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: AggregateOutcome,
    pub types_total: usize,
    pub types_listed: usize,
    pub types_absent: usize,
    pub fetch_errors: usize,
    /// Results handed to the sink.
    pub results: usize,
    pub render_failures: usize,
    /// Instances left unvisited after a type ran into a missing schema.
    pub not_visited: usize,
    pub cancelled: bool,
}

impl RunReport {
    /// Process-level verdict: no errored result and the sweep ran to completion.
    pub fn success(&self) -> bool {
        self.outcome.is_success() && !self.cancelled
    }
}

fn status_label(r: &ValidationResult) -> &'static str {
    if r.has_errors() {
        "invalid"
    } else if r.validated_against_schema {
        "valid"
    } else {
        "skipped"
    }
}

/// Validate one instance and forward its result.
pub fn visit<E, S>(
    instance: &ResourceInstance,
    cache: &mut SchemaValidationCache<E>,
    sink: &mut S,
    report: &mut RunReport,
) -> Result<Step, SweepError>
where
    E: SchemaEngine,
    S: OutputSink + ?Sized,
{
    let document = match instance.render() {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "unable to render instance; skipping");
            report.render_failures += 1;
            return Ok(Step::Continue);
        }
    };
    let result = cache.validate(&instance.identity(), &instance.kind, &instance.api_version(), &document);
    sink.put(&result).map_err(|source| SweepError::Put { identity: result.identity.clone(), source })?;
    report.results += 1;
    report.outcome = report.outcome.fold(&result);
    counter!("kval_results_total", 1, "status" => status_label(&result));
    if result.validated_against_schema {
        Ok(Step::Continue)
    } else {
        Ok(Step::SkipRestOfType)
    }
}

/// Run one sweep over `catalog`. The sink is flushed exactly once unless a fatal
/// error stops the run first; a cancelled run is still flushed.
pub async fn run<L, E, S>(
    catalog: &[ResourceTypeDescriptor],
    lister: &L,
    cache: &mut SchemaValidationCache<E>,
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<RunReport, SweepError>
where
    L: Lister + ?Sized,
    E: SchemaEngine,
    S: OutputSink + ?Sized,
{
    let mut report = RunReport { types_total: catalog.len(), ..Default::default() };
    let started = Instant::now();

    for (i, descriptor) in catalog.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!(remaining = catalog.len() - i, "sweep cancelled");
            report.cancelled = true;
            break;
        }
        let gvk = descriptor.gvk_key();
        let list_started = Instant::now();
        let outcome = lister.list(descriptor).await?;
        histogram!("kval_list_ms", list_started.elapsed().as_secs_f64() * 1000.0);

        let instances = match outcome {
            ListOutcome::Ok(items) => items,
            ListOutcome::TypeAbsent => {
                debug!(gvk = %gvk, "nothing to list");
                report.types_absent += 1;
                continue;
            }
            ListOutcome::FetchError(detail) => {
                warn!(gvk = %gvk, error = %detail, "listing failed; skipping type");
                counter!("kval_fetch_errors_total", 1);
                report.fetch_errors += 1;
                continue;
            }
        };
        report.types_listed += 1;
        debug!(gvk = %gvk, count = instances.len(), "validating");

        for (j, instance) in instances.iter().enumerate() {
            // The skip applies even when earlier siblings reported errors.
            if visit(instance, cache, sink, &mut report)? == Step::SkipRestOfType {
                let rest = instances.len() - j - 1;
                if rest > 0 {
                    debug!(gvk = %gvk, skipped = rest, "no schema; skipping remaining instances");
                }
                report.not_visited += rest;
                break;
            }
        }
    }

    sink.flush().map_err(SweepError::Flush)?;
    info!(
        types = report.types_total,
        listed = report.types_listed,
        absent = report.types_absent,
        fetch_errors = report.fetch_errors,
        results = report.results,
        success = report.outcome.is_success(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "sweep finished"
    );
    Ok(report)
}
