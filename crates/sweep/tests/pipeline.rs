#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use kval_core::{
    enumerate, ApiGroupInfo, ApiResourceInfo, ApiVersionInfo, DiscoveryMetadata, ListOutcome, Lister, MappingError,
    ResourceInstance, ResourceTypeDescriptor, SchemaViolation, ValidationResult, Violations,
};
use kval_output::{OutputSink, SinkError};
use kval_schema::{EngineVerdict, SchemaEngine, SchemaValidationCache};
use kval_sweep::{run, CancellationToken, SweepError};
use serde_json::json;

/// Lister backed by canned outcomes keyed by `resource_key()`; records call order.
#[derive(Default)]
struct FakeLister {
    outcomes: HashMap<String, ListOutcome>,
    calls: Mutex<Vec<String>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl FakeLister {
    fn with(mut self, key: &str, outcome: ListOutcome) -> Self {
        self.outcomes.insert(key.to_string(), outcome);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Lister for FakeLister {
    async fn list(&self, d: &ResourceTypeDescriptor) -> Result<ListOutcome, MappingError> {
        if d.plural.is_empty() {
            return Err(MappingError { gvk: d.gvk_key(), reason: "empty resource name".into() });
        }
        let key = d.resource_key();
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(key.clone());
            calls.len()
        };
        if let Some((after, token)) = &self.cancel_after {
            if n >= *after {
                token.cancel();
            }
        }
        Ok(self.outcomes.get(&key).cloned().unwrap_or(ListOutcome::Ok(Vec::new())))
    }
}

/// Engine that knows a fixed set of kinds; a document's `errors` field says how many violations to report.
#[derive(Default)]
struct FakeEngine {
    known: Vec<&'static str>,
    calls: Vec<(String, String)>,
}

impl FakeEngine {
    fn knowing(kinds: &[&'static str]) -> Self {
        Self { known: kinds.to_vec(), calls: Vec::new() }
    }
}

impl SchemaEngine for FakeEngine {
    fn check(&mut self, kind: &str, api_version: &str, doc: &serde_json::Value) -> EngineVerdict {
        self.calls.push((kind.to_string(), api_version.to_string()));
        if !self.known.contains(&kind) {
            return EngineVerdict::NoSchema;
        }
        let n = doc.get("errors").and_then(|v| v.as_u64()).unwrap_or(0);
        let v: Violations = (0..n).map(|i| SchemaViolation::new(format!("/spec/f{}", i), "invalid")).collect();
        EngineVerdict::Checked(v)
    }
}

#[derive(Default)]
struct RecordingSink {
    results: Vec<ValidationResult>,
    flushes: usize,
    fail_put_at: Option<usize>,
    fail_flush: bool,
}

impl OutputSink for RecordingSink {
    fn put(&mut self, r: &ValidationResult) -> Result<(), SinkError> {
        if self.fail_put_at == Some(self.results.len()) {
            return Err(SinkError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed")));
        }
        self.results.push(r.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.flushes += 1;
        if self.fail_flush {
            return Err(SinkError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
        }
        Ok(())
    }
}

fn res(name: &str, kind: &str) -> ApiResourceInfo {
    ApiResourceInfo { name: name.into(), kind: kind.into(), namespaced: true, verbs: vec!["list".into()] }
}

fn catalog(groups: Vec<(&str, &str, Vec<ApiResourceInfo>)>) -> Vec<ResourceTypeDescriptor> {
    let groups = groups
        .into_iter()
        .map(|(g, v, resources)| ApiGroupInfo {
            name: g.into(),
            versions: vec![ApiVersionInfo { version: v.into(), resources }],
        })
        .collect();
    enumerate(&DiscoveryMetadata { groups })
}

fn inst(group: &str, version: &str, kind: &str, name: &str, errors: u64) -> ResourceInstance {
    ResourceInstance {
        group: group.into(),
        version: version.into(),
        kind: kind.into(),
        namespace: Some("default".into()),
        name: name.into(),
        raw: json!({ "metadata": { "name": name }, "errors": errors }),
    }
}

#[tokio::test]
async fn empty_listing_produces_no_results() {
    let cat = catalog(vec![("", "v1", vec![res("pods", "Pod")])]);
    assert_eq!(cat.len(), 1);
    let lister = FakeLister::default().with("v1/pods", ListOutcome::Ok(vec![]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
    let mut sink = RecordingSink::default();

    let report = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
    assert!(sink.results.is_empty());
    assert_eq!(sink.flushes, 1);
    assert_eq!(report.types_listed, 1);
    assert!(report.success());
}

#[tokio::test]
async fn structural_errors_fail_the_run() {
    let cat = catalog(vec![("", "v1", vec![res("pods", "Pod")])]);
    let lister = FakeLister::default().with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "a", 2)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
    let mut sink = RecordingSink::default();

    let report = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
    assert_eq!(sink.results.len(), 1);
    assert!(sink.results[0].validated_against_schema);
    assert_eq!(sink.results[0].errors().len(), 2);
    assert!(!report.outcome.is_success());
    assert!(!report.success());
}

#[tokio::test]
async fn missing_schema_ends_the_type_after_one_result() {
    let cat = catalog(vec![
        ("example.com", "v1", vec![res("widgets", "Widget")]),
        ("", "v1", vec![res("pods", "Pod")]),
    ]);
    let widgets = (0..3).map(|i| inst("example.com", "v1", "Widget", &format!("w{}", i), 0)).collect();
    let lister = FakeLister::default()
        .with("example.com/v1/widgets", ListOutcome::Ok(widgets))
        .with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "p", 0)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
    let mut sink = RecordingSink::default();

    let report = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
    let ids: Vec<_> = sink.results.iter().map(|r| r.identity.as_str()).collect();
    assert_eq!(ids, vec!["example.com/v1/Widget/default/w0", "v1/Pod/default/p"]);
    assert!(!sink.results[0].validated_against_schema);
    assert_eq!(report.not_visited, 2);
    assert!(report.success());
}

#[tokio::test]
async fn absent_types_are_skipped_and_later_types_still_run() {
    let cat = catalog(vec![
        ("", "v1", vec![res("bindings", "Binding"), res("pods", "Pod")]),
    ]);
    let lister = FakeLister::default()
        .with("v1/bindings", ListOutcome::TypeAbsent)
        .with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "p", 0)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
    let mut sink = RecordingSink::default();

    let report = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
    assert_eq!(lister.calls(), vec!["v1/bindings", "v1/pods"]);
    assert_eq!(sink.results.len(), 1);
    assert_eq!(report.types_absent, 1);
    assert!(report.success());
}

#[tokio::test]
async fn flush_failure_is_fatal_even_after_a_clean_run() {
    let cat = catalog(vec![("", "v1", vec![res("pods", "Pod")])]);
    let lister = FakeLister::default().with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "p", 0)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
    let mut sink = RecordingSink { fail_flush: true, ..Default::default() };

    let err = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SweepError::Flush(_)));
    assert_eq!(sink.flushes, 1);
}

#[tokio::test]
async fn fetch_errors_do_not_fail_the_run() {
    let cat = catalog(vec![("", "v1", vec![res("componentstatuses", "ComponentStatus"), res("pods", "Pod")])]);
    let lister = FakeLister::default()
        .with("v1/componentstatuses", ListOutcome::FetchError("the server is currently unable to handle the request".into()))
        .with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "p", 0)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
    let mut sink = RecordingSink::default();

    let report = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.fetch_errors, 1);
    assert_eq!(sink.results.len(), 1);
    assert!(report.success());
}

#[tokio::test]
async fn results_arrive_in_catalog_then_listing_order() {
    let cat = catalog(vec![
        ("", "v1", vec![res("pods", "Pod"), res("configmaps", "ConfigMap")]),
        ("apps", "v1", vec![res("deployments", "Deployment")]),
    ]);
    let lister = FakeLister::default()
        .with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "p2", 0), inst("", "v1", "Pod", "p1", 1)]))
        .with("v1/configmaps", ListOutcome::Ok(vec![inst("", "v1", "ConfigMap", "c", 0)]))
        .with("apps/v1/deployments", ListOutcome::Ok(vec![inst("apps", "v1", "Deployment", "d", 0)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod", "ConfigMap", "Deployment"]));
    let mut sink = RecordingSink::default();

    run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
    let ids: Vec<_> = sink.results.iter().map(|r| r.identity.as_str()).collect();
    assert_eq!(
        ids,
        vec!["v1/Pod/default/p2", "v1/Pod/default/p1", "v1/ConfigMap/default/c", "apps/v1/Deployment/default/d"]
    );
}

#[tokio::test]
async fn missing_schema_pair_is_never_requeried() {
    // same kind/version served under two resource names
    let cat = catalog(vec![("example.com", "v1", vec![res("widgets", "Widget"), res("legacywidgets", "Widget")])]);
    let lister = FakeLister::default()
        .with("example.com/v1/widgets", ListOutcome::Ok(vec![inst("example.com", "v1", "Widget", "a", 0)]))
        .with("example.com/v1/legacywidgets", ListOutcome::Ok(vec![inst("example.com", "v1", "Widget", "b", 0)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&[]));
    let mut sink = RecordingSink::default();

    run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
    assert_eq!(cache.engine().calls, vec![("Widget".to_string(), "example.com/v1".to_string())]);
    assert_eq!(sink.results.len(), 2);
    assert!(sink.results.iter().all(|r| !r.validated_against_schema));
}

#[tokio::test]
async fn aggregate_fails_iff_some_result_has_errors() {
    for errors in [vec![0, 0, 0], vec![0, 3, 0], vec![1, 0, 0]] {
        let items = errors.iter().enumerate().map(|(i, e)| inst("", "v1", "Pod", &format!("p{}", i), *e)).collect();
        let cat = catalog(vec![("", "v1", vec![res("pods", "Pod")])]);
        let lister = FakeLister::default().with("v1/pods", ListOutcome::Ok(items));
        let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
        let mut sink = RecordingSink::default();

        let report = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
        let any_errors = sink.results.iter().any(|r| r.has_errors());
        assert_eq!(report.outcome.is_success(), !any_errors, "errors per instance: {:?}", errors);
    }
}

#[tokio::test]
async fn rerun_yields_identical_results() {
    let cat = catalog(vec![
        ("", "v1", vec![res("pods", "Pod")]),
        ("example.com", "v1", vec![res("widgets", "Widget")]),
    ]);
    let lister = FakeLister::default()
        .with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "a", 1), inst("", "v1", "Pod", "b", 0)]))
        .with("example.com/v1/widgets", ListOutcome::Ok(vec![inst("example.com", "v1", "Widget", "w", 0)]));

    let mut runs = Vec::new();
    for _ in 0..2 {
        let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
        let mut sink = RecordingSink::default();
        run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
        runs.push(sink.results);
    }
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn put_failure_stops_without_flushing() {
    let cat = catalog(vec![("", "v1", vec![res("pods", "Pod"), res("configmaps", "ConfigMap")])]);
    let lister = FakeLister::default()
        .with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "a", 0), inst("", "v1", "Pod", "b", 0)]))
        .with("v1/configmaps", ListOutcome::Ok(vec![inst("", "v1", "ConfigMap", "c", 0)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod", "ConfigMap"]));
    let mut sink = RecordingSink { fail_put_at: Some(1), ..Default::default() };

    let err = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap_err();
    match err {
        SweepError::Put { identity, .. } => assert_eq!(identity, "v1/Pod/default/b"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(sink.flushes, 0);
    assert_eq!(lister.calls(), vec!["v1/pods"]);
}

#[tokio::test]
async fn mapping_failure_is_fatal() {
    let mut cat = catalog(vec![("", "v1", vec![res("pods", "Pod")])]);
    cat.push(ResourceTypeDescriptor {
        group: "example.com".into(),
        version: "v1".into(),
        kind: "Broken".into(),
        plural: String::new(),
        namespaced: false,
        verbs: vec!["list".into()],
    });
    let lister = FakeLister::default();
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
    let mut sink = RecordingSink::default();

    let err = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SweepError::Mapping(_)));
    assert_eq!(sink.flushes, 0);
}

#[tokio::test]
async fn unrenderable_instances_do_not_end_the_type() {
    let cat = catalog(vec![("", "v1", vec![res("pods", "Pod")])]);
    let mut broken = inst("", "v1", "Pod", "broken", 0);
    broken.raw = serde_json::Value::Null;
    let lister = FakeLister::default()
        .with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "a", 0), broken, inst("", "v1", "Pod", "c", 0)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
    let mut sink = RecordingSink::default();

    let report = run(&cat, &lister, &mut cache, &mut sink, &CancellationToken::new()).await.unwrap();
    assert_eq!(sink.results.len(), 2);
    assert_eq!(report.render_failures, 1);
    assert!(report.success());
}

#[tokio::test]
async fn cancellation_is_checked_between_types_and_still_flushes() {
    let cat = catalog(vec![("", "v1", vec![res("pods", "Pod"), res("configmaps", "ConfigMap"), res("secrets", "Secret")])]);
    let token = CancellationToken::new();
    let lister = FakeLister { cancel_after: Some((1, token.clone())), ..Default::default() }
        .with("v1/pods", ListOutcome::Ok(vec![inst("", "v1", "Pod", "a", 0), inst("", "v1", "Pod", "b", 0)]));
    let mut cache = SchemaValidationCache::new(FakeEngine::knowing(&["Pod"]));
    let mut sink = RecordingSink::default();

    let report = run(&cat, &lister, &mut cache, &mut sink, &token).await.unwrap();
    // the type in flight completes; nothing after it starts
    assert_eq!(lister.calls(), vec!["v1/pods"]);
    assert_eq!(sink.results.len(), 2);
    assert_eq!(sink.flushes, 1);
    assert!(report.cancelled);
    assert!(!report.success());
}
