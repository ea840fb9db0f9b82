//! Kval kubehub: client construction, discovery and dynamic listing

#![forbid(unsafe_code)]

use std::path::PathBuf;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::{
    api::{Api, ListParams},
    config::{InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Config,
};
use kval_core::{
    ApiGroupInfo, ApiResourceInfo, ApiVersionInfo, DiscoveryMetadata, ListOutcome, Lister, MappingError,
    ResourceInstance, ResourceTypeDescriptor,
};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("loading kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),
    #[error("inferring cluster config: {0}")]
    Infer(#[from] InferConfigError),
    #[error("building kube client: {0}")]
    Client(#[source] kube::Error),
    #[error("discovering API resources: {0}")]
    Discovery(#[source] kube::Error),
}

/// How to reach the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub insecure_skip_tls_verify: bool,
}

/// Build a client from an explicit kubeconfig/context, or the usual inference chain.
pub async fn connect(opts: &ClientOptions) -> Result<Client, HubError> {
    let kco = KubeConfigOptions { context: opts.context.clone(), ..Default::default() };
    let mut config = match (&opts.kubeconfig, &opts.context) {
        (Some(path), _) => {
            let kc = Kubeconfig::read_from(path)?;
            Config::from_custom_kubeconfig(kc, &kco).await?
        }
        (None, Some(_)) => Config::from_kubeconfig(&kco).await?,
        (None, None) => Config::infer().await?,
    };
    if opts.insecure_skip_tls_verify {
        config.accept_invalid_certs = true;
    }
    info!(cluster = %config.cluster_url, "kube client configured");
    Client::try_from(config).map_err(HubError::Client)
}

fn version_info(version: &str, list: APIResourceList) -> ApiVersionInfo {
    let resources = list
        .resources
        .into_iter()
        .map(|r| ApiResourceInfo { name: r.name, kind: r.kind, namespaced: r.namespaced, verbs: r.verbs })
        .collect();
    ApiVersionInfo { version: version.to_string(), resources }
}

/// Fetch every served group and version: the legacy core group first, then `/apis` in server order.
///
/// Failing to list `/api` or `/apis` is fatal. A group version whose resource list cannot be
/// fetched is logged and left out; the rest of the discovery is still returned.
pub async fn fetch_discovery(client: &Client) -> Result<DiscoveryMetadata, HubError> {
    let mut groups = Vec::new();
    let mut failed = 0usize;

    let core = client.list_core_api_versions().await.map_err(HubError::Discovery)?;
    let mut core_versions = Vec::with_capacity(core.versions.len());
    for v in &core.versions {
        match client.list_core_api_resources(v).await {
            Ok(list) => core_versions.push(version_info(v, list)),
            Err(e) => {
                warn!(group_version = %v, error = %e, "group version discovery failed; skipping");
                failed += 1;
            }
        }
    }
    groups.push(ApiGroupInfo { name: String::new(), versions: core_versions });

    let apis = client.list_api_groups().await.map_err(HubError::Discovery)?;
    for g in apis.groups {
        let mut versions = Vec::with_capacity(g.versions.len());
        for gv in &g.versions {
            // an unavailable aggregated API only costs its own group version
            match client.list_api_group_resources(&gv.group_version).await {
                Ok(list) => versions.push(version_info(&gv.version, list)),
                Err(e) => {
                    warn!(group_version = %gv.group_version, error = %e, "group version discovery failed; skipping");
                    failed += 1;
                }
            }
        }
        groups.push(ApiGroupInfo { name: g.name, versions });
    }

    let total: usize = groups.iter().flat_map(|g| g.versions.iter()).map(|v| v.resources.len()).sum();
    debug!(groups = groups.len(), resources = total, failed_group_versions = failed, "discovery complete");
    Ok(DiscoveryMetadata { groups })
}

/// Turn a descriptor into the dynamic resource used for requests.
pub fn resolve(descriptor: &ResourceTypeDescriptor) -> Result<ApiResource, MappingError> {
    let missing = if descriptor.version.is_empty() {
        Some("empty version")
    } else if descriptor.kind.is_empty() {
        Some("empty kind")
    } else if descriptor.plural.is_empty() {
        Some("empty resource name")
    } else {
        None
    };
    if let Some(reason) = missing {
        return Err(MappingError { gvk: descriptor.gvk_key(), reason: reason.to_string() });
    }
    let gvk = GroupVersionKind::gvk(&descriptor.group, &descriptor.version, &descriptor.kind);
    Ok(ApiResource::from_gvk_with_plural(&gvk, &descriptor.plural))
}

/// 404 means the type has nothing to show; everything else is a fetch error.
pub fn classify(err: kube::Error) -> ListOutcome {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ListOutcome::TypeAbsent,
        other => ListOutcome::FetchError(other.to_string()),
    }
}

fn instance_from(descriptor: &ResourceTypeDescriptor, obj: DynamicObject) -> ResourceInstance {
    let namespace = obj.metadata.namespace.clone();
    let name = obj.metadata.name.clone().unwrap_or_default();
    // unserializable objects surface downstream as a render error
    let raw = match serde_json::to_value(&obj) {
        Ok(v) => v,
        Err(e) => {
            warn!(gvk = %descriptor.gvk_key(), name = %name, error = %e, "serializing listed object failed");
            serde_json::Value::Null
        }
    };
    ResourceInstance {
        group: descriptor.group.clone(),
        version: descriptor.version.clone(),
        kind: descriptor.kind.clone(),
        namespace,
        name,
        raw,
    }
}

/// Lists instances across all namespaces through the dynamic API, page by page.
pub struct KubeLister {
    client: Client,
    page_size: u32,
}

impl KubeLister {
    /// `page_size == 0` disables paging.
    pub fn new(client: Client, page_size: u32) -> Self {
        Self { client, page_size }
    }
}

#[async_trait::async_trait]
impl Lister for KubeLister {
    async fn list(&self, descriptor: &ResourceTypeDescriptor) -> Result<ListOutcome, MappingError> {
        let ar = resolve(descriptor)?;
        if !descriptor.listable() {
            debug!(gvk = %descriptor.gvk_key(), "resource does not support list");
            return Ok(ListOutcome::TypeAbsent);
        }
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let mut lp = ListParams::default();
        if self.page_size > 0 {
            lp = lp.limit(self.page_size);
        }
        let mut items = Vec::new();
        loop {
            let page = match api.list(&lp).await {
                Ok(p) => p,
                Err(e) => return Ok(classify(e)),
            };
            items.extend(page.items.into_iter().map(|o| instance_from(descriptor, o)));
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => lp.continue_token = Some(token),
                _ => break,
            }
        }
        debug!(gvk = %descriptor.gvk_key(), count = items.len(), "listed");
        Ok(ListOutcome::Ok(items))
    }
}
