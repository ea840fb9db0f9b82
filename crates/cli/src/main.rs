use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use kube::Client;
use kval_core::{enumerate, ResourceFilter};
use kval_kubehub::{ClientOptions, KubeLister};
use kval_output::{sink_for, OutputFormat};
use kval_schema::{ChainSource, CrdSource, DirectorySource, JsonSchemaEngine, KindPolicy, SchemaValidationCache};
use kval_sweep::{CancellationToken, RunReport};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kvalctl", version, about = "Validate every live resource in a cluster against its schema")]
struct Cli {
    /// Path to a kubeconfig file (default: in-cluster config or the usual kubeconfig chain)
    #[arg(long, env = "KVAL_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use (default: current context)
    #[arg(long, env = "KVAL_CONTEXT")]
    context: Option<String>,

    /// Accept any certificate presented by the API server
    #[arg(long = "insecure-skip-tls-verify", env = "KVAL_INSECURE_SKIP_TLS_VERIFY", action = ArgAction::SetTrue)]
    insecure_skip_tls_verify: bool,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, env = "KVAL_OUTPUT", default_value_t = Output::Stdout)]
    output: Output,

    /// Root of a schema directory in kubeval layout (`<version>-standalone[-strict]/<kind>-<group>-<version>.json`)
    #[arg(long = "schema-location", env = "KVAL_SCHEMA_LOCATION")]
    schema_location: Option<PathBuf>,

    /// More schema directories, searched after --schema-location
    #[arg(long = "additional-schema-locations", env = "KVAL_ADDITIONAL_SCHEMA_LOCATIONS", value_delimiter = ',')]
    additional_schema_locations: Vec<PathBuf>,

    /// Kubernetes version of the schemas to use, e.g. 1.29.0
    #[arg(short = 'v', long = "kubernetes-version", env = "KVAL_KUBERNETES_VERSION", default_value = "master")]
    kubernetes_version: String,

    /// Disallow properties not present in the schema
    #[arg(long, env = "KVAL_STRICT", action = ArgAction::SetTrue)]
    strict: bool,

    /// Do not use CustomResourceDefinition schemas from the cluster
    #[arg(long = "no-crd-schemas", env = "KVAL_NO_CRD_SCHEMAS", action = ArgAction::SetTrue)]
    no_crd_schemas: bool,

    /// Comma-separated kinds never validated
    #[arg(long = "skip-kinds", env = "KVAL_SKIP_KINDS", value_delimiter = ',')]
    skip_kinds: Vec<String>,

    /// Comma-separated kinds that fail validation whenever present
    #[arg(long = "reject-kinds", env = "KVAL_REJECT_KINDS", value_delimiter = ',')]
    reject_kinds: Vec<String>,

    /// Comma-separated regexes over `group/version/resource`; matching types are not visited
    #[arg(short = 'i', long = "ignored-resource-patterns", env = "KVAL_IGNORED_RESOURCE_PATTERNS", value_delimiter = ',')]
    ignored_resource_patterns: Vec<String>,

    /// Page size for list calls (0 disables paging)
    #[arg(long = "page-size", env = "KVAL_PAGE_SIZE", default_value_t = 500)]
    page_size: u32,

    /// Color `stdout` output even when stdout is not a terminal
    #[arg(long = "force-color", env = "KVAL_FORCE_COLOR", action = ArgAction::SetTrue)]
    force_color: bool,

    /// Only log errors
    #[arg(long, env = "KVAL_QUIET", action = ArgAction::SetTrue)]
    quiet: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Stdout, Json, Tap }

impl From<Output> for OutputFormat {
    fn from(o: Output) -> Self {
        match o {
            Output::Stdout => OutputFormat::Stdout,
            Output::Json => OutputFormat::Json,
            Output::Tap => OutputFormat::Tap,
        }
    }
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "error" } else { "info" };
    let env = std::env::var("KVAL_LOG").unwrap_or_else(|_| default.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    // stdout belongs to the output sink
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KVAL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KVAL_METRICS_ADDR; expected host:port");
        }
    }
}

fn use_color(force: bool) -> bool {
    force || (std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none())
}

async fn schema_sources(cli: &Cli, client: &Client) -> ChainSource {
    let mut chain = ChainSource::new();
    for dir in cli.schema_location.iter().chain(cli.additional_schema_locations.iter()) {
        chain.push(DirectorySource::new(dir, &cli.kubernetes_version, cli.strict));
    }
    if !cli.no_crd_schemas {
        match CrdSource::fetch(client.clone()).await {
            Ok(crds) => {
                info!(count = crds.len(), "CRD schemas loaded");
                chain.push(crds);
            }
            Err(e) => warn!(error = %e, "CRD schemas unavailable; continuing without them"),
        }
    }
    chain
}

async fn sweep(cli: &Cli) -> Result<RunReport> {
    let filter = ResourceFilter::new(&cli.ignored_resource_patterns).context("parsing --ignored-resource-patterns")?;
    if !cli.skip_kinds.is_empty() {
        warn!(kinds = ?cli.skip_kinds, "skipping validation of some kinds");
    }

    let opts = ClientOptions {
        kubeconfig: cli.kubeconfig.clone(),
        context: cli.context.clone(),
        insecure_skip_tls_verify: cli.insecure_skip_tls_verify,
    };
    let client = kval_kubehub::connect(&opts).await.context("connecting to cluster")?;
    let discovery = kval_kubehub::fetch_discovery(&client).await.context("fetching discovery metadata")?;
    let catalog = filter.retain(enumerate(&discovery));
    info!(types = catalog.len(), "catalog built");

    let sources = schema_sources(cli, &client).await;
    if sources.is_empty() {
        warn!("no schema sources; every resource will be reported as not validated");
    }
    let policy = KindPolicy::new(cli.skip_kinds.iter().cloned(), cli.reject_kinds.iter().cloned());
    let mut cache = SchemaValidationCache::with_policy(JsonSchemaEngine::new(sources), policy);
    let lister = KubeLister::new(client, cli.page_size);
    let mut sink = sink_for(cli.output.into(), std::io::stdout(), use_color(cli.force_color));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; stopping after the current resource type");
                cancel.cancel();
            }
        }
    });

    let report = kval_sweep::run(&catalog, &lister, &mut cache, &mut sink, &cancel).await?;
    Ok(report)
}

/// 0 only for a sweep that ran to completion without an errored result.
fn exit_code(outcome: &Result<RunReport>) -> u8 {
    match outcome {
        Ok(report) if report.success() => 0,
        Ok(report) => {
            if report.cancelled {
                warn!("sweep was interrupted; results are partial");
            }
            1
        }
        Err(e) => {
            error!(error = ?e, "sweep aborted");
            eprintln!("kvalctl: {:#}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.quiet);
    init_metrics();

    let outcome = sweep(&cli).await;
    ExitCode::from(exit_code(&outcome))
}
