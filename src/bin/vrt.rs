use anyhow::Context;
use clap::CommandFactory;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use veritas::{
    invert_aliases, Auditor, Discovery, DiscoveryOptions, Driver, Session, SessionOptions, VerifyOpts,
    DEFAULT_RESTART_THRESHOLD, DEFAULT_TIMEOUT_SECONDS,
};

#[derive(clap::Parser, Debug)]
#[clap(name = "vrt", version, about = "Verify kubernetes workloads against a version manifest")]
struct Vrt {
    /// JSON object mapping component names to expected versions
    ///
    /// Example: --manifest '{"backend": "v1.2.3"}'
    #[clap(long, required_unless_present = "completions")]
    manifest: Option<String>,

    /// Image path segment used as the anchor for component extraction
    ///
    /// For 'registry.example.com/my-org/my-app/backend:v1.0' with
    /// --anchor my-app the component name is 'backend'.
    #[clap(long, required_unless_present = "completions")]
    anchor: Option<String>,

    /// Kubeconfig context name to use for the cluster connection
    #[clap(long, conflicts_with = "gke_project")]
    context: Option<String>,

    /// GCP project ID, resolves the kube context from GKE-style context names
    #[clap(long)]
    gke_project: Option<String>,

    /// Kubernetes namespace (default: from kubeconfig or 'default')
    #[clap(short = 'n', long)]
    namespace: Option<String>,

    /// Comma-separated workload names that must exist (substring match)
    #[clap(long, use_value_delimiter = true)]
    required_workloads: Vec<String>,

    /// Comma-separated patterns to skip, matched against both container
    /// names and workload names
    #[clap(long, use_value_delimiter = true)]
    skip_containers: Vec<String>,

    /// Component aliases as JSON ('{"comp": "image-name"}') or
    /// comma-separated comp=image-name pairs
    #[clap(long)]
    component_aliases: Option<String>,

    /// Global timeout in seconds
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_SECONDS)]
    timeout: u64,

    /// Maximum acceptable restart count per container
    #[clap(long, default_value_t = DEFAULT_RESTART_THRESHOLD)]
    restart_threshold: i32,

    /// Minimum pod uptime in seconds
    #[clap(long, default_value_t = 0)]
    min_uptime: i64,

    /// Allow workloads with 0 replicas to pass verification
    #[clap(long)]
    allow_zero_replicas: bool,

    /// Validate against current cluster state without waiting
    #[clap(long)]
    dry_run: bool,

    /// Include StatefulSets
    #[clap(long, overrides_with = "no_include_statefulsets")]
    include_statefulsets: bool,
    #[clap(long, hide = true)]
    no_include_statefulsets: bool,

    /// Include DaemonSets
    #[clap(long, overrides_with = "no_include_daemonsets")]
    include_daemonsets: bool,
    #[clap(long, hide = true)]
    no_include_daemonsets: bool,

    /// Include Jobs and CronJobs
    #[clap(long, overrides_with = "no_include_jobs")]
    include_jobs: bool,
    #[clap(long, hide = true)]
    no_include_jobs: bool,

    /// Print shell completions and exit
    #[clap(long, value_name = "SHELL")]
    completions: Option<clap_complete::Shell>,
}

fn parse_manifest(raw: &str) -> anyhow::Result<BTreeMap<String, String>> {
    if raw.is_empty() {
        anyhow::bail!("manifest JSON string must not be empty");
    }
    serde_json::from_str(raw).with_context(|| format!("manifest is not a valid JSON object of strings: {raw}"))
}

fn parse_aliases(raw: Option<&str>) -> anyhow::Result<BTreeMap<String, String>> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(BTreeMap::new());
    };
    if raw.starts_with('{') {
        return serde_json::from_str(raw)
            .with_context(|| format!("component aliases are not a valid JSON object: {raw}"));
    }
    let mut aliases = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((component, image_name)) = pair.split_once('=') else {
            anyhow::bail!("component alias {pair:?} is not of the form component=image-name");
        };
        aliases.insert(component.trim().to_string(), image_name.trim().to_string());
    }
    Ok(aliases)
}

fn trim_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = <Vrt as clap::Parser>::parse();
    if let Some(shell) = args.completions {
        clap_complete::generate(shell, &mut Vrt::command(), "vrt", &mut std::io::stdout());
        return;
    }

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Vrt) -> anyhow::Result<i32> {
    let manifest = parse_manifest(args.manifest.as_deref().unwrap_or_default())?;
    let aliases = parse_aliases(args.component_aliases.as_deref())?;
    let reverse_aliases = invert_aliases(&aliases)?;
    let anchor = args.anchor.clone().context("--anchor is required")?;

    let required_workloads = trim_list(args.required_workloads);
    if !required_workloads.is_empty() {
        tracing::info!("required workloads: {required_workloads:?}");
    }
    let skip_patterns = trim_list(args.skip_containers);
    if !skip_patterns.is_empty() {
        tracing::info!("skipping verification for patterns (container/workload name): {skip_patterns:?}");
    }

    let session = Arc::new(
        Session::connect(SessionOptions {
            context: args.context,
            gke_project: args.gke_project,
        })
        .await?,
    );
    let namespace = args
        .namespace
        .unwrap_or_else(|| session.default_namespace().to_string());

    let discovery = Discovery::new(
        session.clone(),
        DiscoveryOptions {
            statefulsets: args.include_statefulsets,
            daemonsets: args.include_daemonsets,
            jobs: args.include_jobs,
        },
    );
    let auditor = Auditor::new(session.clone(), args.restart_threshold, args.min_uptime);

    let opts = VerifyOpts {
        manifest,
        anchor,
        namespace,
        required_workloads,
        skip_patterns,
        reverse_aliases,
        allow_zero_replicas: args.allow_zero_replicas,
        dry_run: args.dry_run,
        timeout: Duration::from_secs(args.timeout),
    };
    let driver = Driver::new(discovery, auditor, session.context_name(), opts);

    let report = driver.run().await?;
    match report.render() {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Failed to generate report: {e}");
            return Ok(1);
        }
    }
    Ok(report.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_json_object() {
        let manifest = parse_manifest(r#"{"backend": "v1.2.3", "frontend": "v2.0.0"}"#).unwrap();
        assert_eq!(manifest["backend"], "v1.2.3");
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn empty_or_invalid_manifest_rejected() {
        assert!(parse_manifest("").is_err());
        assert!(parse_manifest("not json").is_err());
        assert!(parse_manifest(r#"{"backend": 3}"#).is_err());
    }

    #[test]
    fn aliases_parse_both_forms() {
        let json = parse_aliases(Some(r#"{"foo": "bar-baz"}"#)).unwrap();
        assert_eq!(json["foo"], "bar-baz");
        let pairs = parse_aliases(Some("foo=bar-baz, svc=other-name")).unwrap();
        assert_eq!(pairs["foo"], "bar-baz");
        assert_eq!(pairs["svc"], "other-name");
        assert!(parse_aliases(None).unwrap().is_empty());
        assert!(parse_aliases(Some("no-equals-sign")).is_err());
    }

    #[test]
    fn list_entries_are_trimmed() {
        let list = trim_list(vec![" frontend ".to_string(), String::new(), "api".to_string()]);
        assert_eq!(list, vec!["frontend", "api"]);
    }
}
