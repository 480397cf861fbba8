//! Cluster session: a thin typed accessor over the Kubernetes API
//!
//! Owns the `kube::Client` plus the resolved context identity, and provides
//! the list/read/paginate surface the discovery and audit layers build on.
//! The client is `Clone + Send + Sync`, so a single session is shared
//! read-only across all inspection tasks.

use crate::{Error, Result};

use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
    batch::v1::{CronJob, Job},
    core::v1::Pod,
};
use kube::{
    api::ListParams,
    config::{KubeConfigOptions, Kubeconfig},
    core::{Expression, NamespaceResourceScope, Selector},
    Api, Client, Config, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::sleep;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

/// Page size for paginated pod listing
const POD_LIST_LIMIT: u32 = 100;
/// Total budget for one paginated pod listing
const POD_LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Revision metadata for a workload
///
/// Deployments carry the newest ReplicaSet's pod-template-hash and revision
/// number; StatefulSets carry update/current revisions plus the rolling
/// partition; DaemonSets only ever populate `hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    pub hash: String,
    pub current_hash: String,
    pub partition: i32,
    pub strategy: String,
    pub number: Option<i64>,
}

impl Default for RevisionInfo {
    fn default() -> Self {
        Self {
            hash: String::new(),
            current_hash: String::new(),
            partition: 0,
            strategy: "RollingUpdate".to_string(),
            number: None,
        }
    }
}

impl RevisionInfo {
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            ..Self::default()
        }
    }
}

/// Cluster selection for [`Session::connect`]
///
/// `context` and `gke_project` are mutually exclusive; with neither set the
/// default kubeconfig context is tried first, then in-cluster config.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub context: Option<String>,
    pub gke_project: Option<String>,
}

/// An authenticated connection to one cluster
#[derive(Clone)]
pub struct Session {
    client: Client,
    context_name: String,
    default_namespace: String,
}

impl Session {
    pub async fn connect(opts: SessionOptions) -> Result<Self> {
        let (config, context_name) = match (&opts.context, &opts.gke_project) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "cannot specify both a kube context and a GKE project".to_string(),
                ))
            }
            (Some(ctx), None) => {
                let config = load_kubeconfig_context(ctx).await?;
                info!("loaded kubeconfig context {ctx}");
                (config, ctx.clone())
            }
            (None, Some(project)) => {
                ensure_gke_auth_plugin_on_path();
                let ctx = resolve_gke_context(project)?;
                let config = load_kubeconfig_context(&ctx).await?;
                info!("loaded kubeconfig context {ctx} for GKE project {project}");
                (config, project.clone())
            }
            // kubeconfig first; in-cluster is the only fallback
            (None, None) => {
                let config = Config::infer().await.map_err(|e| Error::Init(e.to_string()))?;
                (config, "in-cluster".to_string())
            }
        };
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config).map_err(Error::Kube)?;
        Ok(Self {
            client,
            context_name,
            default_namespace,
        })
    }

    /// Identifier used in the report (context name, GKE project, or "in-cluster")
    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    /// Namespace from the kubeconfig context, the in-cluster service account,
    /// or "default"
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    fn api<K>(&self, ns: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned,
    {
        match ns {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn list_workloads<K>(&self, ns: Option<&str>) -> Result<BTreeMap<String, K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let api: Api<K> = self.api(ns);
        let list = api.list(&ListParams::default()).await.map_err(Error::Kube)?;
        let mut out = BTreeMap::new();
        for item in list {
            let key = format!("{}/{}", item.namespace().unwrap_or_default(), item.name_any());
            out.insert(key, item);
        }
        Ok(out)
    }

    async fn read<K>(&self, name: &str, ns: &str) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        self.api(Some(ns)).get(name).await.map_err(Error::Kube)
    }

    pub async fn deployments(&self, ns: Option<&str>) -> Result<BTreeMap<String, Deployment>> {
        self.list_workloads(ns).await
    }
    pub async fn stateful_sets(&self, ns: Option<&str>) -> Result<BTreeMap<String, StatefulSet>> {
        self.list_workloads(ns).await
    }
    pub async fn daemon_sets(&self, ns: Option<&str>) -> Result<BTreeMap<String, DaemonSet>> {
        self.list_workloads(ns).await
    }
    pub async fn jobs(&self, ns: Option<&str>) -> Result<BTreeMap<String, Job>> {
        self.list_workloads(ns).await
    }
    pub async fn cron_jobs(&self, ns: Option<&str>) -> Result<BTreeMap<String, CronJob>> {
        self.list_workloads(ns).await
    }

    pub async fn read_deployment(&self, name: &str, ns: &str) -> Result<Deployment> {
        self.read(name, ns).await
    }
    pub async fn read_stateful_set(&self, name: &str, ns: &str) -> Result<StatefulSet> {
        self.read(name, ns).await
    }
    pub async fn read_daemon_set(&self, name: &str, ns: &str) -> Result<DaemonSet> {
        self.read(name, ns).await
    }
    pub async fn read_job(&self, name: &str, ns: &str) -> Result<Job> {
        self.read(name, ns).await
    }
    pub async fn read_cron_job(&self, name: &str, ns: &str) -> Result<CronJob> {
        self.read(name, ns).await
    }

    pub async fn pods_for_deployment(&self, name: &str, ns: &str) -> Result<Vec<Pod>> {
        let d = self.read_deployment(name, ns).await?;
        let labels = d
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        if labels.is_empty() {
            return Err(Error::NoSelector(format!("Deployment {name}")));
        }
        Ok(self.pods_by_labels(ns, labels).await)
    }

    pub async fn pods_for_stateful_set(&self, name: &str, ns: &str) -> Result<Vec<Pod>> {
        let sts = self.read_stateful_set(name, ns).await?;
        let labels = sts
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        if labels.is_empty() {
            return Err(Error::NoSelector(format!("StatefulSet {name}")));
        }
        Ok(self.pods_by_labels(ns, labels).await)
    }

    pub async fn pods_for_daemon_set(&self, name: &str, ns: &str) -> Result<Vec<Pod>> {
        let ds = self.read_daemon_set(name, ns).await?;
        let labels = ds
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        if labels.is_empty() {
            return Err(Error::NoSelector(format!("DaemonSet {name}")));
        }
        Ok(self.pods_by_labels(ns, labels).await)
    }

    /// Jobs often carry no match_labels; fall back to the controller-uid
    /// label stamped on the Job itself.
    pub async fn pods_for_job(&self, name: &str, ns: &str) -> Result<Vec<Pod>> {
        let job = self.read_job(name, ns).await?;
        let mut labels = job
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .and_then(|s| s.match_labels.clone())
            .unwrap_or_default();
        if labels.is_empty() {
            if let Some(uid) = job.labels().get("controller-uid") {
                labels.insert("controller-uid".to_string(), uid.clone());
            }
        }
        if labels.is_empty() {
            return Err(Error::NoSelector(format!("Job {name}")));
        }
        Ok(self.pods_by_labels(ns, labels).await)
    }

    /// Paginated, best-effort pod listing by exact label match
    ///
    /// Follows continue tokens until exhausted or the time budget runs out;
    /// transient list errors are retried after 1s within the same budget.
    /// Returns whatever was collected, never an error.
    async fn pods_by_labels(&self, ns: &str, labels: BTreeMap<String, String>) -> Vec<Pod> {
        let selector: Selector = labels.into_iter().map(|(k, v)| Expression::Equal(k, v)).collect();
        let api: Api<Pod> = self.api(Some(ns));
        let start = Instant::now();
        let mut pods = Vec::new();
        let mut token: Option<String> = None;
        while start.elapsed() < POD_LIST_TIMEOUT {
            let mut lp = ListParams::default().labels_from(&selector).limit(POD_LIST_LIMIT);
            if let Some(t) = &token {
                lp = lp.continue_token(t);
            }
            match api.list(&lp).await {
                Ok(list) => {
                    token = list.metadata.continue_.clone();
                    pods.extend(list.items);
                    if token.as_deref().unwrap_or("").is_empty() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("error listing pods in {ns}: {e}");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        pods
    }

    pub async fn replica_sets(&self, ns: &str) -> Result<Vec<ReplicaSet>> {
        let api: Api<ReplicaSet> = self.api(Some(ns));
        let list = api.list(&ListParams::default()).await.map_err(Error::Kube)?;
        Ok(list.items)
    }

    /// Revision of the newest ReplicaSet owned by the Deployment
    ///
    /// Best-effort: listing or lookup failures degrade to an empty
    /// `RevisionInfo` so the audit reports a missing hash instead of dying.
    pub async fn deployment_latest_revision(&self, name: &str, ns: &str) -> RevisionInfo {
        let sets = match self.replica_sets(ns).await {
            Ok(sets) => sets,
            Err(e) => {
                warn!("failed to list replicasets for {name}: {e}");
                return RevisionInfo::default();
            }
        };
        latest_owned_replica_set(&sets, name)
            .map(revision_from_replica_set)
            .unwrap_or_default()
    }

    pub async fn stateful_set_latest_revision(&self, name: &str, ns: &str) -> RevisionInfo {
        match self.read_stateful_set(name, ns).await {
            Ok(sts) => revision_from_stateful_set(&sts),
            Err(e) => {
                warn!("failed to read statefulset {name} for revision info: {e}");
                RevisionInfo::default()
            }
        }
    }
}

// ----------------------------------------------------------------------------
// revision extraction

fn latest_owned_replica_set<'a>(sets: &'a [ReplicaSet], deployment: &str) -> Option<&'a ReplicaSet> {
    let mut best: Option<&ReplicaSet> = None;
    for rs in sets {
        let owned = rs
            .owner_references()
            .iter()
            .any(|o| o.kind == "Deployment" && o.name == deployment);
        if !owned {
            continue;
        }
        // newest creation timestamp wins; ties broken by name for determinism
        best = match best {
            None => Some(rs),
            Some(cur) => {
                if (rs.creation_timestamp(), rs.name_any()) > (cur.creation_timestamp(), cur.name_any()) {
                    Some(rs)
                } else {
                    Some(cur)
                }
            }
        };
    }
    best
}

fn revision_from_replica_set(rs: &ReplicaSet) -> RevisionInfo {
    let hash = rs.labels().get("pod-template-hash").cloned().unwrap_or_default();
    let number = rs
        .annotations()
        .get("deployment.kubernetes.io/revision")
        .and_then(|s| s.parse::<i64>().ok());
    RevisionInfo {
        hash,
        number,
        ..RevisionInfo::default()
    }
}

fn revision_from_stateful_set(sts: &StatefulSet) -> RevisionInfo {
    let strategy = sts.spec.as_ref().and_then(|s| s.update_strategy.as_ref());
    let strategy_type = strategy
        .and_then(|s| s.type_.clone())
        .unwrap_or_else(|| "RollingUpdate".to_string());
    let mut partition = 0;
    if strategy_type == "RollingUpdate" {
        if let Some(ru) = strategy.and_then(|s| s.rolling_update.as_ref()) {
            partition = ru.partition.unwrap_or(0);
        }
    }
    let status = sts.status.as_ref();
    RevisionInfo {
        hash: status.and_then(|s| s.update_revision.clone()).unwrap_or_default(),
        current_hash: status.and_then(|s| s.current_revision.clone()).unwrap_or_default(),
        partition,
        strategy: strategy_type,
        number: None,
    }
}

// ----------------------------------------------------------------------------
// GKE auth plugin plumbing

async fn load_kubeconfig_context(ctx: &str) -> Result<Config> {
    let kco = KubeConfigOptions {
        context: Some(ctx.to_string()),
        ..Default::default()
    };
    Config::from_kubeconfig(&kco)
        .await
        .map_err(|e| Error::Init(format!("could not load kubeconfig context {ctx}: {e}")))
}

/// Pick the kubeconfig context matching a GCP project
///
/// GKE-style names (`gke_<project>_<zone>_<cluster>`) match on the project
/// segment; anything else matches on substring.
fn resolve_gke_context(project: &str) -> Result<String> {
    let kubeconfig = Kubeconfig::read()
        .map_err(|e| Error::Init(format!("could not read kubeconfig for GKE project {project}: {e}")))?;
    match_gke_context(kubeconfig.contexts.iter().map(|c| c.name.as_str()), project)
        .ok_or_else(|| Error::Init(format!("no kubeconfig context matches GKE project {project:?}")))
}

fn match_gke_context<'a>(names: impl IntoIterator<Item = &'a str>, project: &str) -> Option<String> {
    for name in names {
        if let Some(rest) = name.strip_prefix("gke_") {
            if rest.split('_').next() == Some(project) {
                return Some(name.to_string());
            }
        } else if name.contains(project) {
            return Some(name.to_string());
        }
    }
    None
}

/// Make sure `gke-gcloud-auth-plugin` is discoverable before kube spawns it
///
/// Checks PATH, then PATH entries under a google-cloud-sdk root, then the
/// CLOUDSDK_ROOT_DIR / GCLOUD_SDK_PATH environment variables.
fn ensure_gke_auth_plugin_on_path() {
    if which("gke-gcloud-auth-plugin").is_some() {
        return;
    }
    let path = std::env::var_os("PATH").unwrap_or_default();
    for entry in std::env::split_paths(&path) {
        if !entry.to_string_lossy().contains("google-cloud-sdk") {
            continue;
        }
        let mut root = entry.clone();
        while root.file_name().is_some_and(|n| n != "google-cloud-sdk") {
            if !root.pop() {
                break;
            }
        }
        if root.file_name().is_some_and(|n| n == "google-cloud-sdk") {
            append_to_path(root.join("bin"));
            return;
        }
    }
    if let Some(sdk) = std::env::var_os("CLOUDSDK_ROOT_DIR").or_else(|| std::env::var_os("GCLOUD_SDK_PATH")) {
        append_to_path(PathBuf::from(sdk).join("bin"));
        return;
    }
    warn!("gke-gcloud-auth-plugin not found on PATH and no google-cloud-sdk located; GKE authentication may fail");
}

fn which(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

fn append_to_path(dir: PathBuf) {
    let current = std::env::var_os("PATH").unwrap_or_default();
    let mut parts: Vec<_> = std::env::split_paths(&current).collect();
    if parts.contains(&dir) {
        return;
    }
    info!("adding {} to PATH for gke-gcloud-auth-plugin", dir.display());
    parts.push(dir);
    if let Ok(joined) = std::env::join_paths(parts) {
        std::env::set_var("PATH", joined);
    }
}
