//! Workload discovery
//!
//! Lists every enabled workload kind in a namespace, filters skip patterns,
//! and inspects the survivors in parallel (revision lookup + pod listing)
//! through a bounded pool of tokio tasks. One failed inspection never aborts
//! the others; it surfaces as that snapshot's `error`.

use crate::session::{RevisionInfo, Session};
use crate::{Error, Result, DEFAULT_POOL_WORKERS};

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use kube::ResourceExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

/// Workload kinds the verifier understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Kind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Deployment => "Deployment",
            Kind::StatefulSet => "StatefulSet",
            Kind::DaemonSet => "DaemonSet",
            Kind::Job => "Job",
            Kind::CronJob => "CronJob",
        })
    }
}

/// Everything the verifier needs to know about one inspected workload
#[derive(Debug, Clone)]
pub struct WorkloadSnapshot {
    pub name: String,
    pub kind: Kind,
    pub namespace: String,
    pub latest_revision: Option<RevisionInfo>,
    /// Raw pod objects; may be empty for zero-replica workloads
    pub pods: Vec<Pod>,
    /// Pod-template spec, used for version extraction when no pods exist
    pub pod_spec: Option<PodSpec>,
    /// Unrecoverable inspection failure, if any
    pub error: Option<String>,
}

impl WorkloadSnapshot {
    /// Identity used to join snapshots with audit results
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }
}

/// Which optional kinds to fetch; Deployments are always included
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryOptions {
    pub statefulsets: bool,
    pub daemonsets: bool,
    /// Covers Jobs and CronJobs
    pub jobs: bool,
}

pub struct Discovery {
    session: Arc<Session>,
    include: DiscoveryOptions,
    workers: usize,
}

// per-workload data gathered from the list call, before any extra API reads
struct InspectSeed {
    name: String,
    kind: Kind,
    namespace: String,
    pod_spec: Option<PodSpec>,
    // DaemonSet revision comes from the pod-template label, no lookup needed
    ds_revision: Option<RevisionInfo>,
}

impl Discovery {
    pub fn new(session: Arc<Session>, include: DiscoveryOptions) -> Self {
        Self {
            session,
            include,
            workers: DEFAULT_POOL_WORKERS,
        }
    }

    /// Override the inspection pool size (any value >= 1 preserves semantics)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Discover and inspect all relevant workloads in a namespace
    ///
    /// Returns the inspected snapshots (unordered) and the names of
    /// workloads excluded by skip patterns. A failed list call for any
    /// enabled kind is fatal; per-workload inspection failures are not.
    pub async fn discover(
        &self,
        namespace: &str,
        skip_patterns: &[String],
    ) -> Result<(Vec<WorkloadSnapshot>, Vec<String>)> {
        info!("discovering cluster state in {namespace}");
        let mut seeds = self.fetch_seeds(namespace).await?;

        let mut skipped = Vec::new();
        seeds.retain(|seed| {
            if skip_patterns.iter().any(|p| seed.name.contains(p.as_str())) {
                info!("skipping workload {} (matched skip pattern)", seed.name);
                skipped.push(seed.name.clone());
                false
            } else {
                true
            }
        });

        let total = seeds.len();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for seed in seeds {
            let session = self.session.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("inspection semaphore closed");
                inspect(&session, seed).await
            });
        }

        let mut snapshots = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(snapshot) => {
                    debug!("workload {} inspected {}/{}", snapshot.name, snapshots.len() + 1, total);
                    snapshots.push(snapshot);
                }
                Err(e) => warn!("inspection task died: {e}"),
            }
        }
        Ok((snapshots, skipped))
    }

    async fn fetch_seeds(&self, namespace: &str) -> Result<Vec<InspectSeed>> {
        let ns = Some(namespace);
        let mut seeds = Vec::new();

        let deployments = self.fetch(Kind::Deployment, self.session.deployments(ns).await)?;
        seeds.extend(deployments.into_values().map(|d| deployment_seed(d, namespace)));

        if self.include.statefulsets {
            let sets = self.fetch(Kind::StatefulSet, self.session.stateful_sets(ns).await)?;
            seeds.extend(sets.into_values().map(|s| stateful_set_seed(s, namespace)));
        }
        if self.include.daemonsets {
            let sets = self.fetch(Kind::DaemonSet, self.session.daemon_sets(ns).await)?;
            seeds.extend(sets.into_values().map(|d| daemon_set_seed(d, namespace)));
        }
        if self.include.jobs {
            let jobs = self.fetch(Kind::Job, self.session.jobs(ns).await)?;
            seeds.extend(jobs.into_values().map(|j| job_seed(j, namespace)));
            let crons = self.fetch(Kind::CronJob, self.session.cron_jobs(ns).await)?;
            seeds.extend(crons.into_values().map(|c| cron_job_seed(c, namespace)));
        }
        Ok(seeds)
    }

    fn fetch<T>(&self, kind: Kind, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            error!("failed to fetch {kind}s: {e}");
            Error::Discovery(format!("failed to fetch {kind}s: {e}"))
        })
    }
}

async fn inspect(session: &Session, seed: InspectSeed) -> WorkloadSnapshot {
    let mut snapshot = WorkloadSnapshot {
        name: seed.name,
        kind: seed.kind,
        namespace: seed.namespace,
        latest_revision: None,
        pods: Vec::new(),
        pod_spec: seed.pod_spec,
        error: None,
    };

    snapshot.latest_revision = match seed.kind {
        Kind::Deployment => Some(
            session
                .deployment_latest_revision(&snapshot.name, &snapshot.namespace)
                .await,
        ),
        Kind::StatefulSet => Some(
            session
                .stateful_set_latest_revision(&snapshot.name, &snapshot.namespace)
                .await,
        ),
        Kind::DaemonSet => seed.ds_revision,
        Kind::Job | Kind::CronJob => None,
    };

    let listed = match seed.kind {
        Kind::Deployment => Some(session.pods_for_deployment(&snapshot.name, &snapshot.namespace).await),
        Kind::StatefulSet => Some(session.pods_for_stateful_set(&snapshot.name, &snapshot.namespace).await),
        Kind::DaemonSet => Some(session.pods_for_daemon_set(&snapshot.name, &snapshot.namespace).await),
        Kind::Job => Some(session.pods_for_job(&snapshot.name, &snapshot.namespace).await),
        Kind::CronJob => None,
    };
    match listed {
        Some(Ok(pods)) => snapshot.pods = pods,
        Some(Err(e @ (Error::NoSelector(_) | Error::Kube(_)))) => {
            // selector-less or unreadable workloads verify from the pod spec
            warn!("no pods listed for {} {}: {e}", snapshot.kind, snapshot.name);
        }
        Some(Err(e)) => {
            error!("error listing pods for {}: {e}", snapshot.name);
            snapshot.error = Some(e.to_string());
        }
        None => {}
    }

    snapshot
}

// ----------------------------------------------------------------------------
// per-kind seed extraction

fn deployment_seed(d: Deployment, namespace: &str) -> InspectSeed {
    InspectSeed {
        name: d.name_any(),
        kind: Kind::Deployment,
        namespace: namespace.to_string(),
        pod_spec: d.spec.and_then(|s| s.template.spec),
        ds_revision: None,
    }
}

fn stateful_set_seed(sts: StatefulSet, namespace: &str) -> InspectSeed {
    InspectSeed {
        name: sts.name_any(),
        kind: Kind::StatefulSet,
        namespace: namespace.to_string(),
        pod_spec: sts.spec.and_then(|s| s.template.spec),
        ds_revision: None,
    }
}

fn daemon_set_seed(ds: DaemonSet, namespace: &str) -> InspectSeed {
    let name = ds.name_any();
    let template = ds.spec.as_ref().map(|s| &s.template);
    let revision = template
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
        .and_then(|l| l.get("controller-revision-hash"))
        .map(RevisionInfo::from_hash);
    if revision.is_none() {
        warn!("DaemonSet {name} pod template has no controller-revision-hash label");
    }
    InspectSeed {
        pod_spec: ds.spec.and_then(|s| s.template.spec),
        name,
        kind: Kind::DaemonSet,
        namespace: namespace.to_string(),
        ds_revision: revision,
    }
}

fn job_seed(job: Job, namespace: &str) -> InspectSeed {
    InspectSeed {
        name: job.name_any(),
        kind: Kind::Job,
        namespace: namespace.to_string(),
        pod_spec: job.spec.and_then(|s| s.template.spec),
        ds_revision: None,
    }
}

// CronJobs nest the pod template one level deeper, through the job template
fn cron_job_seed(cron: CronJob, namespace: &str) -> InspectSeed {
    InspectSeed {
        name: cron.name_any(),
        kind: Kind::CronJob,
        namespace: namespace.to_string(),
        pod_spec: cron
            .spec
            .and_then(|s| s.job_template.spec)
            .and_then(|s| s.template.spec),
        ds_revision: None,
    }
}
