//! The verification loop: discover, map, verify, audit, repeat until
//! everything passes or the global timeout fires.

use crate::audit::{AuditResult, Auditor};
use crate::discover::{Discovery, WorkloadSnapshot};
use crate::mapping::{self, ComponentMap};
use crate::report::Report;
use crate::verify::{self, Status, VersionResults};
use crate::{Result, RETRY_INTERVAL_SECONDS};

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tokio::time::sleep;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

/// Everything the verification loop needs to know
#[derive(Debug, Clone)]
pub struct VerifyOpts {
    /// Component name → expected version (opaque strings)
    pub manifest: BTreeMap<String, String>,
    /// Repository anchor for image parsing
    pub anchor: String,
    pub namespace: String,
    /// Substring patterns that must match at least one discovered workload
    pub required_workloads: Vec<String>,
    /// Substring patterns excluding workloads/containers from all checks
    pub skip_patterns: Vec<String>,
    /// Image-side name → manifest key (already inverted and validated)
    pub reverse_aliases: BTreeMap<String, String>,
    pub allow_zero_replicas: bool,
    /// Single iteration, no sleeping or retrying
    pub dry_run: bool,
    pub timeout: Duration,
}

pub struct Driver {
    discovery: Discovery,
    auditor: Auditor,
    context: String,
    opts: VerifyOpts,
}

impl Driver {
    pub fn new(discovery: Discovery, auditor: Auditor, context: impl Into<String>, opts: VerifyOpts) -> Self {
        Self {
            discovery,
            auditor,
            context: context.into(),
            opts,
        }
    }

    /// Run the verification loop to completion and produce the report
    ///
    /// Only a non-retryable dry-run discovery failure returns `Err`; every
    /// other outcome (including TIMEOUT) still yields a report.
    pub async fn run(&self) -> Result<Report> {
        let start = Instant::now();
        let mut overall = Status::Pass;
        let mut version_results = VersionResults::default();
        let mut stability_results = BTreeMap::new();
        let mut missing_components = Vec::new();
        let mut missing_workloads = Vec::new();
        let mut skipped = Vec::new();

        loop {
            if start.elapsed() > self.opts.timeout {
                error!("global timeout reached");
                overall = Status::Timeout;
                break;
            }

            let (snapshots, skipped_names) = match self
                .discovery
                .discover(&self.opts.namespace, &self.opts.skip_patterns)
                .await
            {
                Ok(discovered) => discovered,
                Err(e) => {
                    error!("discovery failed: {e}");
                    if self.opts.dry_run {
                        return Err(e);
                    }
                    sleep(Duration::from_secs(RETRY_INTERVAL_SECONDS)).await;
                    continue;
                }
            };
            skipped = skipped_names;

            let component_map = mapping::build(
                &snapshots,
                &self.opts.manifest,
                &self.opts.anchor,
                &self.opts.skip_patterns,
                &self.opts.reverse_aliases,
            );

            missing_components = verify::validate_manifest(&self.opts.manifest, &component_map);
            missing_workloads = verify::check_required_workloads(&self.opts.required_workloads, &snapshots);
            version_results =
                verify::verify_versions(&self.opts.manifest, &component_map, self.opts.allow_zero_replicas);

            let (results, all_stable) = self.audit_all(&component_map, &snapshots).await;
            stability_results = results;

            let has_errors = !version_results.errors.is_empty()
                || !missing_components.is_empty()
                || !missing_workloads.is_empty();

            if self.opts.dry_run {
                if has_errors || !all_stable {
                    overall = Status::Fail;
                }
                break;
            }
            if !has_errors && all_stable {
                info!("verification and stability checks passed");
                overall = Status::Pass;
                break;
            }
            info!("waiting for convergence/stability");
            sleep(Duration::from_secs(RETRY_INTERVAL_SECONDS)).await;
        }

        Ok(Report::generate(
            overall,
            &version_results,
            &stability_results,
            &missing_components,
            &missing_workloads,
            &self.context,
            &self.opts.namespace,
            &skipped,
        ))
    }

    async fn audit_all(
        &self,
        component_map: &ComponentMap,
        snapshots: &[WorkloadSnapshot],
    ) -> (BTreeMap<String, AuditResult>, bool) {
        let targets = select_audit_targets(
            component_map,
            snapshots,
            &self.opts.required_workloads,
            &self.opts.skip_patterns,
        );
        let discovered: BTreeMap<String, &WorkloadSnapshot> = snapshots.iter().map(|s| (s.key(), s)).collect();

        let mut results = BTreeMap::new();
        let mut all_stable = true;
        for key in targets {
            let Some(snapshot) = discovered.get(&key) else {
                continue;
            };
            let audit = self.auditor.audit(snapshot).await;
            if !audit.is_stable() {
                all_stable = false;
            }
            results.insert(key, audit);
        }
        (results, all_stable)
    }
}

/// Workload keys worth auditing: everything in the component map plus
/// discovered workloads matching a required pattern, minus skip matches
fn select_audit_targets(
    component_map: &ComponentMap,
    snapshots: &[WorkloadSnapshot],
    required: &[String],
    skip_patterns: &[String],
) -> BTreeSet<String> {
    let mut to_audit = BTreeSet::new();
    let mut to_skip = BTreeSet::new();

    for entries in component_map.values() {
        for entry in entries {
            let key = format!("{}/{}", entry.workload_kind, entry.workload_name);
            if mapping::should_skip(skip_patterns, &entry.container_name, &entry.workload_name).is_some() {
                to_skip.insert(key);
            } else {
                to_audit.insert(key);
            }
        }
    }

    for snapshot in snapshots {
        let key = snapshot.key();
        if mapping::should_skip(skip_patterns, "", &snapshot.name).is_some() {
            to_skip.insert(key);
            continue;
        }
        if required.iter().any(|r| snapshot.name.contains(r.as_str())) && !to_skip.contains(&key) {
            to_audit.insert(key);
        }
    }

    to_audit
}
