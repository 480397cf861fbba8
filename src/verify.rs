//! Version verification against the manifest (opaque string equality)

use crate::discover::WorkloadSnapshot;
use crate::mapping::{ComponentMap, ComponentMapEntry};
use crate::Kind;

use serde::Serialize;
use std::collections::BTreeMap;

/// Overall or per-entry verification status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
    Timeout,
    Skipped,
}

impl Status {
    /// Process exit code: 0 for PASS, 2 for TIMEOUT, 1 for everything else
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Pass => 0,
            Status::Timeout => 2,
            Status::Fail | Status::Skipped => 1,
        }
    }
}

/// Verification outcome for a single component map entry
#[derive(Debug, Clone, Serialize)]
pub struct EntryResult {
    pub workload: String,
    #[serde(rename = "type")]
    pub kind: Kind,
    pub container: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated result for one manifest component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentResult {
    pub status: Status,
    pub errors: Vec<String>,
    pub workloads: Vec<EntryResult>,
}

impl Default for ComponentResult {
    fn default() -> Self {
        Self {
            status: Status::Pass,
            errors: Vec::new(),
            workloads: Vec::new(),
        }
    }
}

/// Top-level output of [`verify_versions`]
#[derive(Debug, Clone, Default)]
pub struct VersionResults {
    /// Flat list of every error across all components
    pub errors: Vec<String>,
    pub components: BTreeMap<String, ComponentResult>,
}

fn verify_entry(entry: &ComponentMapEntry, expected_version: &str, allow_zero_replicas: bool) -> EntryResult {
    let mut result = EntryResult {
        workload: entry.workload_name.clone(),
        kind: entry.workload_kind,
        container: entry.container_name.clone(),
        status: Status::Pass,
        error: None,
    };
    if entry.pods.is_empty() && !allow_zero_replicas {
        result.status = Status::Fail;
        result.error = Some(format!(
            "Workload has 0 running pods (version from pod spec: {})",
            entry.actual_version
        ));
    } else if entry.actual_version != expected_version {
        result.status = Status::Fail;
        result.error = Some(format!(
            "Version mismatch: expected {expected_version}, found {}",
            entry.actual_version
        ));
    }
    result
}

/// Verify every manifest component against the discovered map
pub fn verify_versions(
    manifest: &BTreeMap<String, String>,
    component_map: &ComponentMap,
    allow_zero_replicas: bool,
) -> VersionResults {
    let mut results = VersionResults::default();

    for (component, expected_version) in manifest {
        let mut comp = ComponentResult::default();

        let Some(entries) = component_map.get(component) else {
            let msg = format!("Component '{component}' not found");
            comp.status = Status::Fail;
            comp.errors.push(msg.clone());
            results.errors.push(msg);
            results.components.insert(component.clone(), comp);
            continue;
        };

        for entry in entries {
            let entry_result = verify_entry(entry, expected_version, allow_zero_replicas);
            if entry_result.status == Status::Fail {
                let error = entry_result.error.as_deref().unwrap_or_default();
                comp.status = Status::Fail;
                comp.errors.push(format!("{}: {error}", entry.workload_name));
                results.errors.push(format!("[{component}] {}: {error}", entry.workload_name));
            }
            comp.workloads.push(entry_result);
        }

        results.components.insert(component.clone(), comp);
    }

    results
}

/// Components declared in the manifest but absent from the cluster
pub fn validate_manifest(manifest: &BTreeMap<String, String>, component_map: &ComponentMap) -> Vec<String> {
    manifest
        .keys()
        .filter(|c| !component_map.contains_key(*c))
        .map(|c| format!("Component '{c}' not found in cluster"))
        .collect()
}

/// Required workload patterns with no substring match among discovered names
pub fn check_required_workloads(required: &[String], discovered: &[WorkloadSnapshot]) -> Vec<String> {
    required
        .iter()
        .filter(|pattern| !discovered.iter().any(|w| w.name.contains(pattern.as_str())))
        .map(|pattern| format!("Required workload '{pattern}' not found"))
        .collect()
}
