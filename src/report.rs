//! The final report document printed to stdout

use crate::audit::AuditResult;
use crate::verify::{Status, VersionResults};
use crate::{Error, Kind, Result};

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregated counts across the whole verification
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub total_components: usize,
    pub missing_components: usize,
    pub missing_workloads: usize,
    pub failed_components: usize,
    pub unstable_workloads: usize,
    pub skipped_containers: usize,
}

/// Detail for one failing workload under a component
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadDetail {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Kind,
    pub container: String,
    pub version_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability: Option<AuditResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentDetail {
    pub status: Status,
    pub errors: Vec<String>,
    pub workloads: Vec<WorkloadDetail>,
}

/// `details` values: component entries plus the `_missing_components` /
/// `_missing_workloads` name lists that sit beside them
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DetailEntry {
    Component(ComponentDetail),
    Names(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub timestamp: String,
    pub context: String,
    pub namespace: String,
    pub status: Status,
    pub summary: Summary,
    pub details: BTreeMap<String, DetailEntry>,
}

impl Report {
    #[allow(clippy::too_many_arguments)]
    pub fn generate(
        overall_status: Status,
        version_results: &VersionResults,
        stability_results: &BTreeMap<String, AuditResult>,
        missing_components: &[String],
        missing_workloads: &[String],
        context: &str,
        namespace: &str,
        skipped_workloads: &[String],
    ) -> Report {
        let mut summary = Summary {
            total_components: version_results.components.len(),
            missing_components: missing_components.len(),
            missing_workloads: missing_workloads.len(),
            skipped_containers: skipped_workloads.len(),
            ..Default::default()
        };

        let mut details = BTreeMap::new();
        for (component, comp_result) in &version_results.components {
            if comp_result.status == Status::Fail {
                summary.failed_components += 1;
            }

            let mut detail = ComponentDetail {
                status: comp_result.status,
                errors: comp_result.errors.clone(),
                workloads: Vec::new(),
            };

            for entry in &comp_result.workloads {
                if entry.status == Status::Skipped {
                    summary.skipped_containers += 1;
                    continue;
                }
                let key = format!("{}/{}", entry.kind, entry.workload);
                let stability = stability_results.get(&key).cloned();
                let has_stability_errors = stability.as_ref().is_some_and(|s| !s.is_stable());
                if has_stability_errors {
                    summary.unstable_workloads += 1;
                }
                // failures only; a clean workload is just a summary statistic
                if entry.status == Status::Fail || has_stability_errors {
                    detail.workloads.push(WorkloadDetail {
                        name: entry.workload.clone(),
                        kind: entry.kind,
                        container: entry.container.clone(),
                        version_error: entry.error.clone(),
                        stability,
                    });
                }
            }

            details.insert(component.clone(), DetailEntry::Component(detail));
        }

        if !missing_components.is_empty() {
            details.insert("_missing_components".to_string(), DetailEntry::Names(missing_components.to_vec()));
        }
        if !missing_workloads.is_empty() {
            details.insert("_missing_workloads".to_string(), DetailEntry::Names(missing_workloads.to_vec()));
        }

        Report {
            timestamp: Utc::now().to_rfc3339(),
            context: context.to_string(),
            namespace: namespace.to_string(),
            status: overall_status,
            summary,
            details,
        }
    }

    /// Pretty-printed JSON document (2-space indent)
    pub fn render(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::Serialization)
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{ComponentResult, EntryResult};

    fn entry(workload: &str, status: Status, error: Option<&str>) -> EntryResult {
        EntryResult {
            workload: workload.to_string(),
            kind: Kind::Deployment,
            container: "backend".to_string(),
            status,
            error: error.map(String::from),
        }
    }

    fn version_results(entries: Vec<EntryResult>, errors: Vec<String>) -> VersionResults {
        let status = if errors.is_empty() { Status::Pass } else { Status::Fail };
        let mut results = VersionResults::default();
        results.errors = errors.clone();
        results.components.insert(
            "backend".to_string(),
            ComponentResult {
                status,
                errors,
                workloads: entries,
            },
        );
        results
    }

    fn unstable() -> AuditResult {
        AuditResult {
            converged: true,
            revision_consistent: true,
            pods_healthy: false,
            scheduling_complete: true,
            job_complete: true,
            errors: vec!["Pod backend-1 is not Ready".to_string()],
        }
    }

    #[test]
    fn passing_report_has_no_workload_details() {
        let results = version_results(vec![entry("backend-deployment", Status::Pass, None)], Vec::new());
        let report = Report::generate(Status::Pass, &results, &BTreeMap::new(), &[], &[], "ctx", "prod", &[]);
        assert_eq!(report.summary.total_components, 1);
        assert_eq!(report.summary.failed_components, 0);
        let DetailEntry::Component(detail) = &report.details["backend"] else {
            panic!("expected component detail");
        };
        assert!(detail.workloads.is_empty());
        assert_eq!(detail.status, Status::Pass);
    }

    #[test]
    fn version_failure_is_detailed_and_counted() {
        let results = version_results(
            vec![entry(
                "backend-deployment",
                Status::Fail,
                Some("Version mismatch: expected v2, found v1"),
            )],
            vec!["[backend] backend-deployment: Version mismatch: expected v2, found v1".to_string()],
        );
        let report = Report::generate(Status::Fail, &results, &BTreeMap::new(), &[], &[], "ctx", "prod", &[]);
        assert_eq!(report.summary.failed_components, 1);
        let DetailEntry::Component(detail) = &report.details["backend"] else {
            panic!("expected component detail");
        };
        assert_eq!(detail.workloads.len(), 1);
        assert_eq!(
            detail.workloads[0].version_error.as_deref(),
            Some("Version mismatch: expected v2, found v1")
        );
    }

    #[test]
    fn unstable_workload_is_detailed_even_when_version_passes() {
        let results = version_results(vec![entry("backend-deployment", Status::Pass, None)], Vec::new());
        let stability = BTreeMap::from([("Deployment/backend-deployment".to_string(), unstable())]);
        let report = Report::generate(Status::Fail, &results, &stability, &[], &[], "ctx", "prod", &[]);
        assert_eq!(report.summary.unstable_workloads, 1);
        let DetailEntry::Component(detail) = &report.details["backend"] else {
            panic!("expected component detail");
        };
        assert_eq!(detail.workloads.len(), 1);
        assert!(!detail.workloads[0].stability.as_ref().unwrap().is_stable());
    }

    #[test]
    fn missing_lists_appear_as_sibling_keys() {
        let results = version_results(Vec::new(), vec!["Component 'backend' not found".to_string()]);
        let report = Report::generate(
            Status::Fail,
            &results,
            &BTreeMap::new(),
            &["Component 'frontend' not found in cluster".to_string()],
            &["Required workload 'worker' not found".to_string()],
            "ctx",
            "prod",
            &[],
        );
        assert_eq!(report.summary.missing_components, 1);
        assert_eq!(report.summary.missing_workloads, 1);
        assert!(matches!(report.details["_missing_components"], DetailEntry::Names(_)));
        assert!(matches!(report.details["_missing_workloads"], DetailEntry::Names(_)));
    }

    #[test]
    fn skipped_workload_names_count_as_skipped_containers() {
        let results = version_results(Vec::new(), Vec::new());
        let report = Report::generate(
            Status::Pass,
            &results,
            &BTreeMap::new(),
            &[],
            &[],
            "ctx",
            "prod",
            &["frontend-deployment".to_string()],
        );
        assert_eq!(report.summary.skipped_containers, 1);
    }

    #[test]
    fn render_is_pretty_json_with_expected_top_level_keys() {
        let results = version_results(vec![entry("backend-deployment", Status::Pass, None)], Vec::new());
        let report = Report::generate(Status::Pass, &results, &BTreeMap::new(), &[], &[], "ctx", "prod", &[]);
        let rendered = report.render().unwrap();
        assert!(rendered.starts_with("{\n  \""));
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        for key in ["timestamp", "context", "namespace", "status", "summary", "details"] {
            assert!(value.get(key).is_some(), "missing top-level key {key}");
        }
        assert_eq!(value["status"], "PASS");
        assert_eq!(value["summary"]["total_components"], 1);
    }
}
