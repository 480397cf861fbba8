//! Workload stability auditing: convergence, revision consistency, pod
//! health, DaemonSet scheduling, Job completion.

use crate::discover::{Kind, WorkloadSnapshot};
use crate::session::Session;
use crate::Result;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::DaemonSetStatus;
use k8s_openapi::api::batch::v1::JobStatus;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Serialize;
use std::sync::Arc;
#[allow(unused_imports)]
use tracing::{debug, warn};

/// Waiting reasons that mark a container as broken rather than starting
const BROKEN_WAITING_REASONS: [&str; 3] = ["ImagePullBackOff", "ErrImagePull", "CrashLoopBackOff"];

/// Default Job backoffLimit when the spec leaves it unset
const DEFAULT_BACKOFF_LIMIT: i32 = 6;

/// Outcome of one workload audit
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditResult {
    pub converged: bool,
    pub revision_consistent: bool,
    pub pods_healthy: bool,
    pub scheduling_complete: bool,
    pub job_complete: bool,
    pub errors: Vec<String>,
}

impl AuditResult {
    /// Stable iff no check contributed an error
    pub fn is_stable(&self) -> bool {
        self.errors.is_empty()
    }
}

// live controller state re-read at audit time (generation and status move
// while the verification loop runs)
#[derive(Default)]
struct LiveState {
    generation: Option<i64>,
    observed_generation: Option<i64>,
    daemon_status: Option<DaemonSetStatus>,
    job_status: Option<JobStatus>,
    job_backoff_limit: Option<i32>,
}

pub struct Auditor {
    session: Arc<Session>,
    restart_threshold: i32,
    min_uptime_sec: i64,
}

impl Auditor {
    pub fn new(session: Arc<Session>, restart_threshold: i32, min_uptime_sec: i64) -> Self {
        Self {
            session,
            restart_threshold,
            min_uptime_sec,
        }
    }

    /// Run all stability checks against one discovered workload
    pub async fn audit(&self, workload: &WorkloadSnapshot) -> AuditResult {
        let mut result = AuditResult::default();

        if workload.name.is_empty() || workload.namespace.is_empty() {
            result.errors.push("Invalid workload info provided".to_string());
            return result;
        }

        let live = match self.fetch_live(workload).await {
            Ok(live) => live,
            Err(e) => {
                warn!("failed to fetch {} {}: {e}", workload.kind, workload.name);
                result
                    .errors
                    .push(format!("Could not fetch workload object {}", workload.name));
                return result;
            }
        };

        // 1. controller convergence
        match workload.kind {
            Kind::Deployment | Kind::StatefulSet | Kind::DaemonSet => {
                result.converged = check_convergence(live.generation, live.observed_generation);
                if !result.converged {
                    result
                        .errors
                        .push("Workload not converged (observedGeneration < generation)".to_string());
                }
            }
            Kind::Job | Kind::CronJob => result.converged = true,
        }

        // 2. revision consistency
        match workload.kind {
            Kind::Deployment | Kind::StatefulSet | Kind::DaemonSet => {
                let expected = workload
                    .latest_revision
                    .as_ref()
                    .map(|r| r.hash.as_str())
                    .unwrap_or_default();
                if expected.is_empty() {
                    result
                        .errors
                        .push("Could not determine latest revision hash".to_string());
                } else {
                    let errors = check_revision_consistency(&workload.pods, expected, workload.kind);
                    if errors.is_empty() {
                        result.revision_consistent = true;
                    } else {
                        result.errors.extend(errors);
                    }
                }
            }
            Kind::Job | Kind::CronJob => result.revision_consistent = true,
        }

        // 3. pod health
        let now = Utc::now();
        let mut pod_errors = Vec::new();
        for pod in &workload.pods {
            pod_errors.extend(check_pod_health(pod, self.restart_threshold, self.min_uptime_sec, now));
        }
        if pod_errors.is_empty() {
            result.pods_healthy = true;
        } else {
            result.errors.extend(pod_errors);
        }

        // 4. DaemonSet scheduling
        if workload.kind == Kind::DaemonSet {
            let errors = check_daemon_set_scheduling(live.daemon_status.as_ref());
            if errors.is_empty() {
                result.scheduling_complete = true;
            } else {
                result.errors.extend(errors);
            }
        } else {
            result.scheduling_complete = true;
        }

        // 5. Job completion
        if workload.kind == Kind::Job {
            let errors = check_job_completion(live.job_status.as_ref(), live.job_backoff_limit);
            if errors.is_empty() {
                result.job_complete = true;
            } else {
                result.errors.extend(errors);
            }
        } else {
            result.job_complete = true;
        }

        result
    }

    async fn fetch_live(&self, workload: &WorkloadSnapshot) -> Result<LiveState> {
        let (name, ns) = (&workload.name, &workload.namespace);
        let mut live = LiveState::default();
        match workload.kind {
            Kind::Deployment => {
                let d = self.session.read_deployment(name, ns).await?;
                live.generation = d.metadata.generation;
                live.observed_generation = d.status.and_then(|s| s.observed_generation);
            }
            Kind::StatefulSet => {
                let sts = self.session.read_stateful_set(name, ns).await?;
                live.generation = sts.metadata.generation;
                live.observed_generation = sts.status.and_then(|s| s.observed_generation);
            }
            Kind::DaemonSet => {
                let ds = self.session.read_daemon_set(name, ns).await?;
                live.generation = ds.metadata.generation;
                live.observed_generation = ds.status.as_ref().and_then(|s| s.observed_generation);
                live.daemon_status = ds.status;
            }
            Kind::Job => {
                let job = self.session.read_job(name, ns).await?;
                live.job_backoff_limit = job.spec.as_ref().and_then(|s| s.backoff_limit);
                live.job_status = job.status;
            }
            Kind::CronJob => {
                self.session.read_cron_job(name, ns).await?;
            }
        }
        Ok(live)
    }
}

// ----------------------------------------------------------------------------
// individual checks

/// `observedGeneration >= generation`; missing status means not converged
pub(crate) fn check_convergence(generation: Option<i64>, observed_generation: Option<i64>) -> bool {
    match (generation, observed_generation) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(generation), Some(observed)) => observed >= generation,
    }
}

/// Compare each pod's revision label against the expected template hash
pub(crate) fn check_revision_consistency(pods: &[Pod], expected_hash: &str, kind: Kind) -> Vec<String> {
    if expected_hash.is_empty() {
        return vec!["Expected revision hash is missing".to_string()];
    }
    let label = match kind {
        Kind::Deployment => "pod-template-hash",
        Kind::StatefulSet | Kind::DaemonSet => "controller-revision-hash",
        Kind::Job | Kind::CronJob => return Vec::new(),
    };
    let mut errors = Vec::new();
    for pod in pods {
        let actual = pod.labels().get(label).map(String::as_str);
        if actual != Some(expected_hash) {
            errors.push(format!(
                "Pod {} has hash {}, expected {expected_hash}",
                pod.name_any(),
                actual.unwrap_or("none")
            ));
        }
    }
    errors
}

/// Per-pod health: terminating, readiness, restarts, broken waiting states,
/// and minimum uptime when configured
pub(crate) fn check_pod_health(
    pod: &Pod,
    restart_threshold: i32,
    min_uptime_sec: i64,
    now: DateTime<Utc>,
) -> Vec<String> {
    let pod_name = pod.name_any();
    if pod.metadata.deletion_timestamp.is_some() {
        return vec![format!("Pod {pod_name} is terminating")];
    }

    let mut errors = Vec::new();
    let status = pod.status.as_ref();

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True");
    if !ready {
        errors.push(format!("Pod {pod_name} is not Ready"));
    }

    for cs in status.and_then(|s| s.container_statuses.as_deref()).unwrap_or_default() {
        if cs.restart_count >= restart_threshold {
            errors.push(format!(
                "Container {} in pod {pod_name} has {} restarts",
                cs.name, cs.restart_count
            ));
        }
        if let Some(reason) = cs
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
        {
            if BROKEN_WAITING_REASONS.contains(&reason) {
                errors.push(format!("Container {} in pod {pod_name} is in {reason}", cs.name));
            }
        }
    }

    if min_uptime_sec > 0 {
        match status.and_then(|s| s.start_time.as_ref()) {
            Some(start) => {
                let uptime = (now - start.0).num_milliseconds() as f64 / 1000.0;
                if uptime < min_uptime_sec as f64 {
                    errors.push(format!("Pod {pod_name} uptime {uptime:.1}s < {min_uptime_sec}s"));
                }
            }
            None => errors.push(format!("Pod {pod_name} has not started yet")),
        }
    }

    errors
}

/// Every desired node must run an available, updated daemon pod
pub(crate) fn check_daemon_set_scheduling(status: Option<&DaemonSetStatus>) -> Vec<String> {
    let Some(status) = status else {
        return vec!["DaemonSet status is missing".to_string()];
    };
    let desired = status.desired_number_scheduled;
    let available = status.number_available.unwrap_or(0);
    let updated = status.updated_number_scheduled.unwrap_or(0);
    let mut errors = Vec::new();
    if available < desired {
        errors.push(format!("DaemonSet available pods {available} < desired {desired}"));
    }
    if updated < desired {
        errors.push(format!("DaemonSet updated pods {updated} < desired {desired}"));
    }
    errors
}

/// Jobs must have succeeded at least once and stayed within backoffLimit
pub(crate) fn check_job_completion(status: Option<&JobStatus>, backoff_limit: Option<i32>) -> Vec<String> {
    let Some(status) = status else {
        return vec!["Job status is missing".to_string()];
    };
    let mut errors = Vec::new();
    if status.succeeded.unwrap_or(0) < 1 {
        errors.push("Job has not succeeded yet".to_string());
    }
    let failed = status.failed.unwrap_or(0);
    let backoff_limit = backoff_limit.unwrap_or(DEFAULT_BACKOFF_LIMIT);
    if failed > backoff_limit {
        errors.push(format!("Job failed count {failed} > backoffLimit {backoff_limit}"));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    fn ready_pod(name: &str, hash_label: Option<(&str, &str)>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: hash_label.map(|(k, v)| [(k.to_string(), v.to_string())].into()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn container_status(name: &str, restarts: i32, waiting_reason: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            restart_count: restarts,
            state: waiting_reason.map(|reason| ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn convergence_observed_at_or_past_generation() {
        assert!(check_convergence(Some(3), Some(3)));
        assert!(check_convergence(Some(3), Some(5)));
        assert!(!check_convergence(Some(5), Some(3)));
    }

    #[test]
    fn convergence_missing_observed_generation_is_not_converged() {
        assert!(!check_convergence(Some(3), None));
    }

    #[test]
    fn convergence_vacuous_without_generation() {
        assert!(check_convergence(None, None));
    }

    #[test]
    fn revision_consistency_all_match() {
        let pods = vec![
            ready_pod("pod-a", Some(("pod-template-hash", "abc"))),
            ready_pod("pod-b", Some(("pod-template-hash", "abc"))),
        ];
        assert!(check_revision_consistency(&pods, "abc", Kind::Deployment).is_empty());
    }

    #[test]
    fn revision_consistency_mismatch_names_pod_and_hashes() {
        let pods = vec![ready_pod("pod-a", Some(("pod-template-hash", "old")))];
        let errors = check_revision_consistency(&pods, "new", Kind::Deployment);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("pod-a"));
        assert!(errors[0].contains("has hash old, expected new"));
    }

    #[test]
    fn revision_consistency_uses_controller_revision_for_stateful_set() {
        let pods = vec![ready_pod("web-0", Some(("controller-revision-hash", "web-5")))];
        assert!(check_revision_consistency(&pods, "web-5", Kind::StatefulSet).is_empty());
        // a deployment-style label does not satisfy a statefulset check
        let wrong = vec![ready_pod("web-0", Some(("pod-template-hash", "web-5")))];
        assert_eq!(check_revision_consistency(&wrong, "web-5", Kind::StatefulSet).len(), 1);
    }

    #[test]
    fn revision_consistency_requires_expected_hash() {
        let errors = check_revision_consistency(&[], "", Kind::Deployment);
        assert_eq!(errors, vec!["Expected revision hash is missing"]);
    }

    #[test]
    fn healthy_pod_produces_no_errors() {
        let pod = ready_pod("pod-a", None);
        assert!(check_pod_health(&pod, 3, 0, Utc::now()).is_empty());
    }

    #[test]
    fn pod_without_ready_condition_flagged() {
        let mut pod = ready_pod("pod-a", None);
        pod.status.as_mut().unwrap().conditions = None;
        let errors = check_pod_health(&pod, 3, 0, Utc::now());
        assert_eq!(errors, vec!["Pod pod-a is not Ready"]);
    }

    #[test]
    fn terminating_pod_short_circuits() {
        let mut pod = ready_pod("pod-a", None);
        pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        pod.status.as_mut().unwrap().conditions = None;
        let errors = check_pod_health(&pod, 3, 0, Utc::now());
        assert_eq!(errors, vec!["Pod pod-a is terminating"]);
    }

    #[test]
    fn crash_looping_container_flagged() {
        let mut pod = ready_pod("pod-a", None);
        pod.status.as_mut().unwrap().container_statuses =
            Some(vec![container_status("main", 0, Some("CrashLoopBackOff"))]);
        let errors = check_pod_health(&pod, 3, 0, Utc::now());
        assert_eq!(errors, vec!["Container main in pod pod-a is in CrashLoopBackOff"]);
    }

    #[test]
    fn benign_waiting_reason_not_flagged() {
        let mut pod = ready_pod("pod-a", None);
        pod.status.as_mut().unwrap().container_statuses =
            Some(vec![container_status("main", 0, Some("ContainerCreating"))]);
        assert!(check_pod_health(&pod, 3, 0, Utc::now()).is_empty());
    }

    #[test]
    fn restart_count_at_threshold_flagged() {
        let mut pod = ready_pod("pod-a", None);
        pod.status.as_mut().unwrap().container_statuses = Some(vec![container_status("main", 3, None)]);
        let errors = check_pod_health(&pod, 3, 0, Utc::now());
        assert_eq!(errors, vec!["Container main in pod pod-a has 3 restarts"]);
        // below threshold passes
        pod.status.as_mut().unwrap().container_statuses = Some(vec![container_status("main", 2, None)]);
        assert!(check_pod_health(&pod, 3, 0, Utc::now()).is_empty());
    }

    #[test]
    fn pod_below_min_uptime_flagged() {
        let now = Utc::now();
        let mut pod = ready_pod("pod-a", None);
        pod.status.as_mut().unwrap().start_time = Some(Time(now - Duration::seconds(10)));
        let errors = check_pod_health(&pod, 3, 60, now);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("uptime"));
        assert!(errors[0].contains("< 60s"));
    }

    #[test]
    fn pod_above_min_uptime_passes() {
        let now = Utc::now();
        let mut pod = ready_pod("pod-a", None);
        pod.status.as_mut().unwrap().start_time = Some(Time(now - Duration::seconds(120)));
        assert!(check_pod_health(&pod, 3, 60, now).is_empty());
    }

    #[test]
    fn pod_without_start_time_flagged_when_uptime_required() {
        let pod = ready_pod("pod-a", None);
        let errors = check_pod_health(&pod, 3, 60, Utc::now());
        assert_eq!(errors, vec!["Pod pod-a has not started yet"]);
    }

    #[test]
    fn min_uptime_zero_skips_the_check() {
        let pod = ready_pod("pod-a", None);
        assert!(check_pod_health(&pod, 3, 0, Utc::now()).is_empty());
    }

    fn ds_status(desired: i32, available: i32, updated: i32) -> DaemonSetStatus {
        DaemonSetStatus {
            desired_number_scheduled: desired,
            number_available: Some(available),
            updated_number_scheduled: Some(updated),
            ..Default::default()
        }
    }

    #[test]
    fn daemon_set_scheduling_complete() {
        assert!(check_daemon_set_scheduling(Some(&ds_status(3, 3, 3))).is_empty());
    }

    #[test]
    fn daemon_set_scheduling_incomplete() {
        let errors = check_daemon_set_scheduling(Some(&ds_status(3, 2, 1)));
        assert_eq!(
            errors,
            vec![
                "DaemonSet available pods 2 < desired 3",
                "DaemonSet updated pods 1 < desired 3",
            ]
        );
    }

    #[test]
    fn daemon_set_missing_status() {
        assert_eq!(check_daemon_set_scheduling(None), vec!["DaemonSet status is missing"]);
    }

    #[test]
    fn job_succeeded_passes() {
        let status = JobStatus {
            succeeded: Some(1),
            ..Default::default()
        };
        assert!(check_job_completion(Some(&status), None).is_empty());
    }

    #[test]
    fn job_not_succeeded_flagged() {
        let status = JobStatus::default();
        assert_eq!(check_job_completion(Some(&status), None), vec!["Job has not succeeded yet"]);
    }

    #[test]
    fn job_failures_over_backoff_limit_flagged() {
        let status = JobStatus {
            succeeded: Some(1),
            failed: Some(7),
            ..Default::default()
        };
        // default backoffLimit is 6
        assert_eq!(
            check_job_completion(Some(&status), None),
            vec!["Job failed count 7 > backoffLimit 6"]
        );
        assert!(check_job_completion(Some(&status), Some(10)).is_empty());
    }

    #[test]
    fn job_missing_status() {
        assert_eq!(check_job_completion(None, None), vec!["Job status is missing"]);
    }

    #[test]
    fn stability_tracks_error_list() {
        let mut result = AuditResult {
            converged: true,
            revision_consistent: true,
            pods_healthy: true,
            scheduling_complete: true,
            job_complete: true,
            errors: Vec::new(),
        };
        assert!(result.is_stable());
        result.errors.push("Pod pod-a is not Ready".to_string());
        assert!(!result.is_stable());
    }
}
