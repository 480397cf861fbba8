//! Component map construction: joins discovered snapshots with the manifest
//! through the image parser. Entries group by
//! `(workload, kind, container, version)`.

use crate::discover::{Kind, WorkloadSnapshot};
use crate::image::{parse_image_reference, ImageReference};
use crate::{Error, Result};

use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;
use serde::Serialize;
use std::collections::BTreeMap;
#[allow(unused_imports)]
use tracing::{debug, info, warn};

/// Where a container sits in the pod spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Init,
    App,
}

/// Compact pod metadata carried into the report
#[derive(Debug, Clone, Serialize)]
pub struct PodInfo {
    pub name: String,
    pub ip: String,
    pub node: String,
    pub start_time: String,
    pub phase: String,
}

impl PodInfo {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        Self {
            name: pod.name_any(),
            ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            node: pod.spec.as_ref().and_then(|s| s.node_name.clone()).unwrap_or_default(),
            start_time: status
                .and_then(|s| s.start_time.as_ref())
                .map(|t| t.0.to_rfc3339())
                .unwrap_or_default(),
            phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
        }
    }
}

/// One `(workload, kind, container, version)` grouping with its pods
#[derive(Debug, Clone, Serialize)]
pub struct ComponentMapEntry {
    pub workload_name: String,
    pub workload_kind: Kind,
    pub container_name: String,
    pub container_type: ContainerType,
    pub actual_version: String,
    pub pods: Vec<PodInfo>,
}

/// Manifest component name → entries found for it in the cluster
pub type ComponentMap = BTreeMap<String, Vec<ComponentMapEntry>>;

/// Invert a manifest-key→image-name alias map for lookup by parsed component
///
/// Two manifest keys aliasing to the same image-side name would make entry
/// attribution ambiguous, so that is a configuration error.
pub fn invert_aliases(aliases: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut reverse = BTreeMap::new();
    for (component, image_name) in aliases {
        if let Some(previous) = reverse.insert(image_name.clone(), component.clone()) {
            return Err(Error::Config(format!(
                "components {previous:?} and {component:?} both alias to image name {image_name:?}"
            )));
        }
    }
    Ok(reverse)
}

/// First pattern matching either the container name or the workload name
pub(crate) fn should_skip<'a>(patterns: &'a [String], container_name: &str, workload_name: &str) -> Option<&'a str> {
    patterns
        .iter()
        .map(String::as_str)
        .find(|p| container_name.contains(p) || workload_name.contains(p))
}

fn containers_from_lists(
    init: Option<&[Container]>,
    app: &[Container],
    pod_info: Option<&PodInfo>,
) -> Vec<(String, ContainerType, Option<PodInfo>)> {
    let mut out = Vec::new();
    for container in init.unwrap_or_default() {
        out.push((
            container.image.clone().unwrap_or_default(),
            ContainerType::Init,
            pod_info.cloned(),
        ));
    }
    for container in app {
        out.push((
            container.image.clone().unwrap_or_default(),
            ContainerType::App,
            pod_info.cloned(),
        ));
    }
    out
}

/// `(image, type, pod)` tuples for a workload, init containers first
///
/// Running pods win; zero-replica workloads fall back to the pod-template
/// spec so their versions can still be verified.
fn extract_containers(workload: &WorkloadSnapshot) -> Vec<(String, ContainerType, Option<PodInfo>)> {
    if !workload.pods.is_empty() {
        let mut out = Vec::new();
        for pod in &workload.pods {
            let info = PodInfo::from_pod(pod);
            if let Some(spec) = &pod.spec {
                out.extend(containers_from_lists(
                    spec.init_containers.as_deref(),
                    &spec.containers,
                    Some(&info),
                ));
            }
        }
        return out;
    }
    if let Some(spec) = &workload.pod_spec {
        info!(
            "workload '{}' has 0 pods, using pod spec template for version extraction",
            workload.name
        );
        return containers_from_lists(spec.init_containers.as_deref(), &spec.containers, None);
    }
    Vec::new()
}

/// Build the component map from discovered snapshots
pub fn build(
    workloads: &[WorkloadSnapshot],
    manifest: &BTreeMap<String, String>,
    repository_anchor: &str,
    skip_patterns: &[String],
    reverse_aliases: &BTreeMap<String, String>,
) -> ComponentMap {
    let mut map = ComponentMap::new();
    for workload in workloads {
        for (image, container_type, pod_info) in extract_containers(workload) {
            let Ok(parsed) = parse_image_reference(&image, repository_anchor) else {
                continue;
            };
            let component = reverse_aliases
                .get(&parsed.component)
                .cloned()
                .unwrap_or_else(|| parsed.component.clone());
            if !manifest.contains_key(&component) {
                continue;
            }
            if should_skip(skip_patterns, &parsed.component, &workload.name).is_some() {
                continue;
            }
            upsert_entry(map.entry(component).or_default(), workload, &parsed, container_type, pod_info);
        }
    }
    map
}

fn upsert_entry(
    entries: &mut Vec<ComponentMapEntry>,
    workload: &WorkloadSnapshot,
    parsed: &ImageReference,
    container_type: ContainerType,
    pod_info: Option<PodInfo>,
) {
    if let Some(existing) = entries.iter_mut().find(|e| {
        e.workload_name == workload.name
            && e.workload_kind == workload.kind
            && e.container_name == parsed.component
            && e.actual_version == parsed.version
    }) {
        if let Some(info) = pod_info {
            existing.pods.push(info);
        }
        return;
    }
    entries.push(ComponentMapEntry {
        workload_name: workload.name.clone(),
        workload_kind: workload.kind,
        container_name: parsed.component.clone(),
        container_type,
        actual_version: parsed.version.clone(),
        pods: pod_info.into_iter().collect(),
    });
}
