//! Builds the JSON patch that records a pod's host port allocations across its
//! affinity, labels, container ports, environment and annotations.

use super::ports::PortRef;
use bcs_webhook_k8s_api::{self as k8s, randhostport as keys};
use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use serde::Serialize;

/// A host port allocated for one selected container port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub target: PortRef,
    pub host_port: u16,
}

/// Builds every patch operation for the pod's allocations.
///
/// When `change_container_port` is set, each selected `containerPort` is
/// rewritten to its host port as well.
pub(crate) fn build(
    pod: &k8s::Pod,
    allocations: &[Allocation],
    change_container_port: bool,
) -> serde_json::Result<Vec<PatchOperation>> {
    let spec = pod.spec.clone().unwrap_or_default();
    let mut patches = Vec::new();

    patches.push(affinity(spec.affinity.as_ref(), allocations)?);
    patches.push(labels(pod.metadata.labels.as_ref(), allocations)?);
    patches.extend(container_ports(allocations, change_container_port));

    let env = allocation_env(allocations);
    for (i, container) in spec.containers.iter().enumerate() {
        let path = format!("/spec/containers/{}/env", i);
        patches.push(container_env(path, container, &env)?);
    }
    for (i, container) in spec.init_containers.iter().flatten().enumerate() {
        let path = format!("/spec/initContainers/{}/env", i);
        patches.push(container_env(path, container, &env)?);
    }

    patches.push(annotations(
        pod.metadata.annotations.as_ref(),
        allocations,
        change_container_port,
    )?);
    Ok(patches)
}

/// Adds the value at `path` if the field was unset, or replaces it whole.
fn set<T: Serialize>(exists: bool, path: String, value: &T) -> serde_json::Result<PatchOperation> {
    let value = serde_json::to_value(value)?;
    Ok(if exists {
        PatchOperation::Replace(ReplaceOperation { path, value })
    } else {
        PatchOperation::Add(AddOperation { path, value })
    })
}

/// Forbids two pods holding the same host port from sharing a node.
fn affinity(
    existing: Option<&k8s::Affinity>,
    allocations: &[Allocation],
) -> serde_json::Result<PatchOperation> {
    let mut affinity = existing.cloned().unwrap_or_default();
    let terms = affinity
        .pod_anti_affinity
        .get_or_insert_with(Default::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(Vec::new);
    terms.extend(allocations.iter().map(|a| k8s::PodAffinityTerm {
        label_selector: Some(k8s::LabelSelector {
            match_expressions: Some(vec![k8s::LabelSelectorRequirement {
                key: keys::hostport_label(a.host_port),
                operator: "Exists".to_string(),
                values: None,
            }]),
            match_labels: None,
        }),
        topology_key: k8s::HOSTNAME_TOPOLOGY_KEY.to_string(),
        ..Default::default()
    }));
    set(existing.is_some(), "/spec/affinity".to_string(), &affinity)
}

fn labels(
    existing: Option<&k8s::Labels>,
    allocations: &[Allocation],
) -> serde_json::Result<PatchOperation> {
    let mut labels = existing.cloned().unwrap_or_default();
    labels.insert(
        keys::INJECTED_LABEL.to_string(),
        keys::INJECTED_LABEL_VALUE.to_string(),
    );
    for a in allocations {
        labels.insert(keys::hostport_label(a.host_port), a.host_port.to_string());
    }
    set(existing.is_some(), "/metadata/labels".to_string(), &labels)
}

fn container_ports(
    allocations: &[Allocation],
    change_container_port: bool,
) -> impl Iterator<Item = PatchOperation> + '_ {
    allocations.iter().flat_map(move |a| {
        let base = format!(
            "/spec/containers/{}/ports/{}",
            a.target.container, a.target.index
        );
        let host_port = PatchOperation::Add(AddOperation {
            path: format!("{}/hostPort", base),
            value: a.host_port.into(),
        });
        let container_port = change_container_port.then(|| {
            PatchOperation::Replace(ReplaceOperation {
                path: format!("{}/containerPort", base),
                value: a.host_port.into(),
            })
        });
        std::iter::once(host_port).chain(container_port)
    })
}

/// Every container learns every allocation, plus where it is running.
fn allocation_env(allocations: &[Allocation]) -> Vec<k8s::EnvVar> {
    let mut env = allocations
        .iter()
        .map(|a| k8s::EnvVar {
            name: keys::container_port_env(a.target.container_port),
            value: Some(a.host_port.to_string()),
            value_from: None,
        })
        .collect::<Vec<_>>();
    env.push(field_ref_env(keys::ENV_HOST_IP, "status.hostIP"));
    env.push(field_ref_env(keys::ENV_POD_NAME, "metadata.name"));
    env.push(field_ref_env(keys::ENV_POD_NAMESPACE, "metadata.namespace"));
    env
}

fn field_ref_env(name: &str, field_path: &str) -> k8s::EnvVar {
    k8s::EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(k8s::EnvVarSource {
            field_ref: Some(k8s::ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

fn container_env(
    path: String,
    container: &k8s::Container,
    env: &[k8s::EnvVar],
) -> serde_json::Result<PatchOperation> {
    let mut vars = container.env.clone().unwrap_or_default();
    vars.extend_from_slice(env);
    set(container.env.is_some(), path, &vars)
}

fn annotations(
    existing: Option<&k8s::Labels>,
    allocations: &[Allocation],
    change_container_port: bool,
) -> serde_json::Result<PatchOperation> {
    let mut annotations = existing.cloned().unwrap_or_default();
    for a in allocations {
        let port = if change_container_port {
            i32::from(a.host_port)
        } else {
            a.target.container_port
        };
        annotations.insert(keys::hostport_annotation(port), a.host_port.to_string());
    }
    set(
        existing.is_some(),
        "/metadata/annotations".to_string(),
        &annotations,
    )
}
