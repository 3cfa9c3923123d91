//! Allocates a random host port for selected container ports of each newly
//! created pod.
//!
//! Pods opt in with the [`INJECT_ANNOTATION`] annotation and list the
//! container ports (by name or number) that need host ports in the
//! [`PORTS_ANNOTATION`] annotation. The injector picks one host port per
//! listed container port and patches the pod so that:
//!
//! - the container port binds that host port (optionally rewriting the
//!   container port to match);
//! - no two pods holding the same host port are scheduled on one node;
//! - every container, including init containers, can read the assignments
//!   from its environment;
//! - the pod's labels and annotations record the assignments.
//!
//! Host ports come from one of two allocators:
//!
//! - By default, a [`PortCache`] tracks how many running pods use each port
//!   and always hands out the least-used ones. A pod watch keeps these counts
//!   reconciled with the pods actually running in the cluster.
//! - With `enableOrderAssign`, ports are handed out sequentially from a random
//!   starting point, without watching the cluster.
//!
//! [`INJECT_ANNOTATION`]: bcs_webhook_k8s_api::randhostport::INJECT_ANNOTATION
//! [`PORTS_ANNOTATION`]: bcs_webhook_k8s_api::randhostport::PORTS_ANNOTATION

pub mod cache;
mod config;
pub mod heap;
mod index;
mod order;
mod patch;
mod ports;

pub use self::{
    cache::PortCache,
    config::Config,
    heap::{PortEntry, PortHeap},
    order::OrderAssigner,
};
use crate::admission::Plugin;
use anyhow::{Context, Result};
use bcs_webhook_k8s_api::{self as k8s, randhostport as keys};
use kube::{
    api::{Api, ListParams},
    core::{
        admission::{AdmissionRequest, AdmissionResponse, Operation},
        DynamicObject,
    },
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{task, time};
use tracing::Instrument;

/// Injects random host ports into pods.
#[derive(Debug)]
pub struct HostPortInjector {
    allocator: Allocator,
    shutdown: Mutex<Option<Shutdown>>,
}

#[derive(Debug)]
enum Allocator {
    Cache { cache: Arc<PortCache>, index: index::Index },
    Order(OrderAssigner),
}

#[derive(Debug)]
struct Shutdown {
    signal: drain::Signal,
    task: task::JoinHandle<()>,
}

/// Reasons a pod's host ports cannot be injected.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("admission request has no object")]
    MissingObject,

    #[error("failed to decode pod: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("pod has no spec")]
    MissingSpec,

    #[error("no ports requested in annotation {}", keys::PORTS_ANNOTATION)]
    NoPortsRequested,

    #[error("pod declares no container ports")]
    NoPortsDeclared,

    #[error("not all ports match: requested [{requested}] but {matched} container ports matched")]
    PortsMismatch { requested: String, matched: usize },

    #[error(transparent)]
    Allocate(#[from] cache::Error),

    #[error("failed to encode patch: {0}")]
    Encode(#[source] serde_json::Error),
}

// === impl HostPortInjector ===

impl HostPortInjector {
    /// Builds an injector whose allocator has no view of the cluster yet.
    pub fn new(config: &Config) -> Self {
        let allocator = if config.enable_order_assign {
            Allocator::Order(OrderAssigner::new(config.ports()))
        } else {
            let cache = Arc::new(PortCache::new(config.ports()));
            let (index, _) = index::Index::new(cache.clone());
            Allocator::Cache { cache, index }
        };
        Self {
            allocator,
            shutdown: Mutex::new(None),
        }
    }

    /// Builds an injector and, unless ports are assigned in order, waits for
    /// its pod watch to sync.
    ///
    /// The watch uses the config's kubeconfig when one is set, and the
    /// runtime's client otherwise. Fails if the watch has not synced within
    /// `sync_timeout`.
    pub async fn init<S: 'static>(
        config: &Config,
        rt: &mut kubert::Runtime<S>,
        sync_timeout: time::Duration,
    ) -> Result<Self> {
        if config.enable_order_assign {
            tracing::info!(
                start = config.start_port,
                end = config.end_port,
                "assigning host ports in order"
            );
            return Ok(Self::new(config));
        }

        let client = config.client(rt.client()).await?;
        let params = ListParams::default().labels(&keys::injected_selector());
        let events = Box::pin(rt.watch(Api::<k8s::Pod>::all(client), params));

        let cache = Arc::new(PortCache::new(config.ports()));
        let (index, mut synced) = index::Index::new(cache.clone());
        let (signal, drain) = drain::channel();
        let indexing = kubert::index::namespaced(index.shared(), events);
        let task = tokio::spawn(
            async move {
                tokio::select! {
                    _ = indexing => tracing::warn!("pod watch ended"),
                    release = drain.signaled() => {
                        tracing::debug!("pod watch stopped");
                        drop(release);
                    }
                }
            }
            .instrument(tracing::info_span!("index", kind = %"Pod")),
        );
        tracing::info!(
            start = config.start_port,
            end = config.end_port,
            "started Pod indexing"
        );

        let sync = async move {
            while !*synced.borrow() {
                synced.changed().await?;
            }
            Ok::<_, tokio::sync::watch::error::RecvError>(())
        };
        let synced = time::timeout(sync_timeout, sync)
            .await
            .context("timed out waiting for the pod watch to sync")
            .and_then(|res| res.context("pod watch stopped before it synced"));
        if let Err(error) = synced {
            task.abort();
            return Err(error);
        }
        tracing::info!(ports = cache.len(), "hostport cache ready");

        Ok(Self {
            allocator: Allocator::Cache { cache, index },
            shutdown: Mutex::new(Some(Shutdown { signal, task })),
        })
    }

    /// Stops the pod watch, if one is running. Subsequent calls do nothing.
    pub async fn close(&self) {
        let shutdown = self.shutdown.lock().take();
        if let Some(Shutdown { signal, task }) = shutdown {
            signal.drain().await;
            if let Err(error) = task.await {
                tracing::warn!(%error, "pod watch task failed");
            }
            tracing::info!("closed hostport injector");
        }
    }

    /// Periodically logs host port usage, when ports are tracked.
    pub fn dump_ports(&self, every: time::Duration) -> Option<task::JoinHandle<()>> {
        match self.allocator {
            Allocator::Cache { ref index, .. } => Some(index.dump_ports(every)),
            Allocator::Order(_) => None,
        }
    }

    pub fn cache(&self) -> Option<&Arc<PortCache>> {
        match self.allocator {
            Allocator::Cache { ref cache, .. } => Some(cache),
            Allocator::Order(_) => None,
        }
    }

    /// Builds the patch injecting host ports into `pod`.
    ///
    /// Ports are only allocated once every requested port has been matched.
    pub fn inject(&self, pod: &k8s::Pod) -> Result<Vec<json_patch::PatchOperation>, InjectError> {
        let spec = pod.spec.as_ref().ok_or(InjectError::MissingSpec)?;
        let annotations = pod.metadata.annotations.as_ref();
        let requested = ports::requested(annotations);
        let targets = ports::select(spec, &requested)?;
        let change_container_port =
            annotations.map_or(false, |a| a.contains_key(keys::CONTAINER_PORT_ANNOTATION));

        let host_ports = self.allocate(targets.len())?;
        tracing::info!(
            ns = pod.metadata.namespace.as_deref().unwrap_or_default(),
            name = pod.metadata.name.as_deref().unwrap_or_default(),
            ?host_ports,
            "allocated host ports"
        );
        let allocations = targets
            .into_iter()
            .zip(host_ports)
            .map(|(target, host_port)| {
                tracing::debug!(
                    container_port = target.container_port,
                    host_port,
                    "allocated host port"
                );
                patch::Allocation { target, host_port }
            })
            .collect::<Vec<_>>();

        patch::build(pod, &allocations, change_container_port).map_err(InjectError::Encode)
    }

    fn allocate(&self, count: usize) -> Result<Vec<u16>, InjectError> {
        match self.allocator {
            Allocator::Cache { ref cache, .. } => {
                let reserved = cache.reserve(count)?;
                Ok(reserved.into_iter().map(|e| e.port).collect())
            }
            Allocator::Order(ref order) => Ok(order.assign(count)),
        }
    }
}

impl Plugin for HostPortInjector {
    fn name(&self) -> &'static str {
        "randhostport"
    }

    fn handle(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(req);
        if req.kind.kind != "Pod" || req.operation != Operation::Create {
            return rsp;
        }

        let pod = match decode_pod(req) {
            Ok(pod) => pod,
            Err(error) => {
                tracing::warn!(%error, "failed to decode pod");
                return rsp.deny(error);
            }
        };
        if !inject_required(&pod) {
            tracing::trace!("pod did not request host ports");
            return rsp;
        }

        let patches = match self.inject(&pod) {
            Ok(patches) => patches,
            Err(error) => {
                tracing::info!(%error, "denying pod");
                return rsp.deny(error);
            }
        };
        tracing::debug!(patches = patches.len(), "injected host ports");
        match rsp.with_patch(json_patch::Patch(patches)) {
            Ok(rsp) => rsp,
            Err(error) => AdmissionResponse::from(req).deny(error),
        }
    }
}

/// Decodes the request's pod, taking the request's namespace when the object
/// does not carry one.
fn decode_pod(req: &AdmissionRequest<DynamicObject>) -> Result<k8s::Pod, InjectError> {
    let obj = req.object.as_ref().ok_or(InjectError::MissingObject)?;
    let value = serde_json::to_value(obj).map_err(InjectError::Decode)?;
    let mut pod = serde_json::from_value::<k8s::Pod>(value).map_err(InjectError::Decode)?;
    if pod.metadata.namespace.as_deref().unwrap_or_default().is_empty() {
        pod.metadata.namespace = req.namespace.clone();
    }
    Ok(pod)
}

fn inject_required(pod: &k8s::Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(keys::INJECT_ANNOTATION))
        .map_or(false, |v| v == keys::INJECT_ANNOTATION_VALUE)
}

#[cfg(test)]
mod tests;
