//! Keeps the port cache's usage counts in step with the injected pods that are
//! actually running.
//!
//! Every injected pod carries one `<hostPort>.<suffix>` label per host port it
//! holds. The index remembers those labels by pod so that:
//!
//! - when a pod is applied, the usage of each of its ports is recounted from
//!   the live set of pods, correcting any drift (e.g. reservations for pods
//!   that were never created, or counts lost across a restart);
//! - when a pod is deleted, each of its ports is released once.

use super::cache::PortCache;
use crate::pod::PortSet;
use ahash::AHashMap;
use bcs_webhook_k8s_api::{self as k8s, randhostport as keys, ResourceExt};
use parking_lot::RwLock;
use std::{collections::hash_map::Entry, sync::Arc};
use tokio::{
    sync::watch,
    time::{Duration, Instant},
};

#[derive(Clone, Debug)]
pub(crate) struct Index {
    index: Arc<RwLock<PodIndex>>,
}

#[derive(Debug)]
pub(crate) struct PodIndex {
    cache: Arc<PortCache>,

    /// Host ports held by each injected pod, by namespace and pod name.
    namespaces: AHashMap<String, AHashMap<String, PortSet>>,

    /// Set once the initial pod list has been indexed.
    synced: watch::Sender<bool>,

    changed: Instant,
}

// === impl Index ===

impl Index {
    pub(crate) fn new(cache: Arc<PortCache>) -> (Self, watch::Receiver<bool>) {
        let (synced, synced_rx) = watch::channel(false);
        let index = PodIndex {
            cache,
            namespaces: AHashMap::new(),
            synced,
            changed: Instant::now(),
        };
        let index = Self {
            index: Arc::new(RwLock::new(index)),
        };
        (index, synced_rx)
    }

    pub(crate) fn shared(&self) -> Arc<RwLock<PodIndex>> {
        self.index.clone()
    }

    /// Periodically logs a table of host port usage when it has changed.
    pub(crate) fn dump_ports(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        tracing::debug!(?every, "dumping hostport usage changes");
        let index = self.index.clone();
        tokio::spawn(async move {
            use comfy_table::{presets::UTF8_FULL, *};

            let mut interval = tokio::time::interval(every);
            let mut last_dumped = None;
            loop {
                interval.tick().await;
                let (changed, entries) = {
                    let index = index.read();
                    (index.changed, index.cache.entries())
                };
                if last_dumped == Some(changed) {
                    continue;
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(Row::from(vec!["HOSTPORT", "PODS"]));
                let in_use = entries.iter().filter(|e| e.quantity > 0);
                for entry in in_use {
                    table.add_row(Row::from(vec![
                        Cell::new(entry.port),
                        Cell::new(entry.quantity),
                    ]));
                }
                tracing::info!(ports = entries.len(), "hostport usage\n{table}");
                last_dumped = Some(changed);
            }
        })
    }
}

// === impl PodIndex ===

impl PodIndex {
    /// Sets the port's usage to the number of indexed pods holding it.
    fn reconcile(&self, port: u16) {
        let live = self
            .namespaces
            .values()
            .flat_map(|pods| pods.values())
            .filter(|ports| ports.contains(&port))
            .count() as u64;
        match self.cache.set_quantity(port, live) {
            Ok(()) => tracing::debug!(%port, pods = live, "reconciled hostport usage"),
            Err(error) => tracing::warn!(%error, "failed to reconcile hostport usage"),
        }
    }

    #[cfg(test)]
    fn pod_ports(&self, ns: &str, name: &str) -> Option<&PortSet> {
        self.namespaces.get(ns)?.get(name)
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for PodIndex {
    fn apply(&mut self, pod: k8s::Pod) {
        let ns = match pod.namespace() {
            Some(ns) => ns,
            None => {
                tracing::warn!(name = %pod.name_unchecked(), "ignoring pod without a namespace");
                return;
            }
        };
        let name = pod.name_unchecked();
        let _span = tracing::info_span!("apply", %ns, %name).entered();

        let ports = hostport_labels(&pod);
        let previous = {
            let pods = self.namespaces.entry(ns).or_default();
            if ports.is_empty() {
                pods.remove(&name)
            } else {
                pods.insert(name, ports.clone())
            }
        };

        // Ports the pod no longer holds are recounted too.
        let released = previous
            .into_iter()
            .flatten()
            .filter(|port| !ports.contains(port));
        let touched = ports.iter().copied().chain(released).collect::<Vec<_>>();
        for port in touched {
            self.reconcile(port);
        }
        self.changed = Instant::now();
    }

    fn delete(&mut self, ns: String, name: String) {
        let _span = tracing::info_span!("delete", %ns, %name).entered();
        if let Entry::Occupied(mut pods) = self.namespaces.entry(ns) {
            if let Some(ports) = pods.get_mut().remove(&name) {
                for port in ports {
                    match self.cache.dec_quantity(port) {
                        Ok(()) => tracing::debug!(%port, "released hostport"),
                        Err(error) => tracing::warn!(%error, "failed to release hostport"),
                    }
                }
                self.changed = Instant::now();
            }

            if pods.get().is_empty() {
                pods.remove();
            }
        } else {
            tracing::debug!("tried to delete a pod that was never indexed");
        }
    }

    fn reset(&mut self, pods: Vec<k8s::Pod>, removed: kubert::index::NamespacedRemoved) {
        let _span = tracing::info_span!("reset").entered();
        for pod in pods.into_iter() {
            self.apply(pod);
        }
        for (ns, names) in removed.into_iter() {
            for name in names.into_iter() {
                self.delete(ns.clone(), name);
            }
        }

        if !*self.synced.borrow() {
            tracing::info!("pod index synced");
        }
        self.synced.send_replace(true);
    }
}

/// Gets the host ports named by a pod's labels.
fn hostport_labels(pod: &k8s::Pod) -> PortSet {
    pod.labels()
        .iter()
        .filter_map(|(key, value)| keys::parse_hostport_label(key, value))
        .collect()
}
