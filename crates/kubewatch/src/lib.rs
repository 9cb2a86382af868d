//! Outpost kube integration: the upstream pod watch subscription that feeds
//! the merge engine's raw queue.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use outpost_core::{PodSnapshot, Uid};
use outpost_merge::{EventSink, EventSource, MergeError};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn to_uid(uid_str: &str) -> Result<Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

/// Capture an immutable snapshot of a pod at event time, reduced to the
/// fields the merge engine and the edge side act on.
pub fn snapshot_from(pod: &Pod) -> Result<PodSnapshot> {
    let meta = &pod.metadata;
    let uid_str = meta
        .uid
        .as_deref()
        .ok_or_else(|| anyhow!("pod missing metadata.uid"))?;
    let uid = to_uid(uid_str)?;
    let labels: SmallVec<[(String, String); 8]> = meta
        .labels
        .iter()
        .flat_map(|m| m.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let spec = serde_json::to_value(&pod.spec).context("serializing pod spec")?;
    let status = serde_json::to_value(&pod.status).context("serializing pod status")?;
    Ok(PodSnapshot {
        uid,
        namespace: meta.namespace.clone(),
        name: meta.name.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone(),
        deletion_ts: meta.deletion_timestamp.as_ref().map(|t| t.0.timestamp()),
        labels,
        spec,
        status,
    })
}

/// Upstream pod watch subscription scoped to one namespace (or all).
pub struct PodWatcher {
    client: Client,
    namespace: Option<String>,
}

impl PodWatcher {
    /// Build a client from the ambient kubeconfig / in-cluster environment.
    pub async fn connect(namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self {
            client,
            namespace: namespace.map(|s| s.to_string()),
        })
    }

    fn api(&self) -> Api<Pod> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl EventSource for PodWatcher {
    async fn attach(&self, sink: EventSink) -> Result<(), MergeError> {
        let api = self.api();
        // Probe the API server so an unreachable or unauthorized upstream
        // fails construction instead of the background task.
        api.list(&ListParams::default().limit(1))
            .await
            .map_err(|e| MergeError::Attach(anyhow::Error::new(e).context("listing pods")))?;
        let ns = self.namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = run_watch(api, sink).await {
                error!(error = ?e, ns = ?ns, "pod watcher failed");
            }
        });
        Ok(())
    }
}

async fn run_watch(api: Api<Pod>, sink: EventSink) -> Result<()> {
    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    info!("pod watcher started");
    while let Some(ev) = stream.try_next().await? {
        counter!("watch_events_total", 1);
        match ev {
            // Live changes arrive untyped between add and update; the merge
            // loop bootstraps first observations back to Added.
            Event::Applied(pod) => match snapshot_from(&pod) {
                Ok(snap) => sink.modified(snap).await,
                Err(e) => warn!(error = ?e, "skipping malformed pod event"),
            },
            Event::Deleted(pod) => match snapshot_from(&pod) {
                Ok(snap) => sink.deleted(snap).await,
                Err(e) => warn!(error = ?e, "skipping malformed pod event"),
            },
            // Relist replays land as re-adds; the merge loop suppresses the
            // unchanged ones.
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for pod in &list {
                    match snapshot_from(pod) {
                        Ok(snap) => sink.added(snap).await,
                        Err(e) => warn!(error = ?e, "skipping malformed pod event"),
                    }
                }
            }
        }
    }
    warn!("pod watcher stream ended");
    Ok(())
}
