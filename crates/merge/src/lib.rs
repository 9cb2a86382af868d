//! Outpost merge engine: collapses the raw pod watch stream into the
//! reduced stream of meaningful changes forwarded to edge sites.

#![forbid(unsafe_code)]

use metrics::counter;
use outpost_core::{PodEvent, PodSnapshot, Uid};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine construction errors. The running loop has no error surface; it
/// absorbs anomalies and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("event buffer capacity must be positive (got {0})")]
    InvalidBuffer(usize),
    #[error("attaching to upstream watch: {0}")]
    Attach(#[from] anyhow::Error),
}

/// Engine tuning supplied by the wiring layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the raw event queue and the merged stream.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { event_buffer: 1024 }
    }
}

/// Last-retained snapshot per live pod, keyed by uid. Owned by the merge
/// loop task; one writer and one reader, so no lock.
#[derive(Debug, Default)]
pub struct PodStateStore {
    map: FxHashMap<Uid, PodSnapshot>,
}

impl PodStateStore {
    pub fn get(&self, uid: &Uid) -> Option<&PodSnapshot> { self.map.get(uid) }
    pub fn put(&mut self, snap: PodSnapshot) { self.map.insert(snap.uid, snap); }
    pub fn remove(&mut self, uid: &Uid) { self.map.remove(uid); }
    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

/// True when the change between two snapshots matters to an edge consumer:
/// labels, spec, status or the deletion marker differ. Revision markers are
/// never compared, so resync repeats of an unchanged object stay silent.
pub fn is_significant(old: &PodSnapshot, new: &PodSnapshot) -> bool {
    old.labels != new.labels
        || old.spec != new.spec
        || old.status != new.status
        || old.deletion_ts != new.deletion_ts
}

/// Apply one raw event to the store and decide what, if anything, to
/// forward. Total over its input; the unknown arm drops without mutating.
pub fn merge_event(store: &mut PodStateStore, event: PodEvent) -> Option<PodEvent> {
    match event {
        PodEvent::Added(snap) => match store.get(&snap.uid) {
            // Re-add of a tracked pod is a resync replay.
            Some(old) => {
                let changed = is_significant(old, &snap);
                if changed {
                    store.put(snap.clone());
                    Some(PodEvent::Modified(snap))
                } else {
                    None
                }
            }
            None => {
                let terminating = snap.is_terminating();
                store.put(snap.clone());
                if terminating {
                    // Already terminating: the deletion marker on the payload
                    // routes this into downstream deletion handling.
                    Some(PodEvent::Modified(snap))
                } else {
                    Some(PodEvent::Added(snap))
                }
            }
        },
        PodEvent::Modified(snap) => match store.get(&snap.uid) {
            Some(old) => {
                let changed = is_significant(old, &snap);
                if changed {
                    store.put(snap.clone());
                    Some(PodEvent::Modified(snap))
                } else {
                    None
                }
            }
            // First observation arriving as Modified: bootstrap as Added.
            None => {
                store.put(snap.clone());
                Some(PodEvent::Added(snap))
            }
        },
        // Deletion is terminal and never suppressed.
        PodEvent::Deleted(snap) => {
            store.remove(&snap.uid);
            Some(PodEvent::Deleted(snap))
        }
        PodEvent::Unknown(snap) => {
            warn!(pod = %snap.key(), "unsupported watch event type; ignoring");
            None
        }
    }
}

/// Cloneable producer handle for the raw event queue. One callback per
/// upstream notification kind; a full queue parks the caller rather than
/// dropping the event.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<PodEvent>,
}

impl EventSink {
    /// Bounded raw queue: producers share the sink, the merge loop owns the
    /// receiver.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<PodEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn added(&self, snapshot: PodSnapshot) {
        self.send(PodEvent::Added(snapshot)).await
    }

    pub async fn modified(&self, snapshot: PodSnapshot) {
        self.send(PodEvent::Modified(snapshot)).await
    }

    pub async fn deleted(&self, snapshot: PodSnapshot) {
        self.send(PodEvent::Deleted(snapshot)).await
    }

    pub async fn send(&self, event: PodEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("merge loop gone; dropping event");
        }
    }
}

/// Upstream watch subscription the engine registers its callbacks against.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn attach(&self, sink: EventSink) -> Result<(), MergeError>;
}

/// Handle to a running merge engine. Owns the merged stream receiver; the
/// single downstream subscriber reads through [`PodMerger::events`].
#[derive(Debug)]
pub struct PodMerger {
    merged: mpsc::Receiver<PodEvent>,
}

impl PodMerger {
    /// Validate the config, attach to the upstream subscription and spawn
    /// the merge loop. The loop runs until the raw queue closes, the merged
    /// stream receiver is dropped, or `shutdown` is cancelled.
    pub async fn start(
        config: &EngineConfig,
        source: &dyn EventSource,
        shutdown: CancellationToken,
    ) -> Result<Self, MergeError> {
        if config.event_buffer == 0 {
            return Err(MergeError::InvalidBuffer(config.event_buffer));
        }
        let (sink, raw_rx) = EventSink::bounded(config.event_buffer);
        let (merged_tx, merged_rx) = mpsc::channel(config.event_buffer);
        source.attach(sink).await?;
        tokio::spawn(merge_loop(raw_rx, merged_tx, shutdown));
        Ok(Self { merged: merged_rx })
    }

    /// Merged event stream. Always the same receiver for the engine's
    /// lifetime; `&mut self` keeps it single-subscriber.
    pub fn events(&mut self) -> &mut mpsc::Receiver<PodEvent> {
        &mut self.merged
    }
}

async fn merge_loop(
    mut raw: mpsc::Receiver<PodEvent>,
    merged: mpsc::Sender<PodEvent>,
    shutdown: CancellationToken,
) {
    let mut store = PodStateStore::default();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            maybe = raw.recv() => match maybe {
                Some(ev) => ev,
                None => {
                    debug!("raw event queue closed; exiting merge loop");
                    break;
                }
            },
        };
        let Some(out) = merge_event(&mut store, event) else {
            counter!("merge_suppressed_total", 1);
            continue;
        };
        counter!("merge_forwarded_total", 1);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = merged.send(out) => {
                if res.is_err() {
                    debug!("merged stream receiver dropped; exiting merge loop");
                    break;
                }
            }
        }
    }
    info!(tracked = store.len(), "merge loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn base() -> PodSnapshot {
        PodSnapshot {
            uid: [1u8; 16],
            namespace: Some("edge".into()),
            name: "sensor-0".into(),
            resource_version: Some("100".into()),
            deletion_ts: None,
            labels: smallvec![("app".to_string(), "sensor".to_string())],
            spec: serde_json::json!({"nodeName": "edge-node-0"}),
            status: serde_json::json!({"phase": "Running"}),
        }
    }

    #[test]
    fn identical_snapshots_are_not_significant() {
        let s = base();
        assert!(!is_significant(&s, &s));
    }

    #[test]
    fn revision_marker_change_alone_is_not_significant() {
        let old = base();
        let mut new = base();
        new.resource_version = Some("101".into());
        assert!(!is_significant(&old, &new));
    }

    #[test]
    fn label_change_is_significant() {
        let old = base();
        let mut new = base();
        new.labels = smallvec![("app".to_string(), "camera".to_string())];
        assert!(is_significant(&old, &new));
    }

    #[test]
    fn spec_change_is_significant() {
        let old = base();
        let mut new = base();
        new.spec = serde_json::json!({"nodeName": "edge-node-1"});
        assert!(is_significant(&old, &new));
    }

    #[test]
    fn status_change_is_significant() {
        let old = base();
        let mut new = base();
        new.status = serde_json::json!({"phase": "Succeeded"});
        assert!(is_significant(&old, &new));
    }

    #[test]
    fn deletion_marker_change_is_significant() {
        let old = base();
        let mut new = base();
        new.deletion_ts = Some(1_577_836_800);
        assert!(is_significant(&old, &new));
    }
}
