//! Outpost core types shared by the merge engine and the watch wiring.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Stable identity of one pod across its lifetime (`metadata.uid`).
pub type Uid = [u8; 16];

/// Immutable-at-capture copy of a pod, reduced to the fields the edge side
/// acts on. `resource_version` is carried for diagnostics only; the
/// significance detector never compares it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub uid: Uid,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
    /// `metadata.deletionTimestamp` as epoch seconds; `Some` means the pod
    /// is already terminating.
    pub deletion_ts: Option<i64>,
    /// Labels as sorted key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    pub spec: serde_json::Value,
    pub status: serde_json::Value,
}

impl PodSnapshot {
    pub fn is_terminating(&self) -> bool {
        self.deletion_ts.is_some()
    }

    /// `namespace/name` display key.
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

/// One watch notification. The same shape flows through the raw queue and
/// the merged stream; merging filters and reclassifies, it never reshapes.
///
/// `Unknown` is the forward-compat arm for event kinds this engine does not
/// recognize; the merge loop drops it without touching state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PodEvent {
    Added(PodSnapshot),
    Modified(PodSnapshot),
    Deleted(PodSnapshot),
    Unknown(PodSnapshot),
}

impl PodEvent {
    pub fn snapshot(&self) -> &PodSnapshot {
        match self {
            PodEvent::Added(s) | PodEvent::Modified(s) | PodEvent::Deleted(s) | PodEvent::Unknown(s) => s,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PodEvent::Added(_) => "added",
            PodEvent::Modified(_) => "modified",
            PodEvent::Deleted(_) => "deleted",
            PodEvent::Unknown(_) => "unknown",
        }
    }
}

pub mod prelude {
    pub use super::{PodEvent, PodSnapshot, Uid};
}
