//! Snapshots: named checkpoints forming a lineage DAG
//!
//! Parent edges are stored as snapshot ids under the same brain and are
//! resolved through the store, never held as in-memory pointers.

use serde::{Deserialize, Serialize};

use crate::model::ModelRef;

/// A named, shareable checkpoint of brain state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot identifier
    pub snapshot_id: String,
    /// Display name
    pub display_name: String,
    /// Creation time
    pub created_micros: u64,
    /// Session the snapshot was taken from
    pub session_id: String,
    /// Latest model of that session at creation
    pub model: Option<ModelRef>,
    /// Size of the referenced artifact
    pub size_bytes: u64,
    /// Parent snapshots; more than one means a merge
    pub ancestor_ids: Vec<String>,
    /// Models the session trained since its ancestors
    pub models: Vec<ModelRef>,
}
