use crate::log::LogAddress;
use crate::operations::SegmentId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod updater;

/// Mutable per-segment record in the container's catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMetadata {
    pub id: SegmentId,
    pub name: String,
    pub length: u64,
    pub sealed: bool,
    pub merged: bool,
    pub attributes: HashMap<u64, i64>,
}

impl SegmentMetadata {
    pub fn new(id: SegmentId, name: impl Into<String>, length: u64, sealed: bool) -> Self {
        Self {
            id,
            name: name.into(),
            length,
            sealed,
            merged: false,
            attributes: HashMap::new(),
        }
    }
}

/// Base metadata for one container. Speculative mutations live in the
/// updater's transaction layers; everything here is durably-committed
/// state, except the two counters, which are never rolled back.
#[derive(Debug)]
pub struct ContainerMetadata {
    container_id: u64,
    segments: HashMap<SegmentId, SegmentMetadata>,
    segment_ids_by_name: HashMap<String, SegmentId>,
    truncation_markers: BTreeMap<u64, LogAddress>,
    next_sequence: AtomicU64,
    next_segment_id: AtomicU64,
}

impl ContainerMetadata {
    pub fn new(container_id: u64) -> Self {
        Self {
            container_id,
            segments: HashMap::new(),
            segment_ids_by_name: HashMap::new(),
            truncation_markers: BTreeMap::new(),
            next_sequence: AtomicU64::new(1),
            next_segment_id: AtomicU64::new(1),
        }
    }

    pub fn container_id(&self) -> u64 {
        self.container_id
    }

    pub fn segment(&self, id: SegmentId) -> Option<&SegmentMetadata> {
        self.segments.get(&id)
    }

    pub fn segment_id_for(&self, name: &str) -> Option<SegmentId> {
        self.segment_ids_by_name.get(name).copied()
    }

    /// Strictly increasing across every operation this container has ever
    /// admitted; never reused, even after rollback.
    pub fn next_operation_sequence_number(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// The next sequence number that would be assigned. Rollback never
    /// rewinds this.
    pub fn operation_sequence_watermark(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    pub fn assign_segment_id(&self) -> SegmentId {
        self.next_segment_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Records "the durable log up to `address` covers operations up to
    /// `sequence_number`". Idempotent; applied directly to base state.
    pub fn record_truncation_marker(&mut self, sequence_number: u64, address: LogAddress) {
        self.truncation_markers.insert(sequence_number, address);
    }

    pub fn truncation_markers(&self) -> &BTreeMap<u64, LogAddress> {
        &self.truncation_markers
    }

    /// Registers a segment directly in the base metadata. This is the
    /// bootstrap seam: recovery seeds the catalog here before the
    /// processor starts; live mappings go through `SegmentMap` operations.
    pub fn insert_segment(&mut self, segment: SegmentMetadata) {
        self.segment_ids_by_name
            .insert(segment.name.clone(), segment.id);
        self.segments.insert(segment.id, segment);
    }

    pub(crate) fn segment_mut(&mut self, id: SegmentId) -> Option<&mut SegmentMetadata> {
        self.segments.get_mut(&id)
    }

    /// Deterministic snapshot of committed state. Counters are excluded so
    /// that rollback comparisons and checkpoint payloads are stable.
    pub fn snapshot(&self) -> MetadataSnapshot {
        let mut segments: Vec<SegmentSnapshot> = self
            .segments
            .values()
            .map(SegmentSnapshot::from_metadata)
            .collect();
        segments.sort_by_key(|s| s.id);
        MetadataSnapshot {
            container_id: self.container_id,
            segments,
            truncation_markers: self
                .truncation_markers
                .iter()
                .map(|(seq, addr)| (*seq, *addr))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    pub id: SegmentId,
    pub name: String,
    pub length: u64,
    pub sealed: bool,
    pub merged: bool,
    /// Sorted by attribute id for deterministic encoding.
    pub attributes: Vec<(u64, i64)>,
}

impl SegmentSnapshot {
    pub(crate) fn from_metadata(segment: &SegmentMetadata) -> Self {
        let mut attributes: Vec<(u64, i64)> =
            segment.attributes.iter().map(|(k, v)| (*k, *v)).collect();
        attributes.sort_by_key(|(id, _)| *id);
        Self {
            id: segment.id,
            name: segment.name.clone(),
            length: segment.length,
            sealed: segment.sealed,
            merged: segment.merged,
            attributes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub container_id: u64,
    pub segments: Vec<SegmentSnapshot>,
    pub truncation_markers: Vec<(u64, LogAddress)>,
}
