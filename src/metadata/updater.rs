use crate::error::SeglogError;
use crate::log::LogAddress;
use crate::metadata::{ContainerMetadata, MetadataSnapshot, SegmentMetadata, SegmentSnapshot};
use crate::operations::{
    AttributeUpdate, AttributeUpdateKind, Operation, OperationBody, SegmentId,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::warn;

#[derive(Debug, Default, Clone)]
struct SegmentDelta {
    length: Option<u64>,
    sealed: bool,
    merged: bool,
    /// Absolute attribute values, resolved at admission.
    attributes: HashMap<u64, i64>,
}

/// Speculative mutations from operations that are not yet durable. Open
/// until sealed; sealed transactions await commit or rollback in id order.
#[derive(Debug, Default)]
struct UpdateTransaction {
    new_segments: Vec<SegmentMetadata>,
    deltas: HashMap<SegmentId, SegmentDelta>,
    claimed_names: HashMap<String, SegmentId>,
}

impl UpdateTransaction {
    fn delta_mut(&mut self, id: SegmentId) -> &mut SegmentDelta {
        self.deltas.entry(id).or_default()
    }
}

/// Validates and admits operations against the effective metadata view
/// (base plus every pending transaction layer), and folds transactions
/// into the base as their frames become durable.
pub struct OperationMetadataUpdater {
    metadata: ContainerMetadata,
    sealed: VecDeque<(u64, UpdateTransaction)>,
    open: Option<UpdateTransaction>,
    next_transaction_id: u64,
}

impl OperationMetadataUpdater {
    pub fn new(metadata: ContainerMetadata) -> Self {
        Self {
            metadata,
            sealed: VecDeque::new(),
            open: None,
            next_transaction_id: 0,
        }
    }

    pub fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut ContainerMetadata {
        &mut self.metadata
    }

    pub fn next_operation_sequence_number(&self) -> u64 {
        self.metadata.next_operation_sequence_number()
    }

    pub fn record_truncation_marker(&mut self, sequence_number: u64, address: LogAddress) {
        self.metadata.record_truncation_marker(sequence_number, address);
    }

    pub fn pending_transaction_count(&self) -> usize {
        self.sealed.len() + usize::from(self.open.is_some())
    }

    /// Validates `op` against the effective view and populates its
    /// admission-assigned fields: offsets, lengths, fresh segment ids,
    /// checkpoint snapshots, and attribute updates rewritten to the
    /// absolute values they resolve to.
    pub fn pre_process(&mut self, op: &mut Operation) -> Result<(), SeglogError> {
        match op.body_mut() {
            OperationBody::SegmentAppend {
                segment_id,
                offset,
                attribute_updates,
                ..
            } => {
                let segment = self.require_mutable_segment(*segment_id)?;
                resolve_attribute_updates(&segment, attribute_updates)?;
                *offset = Some(segment.length);
                Ok(())
            }
            OperationBody::SegmentSeal {
                segment_id,
                segment_length,
            } => {
                let segment = self.require_mutable_segment(*segment_id)?;
                *segment_length = Some(segment.length);
                Ok(())
            }
            OperationBody::SegmentMap {
                segment_id, name, ..
            } => {
                if self.effective_segment_id_for(name).is_some() {
                    return Err(SeglogError::BadOperation(format!(
                        "segment name '{name}' is already mapped"
                    )));
                }
                *segment_id = Some(self.metadata.assign_segment_id());
                Ok(())
            }
            OperationBody::SegmentMerge {
                target_id,
                source_id,
                target_offset,
                length,
            } => {
                if target_id == source_id {
                    return Err(SeglogError::BadOperation(
                        "cannot merge a segment into itself".into(),
                    ));
                }
                let target = self.require_mutable_segment(*target_id)?;
                let source = self.require_segment(*source_id)?;
                if source.merged {
                    return Err(SeglogError::BadOperation(format!(
                        "segment {source_id} has already been merged"
                    )));
                }
                if !source.sealed {
                    return Err(SeglogError::BadOperation(format!(
                        "segment {source_id} must be sealed before it can be merged"
                    )));
                }
                *target_offset = Some(target.length);
                *length = Some(source.length);
                Ok(())
            }
            OperationBody::UpdateAttributes {
                segment_id,
                attribute_updates,
            } => {
                let segment = self.require_mutable_segment(*segment_id)?;
                resolve_attribute_updates(&segment, attribute_updates)?;
                Ok(())
            }
            OperationBody::MetadataCheckpoint { snapshot } => {
                let effective = self.effective_snapshot();
                *snapshot = rmp_serde::to_vec(&effective)
                    .map_err(|e| SeglogError::Encode(e.to_string()))?;
                Ok(())
            }
            OperationBody::Probe => Ok(()),
        }
    }

    /// Applies an admitted operation's mutation to the current open
    /// transaction. The values assigned at admission are applied as-is:
    /// a rollback may have discarded the layers they were computed
    /// against, but then this operation rides a failed frame and its
    /// transaction unwinds with it. Only an operation that was never
    /// admitted is an invariant violation here.
    pub fn accept(&mut self, op: &Operation) -> Result<(), SeglogError> {
        match op.body() {
            OperationBody::SegmentAppend {
                segment_id,
                offset,
                data,
                attribute_updates,
            } => {
                let offset = offset.ok_or_else(|| {
                    SeglogError::DataCorruption("append accepted before admission".into())
                })?;
                let delta = self.open_transaction().delta_mut(*segment_id);
                delta.length = Some(offset + data.len() as u64);
                delta
                    .attributes
                    .extend(attribute_updates.iter().map(|u| (u.attribute_id, u.value)));
                Ok(())
            }
            OperationBody::SegmentSeal {
                segment_id,
                segment_length,
            } => {
                if segment_length.is_none() {
                    return Err(SeglogError::DataCorruption(
                        "seal accepted before admission".into(),
                    ));
                }
                self.open_transaction().delta_mut(*segment_id).sealed = true;
                Ok(())
            }
            OperationBody::SegmentMap {
                segment_id,
                name,
                length,
                sealed,
            } => {
                let id = segment_id.ok_or_else(|| {
                    SeglogError::DataCorruption("map accepted before admission".into())
                })?;
                let txn = self.open_transaction();
                txn.new_segments
                    .push(SegmentMetadata::new(id, name.clone(), *length, *sealed));
                txn.claimed_names.insert(name.clone(), id);
                Ok(())
            }
            OperationBody::SegmentMerge {
                target_id,
                source_id,
                target_offset,
                length,
            } => {
                let (target_offset, length) = match (target_offset, length) {
                    (Some(o), Some(l)) => (*o, *l),
                    _ => {
                        return Err(SeglogError::DataCorruption(
                            "merge accepted before admission".into(),
                        ));
                    }
                };
                let txn = self.open_transaction();
                txn.delta_mut(*target_id).length = Some(target_offset + length);
                txn.delta_mut(*source_id).merged = true;
                Ok(())
            }
            OperationBody::UpdateAttributes {
                segment_id,
                attribute_updates,
            } => {
                self.open_transaction()
                    .delta_mut(*segment_id)
                    .attributes
                    .extend(attribute_updates.iter().map(|u| (u.attribute_id, u.value)));
                Ok(())
            }
            OperationBody::MetadataCheckpoint { .. } | OperationBody::Probe => Ok(()),
        }
    }

    /// Seals the current open transaction (creating an empty one if none)
    /// and returns its id. Ids are dense and monotone from 0; callers rely
    /// on `prev + 1` arithmetic for rollback boundaries.
    pub fn seal_transaction(&mut self) -> u64 {
        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        let txn = self.open.take().unwrap_or_default();
        self.sealed.push_back((id, txn));
        id
    }

    /// Merges every sealed transaction with id ≤ `up_to_id` into the base
    /// metadata, in id order.
    pub fn commit(&mut self, up_to_id: u64) {
        while self.sealed.front().is_some_and(|(id, _)| *id <= up_to_id) {
            if let Some((_, txn)) = self.sealed.pop_front() {
                self.apply_to_base(txn);
            }
        }
    }

    /// Discards every transaction with id ≥ `from_id`, including the open
    /// one. The base metadata is untouched.
    pub fn rollback(&mut self, from_id: u64) {
        self.sealed.retain(|(id, _)| *id < from_id);
        self.open = None;
    }

    /// Effective metadata: base plus every pending transaction layer.
    pub fn effective_snapshot(&self) -> MetadataSnapshot {
        let mut ids: BTreeSet<SegmentId> = BTreeSet::new();
        let base = self.metadata.snapshot();
        ids.extend(base.segments.iter().map(|s| s.id));
        for txn in self.transaction_layers() {
            ids.extend(txn.new_segments.iter().map(|s| s.id));
        }
        let segments = ids
            .into_iter()
            .filter_map(|id| self.effective_segment(id))
            .map(|segment| SegmentSnapshot::from_metadata(&segment))
            .collect();
        MetadataSnapshot {
            container_id: self.metadata.container_id(),
            segments,
            truncation_markers: base.truncation_markers,
        }
    }

    fn transaction_layers(&self) -> impl Iterator<Item = &UpdateTransaction> {
        self.sealed.iter().map(|(_, txn)| txn).chain(self.open.iter())
    }

    fn effective_segment(&self, id: SegmentId) -> Option<SegmentMetadata> {
        let mut view = self.metadata.segment(id).cloned();
        for txn in self.transaction_layers() {
            if view.is_none() {
                view = txn.new_segments.iter().find(|s| s.id == id).cloned();
            }
            if let (Some(segment), Some(delta)) = (view.as_mut(), txn.deltas.get(&id)) {
                if let Some(length) = delta.length {
                    segment.length = length;
                }
                segment.sealed |= delta.sealed;
                segment.merged |= delta.merged;
                segment
                    .attributes
                    .extend(delta.attributes.iter().map(|(k, v)| (*k, *v)));
            }
        }
        view
    }

    fn effective_segment_id_for(&self, name: &str) -> Option<SegmentId> {
        self.transaction_layers()
            .find_map(|txn| txn.claimed_names.get(name))
            .copied()
            .or_else(|| self.metadata.segment_id_for(name))
    }

    fn require_segment(&self, id: SegmentId) -> Result<SegmentMetadata, SeglogError> {
        self.effective_segment(id).ok_or_else(|| {
            SeglogError::BadOperation(format!("segment {id} is not mapped in this container"))
        })
    }

    fn require_mutable_segment(&self, id: SegmentId) -> Result<SegmentMetadata, SeglogError> {
        let segment = self.require_segment(id)?;
        if segment.merged {
            return Err(SeglogError::BadOperation(format!(
                "segment {id} has been merged"
            )));
        }
        if segment.sealed {
            return Err(SeglogError::BadOperation(format!(
                "segment {id} is sealed"
            )));
        }
        Ok(segment)
    }

    fn open_transaction(&mut self) -> &mut UpdateTransaction {
        self.open.get_or_insert_with(UpdateTransaction::default)
    }

    fn apply_to_base(&mut self, txn: UpdateTransaction) {
        for segment in txn.new_segments {
            self.metadata.insert_segment(segment);
        }
        for (id, delta) in txn.deltas {
            match self.metadata.segment_mut(id) {
                Some(segment) => {
                    if let Some(length) = delta.length {
                        segment.length = length;
                    }
                    segment.sealed |= delta.sealed;
                    segment.merged |= delta.merged;
                    segment.attributes.extend(delta.attributes);
                }
                None => {
                    warn!(segment_id = id, "committed delta for unknown segment");
                }
            }
        }
    }
}

/// Validates a list of attribute updates against a segment view and
/// rewrites each update's value to the absolute value it resolves to, so
/// that applying them later is a plain insert. Updates are folded left to
/// right; later entries observe earlier ones.
fn resolve_attribute_updates(
    segment: &SegmentMetadata,
    updates: &mut [AttributeUpdate],
) -> Result<(), SeglogError> {
    let mut resolved: HashMap<u64, i64> = HashMap::new();
    for update in updates.iter_mut() {
        let current = resolved
            .get(&update.attribute_id)
            .copied()
            .or_else(|| segment.attributes.get(&update.attribute_id).copied());
        let next = match update.kind {
            AttributeUpdateKind::Replace => update.value,
            AttributeUpdateKind::ReplaceIfGreater => match current {
                Some(current) if update.value <= current => {
                    return Err(SeglogError::BadOperation(format!(
                        "attribute {} update {} is not greater than current {current}",
                        update.attribute_id, update.value
                    )));
                }
                _ => update.value,
            },
            AttributeUpdateKind::Accumulate => {
                current.unwrap_or(0).checked_add(update.value).ok_or_else(|| {
                    SeglogError::BadOperation(format!(
                        "attribute {} accumulation overflows",
                        update.attribute_id
                    ))
                })?
            }
            AttributeUpdateKind::AssertEquals => {
                if current != Some(update.value) {
                    return Err(SeglogError::BadOperation(format!(
                        "attribute {} is {current:?}, expected {}",
                        update.attribute_id, update.value
                    )));
                }
                update.value
            }
        };
        update.value = next;
        resolved.insert(update.attribute_id, next);
    }
    Ok(())
}
