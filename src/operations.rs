use crate::error::SeglogError;
use serde::{Deserialize, Serialize};

pub type SegmentId = u64;

/// Sequence numbers are assigned at admission and start at 1; 0 marks an
/// operation that has not been admitted yet.
pub const UNASSIGNED_SEQUENCE: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeUpdateKind {
    /// Unconditionally set the attribute.
    Replace,
    /// Set only if the new value is strictly greater than the current one.
    ReplaceIfGreater,
    /// Add the value to the current one (missing counts as zero).
    Accumulate,
    /// Assert the attribute already equals the value; no mutation.
    AssertEquals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub attribute_id: u64,
    pub kind: AttributeUpdateKind,
    pub value: i64,
}

impl AttributeUpdate {
    pub fn new(attribute_id: u64, kind: AttributeUpdateKind, value: i64) -> Self {
        Self {
            attribute_id,
            kind,
            value,
        }
    }
}

/// Fields documented as "assigned" are populated by the metadata updater
/// during admission and are `None`/empty until then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationBody {
    SegmentAppend {
        segment_id: SegmentId,
        /// Assigned: segment length at admission.
        offset: Option<u64>,
        data: Vec<u8>,
        attribute_updates: Vec<AttributeUpdate>,
    },
    SegmentSeal {
        segment_id: SegmentId,
        /// Assigned: final segment length at admission.
        segment_length: Option<u64>,
    },
    SegmentMap {
        /// Assigned: fresh container-local id.
        segment_id: Option<SegmentId>,
        name: String,
        length: u64,
        sealed: bool,
    },
    SegmentMerge {
        target_id: SegmentId,
        source_id: SegmentId,
        /// Assigned: target length at admission.
        target_offset: Option<u64>,
        /// Assigned: source length at admission.
        length: Option<u64>,
    },
    UpdateAttributes {
        segment_id: SegmentId,
        attribute_updates: Vec<AttributeUpdate>,
    },
    MetadataCheckpoint {
        /// Assigned: serialized effective metadata snapshot.
        snapshot: Vec<u8>,
    },
    /// Produces no frame entry; completes once every earlier serializable
    /// operation has committed. Resolves with the unassigned sequence.
    Probe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    sequence_number: u64,
    body: OperationBody,
}

impl Operation {
    pub fn segment_append(
        segment_id: SegmentId,
        data: Vec<u8>,
        attribute_updates: Vec<AttributeUpdate>,
    ) -> Self {
        Self::from_body(OperationBody::SegmentAppend {
            segment_id,
            offset: None,
            data,
            attribute_updates,
        })
    }

    pub fn segment_seal(segment_id: SegmentId) -> Self {
        Self::from_body(OperationBody::SegmentSeal {
            segment_id,
            segment_length: None,
        })
    }

    pub fn segment_map(name: impl Into<String>, length: u64, sealed: bool) -> Self {
        Self::from_body(OperationBody::SegmentMap {
            segment_id: None,
            name: name.into(),
            length,
            sealed,
        })
    }

    pub fn segment_merge(target_id: SegmentId, source_id: SegmentId) -> Self {
        Self::from_body(OperationBody::SegmentMerge {
            target_id,
            source_id,
            target_offset: None,
            length: None,
        })
    }

    pub fn update_attributes(
        segment_id: SegmentId,
        attribute_updates: Vec<AttributeUpdate>,
    ) -> Self {
        Self::from_body(OperationBody::UpdateAttributes {
            segment_id,
            attribute_updates,
        })
    }

    pub fn metadata_checkpoint() -> Self {
        Self::from_body(OperationBody::MetadataCheckpoint {
            snapshot: Vec::new(),
        })
    }

    pub fn probe() -> Self {
        Self::from_body(OperationBody::Probe)
    }

    fn from_body(body: OperationBody) -> Self {
        Self {
            sequence_number: UNASSIGNED_SEQUENCE,
            body,
        }
    }

    pub fn can_serialize(&self) -> bool {
        !matches!(self.body, OperationBody::Probe)
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, sequence_number: u64) {
        self.sequence_number = sequence_number;
    }

    pub fn body(&self) -> &OperationBody {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut OperationBody {
        &mut self.body
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            OperationBody::SegmentAppend { .. } => "segment_append",
            OperationBody::SegmentSeal { .. } => "segment_seal",
            OperationBody::SegmentMap { .. } => "segment_map",
            OperationBody::SegmentMerge { .. } => "segment_merge",
            OperationBody::UpdateAttributes { .. } => "update_attributes",
            OperationBody::MetadataCheckpoint { .. } => "metadata_checkpoint",
            OperationBody::Probe => "probe",
        }
    }

    /// Wire encoding written into data frames. Refuses operations whose
    /// assigned fields were never populated by admission.
    pub fn serialize(&self) -> Result<Vec<u8>, SeglogError> {
        if !self.can_serialize() {
            return Err(SeglogError::Encode(format!(
                "{} operations have no wire form",
                self.kind()
            )));
        }
        if self.sequence_number == UNASSIGNED_SEQUENCE {
            return Err(SeglogError::Encode(
                "sequence number has not been assigned".into(),
            ));
        }
        self.check_assigned()?;
        rmp_serde::to_vec(self).map_err(|e| SeglogError::Encode(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SeglogError> {
        rmp_serde::from_slice(bytes).map_err(|e| SeglogError::Encode(e.to_string()))
    }

    fn check_assigned(&self) -> Result<(), SeglogError> {
        let missing = match &self.body {
            OperationBody::SegmentAppend { offset, .. } => offset.is_none(),
            OperationBody::SegmentSeal { segment_length, .. } => segment_length.is_none(),
            OperationBody::SegmentMap { segment_id, .. } => segment_id.is_none(),
            OperationBody::SegmentMerge {
                target_offset,
                length,
                ..
            } => target_offset.is_none() || length.is_none(),
            OperationBody::MetadataCheckpoint { snapshot } => snapshot.is_empty(),
            OperationBody::UpdateAttributes { .. } | OperationBody::Probe => false,
        };
        if missing {
            return Err(SeglogError::Encode(format!(
                "{} has unassigned admission fields",
                self.kind()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeUpdate, AttributeUpdateKind, Operation, UNASSIGNED_SEQUENCE};
    use crate::error::SeglogError;

    #[test]
    fn probe_has_no_wire_form() {
        let op = Operation::probe();
        assert!(!op.can_serialize());
        assert!(matches!(op.serialize(), Err(SeglogError::Encode(_))));
    }

    #[test]
    fn serialize_refuses_unadmitted_operations() {
        let op = Operation::segment_append(3, vec![1, 2, 3], Vec::new());
        assert_eq!(op.sequence_number(), UNASSIGNED_SEQUENCE);
        assert!(matches!(op.serialize(), Err(SeglogError::Encode(_))));

        let mut op = Operation::segment_seal(3);
        op.set_sequence_number(7);
        // Sequence assigned but segment_length still unassigned.
        assert!(matches!(op.serialize(), Err(SeglogError::Encode(_))));
    }

    #[test]
    fn admitted_operation_round_trips() {
        let mut op = Operation::segment_append(
            9,
            b"payload".to_vec(),
            vec![AttributeUpdate::new(1, AttributeUpdateKind::Accumulate, 5)],
        );
        op.set_sequence_number(12);
        if let super::OperationBody::SegmentAppend { offset, .. } = op.body_mut() {
            *offset = Some(100);
        }
        let bytes = op.serialize().expect("serialize");
        let decoded = Operation::deserialize(&bytes).expect("deserialize");
        assert_eq!(decoded, op);
        assert_eq!(decoded.sequence_number(), 12);
    }
}
