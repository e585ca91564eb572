//! Per-device datapoint collection with batched writes.
//!
//! The store holds at most one [`Datapoint`] per id.  Writes made by the
//! application return the ids that must be sent to the device.  Inside a
//! batch (see [`DatapointStore::begin_batch`]) the ids are collected instead
//! and handed back once when the outermost batch ends; the value that is
//! eventually sent is whatever the datapoint holds at that moment, so the
//! newest write wins.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::domain::datapoint::{Datapoint, DatapointError, DatapointType, DatapointValue};

#[derive(Debug, Default)]
pub struct DatapointStore {
    datapoints: BTreeMap<u8, Datapoint>,
    batch_depth: u32,
    batched: Vec<u8>,
}

impl DatapointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.datapoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datapoints.is_empty()
    }

    pub fn get(&self, id: u8) -> Option<&Datapoint> {
        self.datapoints.get(&id)
    }

    /// Whether a datapoint with `id` exists, optionally also of `kind`.
    pub fn has_id(&self, id: u8, kind: Option<DatapointType>) -> bool {
        match (self.datapoints.get(&id), kind) {
            (Some(dp), Some(kind)) => dp.kind() == kind,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Returns the datapoint `id`, creating it with `initial` if absent.
    ///
    /// An existing datapoint is returned unchanged even if `initial` has a
    /// different type.
    pub fn get_or_create(&mut self, id: u8, initial: DatapointValue) -> &Datapoint {
        self.datapoints
            .entry(id)
            .or_insert_with(|| Datapoint::new(id, Utc::now(), 0, initial))
    }

    /// All datapoints ordered by id.
    pub fn snapshot(&self) -> Vec<Datapoint> {
        self.datapoints.values().cloned().collect()
    }

    /// Clones the datapoints named by `ids`, in that order, skipping unknown ids.
    pub fn collect(&self, ids: &[u8]) -> Vec<Datapoint> {
        ids.iter()
            .filter_map(|id| self.datapoints.get(id).cloned())
            .collect()
    }

    /// Records a value reported by the device.
    ///
    /// `changed_by_device` is set only when an existing value actually
    /// changed; a datapoint seen for the first time is not flagged.
    pub fn apply_from_device(
        &mut self,
        id: u8,
        timestamp: DateTime<Utc>,
        flags: u8,
        value: DatapointValue,
    ) -> &Datapoint {
        let dp = self
            .datapoints
            .entry(id)
            .or_insert_with(|| Datapoint::new(id, timestamp, flags, value.clone()));
        dp.changed_by_device = dp.value != value;
        dp.timestamp = timestamp;
        dp.flags = flags;
        dp.value = value;
        dp
    }

    /// Applies a local write.
    ///
    /// Returns `Ok(Some(ids))` when the ids must be sent now and `Ok(None)`
    /// when the write was absorbed by an open batch.
    ///
    /// # Errors
    ///
    /// Returns [`DatapointError::TypeMismatch`] if the datapoint exists with
    /// another type.  The store is left untouched.
    pub fn set_value(
        &mut self,
        id: u8,
        value: DatapointValue,
    ) -> Result<Option<Vec<u8>>, DatapointError> {
        if let Some(existing) = self.datapoints.get(&id) {
            if existing.kind() != value.kind() {
                return Err(DatapointError::TypeMismatch {
                    id,
                    expected: existing.kind(),
                    actual: value.kind(),
                });
            }
        }
        let dp = self
            .datapoints
            .entry(id)
            .or_insert_with(|| Datapoint::new(id, Utc::now(), 0, value.clone()));
        dp.value = value;
        dp.changed_by_device = false;

        if self.batch_depth > 0 {
            if !self.batched.contains(&id) {
                self.batched.push(id);
            }
            return Ok(None);
        }
        Ok(Some(vec![id]))
    }

    /// Opens a (possibly nested) batch.
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    /// Closes one batch level.
    ///
    /// Returns the ids to send when the outermost batch closes and at least
    /// one write was collected.  Calling this without an open batch is a
    /// no-op.
    pub fn end_batch(&mut self) -> Option<Vec<u8>> {
        if self.batch_depth == 0 {
            return None;
        }
        self.batch_depth -= 1;
        if self.batch_depth == 0 && !self.batched.is_empty() {
            return Some(std::mem::take(&mut self.batched));
        }
        None
    }

    pub fn batch_depth(&self) -> u32 {
        self.batch_depth
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
