//! Per instance process metrics reported by running services

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A metrics sample reported by a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMetrics {
    /// Resident memory of the process in bytes
    pub resident_memory: u64,
    /// Bytes of heap currently in use
    pub heap_used: u64,
}

/// Metrics retained per instance, including the heap low water mark
///
/// The low water mark is what remains in use right after collection; a
/// rising mark is the classic slow leak signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceMetrics {
    /// Latest resident memory in bytes
    pub resident_memory: u64,
    /// Latest heap use in bytes
    pub heap_used: u64,
    /// Lowest heap use ever sampled for this instance
    pub min_heap_used: u64,
}

/// Latest metrics per live instance
#[derive(Debug, Default)]
pub struct ProcessInfoTable {
    samples: Mutex<HashMap<Uuid, InstanceMetrics>>,
}

impl ProcessInfoTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample for an instance
    pub fn record(&self, instance_id: Uuid, metrics: ProcessMetrics) {
        let mut samples = self.samples.lock().unwrap();
        samples
            .entry(instance_id)
            .and_modify(|existing| {
                existing.resident_memory = metrics.resident_memory;
                existing.heap_used = metrics.heap_used;
                existing.min_heap_used = existing.min_heap_used.min(metrics.heap_used);
            })
            .or_insert(InstanceMetrics {
                resident_memory: metrics.resident_memory,
                heap_used: metrics.heap_used,
                min_heap_used: metrics.heap_used,
            });
    }

    /// Latest metrics for an instance
    pub fn get(&self, instance_id: Uuid) -> Option<InstanceMetrics> {
        self.samples.lock().unwrap().get(&instance_id).copied()
    }

    /// Forget an instance that went away
    pub fn forget(&self, instance_id: Uuid) {
        self.samples.lock().unwrap().remove(&instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_heap_tracks_the_low_water_mark() {
        let table = ProcessInfoTable::new();
        let id = Uuid::new_v4();
        table.record(id, ProcessMetrics { resident_memory: 100, heap_used: 50 });
        table.record(id, ProcessMetrics { resident_memory: 120, heap_used: 30 });
        table.record(id, ProcessMetrics { resident_memory: 140, heap_used: 80 });

        let metrics = table.get(id).unwrap();
        assert_eq!(metrics.resident_memory, 140);
        assert_eq!(metrics.heap_used, 80);
        assert_eq!(metrics.min_heap_used, 30);
    }

    #[test]
    fn forget_removes_the_instance() {
        let table = ProcessInfoTable::new();
        let id = Uuid::new_v4();
        table.record(id, ProcessMetrics { resident_memory: 1, heap_used: 1 });
        table.forget(id);
        assert!(table.get(id).is_none());
    }
}
