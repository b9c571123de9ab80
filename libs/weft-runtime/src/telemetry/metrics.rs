//! Recent metric samples reported by workers over their channels.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::descriptor::ServiceId;

pub const DEFAULT_SAMPLES_PER_SERVICE: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub worker_id: Uuid,
    pub recorded_at_ms: u64,
}

/// Bounded ring of samples per service; oldest samples are evicted first.
pub struct MetricsStore {
    samples: DashMap<ServiceId, VecDeque<MetricRecord>>,
    capacity: usize,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLES_PER_SERVICE)
    }
}

impl MetricsStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(
        &self,
        service: &ServiceId,
        worker_id: Uuid,
        name: String,
        value: f64,
        labels: BTreeMap<String, String>,
    ) {
        let recorded_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        let mut ring = self.samples.entry(service.clone()).or_default();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(MetricRecord {
            name,
            value,
            labels,
            worker_id,
            recorded_at_ms,
        });
    }

    /// Samples of `service`, oldest first.
    #[must_use]
    pub fn recent(&self, service: &ServiceId) -> Vec<MetricRecord> {
        self.samples
            .get(service)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent value per metric name.
    #[must_use]
    pub fn latest(&self, service: &ServiceId) -> BTreeMap<String, f64> {
        let mut latest = BTreeMap::new();
        if let Some(ring) = self.samples.get(service) {
            for record in ring.iter() {
                latest.insert(record.name.clone(), record.value);
            }
        }
        latest
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let store = MetricsStore::new(2);
        let svc = ServiceId::from("api");
        let worker = Uuid::now_v7();
        for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
            store.record(&svc, worker, name.to_owned(), f64::from(u32::try_from(i).unwrap()), BTreeMap::new());
        }
        let names: Vec<String> = store.recent(&svc).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["b".to_owned(), "c".to_owned()]);
    }

    #[test]
    fn latest_keeps_last_value_per_name() {
        let store = MetricsStore::default();
        let svc = ServiceId::from("api");
        let worker = Uuid::now_v7();
        store.record(&svc, worker, "rss".into(), 10.0, BTreeMap::new());
        store.record(&svc, worker, "rss".into(), 12.5, BTreeMap::new());
        store.record(&svc, worker, "rps".into(), 3.0, BTreeMap::new());

        let latest = store.latest(&svc);
        assert_eq!(latest.len(), 2);
        assert!((latest["rss"] - 12.5).abs() < f64::EPSILON);
        assert!(store.recent(&ServiceId::from("other")).is_empty());
    }
}
