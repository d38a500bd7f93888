//! Latest resource sample per server, with percentages derived at read time.

use std::collections::HashMap;

use serde::Serialize;
use shared_types::{MetricSample, ServerAllocation};

use crate::collaborators::ServerMetadata;

/// A sample plus the figures derived from the server's current allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsView {
    pub sample: MetricSample,
    /// `None` when the memory allocation is zero or unknown
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    /// CPU usage relative to the CPU limit, `None` without a limit
    pub cpu_of_limit_percent: Option<f64>,
}

impl MetricsView {
    pub fn derive(sample: MetricSample, allocation: Option<&ServerAllocation>) -> Self {
        let memory_percent =
            allocation.and_then(|a| percent_of(sample.memory_usage_mb, a.memory_mb.map(|mb| mb as f64)));
        let disk_percent =
            allocation.and_then(|a| percent_of(sample.disk_usage_mb, a.disk_mb.map(|mb| mb as f64)));
        let cpu_of_limit_percent =
            allocation.and_then(|a| percent_of(sample.cpu_percent, a.cpu_limit_percent));

        Self {
            sample,
            memory_percent,
            disk_percent,
            cpu_of_limit_percent,
        }
    }
}

fn percent_of(used: f64, budget: Option<f64>) -> Option<f64> {
    match budget {
        Some(budget) if budget > 0.0 && budget.is_finite() => Some(used / budget * 100.0),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct MetricsStore {
    latest: HashMap<String, MetricSample>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cached sample for `topic`.
    pub fn record(&mut self, topic: &str, sample: MetricSample) {
        self.latest.insert(topic.to_string(), sample);
    }

    pub fn latest(&self, topic: &str) -> Option<&MetricSample> {
        self.latest.get(topic)
    }

    /// Latest sample with derived figures. The allocation is read on every call.
    pub fn view(&self, topic: &str, metadata: &dyn ServerMetadata) -> Option<MetricsView> {
        let sample = self.latest.get(topic)?.clone();
        let allocation = metadata.allocation(topic);
        Some(MetricsView::derive(sample, allocation.as_ref()))
    }

    pub fn remove(&mut self, topic: &str) -> bool {
        self.latest.remove(topic).is_some()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
