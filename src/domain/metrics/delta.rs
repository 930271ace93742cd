//! Rates derived from the engine's cumulative counters.

use std::collections::HashMap;

use crate::domain::port::ContainerStatsSample;

use super::model::ResourceUsage;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Cycles an unseen container keeps its previous counters.
pub const MAX_IDLE_CYCLES: u64 = 3;

/// Cumulative counters of one container at its last observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviousSample {
    pub cpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub last_seen_cycle: u64,
}

/// `(Δcontainer / Δsystem) × cpus × 100`; zero without a prior sample, on a non-positive system
/// delta or on a counter reset.
pub fn cpu_percent(previous: Option<&PreviousSample>, current: &ContainerStatsSample) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let cpu_delta = current.cpu_total_usage as f64 - previous.cpu_total_usage as f64;
    let system_delta = current.system_cpu_usage as f64 - previous.system_cpu_usage as f64;
    if system_delta <= 0.0 || cpu_delta < 0.0 {
        return 0.0;
    }
    (cpu_delta / system_delta) * current.online_cpus.max(1) as f64 * 100.0
}

/// RX/TX totals across every interface of the container.
pub fn network_totals(sample: &ContainerStatsSample) -> (u64, u64) {
    sample
        .networks
        .values()
        .fold((0, 0), |(rx, tx), counters| {
            (rx + counters.rx_bytes, tx + counters.tx_bytes)
        })
}

/// Bytes moved since the previous sample, clamped at zero on counter reset.
pub fn network_delta(previous: Option<&PreviousSample>, current: &ContainerStatsSample) -> (u64, u64) {
    let Some(previous) = previous else {
        return (0, 0);
    };
    let (rx, tx) = network_totals(current);
    (
        rx.saturating_sub(previous.rx_bytes),
        tx.saturating_sub(previous.tx_bytes),
    )
}

/// Previous counters keyed by container id, entries idle for too long are evicted.
#[derive(Debug, Default)]
pub struct CounterCache {
    entries: HashMap<String, PreviousSample>,
}

impl CounterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage of the container since its previous observation, remembering the new counters.
    pub fn observe(&mut self, container_id: &str, sample: &ContainerStatsSample, cycle: u64) -> ResourceUsage {
        let previous = self.entries.get(container_id);
        let cpu_percent = cpu_percent(previous, sample);
        let (network_rx_bytes, network_tx_bytes) = network_delta(previous, sample);
        let (rx_bytes, tx_bytes) = network_totals(sample);
        self.entries.insert(
            container_id.to_string(),
            PreviousSample {
                cpu_total_usage: sample.cpu_total_usage,
                system_cpu_usage: sample.system_cpu_usage,
                rx_bytes,
                tx_bytes,
                last_seen_cycle: cycle,
            },
        );
        ResourceUsage {
            cpu_percent,
            memory_used_mb: sample.memory_usage_bytes as f64 / BYTES_PER_MB,
            memory_limit_mb: sample.memory_limit_bytes as f64 / BYTES_PER_MB,
            network_rx_bytes,
            network_tx_bytes,
            requests_per_minute: None,
        }
    }

    pub fn evict_stale(&mut self, cycle: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| cycle.saturating_sub(entry.last_seen_cycle) <= MAX_IDLE_CYCLES);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
