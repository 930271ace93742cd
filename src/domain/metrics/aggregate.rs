use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};

use super::model::{AggregatedBucket, Stat, UsageSample};

/// Buckets samples by `floor(timestamp / width)` and reports avg/min/max per field.
pub fn aggregate<T: UsageSample>(samples: &[T], width: Duration) -> Vec<AggregatedBucket> {
    let width = width.as_secs().max(1) as i64;
    let mut buckets: BTreeMap<i64, Vec<&T>> = BTreeMap::new();
    for sample in samples {
        let start = sample.timestamp().timestamp().div_euclid(width) * width;
        buckets.entry(start).or_default().push(sample);
    }

    buckets
        .into_iter()
        .map(|(start, samples)| {
            let rates: Vec<f64> = samples
                .iter()
                .filter_map(|s| s.usage().requests_per_minute)
                .collect();
            AggregatedBucket {
                bucket_start: DateTime::<Utc>::from_timestamp(start, 0).unwrap_or_default(),
                samples: samples.len(),
                cpu_percent: stat(samples.iter().map(|s| s.usage().cpu_percent)),
                memory_used_mb: stat(samples.iter().map(|s| s.usage().memory_used_mb)),
                network_rx_bytes: stat(samples.iter().map(|s| s.usage().network_rx_bytes as f64)),
                network_tx_bytes: stat(samples.iter().map(|s| s.usage().network_tx_bytes as f64)),
                requests_per_minute: (!rates.is_empty()).then(|| stat(rates.into_iter())),
            }
        })
        .collect()
}

fn stat(values: impl Iterator<Item = f64>) -> Stat {
    let (count, sum, min, max) = values.fold(
        (0usize, 0.0, f64::INFINITY, f64::NEG_INFINITY),
        |(count, sum, min, max), value| (count + 1, sum + value, min.min(value), max.max(value)),
    );
    if count == 0 {
        return Stat {
            avg: 0.0,
            min: 0.0,
            max: 0.0,
        };
    }
    Stat {
        avg: sum / count as f64,
        min,
        max,
    }
}
