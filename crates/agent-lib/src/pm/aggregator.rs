//! Named-counter aggregation with difference and average reduction.
//!
//! Samples are keyed by `(name, id, sorted tag set)`. Difference
//! reductions emit the delta against the previous raw value on every call;
//! average reductions accumulate and emit on an externally driven flush.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;

/// Reduction applied to successive samples of the same metric key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    /// Emit `current - previous`; a decrease resets the baseline and
    /// emits zero.
    Difference,
    /// Emit `sum / count` over a flush window, then reset.
    Average,
}

/// One reduced metric emission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub id: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
}

enum Reduction {
    Difference { last: f64 },
    Average { sum: f64, count: u64 },
}

struct Slot {
    name: String,
    id: String,
    tags: BTreeMap<String, String>,
    reduction: Reduction,
}

impl Slot {
    fn sample(&self, value: f64) -> MetricSample {
        MetricSample {
            name: self.name.clone(),
            id: self.id.clone(),
            value,
            tags: self.tags.clone(),
        }
    }
}

/// Aggregates named counters across command executions.
#[derive(Default)]
pub struct Aggregator {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw sample. Difference reductions return their emission
    /// immediately (starting from the second sample); averages return
    /// `None` and surface on [`Aggregator::flush`].
    pub fn aggregate(
        &self,
        op: AggregateOp,
        name: &str,
        value: f64,
        id: &str,
        tags: &[(&str, &str)],
    ) -> Option<MetricSample> {
        let tags: BTreeMap<String, String> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let key = canonical_key(op, name, id, &tags);

        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let slot = slots.entry(key).or_insert_with(|| Slot {
            name: name.to_string(),
            id: id.to_string(),
            tags,
            reduction: match op {
                AggregateOp::Difference => Reduction::Difference { last: f64::NAN },
                AggregateOp::Average => Reduction::Average { sum: 0.0, count: 0 },
            },
        });

        match &mut slot.reduction {
            Reduction::Difference { last } => {
                if last.is_nan() {
                    *last = value;
                    return None;
                }
                let emitted = if value < *last { 0.0 } else { value - *last };
                *last = value;
                Some(slot.sample(emitted))
            }
            Reduction::Average { sum, count } => {
                *sum += value;
                *count += 1;
                None
            }
        }
    }

    /// Emits and resets every average reduction with at least one sample.
    /// Difference baselines survive the flush.
    pub fn flush(&self) -> Vec<MetricSample> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut out = Vec::new();
        for slot in slots.values_mut() {
            if let Reduction::Average { sum, count } = &mut slot.reduction {
                if *count == 0 {
                    continue;
                }
                let value = *sum / *count as f64;
                *sum = 0.0;
                *count = 0;
                out.push(slot.sample(value));
            }
        }
        out.sort_by(|a, b| (&a.name, &a.id).cmp(&(&b.name, &b.id)));
        out
    }
}

/// Tag pairs sort lexicographically before hashing, so tag order never
/// splits a metric key.
fn canonical_key(op: AggregateOp, name: &str, id: &str, tags: &BTreeMap<String, String>) -> String {
    let mut key = format!("{op:?}|{name}|{id}");
    for (k, v) in tags {
        key.push('|');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difference_emits_delta_on_second_sample() {
        let agg = Aggregator::new();
        assert!(agg
            .aggregate(AggregateOp::Difference, "disk.iops.read", 100.0, "sda", &[])
            .is_none());
        let sample = agg
            .aggregate(AggregateOp::Difference, "disk.iops.read", 140.0, "sda", &[])
            .unwrap();
        assert_eq!(sample.value, 40.0);
        assert_eq!(sample.id, "sda");
    }

    #[test]
    fn difference_decrease_emits_zero_and_resets_baseline() {
        let agg = Aggregator::new();
        agg.aggregate(AggregateOp::Difference, "ctx", 1000.0, "", &[]);
        let dropped = agg
            .aggregate(AggregateOp::Difference, "ctx", 10.0, "", &[])
            .unwrap();
        assert_eq!(dropped.value, 0.0);

        let next = agg
            .aggregate(AggregateOp::Difference, "ctx", 25.0, "", &[])
            .unwrap();
        assert_eq!(next.value, 15.0);
    }

    #[test]
    fn average_emits_mean_on_flush_and_resets() {
        let agg = Aggregator::new();
        agg.aggregate(AggregateOp::Average, "mem.free", 10.0, "", &[]);
        agg.aggregate(AggregateOp::Average, "mem.free", 30.0, "", &[]);

        let flushed = agg.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].value, 20.0);

        assert!(agg.flush().is_empty());
    }

    #[test]
    fn tag_order_does_not_split_keys() {
        let agg = Aggregator::new();
        agg.aggregate(
            AggregateOp::Difference,
            "net.rx",
            5.0,
            "eth0",
            &[("type", "phys"), ("kind", "bridge")],
        );
        let sample = agg
            .aggregate(
                AggregateOp::Difference,
                "net.rx",
                9.0,
                "eth0",
                &[("kind", "bridge"), ("type", "phys")],
            )
            .unwrap();
        assert_eq!(sample.value, 4.0);
    }

    #[test]
    fn distinct_ids_keep_separate_baselines() {
        let agg = Aggregator::new();
        agg.aggregate(AggregateOp::Difference, "disk.iops.read", 10.0, "sda", &[]);
        agg.aggregate(AggregateOp::Difference, "disk.iops.read", 50.0, "sdb", &[]);

        let sda = agg
            .aggregate(AggregateOp::Difference, "disk.iops.read", 13.0, "sda", &[])
            .unwrap();
        assert_eq!(sda.value, 3.0);
    }
}
