// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./merge_test.rs"]
mod merge_test;

use crate::labels::grouping_key_for_pairs;
use crate::storage::MetricGroup;
use prometheus::proto::{Bucket, Metric, MetricFamily, MetricType};
use protobuf::RepeatedField;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

//
// MergeError
//

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum MergeError {
  #[error("cannot merge family {name:?}: type {existing:?} != {pushed:?}")]
  TypeConflict {
    name: String,
    existing: MetricType,
    pushed: MetricType,
  },
}

// Merge `m2` into `m1`, both of family type `mtype`. Counters accumulate, gauges and untyped
// values are replaced, histograms add per bucket, and summaries are replaced wholesale because
// producer computed quantiles cannot be recombined.
pub fn merge_metrics(mtype: MetricType, m1: &mut Metric, mut m2: Metric) {
  match mtype {
    MetricType::COUNTER => {
      let value = m1.get_counter().get_value() + m2.get_counter().get_value();
      m1.mut_counter().set_value(value);
    },
    MetricType::GAUGE => {
      m1.mut_gauge().set_value(m2.get_gauge().get_value());
    },
    MetricType::UNTYPED => {
      m1.mut_untyped().set_value(m2.get_untyped().get_value());
    },
    MetricType::SUMMARY => {
      m1.set_summary(m2.take_summary());
    },
    MetricType::HISTOGRAM => {
      let sample_count =
        m1.get_histogram().get_sample_count() + m2.get_histogram().get_sample_count();
      let sample_sum = m1.get_histogram().get_sample_sum() + m2.get_histogram().get_sample_sum();
      let histogram = m1.mut_histogram();
      histogram.set_sample_count(sample_count);
      histogram.set_sample_sum(sample_sum);
      merge_buckets(histogram.mut_bucket(), m2.take_histogram().take_bucket());
    },
  }
}

// Add up cumulative counts for buckets sharing an upper bound and append the rest. Bucket bounds
// are producer defined so two pushes may contribute disjoint bounds, the merged set is the union.
fn merge_buckets(b1: &mut RepeatedField<Bucket>, b2: RepeatedField<Bucket>) {
  let mut index_by_bound: HashMap<u64, usize> = b1
    .iter()
    .enumerate()
    .map(|(i, bucket)| (bucket.get_upper_bound().to_bits(), i))
    .collect();

  for bucket in b2.into_vec() {
    match index_by_bound.entry(bucket.get_upper_bound().to_bits()) {
      Entry::Occupied(entry) => {
        let existing = &mut b1[*entry.get()];
        let count = existing.get_cumulative_count() + bucket.get_cumulative_count();
        existing.set_cumulative_count(count);
      },
      Entry::Vacant(entry) => {
        entry.insert(b1.len());
        b1.push(bucket);
      },
    }
  }
}

// Merge family `f2` into `f1`. The families must share a type. Metrics of `f2` with a label
// signature already present in `f1` are merged per `merge_metrics`, the rest are appended.
pub fn merge_families(f1: &mut MetricFamily, mut f2: MetricFamily) -> Result<(), MergeError> {
  if f1.get_field_type() != f2.get_field_type() {
    return Err(MergeError::TypeConflict {
      name: f1.get_name().to_string(),
      existing: f1.get_field_type(),
      pushed: f2.get_field_type(),
    });
  }

  let mtype = f1.get_field_type();
  let mut index_by_signature: HashMap<String, usize> = f1
    .get_metric()
    .iter()
    .enumerate()
    .map(|(i, metric)| (grouping_key_for_pairs(metric.get_label()), i))
    .collect();

  for metric in f2.take_metric().into_vec() {
    match index_by_signature.entry(grouping_key_for_pairs(metric.get_label())) {
      Entry::Occupied(entry) => {
        merge_metrics(mtype, &mut f1.mut_metric()[*entry.get()], metric);
      },
      Entry::Vacant(entry) => {
        entry.insert(f1.get_metric().len());
        f1.mut_metric().push(metric);
      },
    }
  }
  Ok(())
}

// Merge group `g2` into `g1`. Families `g1` does not have yet are moved in, families it does have
// are family merged. A family that fails to merge (a type conflict that slipped past an unchecked
// ingest) is logged and skipped, the rest of the group still merges.
pub fn merge_groups(g1: &mut MetricGroup, g2: MetricGroup) {
  for (name, family) in g2.families {
    match g1.families.entry(name) {
      Entry::Vacant(entry) => {
        entry.insert(family);
      },
      Entry::Occupied(mut entry) => {
        if let Err(e) = merge_families(entry.get_mut(), family) {
          log::debug!("skipping family during group merge: {e}");
        }
      },
    }
  }
}
