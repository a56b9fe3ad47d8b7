// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./family_test.rs"]
mod family_test;

use crate::labels::INSTANCE_LABEL;
use prometheus::proto::{LabelPair, MetricFamily};
use std::collections::HashMap;

fn make_label_pair(name: &str, value: &str) -> LabelPair {
  let mut pair = LabelPair::new();
  pair.set_name(name.to_string());
  pair.set_value(value.to_string());
  pair
}

// Ensure that every metric in the family carries all grouping labels (values from
// `grouping_labels` win over whatever the producer sent) plus an `instance` label, appended with
// an empty value when absent. Label pairs are left sorted by name. Idempotent.
pub fn sanitize_labels(mf: &mut MetricFamily, grouping_labels: &HashMap<String, String>) {
  for metric in mf.mut_metric().iter_mut() {
    let mut labels_not_yet_done: HashMap<&str, &str> = grouping_labels
      .iter()
      .map(|(name, value)| (name.as_str(), value.as_str()))
      .collect();
    let mut has_instance_label = false;

    for pair in metric.mut_label().iter_mut() {
      let value = labels_not_yet_done.remove(pair.get_name());
      if let Some(value) = value {
        pair.set_value(value.to_string());
      }
      if pair.get_name() == INSTANCE_LABEL {
        has_instance_label = true;
      }
    }

    for (name, value) in labels_not_yet_done {
      if name == INSTANCE_LABEL {
        has_instance_label = true;
      }
      metric.mut_label().push(make_label_pair(name, value));
    }
    if !has_instance_label {
      metric.mut_label().push(make_label_pair(INSTANCE_LABEL, ""));
    }

    metric
      .mut_label()
      .sort_by(|a, b| a.get_name().cmp(b.get_name()));
  }
}

// Whether any metric in any of the families carries a producer supplied timestamp. Pushed metrics
// must not have timestamps, the gateway is the single source of "now".
#[must_use]
pub fn timestamps_present(families: &HashMap<String, MetricFamily>) -> bool {
  families
    .values()
    .any(|mf| mf.get_metric().iter().any(prometheus::proto::Metric::has_timestamp_ms))
}
