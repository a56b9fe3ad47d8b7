// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./validator_test.rs"]
mod validator_test;

use super::{MetricGroup, MetricStore, apply_to_groups};
use crate::family::{sanitize_labels, timestamps_present};
use crate::labels::grouping_key_for_pairs;
use crate::merge::MergeError;
use crate::pipeline::WriteRequest;
use prometheus::proto::MetricType;
use std::collections::{HashMap, HashSet};

//
// ValidateError
//

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum ValidateError {
  #[error(transparent)]
  TypeConflict(#[from] MergeError),
  #[error("pushed metrics must not have timestamps")]
  TimestampForbidden,
  #[error("inconsistent metrics on gather: {0}")]
  InconsistentOnGather(String),
}

// Decide whether applying `wr` would leave the store scrape consistent. The request's families
// are sanitized against its grouping labels as a side effect regardless of the outcome.
//
// Without a `done` channel the caller has opted out of the expensive part: only the cross store
// type scan and the timestamp check run. With one, the write is additionally applied to a deep
// copy of the store and the result swept the way a scrape would be.
pub fn validate(store: &MetricStore, wr: &mut WriteRequest) -> Result<(), ValidateError> {
  // A delete cannot create inconsistencies and has nothing to sanitize.
  let Some(families) = &mut wr.families else {
    return Ok(());
  };

  // Same family name with a different type anywhere in the store can never merge or gather.
  {
    let groups = store.groups.read();
    for pushed in families.values() {
      for group in groups.values() {
        if let Some(existing) = group.families.get(pushed.get_name()) {
          if existing.get_field_type() != pushed.get_field_type() {
            return Err(
              MergeError::TypeConflict {
                name: existing.get_name().to_string(),
                existing: existing.get_field_type(),
                pushed: pushed.get_field_type(),
              }
              .into(),
            );
          }
        }
      }
    }
  }

  // Producer timestamps are rejected even when the deep check is skipped.
  if timestamps_present(families) {
    return Err(ValidateError::TimestampForbidden);
  }

  for family in families.values_mut() {
    sanitize_labels(family, &wr.labels);
  }

  if wr.done.is_none() {
    return Ok(());
  }

  // Apply the write to a virtual copy of the store and run a full gather pass over the result.
  let mut virtual_groups = store.snapshot_groups();
  apply_to_groups(
    &mut virtual_groups,
    wr.labels.clone(),
    Some(families.clone()),
    wr.replace,
  );
  gather_check(&virtual_groups)
}

// The sweep a scrape would perform: flatten every group's families and re-check that no two
// families share a name with different types and that no family holds two metrics with the same
// label signature.
fn gather_check(groups: &HashMap<String, MetricGroup>) -> Result<(), ValidateError> {
  let mut type_by_name: HashMap<&str, MetricType> = HashMap::new();

  for group in groups.values() {
    for family in group.families.values() {
      let existing = type_by_name
        .entry(family.get_name())
        .or_insert_with(|| family.get_field_type());
      if *existing != family.get_field_type() {
        return Err(ValidateError::InconsistentOnGather(format!(
          "family {:?} gathered with types {:?} and {:?}",
          family.get_name(),
          *existing,
          family.get_field_type()
        )));
      }

      let mut signatures = HashSet::with_capacity(family.get_metric().len());
      for metric in family.get_metric() {
        if !signatures.insert(grouping_key_for_pairs(metric.get_label())) {
          return Err(ValidateError::InconsistentOnGather(format!(
            "family {:?} contains two metrics with the same label signature",
            family.get_name()
          )));
        }
      }
    }
  }
  Ok(())
}
