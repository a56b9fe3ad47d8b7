// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod validator;

use crate::labels::grouping_key_for;
use crate::merge::merge_groups;
use crate::pipeline::WriteRequest;
use parking_lot::RwLock;
use prometheus::proto::MetricFamily;
use std::collections::HashMap;
use std::collections::hash_map::Entry;

//
// MetricGroup
//

// A set of metric families sharing one grouping key. Grouping by the push caller's label set
// (always including `job`) is what lets successive pushes from the same producer merge instead of
// clobbering each other.
#[derive(Clone, Debug, Default)]
pub struct MetricGroup {
  pub labels: HashMap<String, String>,
  pub families: HashMap<String, MetricFamily>,
}

//
// MetricStore
//

// In-memory storage of everything pushed to the gateway. Contents are lost on restart, which is
// fine for the scrape model: a counter briefly reporting zero is absorbed by the puller.
//
// A single reader/writer lock guards the group map. All mutation happens under the writer lock
// via the single pipeline worker, scrapes take the reader lock and deep copy so callers never
// observe a partially applied write.
#[derive(Default)]
pub struct MetricStore {
  groups: RwLock<HashMap<String, MetricGroup>>,
}

// Apply a write to a plain group map. Shared between the real store and the validator's virtual
// copy of it.
pub(crate) fn apply_to_groups(
  groups: &mut HashMap<String, MetricGroup>,
  labels: HashMap<String, String>,
  families: Option<HashMap<String, MetricFamily>>,
  replace: bool,
) {
  let grouping_key = grouping_key_for(&labels);

  // A write without families is a delete of the whole group.
  let Some(families) = families else {
    groups.remove(&grouping_key);
    return;
  };

  let group = MetricGroup { labels, families };
  match groups.entry(grouping_key) {
    Entry::Vacant(entry) => {
      entry.insert(group);
    },
    Entry::Occupied(mut entry) => {
      if replace {
        entry.insert(group);
      } else {
        merge_groups(entry.get_mut(), group);
      }
    },
  }
}

impl MetricStore {
  // Deep copied list of every family across every group, in unspecified order.
  #[must_use]
  pub fn snapshot_families(&self) -> Vec<MetricFamily> {
    let groups = self.groups.read();
    groups
      .values()
      .flat_map(|group| group.families.values().cloned())
      .collect()
  }

  // Deep copied grouping key to group map.
  #[must_use]
  pub fn snapshot_groups(&self) -> HashMap<String, MetricGroup> {
    self.groups.read().clone()
  }

  // Apply a validated write request. No families means delete. Otherwise a new group either
  // replaces the stored one (no previous group, or `replace` set) or is merged into it.
  pub fn apply(&self, wr: WriteRequest) {
    let mut groups = self.groups.write();
    apply_to_groups(&mut groups, wr.labels, wr.families, wr.replace);
  }

  // Liveness probe: acquires and releases the writer lock. If the store ever deadlocks, the
  // health endpoint hangs with it and the operator's probe times out.
  pub fn probe_lock(&self) {
    drop(self.groups.write());
  }
}
