// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./pipeline_test.rs"]
mod pipeline_test;

use crate::storage::MetricStore;
use crate::storage::validator::{ValidateError, validate};
use prometheus::proto::MetricFamily;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};

// How many write requests may sit in the queue at once. Submitters block once the queue is full,
// the health probe is what surfaces sustained overflow to operators.
const WRITE_QUEUE_CAPACITY: usize = 1000;

//
// WriteRequest
//

// One unit of work for the pipeline worker. `families == None` deletes the group at the grouping
// key derived from `labels`. The arrival timestamp is informational only and never exposed in
// scrape output.
//
// A `done` sender opts the request in to the expensive post apply gather check and delivers the
// validation outcome, at most one value, after which the channel closes. Requests without it are
// cheap and fast: the caller is never told about consistency failures.
pub struct WriteRequest {
  pub labels: HashMap<String, String>,
  pub timestamp: SystemTime,
  pub families: Option<HashMap<String, MetricFamily>>,
  pub replace: bool,
  pub done: Option<oneshot::Sender<Result<(), ValidateError>>>,
}

//
// HealthError
//

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum HealthError {
  #[error("write queue is full")]
  QueueSaturated,
}

//
// WritePipeline
//

// Bounded queue of write requests drained by a single worker, so every store mutation is
// serialized and writes to one grouping key apply in submission order. Scrapes only ever touch
// the store's reader lock and are unaffected.
pub struct WritePipeline {
  store: Arc<MetricStore>,
  tx: mpsc::Sender<WriteRequest>,
}

impl WritePipeline {
  #[must_use]
  pub fn new(store: Arc<MetricStore>) -> Self {
    let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let worker_store = store.clone();
    tokio::spawn(async move { worker_loop(worker_store, rx).await });
    Self { store, tx }
  }

  #[must_use]
  pub fn store(&self) -> &Arc<MetricStore> {
    &self.store
  }

  // Enqueue a write request. Blocks while the queue is at capacity. Submission is not
  // cancellable: once enqueued the worker will process the request whether or not the caller
  // keeps waiting on `done`.
  pub async fn submit(&self, wr: WriteRequest) {
    // The worker owns the receiver for as long as the pipeline exists, so a send can only fail
    // during shutdown when the whole pipeline is being dropped.
    if self.tx.send(wr).await.is_err() {
      log::warn!("write pipeline is shut down, dropping write request");
    }
  }

  // Ok iff the store's lock can be acquired and the write queue has headroom for new requests.
  pub fn healthy(&self) -> Result<(), HealthError> {
    self.store.probe_lock();

    if self.tx.capacity() == 0 {
      return Err(HealthError::QueueSaturated);
    }
    Ok(())
  }
}

async fn worker_loop(store: Arc<MetricStore>, mut rx: mpsc::Receiver<WriteRequest>) {
  while let Some(mut wr) = rx.recv().await {
    let result = validate(&store, &mut wr);
    let done = wr.done.take();

    match result {
      Ok(()) => {
        log::debug!(
          "applying write request received at {:?} for labels {:?}",
          wr.timestamp,
          wr.labels
        );
        store.apply(wr);
      },
      Err(ref e) => {
        log::debug!("rejecting write request: {e}");
      },
    }

    // Deliver the outcome even if the submitter stopped listening, then close the channel by
    // dropping the sender.
    if let Some(done) = done {
      let _ignored = done.send(result);
    }
  }
}
