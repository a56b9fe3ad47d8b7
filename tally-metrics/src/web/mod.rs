// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::codec::decode_body;
use crate::labels::{decode_base64, split_labels};
use crate::pipeline::{WritePipeline, WriteRequest};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Path};
use axum::response::Response;
use axum::routing::{MethodRouter, get, post};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use prometheus::{Encoder, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;

// Suffix for the /job path segment that marks the job name as base64 encoded. Needed when the
// name contains `/`, which cannot appear raw in a URL segment.
pub const BASE64_JOB_SUFFIX: &str = "@base64";

// Length check to protect against a malicious producer.
const MAX_ALLOWED_REQUEST_SIZE: usize = 20_000_000;

fn make_response(status: StatusCode, message: impl Into<String>) -> Response {
  let message: String = message.into();
  Response::builder()
    .status(status)
    .body(message.into())
    .unwrap()
}

// Build the gateway's routes: push/replace/delete under `{metrics_path}/job[@base64]/:job` with
// optional trailing grouping labels, the scrape endpoint at `{metrics_path}` and the health
// probe.
pub fn make_router(
  pipeline: Arc<WritePipeline>,
  metrics_path: &str,
  skip_consistency_check: bool,
) -> Router {
  let healthy_pipeline = pipeline.clone();
  let scrape_pipeline = pipeline.clone();
  let mut router = Router::new().route(
    "/-/healthy",
    get(move || handle_healthy(healthy_pipeline.clone())),
  );

  // POST merges into the stored group and PUT replaces it.
  for (suffix, base64_job) in [("", false), (BASE64_JOB_SUFFIX, true)] {
    let with_labels = format!("{metrics_path}/job{suffix}/:job/*labels");
    let without_labels = format!("{metrics_path}/job{suffix}/:job");
    router = router
      .route(
        &with_labels,
        push_routes(&pipeline, base64_job, skip_consistency_check),
      )
      .route(
        &without_labels,
        push_routes(&pipeline, base64_job, skip_consistency_check),
      );
  }

  router
    .route(
      metrics_path,
      get(move || handle_scrape(scrape_pipeline.clone())),
    )
    .layer(DefaultBodyLimit::max(MAX_ALLOWED_REQUEST_SIZE))
}

fn push_routes(
  pipeline: &Arc<WritePipeline>,
  base64_job: bool,
  skip_consistency_check: bool,
) -> MethodRouter {
  let post_pipeline = pipeline.clone();
  let put_pipeline = pipeline.clone();
  let delete_pipeline = pipeline.clone();
  post(
    move |Path(params): Path<HashMap<String, String>>, headers: HeaderMap, body: Bytes| {
      handle_push(
        post_pipeline.clone(),
        base64_job,
        skip_consistency_check,
        false,
        params,
        headers,
        body,
      )
    },
  )
  .put(
    move |Path(params): Path<HashMap<String, String>>, headers: HeaderMap, body: Bytes| {
      handle_push(
        put_pipeline.clone(),
        base64_job,
        skip_consistency_check,
        true,
        params,
        headers,
        body,
      )
    },
  )
  .delete(move |Path(params): Path<HashMap<String, String>>| {
    handle_delete(delete_pipeline.clone(), base64_job, params)
  })
}

// Resolve the grouping labels for a push or delete: the (possibly base64 encoded) job name from
// the path plus the trailing label pairs. The decoded job is injected as the `job` label.
fn grouping_labels_from_path(
  params: &HashMap<String, String>,
  base64_job: bool,
) -> Result<HashMap<String, String>, Response> {
  let mut job = params.get("job").cloned().unwrap_or_default();
  if base64_job {
    job = decode_base64(&job).map_err(|e| {
      log::debug!("invalid base64 encoding in job name {job:?}: {e}");
      make_response(
        StatusCode::BAD_REQUEST,
        format!("invalid base64 encoding in job name {job:?}: {e}"),
      )
    })?;
  }
  if job.is_empty() {
    log::debug!("job name is required");
    return Err(make_response(StatusCode::BAD_REQUEST, "job name is required"));
  }

  let labels_path = params.get("labels").map_or("", String::as_str);
  let mut labels = split_labels(labels_path, BASE64_JOB_SUFFIX).map_err(|e| {
    log::debug!("failed to parse label path {labels_path:?}: {e}");
    make_response(StatusCode::BAD_REQUEST, e.to_string())
  })?;
  labels.insert("job".to_string(), job);
  Ok(labels)
}

async fn handle_push(
  pipeline: Arc<WritePipeline>,
  base64_job: bool,
  skip_consistency_check: bool,
  replace: bool,
  params: HashMap<String, String>,
  headers: HeaderMap,
  body: Bytes,
) -> Response {
  let labels = match grouping_labels_from_path(&params, base64_job) {
    Ok(labels) => labels,
    Err(response) => return response,
  };

  let content_type = headers
    .get(CONTENT_TYPE)
    .and_then(|value| value.to_str().ok());
  let families = match decode_body(content_type, &body) {
    Ok(families) => families,
    Err(e) => {
      log::debug!("failed to parse push body: {e}");
      return make_response(StatusCode::BAD_REQUEST, e.to_string());
    },
  };

  if skip_consistency_check {
    pipeline
      .submit(WriteRequest {
        labels,
        timestamp: SystemTime::now(),
        families: Some(families),
        replace,
        done: None,
      })
      .await;
    return make_response(StatusCode::ACCEPTED, "");
  }

  let (done, outcome) = oneshot::channel();
  pipeline
    .submit(WriteRequest {
      labels,
      timestamp: SystemTime::now(),
      families: Some(families),
      replace,
      done: Some(done),
    })
    .await;

  match outcome.await {
    Ok(Ok(())) => make_response(StatusCode::ACCEPTED, ""),
    Ok(Err(e)) => {
      log::warn!("pushed metrics are invalid or inconsistent with existing metrics: {e}");
      make_response(
        StatusCode::BAD_REQUEST,
        format!("pushed metrics are invalid or inconsistent with existing metrics: {e}"),
      )
    },
    // The worker closes the channel after at most one value, so this only happens if the
    // pipeline died out from under us.
    Err(_) => make_response(StatusCode::INTERNAL_SERVER_ERROR, "write pipeline unavailable"),
  }
}

// Deletes are always consistent so the request is acknowledged as soon as it is enqueued.
async fn handle_delete(
  pipeline: Arc<WritePipeline>,
  base64_job: bool,
  params: HashMap<String, String>,
) -> Response {
  let labels = match grouping_labels_from_path(&params, base64_job) {
    Ok(labels) => labels,
    Err(response) => return response,
  };

  pipeline
    .submit(WriteRequest {
      labels,
      timestamp: SystemTime::now(),
      families: None,
      replace: false,
      done: None,
    })
    .await;
  make_response(StatusCode::ACCEPTED, "")
}

// Serve the current store contents in the text exposition format, families sorted by name the
// way a registry gather would present them.
#[allow(clippy::unused_async)]
async fn handle_scrape(pipeline: Arc<WritePipeline>) -> Response {
  let mut families = pipeline.store().snapshot_families();
  // The text encoder refuses nameless or empty families, skip them instead of failing the whole
  // scrape.
  families.retain(|family| !family.get_name().is_empty() && !family.get_metric().is_empty());
  families.sort_by(|a, b| a.get_name().cmp(b.get_name()));

  let encoder = TextEncoder::new();
  let mut buffer = Vec::new();
  if let Err(e) = encoder.encode(&families, &mut buffer) {
    log::warn!("failed to encode scrape output: {e}");
    return make_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
  }

  Response::builder()
    .status(StatusCode::OK)
    .header(CONTENT_TYPE, prometheus::TEXT_FORMAT)
    .body(buffer.into())
    .unwrap()
}

#[allow(clippy::unused_async)]
async fn handle_healthy(pipeline: Arc<WritePipeline>) -> Response {
  match pipeline.healthy() {
    Ok(()) => make_response(StatusCode::OK, "OK"),
    Err(e) => make_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
  }
}
