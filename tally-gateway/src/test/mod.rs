// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{Server, ServerOptions};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use pretty_assertions::assert_eq;
use prometheus::proto::{Bucket, Metric, MetricFamily, MetricType};
use protobuf::Message;
use std::net::SocketAddr;
use std::time::Duration;

const DELIMITED_PROTOBUF_CONTENT_TYPE: &str =
  "application/vnd.google.protobuf; encoding=delimited; proto=io.prometheus.client.MetricFamily";

//
// Helper
//

// A real gateway bound to a loopback port plus a plain HTTP client to drive it.
struct Helper {
  address: SocketAddr,
  client: Client<HttpConnector, Full<Bytes>>,
}

impl Helper {
  async fn new(skip_consistency_check: bool) -> Self {
    let server = Server::bind(ServerOptions {
      listen_address: "127.0.0.1:0".to_string(),
      metrics_path: "/metrics".to_string(),
      skip_consistency_check,
    })
    .await
    .unwrap();
    let address = server.local_addr().unwrap();
    tokio::spawn(async move { server.serve().await.unwrap() });

    Self {
      address,
      client: Client::builder(TokioExecutor::new()).build_http(),
    }
  }

  async fn request(
    &self,
    method: Method,
    path: &str,
    content_type: Option<&str>,
    body: Bytes,
  ) -> (StatusCode, String) {
    let mut builder = Request::builder()
      .method(method)
      .uri(format!("http://{}{path}", self.address));
    if let Some(content_type) = content_type {
      builder = builder.header(CONTENT_TYPE, content_type);
    }

    let response = self
      .client
      .request(builder.body(Full::new(body)).unwrap())
      .await
      .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
  }

  async fn push(&self, path: &str, body: &str) -> (StatusCode, String) {
    self
      .request(
        Method::POST,
        path,
        None,
        Bytes::from(body.to_string()),
      )
      .await
  }

  async fn put(&self, path: &str, body: &str) -> (StatusCode, String) {
    self
      .request(Method::PUT, path, None, Bytes::from(body.to_string()))
      .await
  }

  async fn delete(&self, path: &str) -> StatusCode {
    self.request(Method::DELETE, path, None, Bytes::new()).await.0
  }

  async fn scrape(&self) -> String {
    let (status, body) = self.request(Method::GET, "/metrics", None, Bytes::new()).await;
    assert_eq!(StatusCode::OK, status);
    body
  }

  // Unchecked writes and deletes are acknowledged before they are applied, so tests poll the
  // scrape endpoint until the store converges.
  async fn scrape_until(&self, predicate: impl Fn(&str) -> bool) -> String {
    for _ in 0 .. 100 {
      let body = self.scrape().await;
      if predicate(&body) {
        return body;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scrape output never converged: {}", self.scrape().await);
  }
}

fn make_histogram_family(
  name: &str,
  sample_count: u64,
  sample_sum: f64,
  buckets: &[(f64, u64)],
) -> MetricFamily {
  let mut metric = Metric::new();
  let histogram = metric.mut_histogram();
  histogram.set_sample_count(sample_count);
  histogram.set_sample_sum(sample_sum);
  for (upper_bound, cumulative_count) in buckets {
    let mut bucket = Bucket::new();
    bucket.set_upper_bound(*upper_bound);
    bucket.set_cumulative_count(*cumulative_count);
    histogram.mut_bucket().push(bucket);
  }

  let mut family = MetricFamily::new();
  family.set_name(name.to_string());
  family.set_field_type(MetricType::HISTOGRAM);
  family.mut_metric().push(metric);
  family
}

fn delimited_body(families: &[MetricFamily]) -> Bytes {
  let mut body = Vec::new();
  for family in families {
    family.write_length_delimited_to_writer(&mut body).unwrap();
  }
  body.into()
}

#[tokio::test]
async fn counter_pushes_accumulate() {
  let helper = Helper::new(false).await;

  for body in ["# TYPE foo counter\nfoo 5\n", "# TYPE foo counter\nfoo 4\n"] {
    let (status, _) = helper.push("/metrics/job/t", body).await;
    assert_eq!(StatusCode::ACCEPTED, status);
  }

  let scrape = helper.scrape().await;
  assert!(
    scrape.contains("foo{instance=\"\",job=\"t\"} 9"),
    "scrape output: {scrape}"
  );
}

#[tokio::test]
async fn gauge_pushes_replace() {
  let helper = Helper::new(false).await;

  helper.push("/metrics/job/t", "# TYPE g gauge\ng -13\n").await;
  helper.push("/metrics/job/t", "# TYPE g gauge\ng 4\n").await;

  let scrape = helper.scrape().await;
  assert!(
    scrape.contains("g{instance=\"\",job=\"t\"} 4"),
    "scrape output: {scrape}"
  );
}

#[tokio::test]
async fn put_replaces_the_whole_group() {
  let helper = Helper::new(false).await;

  helper.push("/metrics/job/t", "# TYPE foo counter\nfoo 5\n").await;
  let (status, _) = helper.put("/metrics/job/t", "# TYPE foo counter\nfoo 4\n").await;
  assert_eq!(StatusCode::ACCEPTED, status);

  let scrape = helper.scrape().await;
  assert!(
    scrape.contains("foo{instance=\"\",job=\"t\"} 4"),
    "scrape output: {scrape}"
  );
}

#[tokio::test]
async fn histogram_pushes_merge_buckets() {
  let helper = Helper::new(false).await;

  let first = delimited_body(&[make_histogram_family("h", 2, 13.0, &[(20.0, 13)])]);
  let second = delimited_body(&[make_histogram_family(
    "h",
    3,
    40.0,
    &[(20.0, 13), (40.0, 27)],
  )]);
  for body in [first, second] {
    let (status, response) = helper
      .request(
        Method::POST,
        "/metrics/job/t",
        Some(DELIMITED_PROTOBUF_CONTENT_TYPE),
        body,
      )
      .await;
    assert_eq!(StatusCode::ACCEPTED, status, "response: {response}");
  }

  let scrape = helper.scrape().await;
  assert!(scrape.contains("le=\"20\"} 26"), "scrape output: {scrape}");
  assert!(scrape.contains("le=\"40\"} 27"), "scrape output: {scrape}");
  assert!(
    scrape.contains("h_sum{instance=\"\",job=\"t\"} 53"),
    "scrape output: {scrape}"
  );
  assert!(
    scrape.contains("h_count{instance=\"\",job=\"t\"} 5"),
    "scrape output: {scrape}"
  );
}

// Two pushes with different metric level labels become distinct series of one family.
#[tokio::test]
async fn distinct_labels_share_one_family() {
  let helper = Helper::new(false).await;

  helper
    .push("/metrics/job/t", "# TYPE foo gauge\nfoo{key0=\"val0\"} 1\n")
    .await;
  helper
    .push("/metrics/job/t", "# TYPE foo gauge\nfoo{key1=\"val0\"} 2\n")
    .await;

  let scrape = helper.scrape().await;
  assert_eq!(1, scrape.matches("# TYPE foo gauge").count(), "scrape output: {scrape}");
  assert!(
    scrape.contains("foo{instance=\"\",job=\"t\",key0=\"val0\"} 1"),
    "scrape output: {scrape}"
  );
  assert!(
    scrape.contains("foo{instance=\"\",job=\"t\",key1=\"val0\"} 2"),
    "scrape output: {scrape}"
  );
}

#[tokio::test]
async fn type_conflicts_reject_without_mutation() {
  let helper = Helper::new(false).await;

  helper.push("/metrics/job/t", "# TYPE foo gauge\nfoo 1\n").await;
  let (status, body) = helper
    .push("/metrics/job/t", "# TYPE foo counter\nfoo 1\n")
    .await;
  assert_eq!(StatusCode::BAD_REQUEST, status);
  assert!(body.contains("cannot merge family"), "response: {body}");

  let scrape = helper.scrape().await;
  assert!(scrape.contains("# TYPE foo gauge"), "scrape output: {scrape}");
}

#[tokio::test]
async fn timestamped_pushes_are_rejected() {
  let helper = Helper::new(false).await;

  let (status, body) = helper
    .push("/metrics/job/t", "# TYPE foo counter\nfoo 5 1623456789\n")
    .await;
  assert_eq!(StatusCode::BAD_REQUEST, status);
  assert!(body.contains("must not have timestamps"), "response: {body}");
  assert_eq!("", helper.scrape().await);
}

#[tokio::test]
async fn unparseable_bodies_are_rejected() {
  let helper = Helper::new(false).await;
  let (status, _) = helper.push("/metrics/job/t", "this is {not exposition\n").await;
  assert_eq!(StatusCode::BAD_REQUEST, status);
}

#[tokio::test]
async fn base64_label_values_are_decoded() {
  let helper = Helper::new(false).await;

  // key0=val0, the value base64 encoded in the path.
  helper
    .push(
      "/metrics/job/t/key0@base64/dmFsMA",
      "# TYPE foo gauge\nfoo 1\n",
    )
    .await;

  let scrape = helper.scrape().await;
  assert!(
    scrape.contains("foo{instance=\"\",job=\"t\",key0=\"val0\"} 1"),
    "scrape output: {scrape}"
  );
}

#[tokio::test]
async fn base64_job_names_are_decoded() {
  let helper = Helper::new(false).await;

  // job name "some/job", which cannot appear raw in a path segment.
  helper
    .push("/metrics/job@base64/c29tZS9qb2I", "# TYPE foo gauge\nfoo 1\n")
    .await;

  let scrape = helper.scrape().await;
  assert!(
    scrape.contains("foo{instance=\"\",job=\"some/job\"} 1"),
    "scrape output: {scrape}"
  );
}

#[tokio::test]
async fn empty_job_names_are_rejected() {
  let helper = Helper::new(false).await;

  // "=" decodes to the empty string once padding is stripped.
  let (status, body) = helper
    .push("/metrics/job@base64/=", "# TYPE foo gauge\nfoo 1\n")
    .await;
  assert_eq!(StatusCode::BAD_REQUEST, status);
  assert!(body.contains("job name is required"), "response: {body}");
}

#[tokio::test]
async fn malformed_label_paths_are_rejected() {
  let helper = Helper::new(false).await;

  let (status, _) = helper
    .push("/metrics/job/t/key0/val0/key1", "# TYPE foo gauge\nfoo 1\n")
    .await;
  assert_eq!(StatusCode::BAD_REQUEST, status);

  let (status, _) = helper
    .push("/metrics/job/t/__reserved/val0", "# TYPE foo gauge\nfoo 1\n")
    .await;
  assert_eq!(StatusCode::BAD_REQUEST, status);
}

#[tokio::test]
async fn delete_erases_the_group() {
  let helper = Helper::new(false).await;

  helper.push("/metrics/job/t", "# TYPE foo counter\nfoo 5\n").await;
  assert_eq!(
    StatusCode::ACCEPTED,
    helper.delete("/metrics/job/t").await
  );

  let scrape = helper.scrape_until(str::is_empty).await;
  assert_eq!("", scrape);
}

// Deleting one grouping key leaves the others alone.
#[tokio::test]
async fn delete_is_scoped_to_the_grouping_key() {
  let helper = Helper::new(false).await;

  helper.push("/metrics/job/t", "# TYPE foo counter\nfoo 5\n").await;
  helper
    .push("/metrics/job/t/key0/val0", "# TYPE foo counter\nfoo 7\n")
    .await;
  helper.delete("/metrics/job/t").await;

  let scrape = helper
    .scrape_until(|body| !body.contains("foo{instance=\"\",job=\"t\"} 5"))
    .await;
  assert!(
    scrape.contains("foo{instance=\"\",job=\"t\",key0=\"val0\"} 7"),
    "scrape output: {scrape}"
  );
}

#[tokio::test]
async fn healthy_endpoint_reports_ok() {
  let helper = Helper::new(false).await;
  let (status, body) = helper.request(Method::GET, "/-/healthy", None, Bytes::new()).await;
  assert_eq!(StatusCode::OK, status);
  assert_eq!("OK", body);
}

// Unchecked mode always answers 202, but the worker still refuses timestamped metrics and type
// conflicts, it just cannot tell anyone.
#[tokio::test]
async fn unchecked_mode_silently_drops_inconsistent_pushes() {
  let helper = Helper::new(true).await;

  let (status, _) = helper
    .push("/metrics/job/t", "# TYPE bad counter\nbad 5 1623456789\n")
    .await;
  assert_eq!(StatusCode::ACCEPTED, status);

  let (status, _) = helper
    .push("/metrics/job/t", "# TYPE marker counter\nmarker 1\n")
    .await;
  assert_eq!(StatusCode::ACCEPTED, status);

  // The queue is FIFO, once the marker is visible the bad push has been processed.
  let scrape = helper.scrape_until(|body| body.contains("marker")).await;
  assert!(!scrape.contains("bad"), "scrape output: {scrape}");
}

#[tokio::test]
async fn unchecked_mode_skips_type_conflict_reporting() {
  let helper = Helper::new(true).await;

  helper.push("/metrics/job/t", "# TYPE foo gauge\nfoo 1\n").await;
  let (status, _) = helper
    .push("/metrics/job/t", "# TYPE foo counter\nfoo 2\n")
    .await;
  assert_eq!(StatusCode::ACCEPTED, status);

  helper.push("/metrics/job/t", "# TYPE marker counter\nmarker 1\n").await;
  let scrape = helper.scrape_until(|body| body.contains("marker")).await;
  assert!(scrape.contains("# TYPE foo gauge"), "scrape output: {scrape}");
  assert!(!scrape.contains("# TYPE foo counter"), "scrape output: {scrape}");
}
