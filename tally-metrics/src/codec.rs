// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./codec_test.rs"]
mod codec_test;

use bytes::Bytes;
use prometheus::proto::{
  Bucket,
  LabelPair,
  Metric,
  MetricFamily,
  MetricType,
  Quantile,
};
use prometheus_parser::GroupKind;
use protobuf::CodedInputStream;
use std::collections::HashMap;

//
// ParseError
//

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
  #[error("protobuf decode error: {0}")]
  Protobuf(#[from] protobuf::ProtobufError),
  #[error("text parse error: {0}")]
  Text(#[from] prometheus_parser::ParserError),
  #[error("request body is not valid UTF-8: {0}")]
  InvalidUtf8(#[from] std::str::Utf8Error),
}

// Whether the Content-Type selects the length delimited protobuf encoding of
// io.prometheus.client.MetricFamily. Anything else falls back to the text exposition format.
#[must_use]
pub fn is_delimited_protobuf(content_type: &str) -> bool {
  let Ok(mime) = content_type.parse::<mime::Mime>() else {
    return false;
  };
  mime.type_() == "application"
    && mime.subtype() == "vnd.google.protobuf"
    && mime
      .get_param("encoding")
      .is_some_and(|encoding| encoding.as_str() == "delimited")
    && mime
      .get_param("proto")
      .is_some_and(|proto| proto.as_str() == "io.prometheus.client.MetricFamily")
}

// Decode a push request body into metric families keyed by family name, dispatching on the
// request's Content-Type.
pub fn decode_body(
  content_type: Option<&str>,
  body: &Bytes,
) -> Result<HashMap<String, MetricFamily>, ParseError> {
  if content_type.is_some_and(is_delimited_protobuf) {
    decode_delimited_protobuf(body)
  } else {
    decode_text(std::str::from_utf8(body)?)
  }
}

// Repeated length delimited MetricFamily messages, the encoding prometheus client libraries use
// for push bodies.
fn decode_delimited_protobuf(body: &Bytes) -> Result<HashMap<String, MetricFamily>, ParseError> {
  let mut families = HashMap::new();
  let mut stream = CodedInputStream::from_bytes(body);
  while !stream.eof()? {
    let family: MetricFamily = stream.read_message()?;
    families.insert(family.get_name().to_string(), family);
  }
  Ok(families)
}

// Text exposition format. The parser groups raw lines into typed metric groups which are lowered
// here into the same family representation the protobuf path produces. Producer timestamps are
// carried through so that validation can reject them.
fn decode_text(body: &str) -> Result<HashMap<String, MetricFamily>, ParseError> {
  let mut families = HashMap::new();
  for group in prometheus_parser::parse_text(body)? {
    let mut family = MetricFamily::new();
    family.set_name(group.name.clone());

    match group.metrics {
      GroupKind::Counter(metrics) => {
        family.set_field_type(MetricType::COUNTER);
        for (key, counter) in metrics {
          let mut metric = make_metric(&key);
          metric.mut_counter().set_value(counter.value);
          family.mut_metric().push(metric);
        }
      },
      GroupKind::Gauge(metrics) => {
        family.set_field_type(MetricType::GAUGE);
        for (key, gauge) in metrics {
          let mut metric = make_metric(&key);
          metric.mut_gauge().set_value(gauge.value);
          family.mut_metric().push(metric);
        }
      },
      GroupKind::Untyped(metrics) => {
        family.set_field_type(MetricType::UNTYPED);
        for (key, untyped) in metrics {
          let mut metric = make_metric(&key);
          metric.mut_untyped().set_value(untyped.value);
          family.mut_metric().push(metric);
        }
      },
      GroupKind::Histogram(metrics) => {
        family.set_field_type(MetricType::HISTOGRAM);
        for (key, histogram) in metrics {
          let mut metric = make_metric(&key);
          {
            let data = metric.mut_histogram();
            data.set_sample_count(histogram.count);
            data.set_sample_sum(histogram.sum);
            for bucket in &histogram.buckets {
              let mut out = Bucket::new();
              out.set_upper_bound(bucket.bucket);
              out.set_cumulative_count(bucket.count);
              data.mut_bucket().push(out);
            }
          }
          family.mut_metric().push(metric);
        }
      },
      GroupKind::Summary(metrics) => {
        family.set_field_type(MetricType::SUMMARY);
        for (key, summary) in metrics {
          let mut metric = make_metric(&key);
          {
            let data = metric.mut_summary();
            data.set_sample_count(summary.count);
            data.set_sample_sum(summary.sum);
            for quantile in &summary.quantiles {
              let mut out = Quantile::new();
              out.set_quantile(quantile.quantile);
              out.set_value(quantile.value);
              data.mut_quantile().push(out);
            }
          }
          family.mut_metric().push(metric);
        }
      },
    }

    families.insert(group.name, family);
  }
  Ok(families)
}

fn make_metric(key: &prometheus_parser::GroupKey) -> Metric {
  let mut metric = Metric::new();
  for (name, value) in &key.labels {
    let mut pair = LabelPair::new();
    pair.set_name(name.clone());
    pair.set_value(value.clone());
    metric.mut_label().push(pair);
  }
  if let Some(timestamp) = key.timestamp {
    metric.set_timestamp_ms(timestamp);
  }
  metric
}
