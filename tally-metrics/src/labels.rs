// tally - a prometheus push and aggregation gateway
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./labels_test.rs"]
mod labels_test;

use base64ct::{Base64UrlUnpadded, Encoding};
use prometheus::proto::LabelPair;
use std::collections::HashMap;

// The label that identifies the pushing producer instance. Guaranteed to be present (possibly
// empty) on every stored metric.
pub const INSTANCE_LABEL: &str = "instance";

// Label names starting with this prefix are reserved for internal use.
pub const RESERVED_LABEL_PREFIX: &str = "__";

// Separator used when building grouping keys. NUL cannot appear in a valid label name so the
// resulting key is unambiguous.
const GROUPING_KEY_SEPARATOR: char = '\x00';

//
// LabelError
//

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum LabelError {
  #[error("invalid base64 encoding: {0}")]
  InvalidEncoding(String),
  #[error("malformed label path: {0}")]
  MalformedPath(String),
}

// Whether `name` matches [a-zA-Z_][a-zA-Z0-9_]*. Checked directly rather than through a regex
// dependency since the alphabet is trivial.
#[must_use]
pub fn valid_label_name(name: &str) -> bool {
  let mut chars = name.chars();
  chars
    .next()
    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Decode a string using the URL and filename safe base64 alphabet (RFC 4648). Trailing padding
// characters are stripped before decoding so both padded and unpadded inputs are accepted.
pub fn decode_base64(s: &str) -> Result<String, LabelError> {
  let decoded = Base64UrlUnpadded::decode_vec(s.trim_end_matches('='))
    .map_err(|e| LabelError::InvalidEncoding(e.to_string()))?;
  String::from_utf8(decoded).map_err(|e| LabelError::InvalidEncoding(e.to_string()))
}

// Split a URL path segment of the form /key0/value0/key1/value1 (leading slash optional) into a
// label map. If `base64_suffix` is non-empty, a label name ending with it has the suffix stripped
// and its value base64-decoded. Empty or single character input yields an empty map.
pub fn split_labels(
  path: &str,
  base64_suffix: &str,
) -> Result<HashMap<String, String>, LabelError> {
  let mut result = HashMap::new();
  if path.len() <= 1 {
    return Ok(result);
  }

  let trimmed = path.strip_prefix('/').unwrap_or(path);
  let components: Vec<&str> = trimmed.split('/').collect();
  if components.len() % 2 != 0 {
    return Err(LabelError::MalformedPath(format!(
      "odd number of components in label string {trimmed:?}"
    )));
  }

  for pair in components.chunks(2) {
    let (name, value) = (pair[0], pair[1]);
    let trimmed_name = if base64_suffix.is_empty() {
      name
    } else {
      name.strip_suffix(base64_suffix).unwrap_or(name)
    };

    if !valid_label_name(trimmed_name) || trimmed_name.starts_with(RESERVED_LABEL_PREFIX) {
      return Err(LabelError::MalformedPath(format!(
        "improper label name {trimmed_name:?}"
      )));
    }

    if name == trimmed_name {
      result.insert(name.to_string(), value.to_string());
      continue;
    }

    let decoded = decode_base64(value).map_err(|e| match e {
      LabelError::InvalidEncoding(msg) => {
        LabelError::InvalidEncoding(format!("label {trimmed_name}={value:?}: {msg}"))
      },
      other => other,
    })?;
    result.insert(trimmed_name.to_string(), decoded);
  }
  Ok(result)
}

// Build the canonical grouping key for a label set: label names sorted lexicographically, names
// and values joined with a NUL separator and no trailing separator. The key is a pure function of
// its input so it is reproducible across pushes.
#[must_use]
pub fn grouping_key_for(labels: &HashMap<String, String>) -> String {
  if labels.is_empty() {
    return String::new();
  }

  let mut names: Vec<&str> = labels.keys().map(String::as_str).collect();
  names.sort_unstable();

  let mut key = String::new();
  for (i, name) in names.iter().enumerate() {
    key.push_str(name);
    key.push(GROUPING_KEY_SEPARATOR);
    key.push_str(&labels[*name]);
    if i + 1 < names.len() {
      key.push(GROUPING_KEY_SEPARATOR);
    }
  }
  key
}

// Grouping key over a metric's label pairs. Used to detect metrics with the same label signature
// within a family.
#[must_use]
pub fn grouping_key_for_pairs(pairs: &[LabelPair]) -> String {
  let labels: HashMap<String, String> = pairs
    .iter()
    .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
    .collect();
  grouping_key_for(&labels)
}
