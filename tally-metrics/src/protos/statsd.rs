// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./statsd_test.rs"]
mod statsd_test;

use bytes::Bytes;
use memchr::memchr;
use prometheus::IntCounter;
use std::ops::Range;
use std::sync::LazyLock;

static INVALID_LINES: LazyLock<IntCounter> = LazyLock::new(|| {
  prometheus::register_int_counter!(
    prometheus::Opts::new(
      "rows_invalid_total",
      "Total number of statsd lines that failed to parse."
    )
    .const_label("type", "statsd")
  )
  .unwrap()
});

//
// ParseError
//

#[derive(thiserror::Error, Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
  #[error("cannot find '|' between metric and type")]
  MissingTypeSeparator,
  #[error("metric cannot be empty")]
  EmptyMetric,
  #[error("cannot parse metric value")]
  InvalidValue,
  #[error("invalid metric type")]
  InvalidType,
  #[error("cannot parse sample rate")]
  InvalidSampleRate,
  #[error("missing tag value")]
  MissingTagValue,
  #[error("cannot parse optional field")]
  InvalidOptionalField,
}

//
// MetricType
//

// The statsd submission kind carried by a single row.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MetricType {
  Counter,
  Gauge,
  Timing,
  Histogram,
}

impl MetricType {
  const fn from_statsd(t: &[u8]) -> Result<Self, ParseError> {
    match t {
      b"c" => Ok(Self::Counter),
      b"g" => Ok(Self::Gauge),
      b"ms" => Ok(Self::Timing),
      b"h" => Ok(Self::Histogram),
      _ => Err(ParseError::InvalidType),
    }
  }
}

//
// Tag
//

// A single key/value tag. The backing bytes alias the input buffer handed to
// `Rows::unmarshal` (reference counted, so no lifetime hazard).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tag {
  pub key: Bytes,
  pub value: Bytes,
}

//
// Row
//

// One parsed statsd submission. Tags live in the owning `Rows::tags_pool`
// slab; `tags` indexes into it.
#[derive(Clone, Debug)]
pub struct Row {
  pub metric: Bytes,
  pub metric_type: MetricType,
  pub value: f64,
  pub sample_rate: f64,
  pub tags: Range<usize>,
}

impl Row {
  fn unmarshal(line: &Bytes, tags_pool: &mut Vec<Tag>) -> Result<Self, ParseError> {
    let type_sep = memchr(b'|', line).ok_or(ParseError::MissingTypeSeparator)?;
    let metric_and_value = line.slice(0 .. type_sep);
    let mut tail = line.slice(type_sep + 1 ..);

    let colon = memchr(b':', &metric_and_value).ok_or(ParseError::EmptyMetric)?;
    if colon == 0 {
      return Err(ParseError::EmptyMetric);
    }
    let metric = metric_and_value.slice(0 .. colon);
    let value =
      parse_float(&metric_and_value[colon + 1 ..]).ok_or(ParseError::InvalidValue)?;

    let type_end = memchr(b'|', &tail).unwrap_or(tail.len());
    let metric_type = MetricType::from_statsd(&tail[.. type_end])?;
    tail = if type_end == tail.len() {
      Bytes::new()
    } else {
      tail.slice(type_end + 1 ..)
    };

    let mut sample_rate = 1.0;
    let tags_start = tags_pool.len();
    while !tail.is_empty() {
      let field_end = memchr(b'|', &tail).unwrap_or(tail.len());
      let field = tail.slice(0 .. field_end);
      tail = if field_end == tail.len() {
        Bytes::new()
      } else {
        tail.slice(field_end + 1 ..)
      };

      match field.first() {
        // The payload starts right after the marker byte. A repeated tags
        // field replaces any previously parsed set, matching how a repeated
        // sample rate takes the last value.
        Some(b'#') => {
          tags_pool.truncate(tags_start);
          unmarshal_tags(tags_pool, field.slice(1 ..))?;
        },
        Some(b'@') => {
          sample_rate = parse_float(&field[1 ..]).ok_or(ParseError::InvalidSampleRate)?;
        },
        _ => return Err(ParseError::InvalidOptionalField),
      }
    }

    Ok(Self {
      metric,
      metric_type,
      value,
      sample_rate,
      tags: tags_start .. tags_pool.len(),
    })
  }
}

//
// Rows
//

/// Parsed statsd rows together with the tag slab they index into.
///
/// A `Rows` value is explicitly reusable: `unmarshal` resets previous
/// contents while keeping the backing allocations. The parser slices the
/// input buffer without copying, so the buffer must not be mutated while the
/// parsed rows are in use (enforced by `Bytes` immutability).
#[derive(Debug, Default)]
pub struct Rows {
  pub rows: Vec<Row>,
  pub tags_pool: Vec<Tag>,
}

impl Rows {
  /// Parses all newline separated records in `input`, appending valid rows.
  /// Invalid records are logged and counted, and do not abort the batch.
  pub fn unmarshal(&mut self, input: &Bytes) {
    self.reset();
    let mut offset = 0;
    while offset < input.len() {
      let line_end = memchr(b'\n', &input[offset ..]).map_or(input.len(), |i| offset + i);
      self.unmarshal_row(input.slice(offset .. line_end));
      offset = line_end + 1;
    }
  }

  pub fn reset(&mut self) {
    self.rows.clear();
    self.tags_pool.clear();
  }

  /// The tags of `row` within this object's slab.
  pub fn tags(&self, row: &Row) -> &[Tag] {
    &self.tags_pool[row.tags.clone()]
  }

  fn unmarshal_row(&mut self, mut line: Bytes) {
    if line.last() == Some(&b'\r') {
      line.truncate(line.len() - 1);
    }
    if line.is_empty() {
      return;
    }

    let tags_start = self.tags_pool.len();
    match Row::unmarshal(&line, &mut self.tags_pool) {
      Ok(row) => self.rows.push(row),
      Err(e) => {
        self.tags_pool.truncate(tags_start);
        log::error!("cannot unmarshal statsd line {line:?}: {e}");
        INVALID_LINES.inc();
      },
    }
  }
}

fn parse_float(b: &[u8]) -> Option<f64> {
  std::str::from_utf8(b).ok()?.parse::<f64>().ok()
}

fn unmarshal_tags(tags_pool: &mut Vec<Tag>, mut s: Bytes) -> Result<(), ParseError> {
  loop {
    let tag_end = memchr(b',', &s).unwrap_or(s.len());
    let tag = s.slice(0 .. tag_end);
    let colon = memchr(b':', &tag).ok_or(ParseError::MissingTagValue)?;
    let key = tag.slice(0 .. colon);
    let value = tag.slice(colon + 1 ..);
    // A tag with an empty key or value is dropped without invalidating the
    // record.
    if !key.is_empty() && !value.is_empty() {
      tags_pool.push(Tag { key, value });
    }
    if tag_end == s.len() {
      return Ok(());
    }
    s = s.slice(tag_end + 1 ..);
  }
}
