// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

// Minimal Prometheus remote write model. Field numbers match the canonical
// prompb definitions so the encoded output is wire compatible with any remote
// write receiver. Only the subset this agent emits is modeled.

#[derive(Clone, PartialEq, prost::Message)]
pub struct Label {
  #[prost(string, tag = "1")]
  pub name: String,
  #[prost(string, tag = "2")]
  pub value: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Sample {
  #[prost(double, tag = "1")]
  pub value: f64,
  // Timestamp in milliseconds since the unix epoch.
  #[prost(int64, tag = "2")]
  pub timestamp: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TimeSeries {
  #[prost(message, repeated, tag = "1")]
  pub labels: Vec<Label>,
  #[prost(message, repeated, tag = "2")]
  pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WriteRequest {
  #[prost(message, repeated, tag = "1")]
  pub timeseries: Vec<TimeSeries>,
}

#[must_use]
pub fn make_label(name: impl Into<String>, value: impl Into<String>) -> Label {
  Label {
    name: name.into(),
    value: value.into(),
  }
}
