// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

// Helpers shared by tests across the crate.

use crate::pipeline::outflow::RemoteWritePush;
use crate::protos::prompb::WriteRequest;
use crate::protos::statsd::Rows;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

//
// CapturePush
//

// A RemoteWritePush that records every pushed write request for later
// inspection.
#[derive(Default)]
pub struct CapturePush {
  requests: Mutex<Vec<WriteRequest>>,
}

impl CapturePush {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn take(&self) -> Vec<WriteRequest> {
    std::mem::take(&mut *self.requests.lock())
  }

  pub fn len(&self) -> usize {
    self.requests.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.requests.lock().is_empty()
  }
}

#[async_trait]
impl RemoteWritePush for CapturePush {
  async fn push<'a>(&self, write_request: &'a WriteRequest) {
    self.requests.lock().push(write_request.clone());
  }
}

/// Parses statsd plaintext into a fresh `Rows`.
#[must_use]
pub fn parse_rows(input: &str) -> Rows {
  let mut rows = Rows::default();
  rows.unmarshal(&Bytes::copy_from_slice(input.as_bytes()));
  rows
}

/// Finds the sample value of the series whose `__name__` is `name` and whose
/// labels include every `(key, value)` pair in `extra_labels`.
#[must_use]
pub fn series_value(
  write_request: &WriteRequest,
  name: &str,
  extra_labels: &[(&str, &str)],
) -> Option<f64> {
  write_request
    .timeseries
    .iter()
    .find(|ts| {
      ts.labels
        .iter()
        .any(|l| l.name == "__name__" && l.value == name)
        && extra_labels.iter().all(|(k, v)| {
          ts.labels.iter().any(|l| l.name == *k && l.value == *v)
        })
    })
    .map(|ts| ts.samples[0].value)
}
