// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./prom_test.rs"]
mod prom_test;

use crate::pipeline::outflow::RemoteWritePush;
use crate::protos::prompb::WriteRequest;
use async_trait::async_trait;
use prometheus::IntCounter;
use prost::Message;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::sync::LazyLock;
use std::time::Duration;

static REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
  prometheus::register_int_counter!(
    prometheus::Opts::new(
      "remotewrite_requests_total",
      "Total number of remote write requests attempted."
    )
    .const_label("type", "statsd")
  )
  .unwrap()
});

static REQUESTS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
  prometheus::register_int_counter!(
    prometheus::Opts::new(
      "remotewrite_requests_failed_total",
      "Total number of remote write requests that failed."
    )
    .const_label("type", "statsd")
  )
  .unwrap()
});

/// Encodes and snappy-compresses a write request into a remote write body.
#[must_use]
pub fn compress_write_request(write_request: &WriteRequest) -> Vec<u8> {
  let proto_encoded = write_request.encode_to_vec();
  let proto_compressed = snap::raw::Encoder::new()
    .compress_vec(&proto_encoded)
    .unwrap();
  log::debug!(
    "compressed WriteRequest {} bytes to {} bytes",
    proto_encoded.len(),
    proto_compressed.len()
  );
  proto_compressed
}

//
// PromRemoteWriteClient
//

/// An HTTP client that writes to a Prometheus remote write capable endpoint.
/// Pushes are at-most-once: failures are logged and counted, never retried or
/// surfaced to the flusher.
pub struct PromRemoteWriteClient {
  client: reqwest::Client,
  endpoint: String,
  auth_bearer: Option<String>,
}

impl PromRemoteWriteClient {
  pub fn new(
    endpoint: String,
    request_timeout: Duration,
    auth_bearer: Option<String>,
  ) -> anyhow::Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(request_timeout)
      .build()?;
    Ok(Self {
      client,
      endpoint,
      auth_bearer,
    })
  }
}

#[async_trait]
impl RemoteWritePush for PromRemoteWriteClient {
  async fn push<'a>(&self, write_request: &'a WriteRequest) {
    REQUESTS_TOTAL.inc();
    let body = compress_write_request(write_request);
    let mut request = self
      .client
      .post(&self.endpoint)
      .header(CONTENT_TYPE, "application/x-protobuf")
      .header(CONTENT_ENCODING, "snappy")
      .header("X-Prometheus-Remote-Write-Version", "0.1.0")
      .body(body);
    if let Some(token) = &self.auth_bearer {
      request = request.bearer_auth(token);
    }

    match request.send().await {
      Ok(response) if response.status().is_success() => {},
      Ok(response) => {
        REQUESTS_FAILED.inc();
        log::warn!(
          "prometheus remote write request failed: endpoint={}, status={}",
          self.endpoint,
          response.status()
        );
      },
      Err(e) => {
        REQUESTS_FAILED.inc();
        log::warn!(
          "prometheus remote write request failed: endpoint={}: {e}",
          self.endpoint
        );
      },
    }
  }
}
