// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./handler_test.rs"]
mod handler_test;

use super::aggregation::Aggregator;
use super::inflow::RowsCallback;
use crate::protos::statsd::{Rows, Tag};
use bytes::{BufMut, BytesMut};
use std::sync::Arc;

// Builds the canonical fingerprint for a metric with already-sorted tags:
// `__name__:<metric>` followed by `,<key>:<value>` per tag.
pub(crate) fn build_fingerprint(key: &mut BytesMut, metric: &[u8], tags: &[Tag]) {
  key.clear();
  key.put_slice(b"__name__:");
  key.put_slice(metric);
  for tag in tags {
    key.put_u8(b',');
    key.put_slice(&tag.key);
    key.put_u8(b':');
    key.put_slice(&tag.value);
  }
}

//
// InsertHandler
//

/// Turns parsed rows into aggregator inserts: sorts each row's tags by key,
/// computes the canonical fingerprint, and routes the row to its shard.
pub struct InsertHandler {
  aggregator: Arc<Aggregator>,
}

impl InsertHandler {
  pub fn new(aggregator: Arc<Aggregator>) -> Arc<Self> {
    Arc::new(Self { aggregator })
  }

  pub fn handle_rows(&self, rows: &mut Rows) {
    let mut key = BytesMut::with_capacity(128);
    for i in 0 .. rows.rows.len() {
      let tags_range = rows.rows[i].tags.clone();
      // Stable sort: tags with equal keys keep their input order.
      rows.tags_pool[tags_range.clone()].sort_by(|a, b| a.key.cmp(&b.key));

      let row = &rows.rows[i];
      let tags = &rows.tags_pool[tags_range];
      build_fingerprint(&mut key, &row.metric, tags);
      self.aggregator.insert(&key, row, tags);
    }
  }

  /// The parse-stream callback feeding this handler.
  pub fn callback(self: &Arc<Self>) -> RowsCallback {
    let handler = self.clone();
    Arc::new(move |rows| handler.handle_rows(rows))
  }
}
