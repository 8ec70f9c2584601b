// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::protos::prompb::{Label, Sample, TimeSeries, WriteRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

//
// RemoteWritePush
//

/// The egress seam the flusher talks to. Pushes are fire and forget:
/// implementations log and count failures, the flusher never observes them.
#[mockall::automock]
#[async_trait]
pub trait RemoteWritePush: Send + Sync {
  async fn push<'a>(&self, write_request: &'a WriteRequest);
}

//
// PushCtx
//

// Reusable scratch for one flush pass: the write request being assembled.
// Obtained from and returned to a PushCtxPool.
#[derive(Default)]
pub struct PushCtx {
  pub write_request: WriteRequest,
}

impl PushCtx {
  pub fn reset(&mut self) {
    self.write_request.timeseries.clear();
  }

  pub fn append_sample(&mut self, labels: Vec<Label>, value: f64, timestamp: i64) {
    self.write_request.timeseries.push(TimeSeries {
      labels,
      samples: vec![Sample { value, timestamp }],
    });
  }
}

//
// PushCtxPool
//

// Free list of PushCtx values, bounded by effective parallelism so idle
// contexts do not pin flush-sized allocations forever.
pub struct PushCtxPool {
  free: Mutex<Vec<PushCtx>>,
  capacity: usize,
}

impl Default for PushCtxPool {
  fn default() -> Self {
    Self {
      free: Mutex::new(Vec::new()),
      capacity: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
    }
  }
}

impl PushCtxPool {
  pub fn get(&self) -> PushCtx {
    self.free.lock().pop().unwrap_or_default()
  }

  pub fn put(&self, mut ctx: PushCtx) {
    ctx.reset();
    let mut free = self.free.lock();
    if free.len() < self.capacity {
      free.push(ctx);
    }
  }
}
