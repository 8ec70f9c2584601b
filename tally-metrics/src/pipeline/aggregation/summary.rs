// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./summary_test.rs"]
mod summary_test;

use super::fast_histogram::FastHistogram;
use crate::pipeline::outflow::PushCtx;
use crate::protos::prompb::{make_label, Label};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

//
// Summary
//

// A sliding-window quantile/sum/count estimator for statsd timings.
//
// Two reservoirs are maintained: `curr` covers everything since the previous
// swap, `next` covers everything since the current half-window started. The
// swap loop rotates them every `window / 2`, so `curr` always holds between
// one and two windows of data. Quantiles are read from `curr` once per flush
// via `update_quantiles`; the resulting vector stays stable for the whole
// flush pass so the companion `QuantileValue` entries observe consistent
// numbers.
//
// Flushing emits `<name>_sum` / `<name>_count` and resets only those running
// totals. The reservoirs are reset exclusively through the swap.
pub(super) struct Summary {
  window: Duration,
  quantiles: Arc<[f64]>,
  inner: Mutex<SummaryInner>,
}

struct SummaryInner {
  curr: FastHistogram,
  next: FastHistogram,
  quantile_values: Vec<f64>,
  sum: f64,
  count: u64,
  staleness: usize,
}

impl Summary {
  pub fn new(window: Duration, quantiles: Arc<[f64]>) -> Self {
    let quantile_values = vec![f64::NAN; quantiles.len()];
    Self {
      window,
      quantiles,
      inner: Mutex::new(SummaryInner {
        curr: FastHistogram::default(),
        next: FastHistogram::default(),
        quantile_values,
        sum: 0.0,
        count: 0,
        staleness: 0,
      }),
    }
  }

  pub const fn window(&self) -> Duration {
    self.window
  }

  pub fn update(&self, v: f64) {
    let mut inner = self.inner.lock();
    inner.staleness = 0;
    inner.curr.update(v);
    inner.next.update(v);
    inner.sum += v;
    inner.count += 1;
  }

  // Refreshes the quantile value vector from the current reservoir. Called by
  // the shard under its lock at the start of every flush.
  pub fn update_quantiles(&self) {
    let mut inner = self.inner.lock();
    let SummaryInner {
      curr,
      quantile_values,
      ..
    } = &mut *inner;
    curr.quantiles(quantile_values, &self.quantiles);
  }

  pub fn quantile_value(&self, idx: usize) -> f64 {
    self.inner.lock().quantile_values[idx]
  }

  // Rotates the reservoirs: `next` becomes `curr` and a fresh half-window
  // starts accumulating.
  pub fn swap(&self) {
    let mut inner = self.inner.lock();
    let SummaryInner { curr, next, .. } = &mut *inner;
    std::mem::swap(curr, next);
    next.reset();
  }

  pub fn marshal_to(
    &self,
    ctx: &mut PushCtx,
    name: &str,
    labels: &[Label],
    timestamp: i64,
  ) -> usize {
    let (sum, count) = {
      let mut inner = self.inner.lock();
      inner.staleness += 1;
      if inner.staleness > 1 {
        return inner.staleness;
      }
      let sum = std::mem::take(&mut inner.sum);
      let count = std::mem::take(&mut inner.count);
      (sum, count)
    };

    if count > 0 {
      let mut sum_labels = labels.to_vec();
      sum_labels.push(make_label("__name__", format!("{name}_sum")));
      ctx.append_sample(sum_labels, sum, timestamp);

      let mut count_labels = labels.to_vec();
      count_labels.push(make_label("__name__", format!("{name}_count")));
      ctx.append_sample(count_labels, count as f64, timestamp);
    }

    1
  }
}

//
// QuantileValue
//

// A view onto one slot of a Summary's quantile value vector. Companion map
// entries hold one of these; they share (and never outlive) the parent
// Summary, since companions are created and evicted together with it.
pub(super) struct QuantileValue {
  summary: Arc<Summary>,
  idx: usize,
}

impl QuantileValue {
  pub const fn new(summary: Arc<Summary>, idx: usize) -> Self {
    Self { summary, idx }
  }

  // Companions never drive eviction themselves, so this always reports zero
  // staleness. NaN quantiles (an empty window) are omitted from the output.
  pub fn marshal_to(&self, ctx: &mut PushCtx, labels: &[Label], timestamp: i64) -> usize {
    let v = self.summary.quantile_value(self.idx);
    if !v.is_nan() {
      ctx.append_sample(labels.to_vec(), v, timestamp);
    }
    0
  }
}

//
// SummaryRegistry
//

// Tracks live summaries per distinct window value and runs one swap loop per
// window, started lazily when the first summary for that window registers.
// Owned by the aggregator; loops stop when the aggregator shuts down.
pub(super) struct SummaryRegistry {
  shutdown: CancellationToken,
  windows: Mutex<HashMap<Duration, WindowEntry>>,
}

#[derive(Default)]
struct WindowEntry {
  summaries: Vec<Arc<Summary>>,
  swap_loop_started: bool,
}

impl SummaryRegistry {
  pub fn new(shutdown: CancellationToken) -> Arc<Self> {
    Arc::new(Self {
      shutdown,
      windows: Mutex::new(HashMap::new()),
    })
  }

  pub fn register(self: &Arc<Self>, summary: Arc<Summary>) {
    let window = summary.window();
    let mut windows = self.windows.lock();
    let entry = windows.entry(window).or_default();
    entry.summaries.push(summary);
    if !entry.swap_loop_started {
      entry.swap_loop_started = true;
      let registry = self.clone();
      tokio::spawn(async move {
        registry.swap_loop(window).await;
      });
    }
  }

  pub fn unregister(&self, summary: &Arc<Summary>) {
    let mut windows = self.windows.lock();
    if let Some(entry) = windows.get_mut(&summary.window()) {
      entry.summaries.retain(|s| !Arc::ptr_eq(s, summary));
    }
  }

  pub fn swap_window(&self, window: Duration) {
    let summaries: Vec<_> = self
      .windows
      .lock()
      .get(&window)
      .map(|entry| entry.summaries.clone())
      .unwrap_or_default();
    for summary in summaries {
      summary.swap();
    }
  }

  async fn swap_loop(self: Arc<Self>, window: Duration) {
    let half_window = window / 2;
    loop {
      tokio::select! {
        () = tokio::time::sleep(half_window) => self.swap_window(window),
        () = self.shutdown.cancelled() => {
          log::debug!("shutting down summary swap task for {window:?} window");
          break;
        },
      }
    }
  }
}
