// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::pipeline::outflow::PushCtx;
use crate::protos::prompb::Label;
use parking_lot::Mutex;

//
// Gauge
//

// A last-write-wins gauge with the same staleness/reset discipline as
// FloatCounter.
#[derive(Default)]
pub(super) struct Gauge {
  inner: Mutex<GaugeInner>,
}

#[derive(Default)]
struct GaugeInner {
  n: f64,
  staleness: usize,
}

impl Gauge {
  pub fn set(&self, n: f64) {
    let mut inner = self.inner.lock();
    inner.staleness = 0;
    inner.n = n;
  }

  pub fn marshal_to(&self, ctx: &mut PushCtx, labels: &[Label], timestamp: i64) -> usize {
    let value = {
      let mut inner = self.inner.lock();
      inner.staleness += 1;
      if inner.staleness > 1 {
        return inner.staleness;
      }
      std::mem::take(&mut inner.n)
    };

    ctx.append_sample(labels.to_vec(), value, timestamp);
    1
  }
}
