// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./histogram_test.rs"]
mod histogram_test;

use crate::pipeline::outflow::PushCtx;
use crate::protos::prompb::{make_label, Label};
use parking_lot::Mutex;
use std::sync::LazyLock;

// Log-range bucket layout: every power of ten between 10^E10_MIN and
// 10^E10_MAX is split into BUCKETS_PER_DECIMAL multiplicative buckets.
// Values outside the covered range land in the lower/upper overflow buckets.
const E10_MIN: i32 = -9;
const E10_MAX: i32 = 18;
const BUCKETS_PER_DECIMAL: usize = 18;
const BUCKETS_COUNT: usize = ((E10_MAX - E10_MIN) as usize) * BUCKETS_PER_DECIMAL;

fn bucket_bound(i: usize) -> f64 {
  10f64.powf(f64::from(E10_MIN) + i as f64 / BUCKETS_PER_DECIMAL as f64)
}

// vmrange label values for every bucket, formatted once.
static BUCKET_RANGES: LazyLock<Vec<String>> = LazyLock::new(|| {
  (0 .. BUCKETS_COUNT)
    .map(|i| format!("{:.3e}...{:.3e}", bucket_bound(i), bucket_bound(i + 1)))
    .collect()
});

static LOWER_RANGE: LazyLock<String> = LazyLock::new(|| format!("0...{:.3e}", bucket_bound(0)));
static UPPER_RANGE: LazyLock<String> =
  LazyLock::new(|| format!("{:.3e}...+Inf", bucket_bound(BUCKETS_COUNT)));

//
// Histogram
//

// A bucketed histogram for statsd `h` submissions, emitting
// `<name>_bucket{vmrange="lo...hi"}` series for every non-empty bucket plus
// `<name>_sum` and `<name>_count`. Bucket counts accumulate for the lifetime
// of the series; each flush emits the current totals as-is. The staleness
// counter only gates emission and eviction.
pub(super) struct Histogram {
  inner: Mutex<HistogramInner>,
}

struct HistogramInner {
  buckets: Vec<u64>,
  lower: u64,
  upper: u64,
  sum: f64,
  staleness: usize,
}

impl Default for Histogram {
  fn default() -> Self {
    Self {
      inner: Mutex::new(HistogramInner {
        buckets: vec![0; BUCKETS_COUNT],
        lower: 0,
        upper: 0,
        sum: 0.0,
        staleness: 0,
      }),
    }
  }
}

impl Histogram {
  pub fn update(&self, v: f64) {
    // Negative values cannot be represented in a log-range layout.
    if v.is_nan() || v < 0.0 {
      return;
    }

    let mut inner = self.inner.lock();
    inner.staleness = 0;
    inner.sum += v;

    let bucket_idx = (v.log10() - f64::from(E10_MIN)) * BUCKETS_PER_DECIMAL as f64;
    if bucket_idx < 0.0 {
      inner.lower += 1;
    } else if bucket_idx >= BUCKETS_COUNT as f64 {
      inner.upper += 1;
    } else {
      let mut idx = bucket_idx as usize;
      // Values landing exactly on a bucket boundary belong to the bucket
      // below, keeping the upper bound exclusive.
      if bucket_idx == bucket_idx.trunc() && idx > 0 {
        idx -= 1;
      }
      let idx = idx.min(BUCKETS_COUNT - 1);
      inner.buckets[idx] += 1;
    }
  }

  pub fn marshal_to(
    &self,
    ctx: &mut PushCtx,
    name: &str,
    labels: &[Label],
    timestamp: i64,
  ) -> usize {
    let inner = {
      let mut inner = self.inner.lock();
      inner.staleness += 1;
      if inner.staleness > 1 {
        return inner.staleness;
      }
      HistogramInner {
        buckets: inner.buckets.clone(),
        lower: inner.lower,
        upper: inner.upper,
        sum: inner.sum,
        staleness: inner.staleness,
      }
    };

    let mut count = inner.lower + inner.upper;
    let bucket_name = format!("{name}_bucket");
    let emit_bucket = |ctx: &mut PushCtx, range: &str, n: u64| {
      let mut bucket_labels = labels.to_vec();
      bucket_labels.push(make_label("__name__", bucket_name.as_str()));
      bucket_labels.push(make_label("vmrange", range));
      ctx.append_sample(bucket_labels, n as f64, timestamp);
    };

    if inner.lower > 0 {
      emit_bucket(ctx, &LOWER_RANGE, inner.lower);
    }
    for (i, n) in inner.buckets.iter().enumerate() {
      if *n > 0 {
        count += n;
        emit_bucket(ctx, &BUCKET_RANGES[i], *n);
      }
    }
    if inner.upper > 0 {
      emit_bucket(ctx, &UPPER_RANGE, inner.upper);
    }

    if count > 0 {
      let mut sum_labels = labels.to_vec();
      sum_labels.push(make_label("__name__", format!("{name}_sum")));
      ctx.append_sample(sum_labels, inner.sum, timestamp);

      let mut count_labels = labels.to_vec();
      count_labels.push(make_label("__name__", format!("{name}_count")));
      ctx.append_sample(count_labels, count as f64, timestamp);
    }

    1
  }
}
