// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./fast_histogram_test.rs"]
mod fast_histogram_test;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const MAX_SAMPLES: usize = 1000;

//
// FastHistogram
//

// A bounded reservoir of samples used for quantile estimation inside a
// Summary window. Once the reservoir is full, new samples replace random
// existing ones with probability len/count, which keeps the reservoir a
// uniform sample of everything observed since the last reset.
pub(super) struct FastHistogram {
  a: Vec<f64>,
  count: u64,
  rng: SmallRng,
}

impl Default for FastHistogram {
  fn default() -> Self {
    Self {
      a: Vec::new(),
      count: 0,
      rng: SmallRng::from_entropy(),
    }
  }
}

impl FastHistogram {
  pub fn reset(&mut self) {
    self.a.clear();
    self.count = 0;
  }

  pub fn update(&mut self, v: f64) {
    self.count += 1;
    if self.a.len() < MAX_SAMPLES {
      self.a.push(v);
      return;
    }
    let n = self.rng.gen_range(0 .. self.count);
    if (n as usize) < self.a.len() {
      self.a[n as usize] = v;
    }
  }

  /// Fills `dst` with the estimated value for each quantile in `qs`. An
  /// empty reservoir yields NaN for every quantile.
  pub fn quantiles(&self, dst: &mut Vec<f64>, qs: &[f64]) {
    dst.clear();
    if self.a.is_empty() {
      dst.extend(qs.iter().map(|_| f64::NAN));
      return;
    }

    let mut sorted = self.a.clone();
    sorted.sort_unstable_by(f64::total_cmp);
    dst.extend(qs.iter().map(|q| quantile_sorted(&sorted, *q)));
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.a.len()
  }
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
  if q <= 0.0 {
    return sorted[0];
  }
  if q >= 1.0 {
    return sorted[sorted.len() - 1];
  }
  let idx = (q * (sorted.len() - 1) as f64 + 0.5) as usize;
  sorted[idx.min(sorted.len() - 1)]
}
