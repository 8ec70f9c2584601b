// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;

#[test]
fn empty_reservoir_yields_nan() {
  let h = FastHistogram::default();
  let mut dst = Vec::new();
  h.quantiles(&mut dst, &[0.5, 0.99]);
  assert_eq!(2, dst.len());
  assert!(dst.iter().all(|v| v.is_nan()));
}

#[test]
fn quantiles_on_small_sample() {
  let mut h = FastHistogram::default();
  for v in [300.0, 100.0, 200.0] {
    h.update(v);
  }
  let mut dst = Vec::new();
  h.quantiles(&mut dst, &[0.0, 0.5, 0.9, 1.0]);
  assert_eq!(dst, vec![100.0, 200.0, 300.0, 300.0]);
}

#[test]
fn reservoir_is_bounded() {
  let mut h = FastHistogram::default();
  for i in 0 .. 10 * MAX_SAMPLES {
    h.update(i as f64);
  }
  assert_eq!(MAX_SAMPLES, h.len());

  // The median estimate must land somewhere inside the observed range.
  let mut dst = Vec::new();
  h.quantiles(&mut dst, &[0.5]);
  assert!(dst[0] >= 0.0 && dst[0] < (10 * MAX_SAMPLES) as f64);
}

#[test]
fn reset_clears_samples() {
  let mut h = FastHistogram::default();
  h.update(1.0);
  h.reset();
  let mut dst = Vec::new();
  h.quantiles(&mut dst, &[0.5]);
  assert!(dst[0].is_nan());

  h.update(7.0);
  h.quantiles(&mut dst, &[0.5]);
  assert_eq!(dst, vec![7.0]);
}
