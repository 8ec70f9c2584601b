// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use anyhow::Context;
use std::time::Duration;

//
// Config
//

/// Fully parsed agent configuration. All options are fixed at startup.
#[derive(Clone, Debug)]
pub struct Config {
  pub bind: String,
  pub remote_write_url: String,
  pub shard_count: usize,
  pub flush_interval: Duration,
  pub quantiles: Vec<f64>,
  pub request_timeout: Duration,
}

/// Parses a comma separated quantile list (e.g. `0.5,0.99`). Range checking
/// happens at aggregator construction; any unparsable entry aborts startup.
pub fn parse_quantiles(s: &str) -> anyhow::Result<Vec<f64>> {
  s.split(',')
    .map(|part| {
      let part = part.trim();
      part
        .parse::<f64>()
        .with_context(|| format!("invalid quantile {part:?}"))
    })
    .collect()
}

/// Parses a duration flag: a number with an optional `ms`, `s`, `m` or `h`
/// suffix. A bare number means seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
  let s = s.trim();
  let (number, unit): (&str, fn(f64) -> Duration) = if let Some(n) = s.strip_suffix("ms") {
    (n, |v| Duration::from_secs_f64(v / 1000.0))
  } else if let Some(n) = s.strip_suffix('s') {
    (n, Duration::from_secs_f64)
  } else if let Some(n) = s.strip_suffix('m') {
    (n, |v| Duration::from_secs_f64(v * 60.0))
  } else if let Some(n) = s.strip_suffix('h') {
    (n, |v| Duration::from_secs_f64(v * 3600.0))
  } else {
    (s, Duration::from_secs_f64)
  };

  let value: f64 = number
    .parse()
    .map_err(|_| format!("invalid duration {s:?}"))?;
  if value < 0.0 || !value.is_finite() {
    return Err(format!("invalid duration {s:?}"));
  }
  Ok(unit(value))
}
