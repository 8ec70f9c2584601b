// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::pipeline::handler::InsertHandler;
use crate::pipeline::outflow::MockRemoteWritePush;
use crate::test::{parse_rows, series_value, CapturePush};
use pretty_assertions::assert_eq;

const QUANTILES: &[f64] = &[0.5, 0.9];

fn make_aggregator(push: Arc<dyn RemoteWritePush>) -> Aggregator {
  Aggregator::new(4, Duration::from_secs(3600), QUANTILES, push).unwrap()
}

// Routes statsd plaintext through the real fingerprint handler into the
// aggregator.
fn insert_lines(aggregator: &Arc<Aggregator>, input: &str) {
  let mut rows = parse_rows(input);
  assert!(!rows.rows.is_empty(), "no valid rows in {input:?}");
  InsertHandler::new(aggregator.clone()).handle_rows(&mut rows);
}

#[tokio::test]
async fn counter_sums_sample_rate_adjusted_values() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "reqs:2|c\nreqs:3|c|@0.5\nreqs:1|c|@0.2");
  aggregator.flush().await;

  let requests = push.take();
  assert_eq!(1, requests.len());
  // 2/1 + 3/0.5 + 1/0.2 = 13
  assert_eq!(Some(13.0), series_value(&requests[0], "reqs", &[]));
  aggregator.close().await;
}

#[tokio::test]
async fn counter_resets_after_flush() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "reqs:5|c");
  aggregator.flush().await;
  assert_eq!(Some(5.0), series_value(&push.take()[0], "reqs", &[]));

  insert_lines(&aggregator, "reqs:7|c");
  aggregator.flush().await;
  assert_eq!(Some(7.0), series_value(&push.take()[0], "reqs", &[]));
  aggregator.close().await;
}

#[tokio::test]
async fn gauge_last_write_wins() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "temp:1|g\ntemp:2|g\ntemp:42|g");
  aggregator.flush().await;

  assert_eq!(Some(42.0), series_value(&push.take()[0], "temp", &[]));
  aggregator.close().await;
}

#[tokio::test]
async fn tags_become_labels() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "reqs:1|c|#region:eu,host:a");
  aggregator.flush().await;

  let requests = push.take();
  assert_eq!(
    Some(1.0),
    series_value(&requests[0], "reqs", &[("region", "eu"), ("host", "a")])
  );
  aggregator.close().await;
}

#[tokio::test]
async fn same_tags_in_any_order_share_a_series() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "reqs:1|c|#a:1,b:2\nreqs:1|c|#b:2,a:1");
  aggregator.flush().await;

  let requests = push.take();
  assert_eq!(1, requests[0].timeseries.len());
  assert_eq!(
    Some(2.0),
    series_value(&requests[0], "reqs", &[("a", "1"), ("b", "2")])
  );
  aggregator.close().await;
}

#[tokio::test]
async fn summary_emits_sum_count_and_quantiles() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(
    &aggregator,
    "svc.rt:100|ms|#region:eu\nsvc.rt:200|ms|#region:eu\nsvc.rt:300|ms|#region:eu",
  );
  aggregator.flush().await;

  let requests = push.take();
  assert_eq!(1, requests.len());
  let wr = &requests[0];
  assert_eq!(Some(600.0), series_value(wr, "svc.rt_sum", &[("region", "eu")]));
  assert_eq!(Some(3.0), series_value(wr, "svc.rt_count", &[("region", "eu")]));
  assert_eq!(
    Some(200.0),
    series_value(wr, "svc.rt", &[("quantile", "0.5"), ("region", "eu")])
  );
  assert_eq!(
    Some(300.0),
    series_value(wr, "svc.rt", &[("quantile", "0.9"), ("region", "eu")])
  );
  aggregator.close().await;
}

#[tokio::test]
async fn summary_sum_count_emitted_only_when_updated() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "rt:10|ms");
  aggregator.flush().await;
  push.take();

  // Second flush without updates: _sum/_count are gone, but the quantile
  // companions still emit since the sliding window has not rotated yet.
  aggregator.flush().await;
  let requests = push.take();
  assert_eq!(1, requests.len());
  assert_eq!(None, series_value(&requests[0], "rt_sum", &[]));
  assert_eq!(None, series_value(&requests[0], "rt_count", &[]));
  assert_eq!(
    Some(10.0),
    series_value(&requests[0], "rt", &[("quantile", "0.5")])
  );
  aggregator.close().await;
}

#[tokio::test]
async fn histogram_emits_buckets_sum_and_count() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "lat:1|h|#region:eu\nlat:1|h|#region:eu\nlat:250|h|#region:eu");
  aggregator.flush().await;

  let requests = push.take();
  assert_eq!(1, requests.len());
  let wr = &requests[0];
  assert_eq!(Some(252.0), series_value(wr, "lat_sum", &[("region", "eu")]));
  assert_eq!(Some(3.0), series_value(wr, "lat_count", &[("region", "eu")]));

  let buckets: Vec<_> = wr
    .timeseries
    .iter()
    .filter(|ts| {
      ts.labels
        .iter()
        .any(|l| l.name == "__name__" && l.value == "lat_bucket")
    })
    .collect();
  assert_eq!(2, buckets.len());
  let counts: Vec<f64> = buckets.iter().map(|ts| ts.samples[0].value).collect();
  assert!(counts.contains(&2.0));
  assert!(counts.contains(&1.0));
  assert!(
    buckets
      .iter()
      .all(|ts| ts.labels.iter().any(|l| l.name == "vmrange"))
  );

  // Every emitted series carries exactly one __name__ label.
  for ts in &wr.timeseries {
    assert_eq!(
      1,
      ts.labels.iter().filter(|l| l.name == "__name__").count(),
      "series has duplicate __name__ labels: {:?}",
      ts.labels
    );
  }
  aggregator.close().await;
}

#[tokio::test]
async fn kind_mismatch_drops_update() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "thing:1|c");
  // Same fingerprint, different kinds: all dropped without touching state.
  insert_lines(&aggregator, "thing:5|g\nthing:5|ms\nthing:5|h");
  aggregator.flush().await;

  let requests = push.take();
  assert_eq!(1, requests[0].timeseries.len());
  assert_eq!(Some(1.0), series_value(&requests[0], "thing", &[]));
  aggregator.close().await;
}

#[tokio::test]
async fn invalid_metric_name_rejected() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "bad-name:1|c\n1leading:2|c");
  aggregator.flush().await;

  assert!(push.is_empty());
  aggregator.close().await;
}

#[tokio::test]
async fn stale_series_skipped_then_evicted() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "reqs:1|c");
  aggregator.flush().await;
  assert_eq!(1, push.take().len());

  // Stale flushes emit nothing.
  aggregator.flush().await;
  assert!(push.is_empty());

  // Staleness passes the eviction threshold after enough idle cycles.
  for _ in 0 .. STALENESS_EVICT_THRESHOLD {
    aggregator.flush().await;
  }
  assert!(
    aggregator
      .inner
      .shards
      .iter()
      .all(|shard| shard.state.lock().metrics.is_empty())
  );

  // A fresh insert recreates the series from scratch.
  insert_lines(&aggregator, "reqs:3|c");
  aggregator.flush().await;
  assert_eq!(Some(3.0), series_value(&push.take()[0], "reqs", &[]));
  aggregator.close().await;
}

#[tokio::test]
async fn summary_eviction_removes_companions_together() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "rt:10|ms");
  for _ in 0 .. STALENESS_EVICT_THRESHOLD + 2 {
    aggregator.flush().await;
  }

  assert!(
    aggregator
      .inner
      .shards
      .iter()
      .all(|shard| shard.state.lock().metrics.is_empty())
  );
  assert!(
    aggregator
      .inner
      .shards
      .iter()
      .all(|shard| shard.state.lock().summaries.is_empty())
  );
  aggregator.close().await;
}

#[tokio::test]
async fn continuously_active_series_never_evicted() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  for _ in 0 .. STALENESS_EVICT_THRESHOLD + 3 {
    insert_lines(&aggregator, "reqs:1|c");
    aggregator.flush().await;
  }

  let live: usize = aggregator
    .inner
    .shards
    .iter()
    .map(|shard| shard.state.lock().metrics.len())
    .sum();
  assert_eq!(1, live);
  aggregator.close().await;
}

#[tokio::test]
async fn empty_flush_does_not_push() {
  let mut push = MockRemoteWritePush::new();
  push.expect_push().never();
  let aggregator = make_aggregator(Arc::new(push));
  aggregator.flush().await;
  aggregator.close().await;
}

#[tokio::test]
async fn close_performs_final_flush() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  insert_lines(&aggregator, "reqs:9|c");
  aggregator.close().await;

  let requests = push.take();
  assert_eq!(1, requests.len());
  assert_eq!(Some(9.0), series_value(&requests[0], "reqs", &[]));
}

#[tokio::test]
async fn shards_partition_the_fingerprint_space() {
  let push = CapturePush::new();
  let aggregator = Arc::new(make_aggregator(push.clone()));

  let lines: String = (0 .. 64)
    .map(|i| format!("metric_{i}:1|c\n"))
    .collect();
  insert_lines(&aggregator, &lines);

  let populated = aggregator
    .inner
    .shards
    .iter()
    .filter(|shard| !shard.state.lock().metrics.is_empty())
    .count();
  assert!(populated > 1, "all series landed in one shard");

  aggregator.flush().await;
  let requests = push.take();
  let total: usize = requests.iter().map(|wr| wr.timeseries.len()).sum();
  assert_eq!(64, total);
  aggregator.close().await;
}

#[test]
fn quantile_out_of_range_rejected_at_construction() {
  let push = CapturePush::new();
  for quantiles in [&[-0.1][..], &[1.1][..]] {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let _guard = runtime.enter();
    assert!(
      Aggregator::new(4, Duration::from_secs(10), quantiles, push.clone()).is_err()
    );
  }
}

#[test]
fn boundary_quantiles_accepted() {
  let push = CapturePush::new();
  let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
  let _guard = runtime.enter();
  assert!(Aggregator::new(4, Duration::from_secs(10), &[0.0, 1.0], push).is_ok());
}

#[test]
fn metric_name_validation() {
  assert!(validate_metric_name("foo"));
  assert!(validate_metric_name("foo_bar:baz"));
  assert!(validate_metric_name("_leading"));
  assert!(validate_metric_name("f00"));
  assert!(validate_metric_name("foo.bar"));
  assert!(!validate_metric_name(""));
  assert!(!validate_metric_name("0foo"));
  assert!(!validate_metric_name(".foo"));
  assert!(!validate_metric_name("foo-bar"));
  assert!(!validate_metric_name("foo bar"));
}
