// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

mod counter;
mod fast_histogram;
mod gauge;
mod histogram;
mod summary;

use self::counter::FloatCounter;
use self::gauge::Gauge;
use self::histogram::Histogram;
use self::summary::{QuantileValue, Summary, SummaryRegistry};
use crate::pipeline::outflow::{PushCtx, PushCtxPool, RemoteWritePush};
use crate::protos::prompb::{make_label, Label};
use crate::protos::statsd::{MetricType, Row, Tag};
use hashbrown::HashMap;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// A series stops being emitted after one flush without updates and is evicted
// from the shard map once its staleness exceeds this many flush cycles.
const STALENESS_EVICT_THRESHOLD: usize = 6;

static ROWS_INSERTED: LazyLock<IntCounter> = LazyLock::new(|| {
  prometheus::register_int_counter!(
    prometheus::Opts::new(
      "rows_inserted_total",
      "Total number of series emitted by aggregation flushes."
    )
    .const_label("type", "statsd")
  )
  .unwrap()
});

static ROWS_PER_INSERT: LazyLock<prometheus::Histogram> = LazyLock::new(|| {
  prometheus::register_histogram!(
    prometheus::HistogramOpts::new(
      "rows_per_insert",
      "Number of series emitted per aggregation flush."
    )
    .const_label("type", "statsd")
  )
  .unwrap()
});

fn timestamp_ms() -> i64 {
  let unix_seconds = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs();
  i64::try_from(unix_seconds).unwrap_or_default() * 1000
}

// Valid metric name: `[A-Za-z_:]` first, `[A-Za-z0-9_:.]` after. Dots are
// accepted past the first character since statsd names are dot delimited.
fn validate_metric_name(name: &str) -> bool {
  if name.is_empty() {
    return false;
  }
  name.bytes().enumerate().all(|(i, b)| match b {
    b'a' ..= b'z' | b'A' ..= b'Z' | b'_' | b':' => true,
    b'0' ..= b'9' | b'.' => i != 0,
    _ => false,
  })
}

fn gen_row_labels(name: &str, tags: &[Tag], with_name: bool) -> Vec<Label> {
  let mut labels = Vec::with_capacity(tags.len() + 1);
  if with_name {
    labels.push(make_label("__name__", name));
  }
  for tag in tags {
    labels.push(make_label(
      String::from_utf8_lossy(&tag.key),
      String::from_utf8_lossy(&tag.value),
    ));
  }
  labels
}

// Map key for the companion entry carrying one quantile of a summary. Uses
// '=' as the separator so it can never collide with a real fingerprint,
// whose tags are ':' separated.
fn quantile_key(key: &[u8], q: f64) -> Box<[u8]> {
  let mut companion = Vec::with_capacity(key.len() + 16);
  companion.extend_from_slice(key);
  companion.extend_from_slice(format!(",quantile={q}").as_bytes());
  companion.into_boxed_slice()
}

//
// MetricAggregation
//

// Wraps the per-kind aggregation state of one named metric.
enum MetricAggregation {
  Counter(FloatCounter),
  Gauge(Gauge),
  Summary(Arc<Summary>),
  SummaryQuantile(QuantileValue),
  Histogram(Histogram),
}

impl MetricAggregation {
  fn kind_matches(&self, metric_type: MetricType) -> bool {
    matches!(
      (self, metric_type),
      (Self::Counter(_), MetricType::Counter)
        | (Self::Gauge(_), MetricType::Gauge)
        | (Self::Summary(_), MetricType::Timing)
        | (Self::Histogram(_), MetricType::Histogram)
    )
  }

  // Appends this metric's samples to the push context and returns the
  // post-increment staleness, which the flusher compares against the eviction
  // threshold. Quantile companions always report zero; they are evicted with
  // their parent.
  fn marshal_to(&self, ctx: &mut PushCtx, name: &str, labels: &[Label], timestamp: i64) -> usize {
    match self {
      Self::Counter(c) => c.marshal_to(ctx, labels, timestamp),
      Self::Gauge(g) => g.marshal_to(ctx, labels, timestamp),
      Self::Summary(s) => s.marshal_to(ctx, name, labels, timestamp),
      Self::SummaryQuantile(qv) => qv.marshal_to(ctx, labels, timestamp),
      Self::Histogram(h) => h.marshal_to(ctx, name, labels, timestamp),
    }
  }
}

//
// NamedMetric
//

// A fingerprinted aggregator: the map key it lives under, the bare metric
// name, the label set it is emitted with, and the kind-specific state.
struct NamedMetric {
  key: Box<[u8]>,
  name: String,
  labels: Vec<Label>,
  metric: MetricAggregation,
}

//
// Shard
//

struct ShardState {
  metrics: HashMap<Box<[u8]>, Arc<NamedMetric>>,
  // Summaries registered in this shard, walked at the start of every flush to
  // refresh quantile values.
  summaries: Vec<Arc<Summary>>,
  // Scratch for the flush snapshot, reused across ticks.
  buf: Vec<Arc<NamedMetric>>,
}

struct Shard {
  window: Duration,
  quantiles: Arc<[f64]>,
  state: Mutex<ShardState>,
}

impl Shard {
  fn new(window: Duration, quantiles: Arc<[f64]>) -> Self {
    Self {
      window,
      quantiles,
      state: Mutex::new(ShardState {
        metrics: HashMap::new(),
        summaries: Vec::new(),
        buf: Vec::new(),
      }),
    }
  }

  fn insert(&self, key: &[u8], row: &Row, tags: &[Tag], registry: &Arc<SummaryRegistry>) {
    let Some(nm) = self.get_or_create(key, row, tags, registry) else {
      return;
    };
    match (&nm.metric, row.metric_type) {
      (MetricAggregation::Counter(c), MetricType::Counter) => {
        c.add(row.value * (1.0 / row.sample_rate));
      },
      (MetricAggregation::Gauge(g), MetricType::Gauge) => g.set(row.value),
      (MetricAggregation::Summary(s), MetricType::Timing) => s.update(row.value),
      (MetricAggregation::Histogram(h), MetricType::Histogram) => h.update(row.value),
      _ => (),
    }
  }

  // Double-checked get-or-create. The fast path is a single lock/lookup; on
  // miss the aggregator is constructed outside the lock and discarded if
  // another task won the race. Returns None when the metric name is invalid
  // or an existing entry holds a different kind (the update is dropped).
  fn get_or_create(
    &self,
    key: &[u8],
    row: &Row,
    tags: &[Tag],
    registry: &Arc<SummaryRegistry>,
  ) -> Option<Arc<NamedMetric>> {
    if let Some(nm) = self.state.lock().metrics.get(key) {
      return nm.metric.kind_matches(row.metric_type).then(|| nm.clone());
    }

    let name = match std::str::from_utf8(&row.metric) {
      Ok(name) if validate_metric_name(name) => name.to_string(),
      _ => {
        log::warn!("dropping metric with invalid name {:?}", row.metric);
        return None;
      },
    };

    let mut summary = None;
    let metric = match row.metric_type {
      MetricType::Counter => MetricAggregation::Counter(FloatCounter::default()),
      MetricType::Gauge => MetricAggregation::Gauge(Gauge::default()),
      MetricType::Timing => {
        let sm = Arc::new(Summary::new(self.window, self.quantiles.clone()));
        summary = Some(sm.clone());
        MetricAggregation::Summary(sm)
      },
      MetricType::Histogram => MetricAggregation::Histogram(Histogram::default()),
    };
    // Counters and gauges are emitted under the bare metric name; summaries
    // and histograms append their own suffixed `__name__` when marshaling.
    let with_name = matches!(row.metric_type, MetricType::Counter | MetricType::Gauge);
    let nm_new = Arc::new(NamedMetric {
      key: key.into(),
      name: name.clone(),
      labels: gen_row_labels(&name, tags, with_name),
      metric,
    });

    // Companion entries are built outside the lock as well; on race loss the
    // whole spare set is dropped.
    let companions: Vec<Arc<NamedMetric>> = summary
      .as_ref()
      .map(|sm| {
        let labels = gen_row_labels(&name, tags, true);
        self
          .quantiles
          .iter()
          .enumerate()
          .map(|(idx, q)| {
            let mut quantile_labels = labels.clone();
            quantile_labels.push(make_label("quantile", format!("{q}")));
            Arc::new(NamedMetric {
              key: quantile_key(key, *q),
              name: name.clone(),
              labels: quantile_labels,
              metric: MetricAggregation::SummaryQuantile(QuantileValue::new(sm.clone(), idx)),
            })
          })
          .collect()
      })
      .unwrap_or_default();

    let mut state = self.state.lock();
    if let Some(existing) = state.metrics.get(key) {
      return existing
        .metric
        .kind_matches(row.metric_type)
        .then(|| existing.clone());
    }
    state.metrics.insert(nm_new.key.clone(), nm_new.clone());
    for companion in companions {
      state.metrics.insert(companion.key.clone(), companion);
    }
    if let Some(sm) = summary {
      state.summaries.push(sm.clone());
      registry.register(sm);
    }
    Some(nm_new)
  }
}

//
// Aggregator
//

struct AggregatorInner {
  shards: Vec<Shard>,
  summaries: Arc<SummaryRegistry>,
  push: Arc<dyn RemoteWritePush>,
  push_ctx_pool: PushCtxPool,
}

impl AggregatorInner {
  async fn flush(&self) {
    for shard in &self.shards {
      self.flush_shard(shard).await;
    }
  }

  async fn flush_shard(&self, shard: &Shard) {
    // Refresh quantiles and snapshot the shard under its lock; the marshal
    // pass and the downstream push run without it.
    let mut buf = {
      let mut state = shard.state.lock();
      for summary in &state.summaries {
        summary.update_quantiles();
      }
      let mut buf = std::mem::take(&mut state.buf);
      buf.clear();
      buf.extend(state.metrics.values().cloned());
      buf
    };

    let mut ctx = self.push_ctx_pool.get();
    let mut evicted: Vec<Arc<NamedMetric>> = Vec::new();
    let timestamp = timestamp_ms();
    for nm in &buf {
      let staleness = nm.metric.marshal_to(&mut ctx, &nm.name, &nm.labels, timestamp);
      if staleness > STALENESS_EVICT_THRESHOLD {
        evicted.push(nm.clone());
      }
    }

    let emitted = ctx.write_request.timeseries.len();
    if emitted > 0 {
      self.push.push(&ctx.write_request).await;
      ROWS_INSERTED.inc_by(emitted as u64);
      ROWS_PER_INSERT.observe(emitted as f64);
    }

    if !evicted.is_empty() {
      let mut stale_summaries = Vec::new();
      {
        let mut state = shard.state.lock();
        for nm in &evicted {
          log::debug!("evicting stale series {}", nm.name);
          state.metrics.remove(&nm.key);
          if let MetricAggregation::Summary(sm) = &nm.metric {
            // Companion keys derive from the parent fingerprint, so the whole
            // family leaves the map together.
            for q in shard.quantiles.iter() {
              state.metrics.remove(&quantile_key(&nm.key, *q));
            }
            state.summaries.retain(|s| !Arc::ptr_eq(s, sm));
            stale_summaries.push(sm.clone());
          }
        }
      }
      for sm in stale_summaries {
        self.summaries.unregister(&sm);
      }
    }

    buf.clear();
    shard.state.lock().buf = buf;
    self.push_ctx_pool.put(ctx);
  }
}

/// The sharded in-memory aggregation engine. Rows are routed to one of
/// `shard_count` independent shards by fingerprint hash; a background task
/// flushes every shard to the remote write sink each `flush_interval` and
/// evicts series that stopped receiving updates.
pub struct Aggregator {
  inner: Arc<AggregatorInner>,
  shutdown: CancellationToken,
  flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
  /// Creates the aggregator and starts its flush task. `flush_interval` is
  /// also the summary quantile window. Fails fast on invalid configuration.
  pub fn new(
    shard_count: usize,
    flush_interval: Duration,
    quantiles: &[f64],
    push: Arc<dyn RemoteWritePush>,
  ) -> anyhow::Result<Self> {
    anyhow::ensure!(shard_count > 0, "shard count must be positive");
    anyhow::ensure!(
      !flush_interval.is_zero(),
      "flush interval must be positive"
    );
    for q in quantiles {
      anyhow::ensure!(
        (0.0 ..= 1.0).contains(q),
        "quantile must be in the range [0..1]; got {q}"
      );
    }

    let quantiles: Arc<[f64]> = quantiles.to_vec().into();
    let shutdown = CancellationToken::new();
    let inner = Arc::new(AggregatorInner {
      shards: (0 .. shard_count)
        .map(|_| Shard::new(flush_interval, quantiles.clone()))
        .collect(),
      summaries: SummaryRegistry::new(shutdown.clone()),
      push,
      push_ctx_pool: PushCtxPool::default(),
    });

    let flush_task = tokio::spawn(flush_loop(
      inner.clone(),
      flush_interval,
      shutdown.clone(),
    ));

    Ok(Self {
      inner,
      shutdown,
      flush_task: Mutex::new(Some(flush_task)),
    })
  }

  /// Routes one parsed row to its shard. `key` is the canonical fingerprint
  /// and `tags` are the row's tags, already sorted by key.
  pub fn insert(&self, key: &[u8], row: &Row, tags: &[Tag]) {
    let shards = &self.inner.shards;
    let shard = &shards[(xxhash_rust::xxh64::xxh64(key, 0) % shards.len() as u64) as usize];
    shard.insert(key, row, tags, &self.inner.summaries);
  }

  /// Runs one flush pass over every shard. Normally driven by the background
  /// task; exposed for the shutdown path and tests.
  pub async fn flush(&self) {
    self.inner.flush().await;
  }

  /// Stops the background tasks. The in-flight flush completes, followed by
  /// one final flush of everything still buffered.
  pub async fn close(&self) {
    self.shutdown.cancel();
    let flush_task = self.flush_task.lock().take();
    if let Some(flush_task) = flush_task {
      let _ignored = flush_task.await;
    }
  }
}

async fn flush_loop(
  inner: Arc<AggregatorInner>,
  flush_interval: Duration,
  shutdown: CancellationToken,
) {
  let mut ticker = tokio::time::interval(flush_interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // The first tick completes immediately; consume it so flushes start one
  // interval from now.
  ticker.tick().await;
  loop {
    tokio::select! {
      _ = ticker.tick() => inner.flush().await,
      () = shutdown.cancelled() => {
        log::debug!("shutting down aggregation flush task");
        break;
      },
    }
  }

  log::debug!("performing shutdown flush");
  inner.flush().await;
}
