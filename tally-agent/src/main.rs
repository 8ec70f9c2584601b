// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use clap::Parser;
use log::info;
use std::num::NonZeroUsize;
use std::time::Duration;
use tally_agent::config::{parse_duration, parse_quantiles, Config};
use tally_agent::run_server;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser, Debug, Clone)]
struct Options {
  /// Address to listen on for statsd plaintext over TCP.
  #[arg(long = "bind", default_value = "127.0.0.1:8125")]
  pub bind: String,

  /// Prometheus remote write endpoint to forward aggregated series to.
  #[arg(long = "remote-write-url")]
  pub remote_write_url: String,

  /// Number of independent aggregation shards.
  #[arg(long = "aggregator.shardCount", default_value_t = 64)]
  pub shard_count: usize,

  /// Flush tick period; also the summary quantile window.
  #[arg(long = "aggregator.flushInterval", default_value = "10s", value_parser = parse_duration)]
  pub flush_interval: Duration,

  /// Comma separated summary quantiles.
  #[arg(long = "aggregator.quantiles", default_value = "0.5,0.75,0.95,0.99,0.999")]
  pub quantiles: String,

  /// Timeout for each remote write request.
  #[arg(long = "request-timeout", default_value = "30s", value_parser = parse_duration)]
  pub request_timeout: Duration,
}

fn main() -> anyhow::Result<()> {
  env_logger::init();
  let opts = Options::parse();

  let config = Config {
    bind: opts.bind,
    remote_write_url: opts.remote_write_url,
    shard_count: opts.shard_count,
    flush_interval: opts.flush_interval,
    quantiles: parse_quantiles(&opts.quantiles)?,
    request_timeout: opts.request_timeout,
  };

  let num_threads = std::thread::available_parallelism().unwrap_or_else(|_| {
    log::warn!("could not determine number of CPUs. Defaulting to 1");
    NonZeroUsize::new(1).unwrap()
  });
  info!("running agent with {num_threads} workers");
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_threads.into())
    .enable_all()
    .build()
    .unwrap();

  runtime.block_on(run_server(config, async {
    // Trap ctrl+c and sigterm and perform a clean shutdown with a final
    // flush.
    let mut sigint = signal(SignalKind::interrupt()).unwrap();
    let mut sigterm = signal(SignalKind::terminate()).unwrap();
    select! {
      _ = sigint.recv() => info!("received sigint"),
      _ = sigterm.recv() => info!("received sigterm"),
    }
  }))
}
