// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod config;

use anyhow::Context;
use config::Config;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tally_metrics::clients::prom::PromRemoteWriteClient;
use tally_metrics::pipeline::aggregation::Aggregator;
use tally_metrics::pipeline::handler::InsertHandler;
use tally_metrics::pipeline::inflow::{parse_stream, ParseScheduler};
use tokio::net::TcpListener;

/// Runs the agent: binds the statsd TCP listener, wires connections through
/// the parse workers into the aggregator, and tears everything down when
/// `shutdown` resolves. The aggregator performs a final flush on the way out.
pub async fn run_server(
  config: Config,
  shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
  let push = Arc::new(PromRemoteWriteClient::new(
    config.remote_write_url.clone(),
    config.request_timeout,
    None,
  )?);
  let aggregator = Arc::new(Aggregator::new(
    config.shard_count,
    config.flush_interval,
    &config.quantiles,
    push,
  )?);
  let handler = InsertHandler::new(aggregator.clone());

  let workers = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
  let scheduler = Arc::new(ParseScheduler::new(workers));

  let listener = TcpListener::bind(&config.bind)
    .await
    .with_context(|| format!("cannot bind {}", config.bind))?;
  log::info!(
    "listening for statsd on {}, forwarding to {}",
    config.bind,
    config.remote_write_url
  );

  tokio::pin!(shutdown);
  loop {
    tokio::select! {
      accepted = listener.accept() => match accepted {
        Ok((socket, peer)) => {
          let scheduler = scheduler.clone();
          let callback = handler.callback();
          tokio::spawn(async move {
            log::debug!("accepted statsd connection from {peer}");
            if let Err(e) = parse_stream(socket, &scheduler, callback).await {
              log::debug!("statsd connection from {peer} failed: {e}");
            }
          });
        },
        Err(e) => log::warn!("accept failed: {e}"),
      },
      () = &mut shutdown => break,
    }
  }

  log::info!("shutting down");
  aggregator.close().await;
  Ok(())
}
