// tally - statsd aggregation agent
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use crate::protos::statsd::Rows;
use bytes::{Buf, Bytes, BytesMut};
use memchr::memrchr;
use parking_lot::Mutex;
use prometheus::IntCounter;
use std::sync::{Arc, LazyLock};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

const READ_BUFFER_SIZE: usize = 64 * 1024;

static READ_CALLS: LazyLock<IntCounter> = LazyLock::new(|| {
  prometheus::register_int_counter!(
    prometheus::Opts::new(
      "protoparser_read_calls_total",
      "Total number of reads performed on statsd streams."
    )
    .const_label("type", "statsd")
  )
  .unwrap()
});

static READ_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
  prometheus::register_int_counter!(
    prometheus::Opts::new(
      "protoparser_read_errors_total",
      "Total number of read errors on statsd streams."
    )
    .const_label("type", "statsd")
  )
  .unwrap()
});

static ROWS_READ: LazyLock<IntCounter> = LazyLock::new(|| {
  prometheus::register_int_counter!(
    prometheus::Opts::new(
      "protoparser_rows_read_total",
      "Total number of statsd rows parsed from streams."
    )
    .const_label("type", "statsd")
  )
  .unwrap()
});

/// Invoked by parse workers with each parsed batch. May run concurrently for
/// different blocks of the same stream, and may run after `parse_stream`
/// returns. Implementations must not retain the rows past the call.
pub type RowsCallback = Arc<dyn Fn(&mut Rows) + Send + Sync>;

//
// ParseScheduler
//

struct UnmarshalWork {
  block: Bytes,
  rows: Rows,
  callback: RowsCallback,
}

/// Shared parse-work scheduler: a bounded work channel drained by a fixed set
/// of worker tasks, plus a free list of `Rows` recycled across blocks. One
/// scheduler serves every ingress stream in the process.
pub struct ParseScheduler {
  tx: mpsc::Sender<UnmarshalWork>,
  free: Arc<Mutex<Vec<Rows>>>,
}

impl ParseScheduler {
  /// Spawns `workers` parse tasks (at least one). Must be called within a
  /// tokio runtime.
  pub fn new(workers: usize) -> Self {
    let workers = workers.max(1);
    let (tx, rx) = mpsc::channel(workers * 2);
    let rx = Arc::new(TokioMutex::new(rx));
    let free: Arc<Mutex<Vec<Rows>>> = Arc::default();
    for _ in 0 .. workers {
      tokio::spawn(unmarshal_worker(rx.clone(), free.clone(), workers));
    }
    Self { tx, free }
  }

  async fn schedule(&self, block: Bytes, callback: RowsCallback) {
    let rows = self.free.lock().pop().unwrap_or_default();
    let work = UnmarshalWork {
      block,
      rows,
      callback,
    };
    // Send only fails if every worker exited, which means the process is
    // shutting down; the block is dropped.
    let _ignored = self.tx.send(work).await;
  }
}

async fn unmarshal_worker(
  rx: Arc<TokioMutex<mpsc::Receiver<UnmarshalWork>>>,
  free: Arc<Mutex<Vec<Rows>>>,
  free_capacity: usize,
) {
  loop {
    // The receiver lock is held only while waiting for the next item, so one
    // idle worker blocks on it while the rest process in parallel.
    let work = rx.lock().await.recv().await;
    let Some(mut work) = work else {
      break;
    };

    work.rows.unmarshal(&work.block);
    ROWS_READ.inc_by(work.rows.rows.len() as u64);
    (work.callback)(&mut work.rows);

    work.rows.reset();
    let mut free = free.lock();
    if free.len() < free_capacity {
      free.push(work.rows);
    }
  }
}

/// Reads `\n`-framed statsd data from `reader`, cutting line-aligned blocks
/// and scheduling them onto the shared parse workers. No record ever
/// straddles two blocks. Returns the first read error other than EOF; EOF is
/// success, and a trailing record without a newline is still parsed.
pub async fn parse_stream<R: AsyncRead + Unpin>(
  mut reader: R,
  scheduler: &ParseScheduler,
  callback: RowsCallback,
) -> std::io::Result<()> {
  let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
  loop {
    if buf.capacity() - buf.len() < READ_BUFFER_SIZE {
      buf.reserve(READ_BUFFER_SIZE);
    }

    READ_CALLS.inc();
    let bytes_read = match reader.read_buf(&mut buf).await {
      Ok(bytes_read) => bytes_read,
      Err(e) => {
        READ_ERRORS.inc();
        return Err(e);
      },
    };

    if bytes_read == 0 {
      if !buf.is_empty() {
        scheduler.schedule(buf.split().freeze(), callback).await;
      }
      return Ok(());
    }

    if let Some(newline) = memrchr(b'\n', buf.chunk()) {
      scheduler
        .schedule(buf.split_to(newline + 1).freeze(), callback.clone())
        .await;
    }
  }
}
