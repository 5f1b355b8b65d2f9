//! Bidirectional byte splice between an authenticated client and its backend.
//!
//! Two copy tasks run per session, one per direction, each reporting how it
//! ended on a two-slot channel. A copy task that panics still reports. The
//! supervisor waits for the first report or for shutdown, then cancels the
//! session token so the remaining task leaves its blocked read or write, and
//! joins both before returning.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::buffer_pool::BufferPool;
use super::metrics::RelayMetrics;
use super::session::panic_message;

/// Direction of one copy task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client->backend",
            Direction::BackendToClient => "backend->client",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a copy task stopped.
#[derive(Debug)]
enum CopyEnd {
    Eof,
    Cancelled,
    Failed(io::Error),
    Panicked(String),
}

#[derive(Debug)]
struct CopyReport {
    direction: Direction,
    bytes: u64,
    end: CopyEnd,
}

/// Summary of a finished splice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpliceOutcome {
    /// Direction whose task finished first, if any finished before shutdown
    pub first_finished: Option<Direction>,
    /// Whether the process-wide shutdown ended the session
    pub shutdown: bool,
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Client and backend streams ready to be spliced.
pub struct Splice<C, B> {
    client: C,
    backend: B,
    pool: BufferPool,
    metrics: Arc<RelayMetrics>,
}

impl<C, B> Splice<C, B>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(client: C, backend: B, pool: BufferPool, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            client,
            backend,
            pool,
            metrics,
        }
    }

    /// Copy bytes both ways until one side finishes or `shutdown` fires.
    ///
    /// Both copy tasks have exited when this returns; the streams are
    /// dropped (closed) with them.
    pub async fn run(self, shutdown: &CancellationToken) -> SpliceOutcome {
        let session = shutdown.child_token();
        let (client_read, client_write) = split(self.client);
        let (backend_read, backend_write) = split(self.backend);
        let (tx, mut rx) = mpsc::channel(2);

        let upstream = tokio::spawn(supervised_copy(
            client_read,
            backend_write,
            Direction::ClientToBackend,
            self.pool.clone(),
            Arc::clone(&self.metrics),
            session.clone(),
            tx.clone(),
        ));
        let downstream = tokio::spawn(supervised_copy(
            backend_read,
            client_write,
            Direction::BackendToClient,
            self.pool,
            Arc::clone(&self.metrics),
            session.clone(),
            tx,
        ));

        let mut outcome = SpliceOutcome::default();
        let mut reports = Vec::with_capacity(2);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Shutdown requested, ending relay session");
                outcome.shutdown = true;
            }
            report = rx.recv() => {
                if let Some(report) = report {
                    outcome.first_finished = Some(report.direction);
                    reports.push(report);
                }
            }
        }
        session.cancel();

        for (direction, joined) in [
            (Direction::ClientToBackend, upstream.await),
            (Direction::BackendToClient, downstream.await),
        ] {
            if let Err(e) = joined {
                if e.is_panic() {
                    self.metrics.session_panicked();
                }
                error!(%direction, error = %e, "Copy task did not finish cleanly");
            }
        }
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }

        for report in reports {
            match report.end {
                CopyEnd::Eof => {
                    debug!(direction = %report.direction, bytes = report.bytes, "EOF")
                }
                CopyEnd::Cancelled => {
                    trace!(direction = %report.direction, bytes = report.bytes, "Cancelled")
                }
                CopyEnd::Failed(e) => {
                    debug!(direction = %report.direction, bytes = report.bytes, error = %e, "Copy ended with error")
                }
                CopyEnd::Panicked(message) => {
                    error!(direction = %report.direction, panic = %message, "Copy task panicked")
                }
            }
            match report.direction {
                Direction::ClientToBackend => outcome.client_to_backend = report.bytes,
                Direction::BackendToClient => outcome.backend_to_client = report.bytes,
            }
        }
        outcome
    }
}

/// Run one direction and report how it ended, panics included.
async fn supervised_copy<R, W>(
    reader: R,
    writer: W,
    direction: Direction,
    pool: BufferPool,
    metrics: Arc<RelayMetrics>,
    cancel: CancellationToken,
    results: mpsc::Sender<CopyReport>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = AssertUnwindSafe(copy_direction(
        reader,
        writer,
        direction,
        pool,
        Arc::clone(&metrics),
        cancel,
    ))
    .catch_unwind()
    .await;

    let (bytes, end) = match copied {
        Ok(finished) => finished,
        Err(payload) => {
            metrics.session_panicked();
            (0, CopyEnd::Panicked(panic_message(payload.as_ref()).to_string()))
        }
    };
    let _ = results
        .send(CopyReport {
            direction,
            bytes,
            end,
        })
        .await;
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    pool: BufferPool,
    metrics: Arc<RelayMetrics>,
    cancel: CancellationToken,
) -> (u64, CopyEnd)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.acquire();
    let mut bytes = 0u64;

    let end = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break CopyEnd::Cancelled,
            read = reader.read(&mut buf[..]) => match read {
                Ok(0) => {
                    let _ = writer.shutdown().await;
                    break CopyEnd::Eof;
                }
                Ok(n) => n,
                Err(e) => break CopyEnd::Failed(e),
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break CopyEnd::Cancelled,
            written = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => written,
        };
        if let Err(e) = written {
            break CopyEnd::Failed(e);
        }

        trace!(%direction, bytes = n, "Relayed chunk");
        bytes += n as u64;
        match direction {
            Direction::ClientToBackend => metrics.record_client_to_backend(n as u64),
            Direction::BackendToClient => metrics.record_backend_to_client(n as u64),
        }
    };
    drop(buf);
    (bytes, end)
}
