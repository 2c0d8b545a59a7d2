//! Aggregate log streams: fan-in of every worker's stdout/stderr into one
//! tagged stream (spec §3's `AggregateStream`).

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::mpsc;

use crate::worker::WorkerId;

/// Which of a worker's two log streams a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// The worker's standard output.
    Stdout,
    /// The worker's standard error.
    Stderr,
}

/// One chunk of worker output, tagged with its source worker and stream.
#[derive(Debug, Clone)]
pub struct LogChunk {
    /// The worker that produced this chunk.
    pub worker: WorkerId,
    /// Which stream (stdout/stderr) it came from.
    pub kind: LogKind,
    /// The raw bytes. No line-buffering or encoding is imposed.
    pub bytes: Bytes,
}

/// The sending half registered into every worker's log-pumping tasks.
///
/// Cloning an `AggregateSender` and handing a clone to each worker is the
/// "fan-in" itself: no buffering happens beyond the underlying channel, per
/// spec §3.
#[derive(Debug, Clone)]
pub struct AggregateSender(mpsc::UnboundedSender<LogChunk>);

impl AggregateSender {
    pub(crate) fn send(&self, chunk: LogChunk) {
        // The receiving half (the Pool's AggregateStream) may have been
        // dropped by a caller uninterested in logs; that is not an error
        // for the worker emitting them.
        let _ = self.0.send(chunk);
    }
}

/// The `Stream<Item = LogChunk>` a [`crate::pool::Pool`] exposes for its
/// aggregated stdout or stderr.
#[derive(Debug)]
pub struct AggregateStream(mpsc::UnboundedReceiver<LogChunk>);

/// Construct a fresh fan-in pair: the sender half is cloned into each
/// worker; the receiver half is owned by the Pool.
pub(crate) fn channel() -> (AggregateSender, AggregateStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AggregateSender(tx), AggregateStream(rx))
}

impl Stream for AggregateStream {
    type Item = LogChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogChunk>> {
        self.0.poll_recv(cx)
    }
}
