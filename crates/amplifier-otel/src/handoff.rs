//! Non-blocking handoff between the span engine and the export pipeline.
//!
//! Completed spans and metric points cross into the export task through a
//! bounded queue. Submission never waits: when the queue is full the record
//! is dropped and counted.

use crate::metrics::MetricPoint;
use crate::span::FinishedSpan;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// One unit of work for the export pipeline.
#[derive(Debug, Clone)]
pub enum ExportRecord {
    Span(FinishedSpan),
    Metric(MetricPoint),
}

/// Error types for record submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Queue is full; the record was dropped
    #[error("export queue is full")]
    Full,
    /// Export pipeline has shut down; the record was dropped
    #[error("export queue is closed")]
    Closed,
}

/// Counters for the handoff queue.
///
/// Submitters on many threads bump these concurrently, so each counter sits
/// on its own cache line.
#[derive(Debug, Default)]
pub struct HandoffMetrics {
    spans_submitted: CachePadded<AtomicU64>,
    spans_dropped: CachePadded<AtomicU64>,
    metric_points_submitted: CachePadded<AtomicU64>,
    metric_points_dropped: CachePadded<AtomicU64>,
}

// Relaxed everywhere: these are statistics and guard no other data.
impl HandoffMetrics {
    pub fn spans_submitted(&self) -> u64 {
        self.spans_submitted.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    pub fn metric_points_submitted(&self) -> u64 {
        self.metric_points_submitted.load(Ordering::Relaxed)
    }

    pub fn metric_points_dropped(&self) -> u64 {
        self.metric_points_dropped.load(Ordering::Relaxed)
    }
}

/// Cloneable submission side of the export queue.
#[derive(Debug, Clone)]
pub struct ExportHandle {
    tx: mpsc::Sender<ExportRecord>,
    metrics: Arc<HandoffMetrics>,
}

/// Receiving side of the export queue, owned by the export pipeline.
#[derive(Debug)]
pub struct ExportReceiver {
    rx: mpsc::Receiver<ExportRecord>,
}

/// Creates a bounded export queue.
pub fn channel(capacity: usize) -> (ExportHandle, ExportReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ExportHandle {
            tx,
            metrics: Arc::new(HandoffMetrics::default()),
        },
        ExportReceiver { rx },
    )
}

impl ExportHandle {
    /// Queues a finished span without waiting.
    pub fn submit_span(&self, span: FinishedSpan) -> Result<(), SubmitError> {
        let result = self.try_submit(ExportRecord::Span(span));
        let counter = match result {
            Ok(()) => &self.metrics.spans_submitted,
            Err(_) => &self.metrics.spans_dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Queues a metric point without waiting.
    pub fn submit_metric(&self, point: MetricPoint) -> Result<(), SubmitError> {
        let result = self.try_submit(ExportRecord::Metric(point));
        let counter = match result {
            Ok(()) => &self.metrics.metric_points_submitted,
            Err(_) => &self.metrics.metric_points_dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn try_submit(&self, record: ExportRecord) -> Result<(), SubmitError> {
        self.tx.try_send(record).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Full,
            TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    pub fn metrics(&self) -> &Arc<HandoffMetrics> {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ExportReceiver {
    /// Waits for the next record; `None` once every handle is dropped.
    pub async fn recv(&mut self) -> Option<ExportRecord> {
        self.rx.recv().await
    }

    /// Takes everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<ExportRecord> {
        let mut records = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(record) => records.push(record),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        records
    }

    /// Drains and keeps only finished spans.
    pub fn drain_spans(&mut self) -> Vec<FinishedSpan> {
        self.drain()
            .into_iter()
            .filter_map(|r| match r {
                ExportRecord::Span(span) => Some(span),
                ExportRecord::Metric(_) => None,
            })
            .collect()
    }
}
