//! Write-behind buffer between admission and the durable log.
//!
//! Admission hands accepted requests to a [`BufferHandle`] without waiting.
//! A single [`DrainWorker`] owns the receiving side and groups requests into
//! batches, flushing when a batch reaches `batch_size` or when
//! `flush_interval` has passed since the last flush, whichever comes first.
//! Requests the log never acknowledges get their reserved unit released.

use shared::OrderRequest;
use std::mem;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use crate::cache::StockCache;
use crate::config::BufferConfig;
use crate::error::LogError;
use crate::kafka::LogProducer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferRejected {
    #[error("write-behind buffer is full")]
    Full,
    #[error("write-behind buffer is closed")]
    Closed,
}

/// Producer side of the buffer, cloned into every admission path.
#[derive(Clone)]
pub struct BufferHandle {
    tx: mpsc::Sender<OrderRequest>,
    capacity: usize,
}

impl BufferHandle {
    /// Never waits: a full or closed buffer is reported immediately.
    pub fn offer(&self, request: OrderRequest) -> Result<(), BufferRejected> {
        if self.capacity == 0 {
            return Err(BufferRejected::Full);
        }
        self.tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => BufferRejected::Full,
            TrySendError::Closed(_) => BufferRejected::Closed,
        })
    }
}

/// Builds a buffer of `capacity` entries. A capacity of zero yields a handle
/// that rejects every offer.
pub fn channel(capacity: usize) -> (BufferHandle, mpsc::Receiver<OrderRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (BufferHandle { tx, capacity }, rx)
}

pub struct DrainWorker<P, C> {
    producer: Arc<P>,
    cache: Arc<C>,
    batch_size: usize,
    flush_interval: time::Duration,
}

impl<P: LogProducer, C: StockCache> DrainWorker<P, C> {
    pub fn new(producer: Arc<P>, cache: Arc<C>, config: &BufferConfig) -> Self {
        Self {
            producer,
            cache,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<OrderRequest>, shutdown: CancellationToken) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut ticker = time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(request) => {
                        batch.push(request);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }

        // Stop new offers, then push out whatever is still queued.
        rx.close();
        while let Some(request) = rx.recv().await {
            batch.push(request);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch).await;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        info!("Write-behind drain stopped");
    }

    async fn flush(&self, batch: &mut Vec<OrderRequest>) {
        let pending = mem::replace(batch, Vec::with_capacity(self.batch_size));
        match self.producer.send_batch(&pending).await {
            Ok(()) => info!("Batch sent: {} requests", pending.len()),
            Err(LogError::Undelivered { undelivered, total, reason }) => {
                error!("Batch send failed for {} of {} requests: {}", undelivered.len(), total, reason);
                self.compensate(&undelivered).await;
            }
            Err(e) => {
                error!("Batch send failed: {}", e);
                self.compensate(&pending).await;
            }
        }
    }

    async fn compensate(&self, requests: &[OrderRequest]) {
        for request in requests {
            match self.cache.release(request.item_id).await {
                Ok(()) => debug!("Released reservation for {}", request),
                Err(e) => error!("Failed to release reservation for {}: {}", request, e),
            }
        }
    }
}
