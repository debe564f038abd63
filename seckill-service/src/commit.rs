use futures::{Stream, StreamExt};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::Message;
use shared::{LogRecord, OrderRequest, OrderStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::cache::StockCache;
use crate::store::{OrderStore, Placement};

const REOPEN_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(i64),
    /// The order was committed by an earlier delivery.
    AlreadyExists,
    Failed(String),
}

/// Turns log records into orders, one at a time, in delivery order.
pub struct CommitProcessor<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
}

impl<S: OrderStore, C: StockCache> CommitProcessor<S, C> {
    pub fn new(store: Arc<S>, cache: Arc<C>) -> Self {
        Self { store, cache }
    }

    pub async fn run(&self, consumer: StreamConsumer, shutdown: CancellationToken) {
        {
            let mut message_stream = consumer.stream();

            loop {
                // Only the wait for the next record is cancellable; a commit in
                // progress always runs to completion.
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = next_resuming(&mut message_stream, || consumer.stream()) => next,
                };

                match message {
                    Ok(m) => {
                        match m.payload() {
                            Some(payload) => {
                                self.handle_payload(payload).await;
                            }
                            None => warn!("Skipping empty record at offset {}", m.offset()),
                        }
                        if let Err(e) = consumer.store_offset_from_message(&m) {
                            error!("Error storing offset: {}", e);
                        }
                    }
                    Err(KafkaError::PartitionEOF(partition)) => {
                        debug!("Reached end of partition {}", partition);
                    }
                    Err(e) => error!("Error receiving record: {}", e),
                }
            }
        }

        if let Err(e) = consumer.commit_consumer_state(CommitMode::Sync) {
            warn!("Final offset commit failed: {}", e);
        }
        info!("Commit processor stopped");
    }

    /// Decodes one record and commits it. Control and malformed records are
    /// dropped without touching any state.
    pub async fn handle_payload(&self, payload: &[u8]) -> Option<CommitOutcome> {
        match LogRecord::decode(payload) {
            Ok(LogRecord::Activate) => {
                info!("Reader activated, ready for seckill");
                None
            }
            Ok(LogRecord::Order(request)) => Some(self.commit(request).await),
            Err(e) => {
                error!("Dropping record: {}", e);
                None
            }
        }
    }

    pub async fn commit(&self, request: OrderRequest) -> CommitOutcome {
        match self.store.place_order(request).await {
            Ok(Placement::Created(order_id)) => {
                self.write_status(request, OrderStatus::Succeeded).await;
                info!("Order {} created for {}", order_id, request);
                CommitOutcome::Committed(order_id)
            }
            Ok(Placement::AlreadyExists) => {
                // Not a failure: the first delivery owns the status.
                info!("Order for {} already exists", request);
                self.release(request).await;
                CommitOutcome::AlreadyExists
            }
            Err(e) => {
                error!("Order for {} failed: {}", request, e);
                self.release(request).await;
                self.write_status(request, OrderStatus::Failed).await;
                CommitOutcome::Failed(e.to_string())
            }
        }
    }

    async fn release(&self, request: OrderRequest) {
        if let Err(e) = self.cache.release(request.item_id).await {
            error!("Failed to release reservation for {}: {}", request, e);
        }
    }

    async fn write_status(&self, request: OrderRequest, status: OrderStatus) {
        if let Err(e) = self.cache.set_status(request, status).await {
            error!("Failed to write status {:?} for {}: {}", status, request, e);
        }
    }
}

/// Next item of `stream`. An ended stream is reopened after a short pause
/// rather than ending the caller's loop.
async fn next_resuming<St, F>(stream: &mut St, mut reopen: F) -> St::Item
where
    St: Stream + Unpin,
    F: FnMut() -> St,
{
    loop {
        if let Some(item) = stream.next().await {
            return item;
        }
        warn!("Order stream ended, reopening");
        time::sleep(REOPEN_BACKOFF).await;
        *stream = reopen();
    }
}
