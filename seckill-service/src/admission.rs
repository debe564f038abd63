use serde::Serialize;
use shared::{BuyerId, ItemId, OrderRequest, OrderStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use crate::buffer::BufferHandle;
use crate::cache::{Reservation, StockCache};
use crate::error::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// A unit is reserved and the request is on its way to the log.
    Accepted,
    Duplicate,
    OutOfStock,
    /// The write-behind buffer could not take the request; nothing is reserved.
    SystemBusy,
}

/// Synchronous front of the pipeline. Decides in one cache round-trip and
/// never waits on the log or the store.
pub struct AdmissionController<C> {
    cache: Arc<C>,
    buffer: BufferHandle,
    dedup_window: Duration,
}

impl<C: StockCache> AdmissionController<C> {
    pub fn new(cache: Arc<C>, buffer: BufferHandle, dedup_window: Duration) -> Self {
        Self {
            cache,
            buffer,
            dedup_window,
        }
    }

    pub async fn admit(&self, request: OrderRequest) -> Result<Admission, CacheError> {
        match self.cache.try_reserve(request, self.dedup_window).await? {
            Reservation::Duplicate => {
                debug!("Duplicate request {}", request);
                Ok(Admission::Duplicate)
            }
            Reservation::OutOfStock => {
                debug!("Item {} out of stock for buyer {}", request.item_id, request.buyer_id);
                Ok(Admission::OutOfStock)
            }
            Reservation::Reserved => match self.buffer.offer(request) {
                Ok(()) => {
                    debug!("Order request buffered {}", request);
                    Ok(Admission::Accepted)
                }
                Err(rejected) => {
                    warn!("Rejecting {}: {}", request, rejected);
                    if let Err(e) = self.cache.release(request.item_id).await {
                        error!("Failed to release reservation for {}: {}", request, e);
                    }
                    Ok(Admission::SystemBusy)
                }
            },
        }
    }

    pub async fn poll_status(
        &self,
        buyer_id: BuyerId,
        item_ids: &[ItemId],
    ) -> Result<Vec<(ItemId, OrderStatus)>, CacheError> {
        let statuses = self.cache.statuses(buyer_id, item_ids).await?;
        Ok(item_ids.iter().copied().zip(statuses).collect())
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }
}
