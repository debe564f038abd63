//! In-memory stand-ins for the cache, the durable log and the store.

use shared::{BuyerId, ItemId, OrderRequest, OrderStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use crate::cache::{Reservation, StockCache};
use crate::error::{CacheError, LogError, StoreError};
use crate::kafka::LogProducer;
use crate::models::{Item, Order};
use crate::store::{OrderStore, Placement};

#[derive(Default)]
struct CacheState {
    stock: HashMap<ItemId, i64>,
    dedup: HashMap<OrderRequest, Instant>,
    status: HashMap<OrderRequest, OrderStatus>,
}

/// Mirrors the Redis script: every operation runs under one lock, so the
/// check-and-reserve step cannot interleave with another.
#[derive(Default)]
pub struct MemoryStockCache {
    state: Mutex<CacheState>,
}

impl MemoryStockCache {
    pub fn with_stock(stock: &[(ItemId, i64)]) -> Self {
        let cache = Self::default();
        cache.state.lock().unwrap().stock = stock.iter().copied().collect();
        cache
    }

    pub fn stock(&self, item_id: ItemId) -> i64 {
        self.state.lock().unwrap().stock.get(&item_id).copied().unwrap_or(0)
    }

    pub fn status(&self, request: OrderRequest) -> Option<OrderStatus> {
        self.state.lock().unwrap().status.get(&request).copied()
    }
}

impl StockCache for MemoryStockCache {
    async fn try_reserve(&self, request: OrderRequest, dedup_window: Duration) -> Result<Reservation, CacheError> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if state.dedup.get(&request).is_some_and(|&expires| expires > now) {
            return Ok(Reservation::Duplicate);
        }
        state.dedup.insert(request, now + dedup_window);

        let Some(stock) = state.stock.get_mut(&request.item_id) else {
            return Ok(Reservation::OutOfStock);
        };
        if *stock <= 0 {
            return Ok(Reservation::OutOfStock);
        }
        *stock -= 1;
        Ok(Reservation::Reserved)
    }

    async fn release(&self, item_id: ItemId) -> Result<(), CacheError> {
        *self.state.lock().unwrap().stock.entry(item_id).or_insert(0) += 1;
        Ok(())
    }

    async fn set_status(&self, request: OrderRequest, status: OrderStatus) -> Result<(), CacheError> {
        self.state.lock().unwrap().status.insert(request, status);
        Ok(())
    }

    async fn statuses(&self, buyer_id: BuyerId, item_ids: &[ItemId]) -> Result<Vec<OrderStatus>, CacheError> {
        let state = self.state.lock().unwrap();
        Ok(item_ids
            .iter()
            .map(|&item_id| {
                state
                    .status
                    .get(&OrderRequest::new(buyer_id, item_id))
                    .copied()
                    .unwrap_or(OrderStatus::Unknown)
            })
            .collect())
    }

    async fn warm_up(&self, stock: &[(ItemId, i64)]) -> Result<(), CacheError> {
        self.state.lock().unwrap().stock = stock.iter().copied().collect();
        Ok(())
    }

    async fn stock_snapshot(&self) -> Result<HashMap<ItemId, i64>, CacheError> {
        Ok(self.state.lock().unwrap().stock.clone())
    }
}

/// Records every batch; can be told to drop all records or those of one item.
#[derive(Default)]
pub struct RecordingProducer {
    batches: Mutex<Vec<Vec<OrderRequest>>>,
    fail_all: AtomicBool,
    reject_item: Option<ItemId>,
}

impl RecordingProducer {
    pub fn failing() -> Self {
        let producer = Self::default();
        producer.fail_all.store(true, Ordering::SeqCst);
        producer
    }

    pub fn rejecting_item(item_id: ItemId) -> Self {
        Self {
            reject_item: Some(item_id),
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<Vec<OrderRequest>> {
        self.batches.lock().unwrap().clone()
    }
}

impl LogProducer for RecordingProducer {
    async fn send_batch(&self, batch: &[OrderRequest]) -> Result<(), LogError> {
        let undelivered: Vec<OrderRequest> = if self.fail_all.load(Ordering::SeqCst) {
            batch.to_vec()
        } else {
            batch
                .iter()
                .copied()
                .filter(|request| Some(request.item_id) == self.reject_item)
                .collect()
        };

        let delivered: Vec<OrderRequest> = batch
            .iter()
            .copied()
            .filter(|request| !undelivered.contains(request))
            .collect();
        if !delivered.is_empty() {
            self.batches.lock().unwrap().push(delivered);
        }

        if undelivered.is_empty() {
            Ok(())
        } else {
            Err(LogError::Undelivered {
                undelivered,
                total: batch.len(),
                reason: "broker unavailable".to_string(),
            })
        }
    }
}

#[derive(Default)]
struct StoreState {
    items: HashMap<ItemId, i32>,
    orders: Vec<Order>,
}

/// Transactional in the sense that a failing placement changes nothing.
#[derive(Default)]
pub struct MemoryOrderStore {
    state: Mutex<StoreState>,
    fail_inserts: AtomicBool,
}

impl MemoryOrderStore {
    pub fn with_stock(stock: &[(ItemId, i32)]) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().items = stock.iter().copied().collect();
        store
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn stock(&self, item_id: ItemId) -> i32 {
        self.state.lock().unwrap().items.get(&item_id).copied().unwrap_or(0)
    }

    pub fn order_count(&self, request: OrderRequest) -> usize {
        self.state
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|order| order.buyer_id == request.buyer_id && order.item_id == request.item_id)
            .count()
    }
}

impl OrderStore for MemoryOrderStore {
    async fn place_order(&self, request: OrderRequest) -> Result<Placement, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .orders
            .iter()
            .any(|order| order.buyer_id == request.buyer_id && order.item_id == request.item_id)
        {
            return Ok(Placement::AlreadyExists);
        }
        match state.items.get(&request.item_id) {
            Some(stock) if *stock > 0 => {}
            _ => return Err(StoreError::SoldOut(request.item_id)),
        }
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Query(diesel::result::Error::RollbackTransaction));
        }

        if let Some(stock) = state.items.get_mut(&request.item_id) {
            *stock -= 1;
        }
        let id = state.orders.len() as i64 + 1;
        state.orders.push(Order {
            id,
            buyer_id: request.buyer_id,
            item_id: request.item_id,
            status: "completed".to_string(),
            created_at: None,
        });
        Ok(Placement::Created(id))
    }

    async fn items(&self) -> Result<Vec<Item>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut items: Vec<Item> = state
            .items
            .iter()
            .map(|(&id, &stock)| Item {
                id,
                title: format!("item-{id}"),
                description: String::new(),
                stock,
            })
            .collect();
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    async fn recent_orders(&self, limit: i64) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .iter()
            .rev()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}
