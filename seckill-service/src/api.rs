use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use shared::{BuyerId, ItemId, OrderRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use crate::admission::{Admission, AdmissionController};
use crate::cache::StockCache;
use crate::models::{Item, Order};
use crate::store::OrderStore;

const RECENT_ORDERS_LIMIT: i64 = 1000;

pub struct AppState<C, S> {
    pub admission: Arc<AdmissionController<C>>,
    pub store: Arc<S>,
}

impl<C, S> Clone for AppState<C, S> {
    fn clone(&self) -> Self {
        Self {
            admission: self.admission.clone(),
            store: self.store.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SeckillResponse {
    pub message: String,
    pub outcome: Option<Admission>,
    pub error: Option<String>,
    pub item_id: ItemId,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: BTreeMap<String, i8>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn unavailable(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse { error: e.to_string() }),
    )
}

pub fn create_router<C: StockCache, S: OrderStore>(state: AppState<C, S>) -> Router {
    Router::new()
        .route("/api/seckill/:item_id/:buyer_id", get(seckill::<C, S>))
        .route("/api/orders/status/:item_ids/:buyer_id", get(order_status::<C, S>))
        .route("/api/stock", get(stock::<C, S>))
        .route("/api/items", get(items::<C, S>))
        .route("/api/orders", get(orders::<C, S>))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn seckill<C: StockCache, S: OrderStore>(
    State(state): State<AppState<C, S>>,
    Path((item_id, buyer_id)): Path<(ItemId, BuyerId)>,
) -> (StatusCode, Json<SeckillResponse>) {
    let request = OrderRequest::new(buyer_id, item_id);

    let (code, message, outcome, error) = match state.admission.admit(request).await {
        Ok(Admission::Accepted) => (StatusCode::OK, "seckill order pending", Admission::Accepted, None),
        Ok(Admission::Duplicate) => (StatusCode::CONFLICT, "seckill failed", Admission::Duplicate, Some("repeat order")),
        Ok(Admission::OutOfStock) => (StatusCode::GONE, "seckill failed", Admission::OutOfStock, Some("out of stock")),
        Ok(Admission::SystemBusy) => (StatusCode::TOO_MANY_REQUESTS, "seckill failed", Admission::SystemBusy, Some("system busy")),
        Err(e) => {
            tracing::error!("Admission for {} failed: {}", request, e);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(SeckillResponse {
                    message: "seckill failed".to_string(),
                    outcome: None,
                    error: Some(e.to_string()),
                    item_id,
                }),
            );
        }
    };

    (
        code,
        Json(SeckillResponse {
            message: message.to_string(),
            outcome: Some(outcome),
            error: error.map(str::to_string),
            item_id,
        }),
    )
}

pub async fn order_status<C: StockCache, S: OrderStore>(
    State(state): State<AppState<C, S>>,
    Path((item_ids, buyer_id)): Path<(String, BuyerId)>,
) -> Result<Json<StatusResponse>, ApiError> {
    let item_ids = item_ids
        .split(':')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<ItemId>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("invalid item id list: {}", e),
                }),
            )
        })?;

    let statuses = state
        .admission
        .poll_status(buyer_id, &item_ids)
        .await
        .map_err(unavailable)?;

    Ok(Json(StatusResponse {
        status: statuses
            .into_iter()
            .map(|(item_id, status)| (item_id.to_string(), status.as_i8()))
            .collect(),
    }))
}

pub async fn stock<C: StockCache, S: OrderStore>(
    State(state): State<AppState<C, S>>,
) -> Result<Json<BTreeMap<ItemId, i64>>, ApiError> {
    let snapshot = state
        .admission
        .cache()
        .stock_snapshot()
        .await
        .map_err(unavailable)?;
    Ok(Json(snapshot.into_iter().collect()))
}

pub async fn items<C: StockCache, S: OrderStore>(
    State(state): State<AppState<C, S>>,
) -> Result<Json<Vec<Item>>, ApiError> {
    state.store.items().await.map(Json).map_err(unavailable)
}

pub async fn orders<C: StockCache, S: OrderStore>(
    State(state): State<AppState<C, S>>,
) -> Result<Json<Vec<Order>>, ApiError> {
    state
        .store
        .recent_orders(RECENT_ORDERS_LIMIT)
        .await
        .map(Json)
        .map_err(unavailable)
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer;
    use crate::testing::{MemoryOrderStore, MemoryStockCache};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use shared::OrderStatus;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(cache: Arc<MemoryStockCache>, capacity: usize) -> (Router, tokio::sync::mpsc::Receiver<OrderRequest>) {
        let (handle, rx) = buffer::channel(capacity);
        let admission = Arc::new(AdmissionController::new(cache, handle, Duration::from_secs(5)));
        let store = Arc::new(MemoryOrderStore::with_stock(&[(2, 3)]));
        (create_router(AppState { admission, store }), rx)
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn seckill_outcomes_map_to_status_codes() {
        let cache = Arc::new(MemoryStockCache::with_stock(&[(2, 1)]));
        let (router, _rx) = app(cache, 8);

        let (code, body) = get(&router, "/api/seckill/2/7").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["outcome"], "accepted");
        assert_eq!(body["item_id"], 2);

        let (code, body) = get(&router, "/api/seckill/2/7").await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["outcome"], "duplicate");

        let (code, body) = get(&router, "/api/seckill/2/8").await;
        assert_eq!(code, StatusCode::GONE);
        assert_eq!(body["outcome"], "out_of_stock");
    }

    #[tokio::test]
    async fn busy_buffer_is_too_many_requests() {
        let cache = Arc::new(MemoryStockCache::with_stock(&[(2, 3)]));
        let (router, _rx) = app(cache.clone(), 0);

        let (code, body) = get(&router, "/api/seckill/2/7").await;
        assert_eq!(code, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["outcome"], "system_busy");
        assert_eq!(cache.stock(2), 3);
    }

    #[tokio::test]
    async fn status_poll_lists_every_requested_item() {
        let cache = Arc::new(MemoryStockCache::with_stock(&[(2, 3)]));
        cache
            .set_status(OrderRequest::new(7, 2), OrderStatus::Succeeded)
            .await
            .unwrap();
        let (router, _rx) = app(cache, 8);

        let (code, body) = get(&router, "/api/orders/status/1:2:3/7").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"]["1"], 0);
        assert_eq!(body["status"]["2"], 1);
        assert_eq!(body["status"]["3"], 0);

        let (code, _) = get(&router, "/api/orders/status/1:x/7").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn read_endpoints() {
        let cache = Arc::new(MemoryStockCache::with_stock(&[(2, 3)]));
        let (router, _rx) = app(cache, 8);

        let (code, body) = get(&router, "/api/stock").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["2"], 3);

        let (_, body) = get(&router, "/api/items").await;
        assert_eq!(body[0]["stock"], 3);

        let (_, body) = get(&router, "/api/orders").await;
        assert_eq!(body, serde_json::json!([]));
    }
}
