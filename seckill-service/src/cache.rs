use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::{AsyncCommands, Script};
use shared::{BuyerId, ItemId, OrderRequest, OrderStatus};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::info;
use crate::config::CacheConfig;
use crate::error::CacheError;

const STOCK_KEY: &str = "seckill:stock";
const STATUS_KEY: &str = "seckill:status";
const DEDUP_PREFIX: &str = "seckill:dedup";

/// Outcome of the atomic check-and-reserve step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    Duplicate,
    OutOfStock,
}

/// Fast, eventually consistent mirror of item stock plus the de-duplication
/// markers and the order status map.
pub trait StockCache: Send + Sync + 'static {
    /// Checks the de-duplication marker, installs it, and takes one unit of
    /// stock as a single indivisible step.
    fn try_reserve(
        &self,
        request: OrderRequest,
        dedup_window: Duration,
    ) -> impl Future<Output = Result<Reservation, CacheError>> + Send;

    /// Gives one previously reserved unit back.
    fn release(&self, item_id: ItemId) -> impl Future<Output = Result<(), CacheError>> + Send;

    fn set_status(
        &self,
        request: OrderRequest,
        status: OrderStatus,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Statuses for `item_ids`, in the same order, unknown when absent.
    fn statuses(
        &self,
        buyer_id: BuyerId,
        item_ids: &[ItemId],
    ) -> impl Future<Output = Result<Vec<OrderStatus>, CacheError>> + Send;

    /// Replaces the whole stock mirror.
    fn warm_up(&self, stock: &[(ItemId, i64)]) -> impl Future<Output = Result<(), CacheError>> + Send;

    fn stock_snapshot(&self) -> impl Future<Output = Result<HashMap<ItemId, i64>, CacheError>> + Send;
}

// KEYS[1] dedup marker, KEYS[2] stock hash; ARGV[1] item id, ARGV[2] window in ms.
// Returns 1 reserved, 0 duplicate, -1 out of stock.
const ADMISSION_SCRIPT: &str = r#"
if not redis.call("SET", KEYS[1], "1", "NX", "PX", ARGV[2]) then
    return 0
end

local stock = redis.call("HGET", KEYS[2], ARGV[1])
if not stock then
    return -1
end
if tonumber(stock) <= 0 then
    return -1
end

local remaining = redis.call("HINCRBY", KEYS[2], ARGV[1], -1)
if remaining >= 0 then
    return 1
end
redis.call("HINCRBY", KEYS[2], ARGV[1], 1)
return -1
"#;

pub struct RedisStockCache {
    pool: Pool<RedisConnectionManager>,
    admission: Script,
    command_timeout: Duration,
}

impl RedisStockCache {
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let manager = RedisConnectionManager::new(config.url.as_str())?;
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.pool_timeout)
            .build(manager)
            .await?;
        info!("Redis pool ready at {}", config.url);
        Ok(Self {
            pool,
            admission: Script::new(ADMISSION_SCRIPT),
            command_timeout: config.command_timeout,
        })
    }

    fn dedup_key(request: &OrderRequest) -> String {
        format!("{}:{}", DEDUP_PREFIX, request.encode())
    }

    /// Runs one cache operation, checkout included, under the command timeout.
    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        time::timeout(self.command_timeout, operation)
            .await
            .map_err(|_| CacheError::Timeout(self.command_timeout))?
    }
}

impl StockCache for RedisStockCache {
    async fn try_reserve(
        &self,
        request: OrderRequest,
        dedup_window: Duration,
    ) -> Result<Reservation, CacheError> {
        let window_ms = dedup_window.as_millis().max(1) as u64;
        let reply: i64 = self
            .bounded(async {
                let mut conn = self.pool.get().await?;
                let mut invocation = self.admission.prepare_invoke();
                invocation
                    .key(Self::dedup_key(&request))
                    .key(STOCK_KEY)
                    .arg(request.item_id)
                    .arg(window_ms);
                Ok::<_, CacheError>(invocation.invoke_async(&mut *conn).await?)
            })
            .await?;

        match reply {
            1 => Ok(Reservation::Reserved),
            0 => Ok(Reservation::Duplicate),
            -1 => Ok(Reservation::OutOfStock),
            other => Err(CacheError::UnexpectedReply(other)),
        }
    }

    async fn release(&self, item_id: ItemId) -> Result<(), CacheError> {
        self.bounded(async {
            let mut conn = self.pool.get().await?;
            let _: i64 = conn.hincr(STOCK_KEY, item_id, 1).await?;
            Ok::<_, CacheError>(())
        })
        .await
    }

    async fn set_status(&self, request: OrderRequest, status: OrderStatus) -> Result<(), CacheError> {
        self.bounded(async {
            let mut conn = self.pool.get().await?;
            let _: () = conn.hset(STATUS_KEY, request.encode(), status.as_i8()).await?;
            Ok::<_, CacheError>(())
        })
        .await
    }

    async fn statuses(&self, buyer_id: BuyerId, item_ids: &[ItemId]) -> Result<Vec<OrderStatus>, CacheError> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }
        let fields: Vec<String> = item_ids
            .iter()
            .map(|&item_id| OrderRequest::new(buyer_id, item_id).encode())
            .collect();

        let codes: Vec<Option<i64>> = self
            .bounded(async {
                let mut conn = self.pool.get().await?;
                Ok::<_, CacheError>(redis::cmd("HMGET")
                    .arg(STATUS_KEY)
                    .arg(&fields)
                    .query_async(&mut *conn)
                    .await?)
            })
            .await?;

        Ok(codes
            .into_iter()
            .map(|code| code.map_or(OrderStatus::Unknown, OrderStatus::from_code))
            .collect())
    }

    async fn warm_up(&self, stock: &[(ItemId, i64)]) -> Result<(), CacheError> {
        self.bounded(async {
            let mut conn = self.pool.get().await?;
            let mut pipe = redis::pipe();
            pipe.atomic().del(STOCK_KEY).ignore();
            if !stock.is_empty() {
                pipe.hset_multiple(STOCK_KEY, stock).ignore();
            }
            let _: () = pipe.query_async(&mut *conn).await?;
            Ok::<_, CacheError>(())
        })
        .await?;
        info!("Warmed stock mirror with {} items", stock.len());
        Ok(())
    }

    async fn stock_snapshot(&self) -> Result<HashMap<ItemId, i64>, CacheError> {
        self.bounded(async {
            let mut conn = self.pool.get().await?;
            let snapshot: HashMap<ItemId, i64> = conn.hgetall(STOCK_KEY).await?;
            Ok::<_, CacheError>(snapshot)
        })
        .await
    }
}
