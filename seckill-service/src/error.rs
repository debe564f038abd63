use diesel_async::pooled_connection::PoolError;
use rdkafka::error::KafkaError;
use shared::{ItemId, OrderRequest};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache pool: {0}")]
    Pool(#[from] bb8::RunError<redis::RedisError>),
    #[error("cache command: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("unexpected admission script reply {0}")]
    UnexpectedReply(i64),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store pool: {0}")]
    Pool(#[from] bb8::RunError<PoolError>),
    #[error("store query: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("item {0} has no stock left in the store")]
    SoldOut(ItemId),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("kafka client: {0}")]
    Client(#[from] KafkaError),
    /// Some or all records of a batch were not acknowledged. Only the listed
    /// requests lost their delivery; the rest are owned by the commit path.
    #[error("{} of {total} records undelivered: {reason}", .undelivered.len())]
    Undelivered {
        undelivered: Vec<OrderRequest>,
        total: usize,
        reason: String,
    },
    #[error("send failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: KafkaError },
}
