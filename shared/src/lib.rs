use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type BuyerId = i64;
pub type ItemId = i64;

/// Payload of the control record written once at startup to wake the reader.
pub const ACTIVATE_SENTINEL: &str = "activate reader";

/// A buyer's claim on one unit of an item. Identity is the (buyer, item) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderRequest {
    pub buyer_id: BuyerId,
    pub item_id: ItemId,
}

impl OrderRequest {
    pub fn new(buyer_id: BuyerId, item_id: ItemId) -> Self {
        Self { buyer_id, item_id }
    }

    /// Compact `buyer:item` form used both as the log record and as the
    /// field name in the cache status map.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.buyer_id, self.item_id)
    }
}

impl FromStr for OrderRequest {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (buyer, item) = s
            .split_once(':')
            .ok_or_else(|| RecordError::Malformed(s.to_string()))?;
        let buyer_id = buyer
            .trim()
            .parse()
            .map_err(|_| RecordError::Malformed(s.to_string()))?;
        let item_id = item
            .trim()
            .parse()
            .map_err(|_| RecordError::Malformed(s.to_string()))?;
        Ok(Self { buyer_id, item_id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record payload is not utf-8")]
    NotUtf8,
    #[error("malformed order record: {0:?}")]
    Malformed(String),
}

/// A record read back from the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecord {
    Activate,
    Order(OrderRequest),
}

impl LogRecord {
    pub fn decode(payload: &[u8]) -> Result<Self, RecordError> {
        let text = std::str::from_utf8(payload).map_err(|_| RecordError::NotUtf8)?;
        if text == ACTIVATE_SENTINEL {
            return Ok(LogRecord::Activate);
        }
        text.parse().map(LogRecord::Order)
    }
}

/// Terminal outcome of an order as seen by the polling read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Unknown,
    Failed,
    Succeeded,
}

impl OrderStatus {
    pub fn as_i8(self) -> i8 {
        match self {
            OrderStatus::Unknown => 0,
            OrderStatus::Failed => -1,
            OrderStatus::Succeeded => 1,
        }
    }

    /// Anything other than the two terminal codes reads as unknown.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => OrderStatus::Succeeded,
            -1 => OrderStatus::Failed,
            _ => OrderStatus::Unknown,
        }
    }
}
