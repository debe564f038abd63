use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::{BuyerId, ItemId, OrderRequest};

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::items)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub description: String,
    pub stock: i32,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: i64,
    pub buyer_id: BuyerId,
    pub item_id: ItemId,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub buyer_id: BuyerId,
    pub item_id: ItemId,
    pub status: String,
}

impl From<OrderRequest> for NewOrder {
    fn from(request: OrderRequest) -> Self {
        Self {
            buyer_id: request.buyer_id,
            item_id: request.item_id,
            status: "completed".to_string(),
        }
    }
}
