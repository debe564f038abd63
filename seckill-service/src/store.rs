use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::OrderRequest;
use std::future::Future;
use crate::error::StoreError;
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Created(i64),
    AlreadyExists,
}

/// Authoritative record of items and orders.
pub trait OrderStore: Send + Sync + 'static {
    /// Runs the duplicate check, the stock decrement and the order insert in
    /// one transaction. Nothing is written unless it returns `Created`.
    fn place_order(&self, request: OrderRequest) -> impl Future<Output = Result<Placement, StoreError>> + Send;

    fn items(&self) -> impl Future<Output = Result<Vec<Item>, StoreError>> + Send;

    /// Most recent orders first.
    fn recent_orders(&self, limit: i64) -> impl Future<Output = Result<Vec<Order>, StoreError>> + Send;
}

/// Reasons to abandon the order transaction.
enum Abort {
    AlreadyExists,
    SoldOut,
    Db(DieselError),
}

impl From<DieselError> for Abort {
    fn from(e: DieselError) -> Self {
        Abort::Db(e)
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_size: u32) -> anyhow::Result<Self> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder().max_size(max_size).build(config).await?;
        // Fail startup here rather than on the first commit.
        drop(pool.get().await?);
        Ok(Self { pool })
    }
}

impl OrderStore for PgStore {
    async fn place_order(&self, request: OrderRequest) -> Result<Placement, StoreError> {
        let mut conn = self.pool.get().await?;

        let result = conn
            .transaction::<_, Abort, _>(|conn| {
                Box::pin(async move {
                    let existing = orders::table
                        .filter(orders::buyer_id.eq(request.buyer_id))
                        .filter(orders::item_id.eq(request.item_id))
                        .select(orders::id)
                        .first::<i64>(conn)
                        .await
                        .optional()?;
                    if existing.is_some() {
                        return Err(Abort::AlreadyExists);
                    }

                    let updated = diesel::update(
                        items::table
                            .filter(items::id.eq(request.item_id))
                            .filter(items::stock.gt(0)),
                    )
                    .set(items::stock.eq(items::stock - 1))
                    .execute(conn)
                    .await?;
                    if updated == 0 {
                        return Err(Abort::SoldOut);
                    }

                    let id = diesel::insert_into(orders::table)
                        .values(&NewOrder::from(request))
                        .returning(orders::id)
                        .get_result::<i64>(conn)
                        .await?;
                    Ok(id)
                })
            })
            .await;

        match result {
            Ok(id) => Ok(Placement::Created(id)),
            Err(Abort::AlreadyExists) => Ok(Placement::AlreadyExists),
            Err(Abort::Db(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _))) => {
                Ok(Placement::AlreadyExists)
            }
            Err(Abort::SoldOut) => Err(StoreError::SoldOut(request.item_id)),
            Err(Abort::Db(e)) => Err(StoreError::Query(e)),
        }
    }

    async fn items(&self) -> Result<Vec<Item>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = items::table
            .order(items::id.asc())
            .select(Item::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn recent_orders(&self, limit: i64) -> Result<Vec<Order>, StoreError> {
        let mut conn = self.pool.get().await?;
        let rows = orders::table
            .order(orders::id.desc())
            .limit(limit)
            .select(Order::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }
}
