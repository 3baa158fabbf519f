use crate::models::{LeadStatus, NewOrder, OrderProjection, TokenPair};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Public tracking identifier, a pure function of the lead id. First 16 hex
/// chars of sha256 keep the slug short while staying collision-free within
/// the practical id space.
pub fn generate_slug(lead_id: i64) -> String {
    let digest = Sha256::digest(format!("amo_lead_{lead_id}"));
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

/// Order projection persistence. The pipeline is the sole writer; the
/// tracking endpoint reads by slug.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get_by_slug(&self, slug: &str) -> Result<Option<OrderProjection>, StoreError>;
    async fn get_by_lead_id(&self, lead_id: i64) -> Result<Option<OrderProjection>, StoreError>;

    /// Insert-or-update keyed on lead id. A slug is assigned only when the
    /// incoming status qualifies and the row has none yet; once set it is
    /// preserved verbatim on every later write.
    async fn upsert(&self, order: NewOrder) -> Result<OrderProjection, StoreError>;
}

/// CRM session token persistence, a singleton row owned by the session
/// manager.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn tokens(&self) -> Result<Option<TokenPair>, StoreError>;
    async fn save_tokens(&self, tokens: &TokenPair) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    amo_lead_id: i64,
    hash_slug: Option<String>,
    status_id: i64,
    status_step: i32,
    status_label: Option<String>,
    car_info: Json<serde_json::Value>,
    permit_info: Json<serde_json::Value>,
    manager_contact: Json<serde_json::Value>,
    updated_at: DateTime<Utc>,
}

impl From<OrderRow> for OrderProjection {
    fn from(row: OrderRow) -> Self {
        OrderProjection {
            amo_lead_id: row.amo_lead_id,
            hash_slug: row.hash_slug,
            status_id: row.status_id,
            status_step: row.status_step,
            status_label: row.status_label,
            car_info: row.car_info.0,
            permit_info: row.permit_info.0,
            manager_contact: row.manager_contact.0,
            updated_at: row.updated_at,
        }
    }
}

const SELECT_COLUMNS: &str = "amo_lead_id, hash_slug, status_id, status_step, status_label, \
     car_info, permit_info, manager_contact, updated_at";

#[async_trait]
impl OrderStore for PgStore {
    async fn get_by_slug(&self, slug: &str) -> Result<Option<OrderProjection>, StoreError> {
        let sql = format!("select {SELECT_COLUMNS} from orders where hash_slug = $1 limit 1");
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(OrderProjection::from))
    }

    async fn get_by_lead_id(&self, lead_id: i64) -> Result<Option<OrderProjection>, StoreError> {
        let sql = format!("select {SELECT_COLUMNS} from orders where amo_lead_id = $1 limit 1");
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(OrderProjection::from))
    }

    async fn upsert(&self, order: NewOrder) -> Result<OrderProjection, StoreError> {
        let status = LeadStatus::from_id(order.status_id);
        let status_step = order.status_step.unwrap_or_else(|| status.step());
        let candidate_slug = status
            .qualifies_for_slug()
            .then(|| generate_slug(order.amo_lead_id));

        let sql = format!(
            "insert into orders (
                amo_lead_id, hash_slug, status_id, status_step, status_label,
                car_info, permit_info, manager_contact
            ) values ($1, $2, $3, $4, $5, $6, $7, $8)
            on conflict (amo_lead_id) do update
            set status_id = excluded.status_id,
                status_step = excluded.status_step,
                status_label = excluded.status_label,
                car_info = excluded.car_info,
                permit_info = excluded.permit_info,
                manager_contact = excluded.manager_contact,
                hash_slug = coalesce(orders.hash_slug, excluded.hash_slug),
                updated_at = now()
            returning {SELECT_COLUMNS}"
        );
        let row: OrderRow = sqlx::query_as(&sql)
            .bind(order.amo_lead_id)
            .bind(candidate_slug)
            .bind(order.status_id)
            .bind(status_step)
            .bind(order.status_label)
            .bind(Json(order.car_info))
            .bind(Json(order.permit_info))
            .bind(Json(order.manager_contact))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn tokens(&self) -> Result<Option<TokenPair>, StoreError> {
        let row: Option<(String, String, Option<i64>)> = sqlx::query_as(
            "select access_token, refresh_token, expires_in from amo_tokens limit 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(access_token, refresh_token, expires_in)| TokenPair {
            access_token,
            refresh_token,
            expires_in,
        }))
    }

    async fn save_tokens(&self, tokens: &TokenPair) -> Result<(), StoreError> {
        sqlx::query(
            "insert into amo_tokens (id, access_token, refresh_token, expires_in)
             values (true, $1, $2, $3)
             on conflict (id) do update
             set access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 expires_in = excluded.expires_in,
                 updated_at = now()",
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_in)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory store with the same slug-coalescing upsert semantics as
/// [`PgStore`], used by pipeline and store tests.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        orders: Mutex<HashMap<i64, OrderProjection>>,
        tokens: Mutex<Option<TokenPair>>,
    }

    #[async_trait]
    impl OrderStore for MemoryStore {
        async fn get_by_slug(&self, slug: &str) -> Result<Option<OrderProjection>, StoreError> {
            let orders = self.orders.lock().await;
            Ok(orders
                .values()
                .find(|order| order.hash_slug.as_deref() == Some(slug))
                .cloned())
        }

        async fn get_by_lead_id(
            &self,
            lead_id: i64,
        ) -> Result<Option<OrderProjection>, StoreError> {
            let orders = self.orders.lock().await;
            Ok(orders.get(&lead_id).cloned())
        }

        async fn upsert(&self, order: NewOrder) -> Result<OrderProjection, StoreError> {
            let status = LeadStatus::from_id(order.status_id);
            let status_step = order.status_step.unwrap_or_else(|| status.step());
            let candidate_slug = status
                .qualifies_for_slug()
                .then(|| generate_slug(order.amo_lead_id));

            let mut orders = self.orders.lock().await;
            let existing_slug = orders
                .get(&order.amo_lead_id)
                .and_then(|row| row.hash_slug.clone());
            let projection = OrderProjection {
                amo_lead_id: order.amo_lead_id,
                hash_slug: existing_slug.or(candidate_slug),
                status_id: order.status_id,
                status_step,
                status_label: order.status_label,
                car_info: order.car_info,
                permit_info: order.permit_info,
                manager_contact: order.manager_contact,
                updated_at: Utc::now(),
            };
            orders.insert(order.amo_lead_id, projection.clone());
            Ok(projection)
        }
    }

    #[async_trait]
    impl TokenStore for MemoryStore {
        async fn tokens(&self) -> Result<Option<TokenPair>, StoreError> {
            Ok(self.tokens.lock().await.clone())
        }

        async fn save_tokens(&self, tokens: &TokenPair) -> Result<(), StoreError> {
            *self.tokens.lock().await = Some(tokens.clone());
            Ok(())
        }
    }
}
