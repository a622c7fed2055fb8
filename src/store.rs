//! SQLite persistence. Everything that touches SQL lives here; the rest of
//! the crate works with `models` types. Image reference lists are stored as
//! JSON text columns and encoded/decoded only in this module. Timestamps are
//! stored as unix milliseconds so SQL comparisons are exact.

use crate::models::{
    ActivationFunding, ItemCondition, Listing, ListingStatus, ListingUpdate, ModerationStatus,
    NewListing, PromotionTier, Seller,
};
use crate::search::QueryPlan;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fresh activations stay public this long before lazy expiry kicks in.
pub const LISTING_TTL_DAYS: i64 = 30;

const BUSY_RETRIES: u32 = 5;
const BUSY_BACKOFF_MS: u64 = 25;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Migrations run once at startup, gated by the persisted `schema_version`
/// marker. Step 2 exists because `funding` was added after the initial
/// schema shipped.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE IF NOT EXISTS sellers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id INTEGER NOT NULL UNIQUE,
            has_used_free_ad INTEGER NOT NULL DEFAULT 0,
            listing_packages_balance INTEGER NOT NULL DEFAULT 0,
            balance REAL NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS listings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            seller_id INTEGER NOT NULL REFERENCES sellers(id),
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            price TEXT NOT NULL,
            currency TEXT NOT NULL,
            category TEXT NOT NULL,
            subcategory TEXT,
            condition TEXT,
            location TEXT NOT NULL,
            images TEXT NOT NULL DEFAULT '[]',
            optimized_images TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            moderation_status TEXT NOT NULL,
            rejection_reason TEXT,
            promotion_type TEXT,
            promotion_ends_at INTEGER,
            expires_at INTEGER,
            published_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            view_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_listings_catalog
            ON listings (status, category, expires_at);
        CREATE INDEX IF NOT EXISTS idx_listings_seller ON listings (seller_id);
        CREATE TABLE IF NOT EXISTS favorites (
            seller_id INTEGER NOT NULL,
            listing_id INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (seller_id, listing_id)
        );
        CREATE TABLE IF NOT EXISTS pending_payments (
            reference TEXT PRIMARY KEY,
            listing_id INTEGER NOT NULL,
            tier TEXT NOT NULL,
            amount REAL NOT NULL,
            created_at INTEGER NOT NULL
        );
        "#,
    ),
    (
        2,
        "ALTER TABLE listings ADD COLUMN funding TEXT NOT NULL DEFAULT 'none';",
    ),
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

/// Bounded exponential backoff for SQLite busy/locked conditions. The
/// operation is handed over as a closure so each retry re-runs it from
/// scratch against the pool.
async fn with_busy_retry<T, F, Fut>(op: &'static str, mut run: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        match run().await {
            Err(err) if is_busy(&err) && attempt < BUSY_RETRIES => {
                attempt += 1;
                let backoff = Duration::from_millis(BUSY_BACKOFF_MS << attempt);
                warn!(
                    target = "bazaar.store",
                    op,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "storage busy, backing off",
                );
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

const LISTING_COLUMNS: &str = "listings.*, \
    (SELECT COUNT(*) FROM favorites f WHERE f.listing_id = listings.id) AS favorites_count";

fn decode_refs(raw: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Corrupt(format!("image list: {err}")))
}

fn encode_refs(refs: &[String]) -> String {
    serde_json::to_string(refs).unwrap_or_else(|_| "[]".to_string())
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = ListingStatus::from_str(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("status `{status_raw}`")))?;
    let moderation_raw: String = row.try_get("moderation_status")?;
    let moderation_status = ModerationStatus::from_str(&moderation_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("moderation_status `{moderation_raw}`")))?;
    let funding_raw: String = row.try_get("funding")?;
    let funding = ActivationFunding::from_str(&funding_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("funding `{funding_raw}`")))?;

    let condition = row
        .try_get::<Option<String>, _>("condition")?
        .and_then(|raw| ItemCondition::from_str(&raw));
    let promotion_type = row
        .try_get::<Option<String>, _>("promotion_type")?
        .and_then(|raw| PromotionTier::from_str(&raw));

    let images_raw: String = row.try_get("images")?;
    let optimized_raw: String = row.try_get("optimized_images")?;

    Ok(Listing {
        id: row.try_get("id")?,
        seller_id: row.try_get("seller_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        category: row.try_get("category")?,
        subcategory: row.try_get("subcategory")?,
        condition,
        location: row.try_get("location")?,
        images: decode_refs(&images_raw)?,
        optimized_images: decode_refs(&optimized_raw)?,
        status,
        moderation_status,
        rejection_reason: row.try_get("rejection_reason")?,
        promotion_type,
        promotion_ends_at: row
            .try_get::<Option<i64>, _>("promotion_ends_at")?
            .map(from_ms),
        expires_at: row.try_get::<Option<i64>, _>("expires_at")?.map(from_ms),
        published_at: row.try_get::<Option<i64>, _>("published_at")?.map(from_ms),
        funding,
        created_at: from_ms(row.try_get("created_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
        view_count: row.try_get("view_count")?,
        favorites_count: row.try_get("favorites_count")?,
    })
}

fn seller_from_row(row: &SqliteRow) -> Result<Seller, StoreError> {
    Ok(Seller {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        has_used_free_ad: row.try_get::<i64, _>("has_used_free_ad")? != 0,
        listing_packages_balance: row.try_get("listing_packages_balance")?,
        balance: row.try_get("balance")?,
        created_at: from_ms(row.try_get("created_at")?),
    })
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(1));
        // A shared in-memory database only exists per connection; keep the
        // pool at one connection so tests see a single database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Idempotent startup migration, gated by the `schema_version` marker.
    /// Nothing else in the crate probes for tables or columns at runtime.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;
        let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        let current = current.unwrap_or(0);
        for (version, sql) in MIGRATIONS {
            if *version > current {
                sqlx::raw_sql(sql).execute(&self.pool).await?;
                sqlx::query("INSERT INTO schema_version (version) VALUES (?1)")
                    .bind(version)
                    .execute(&self.pool)
                    .await?;
                info!(target = "bazaar.store", version, "schema migrated");
            }
        }
        Ok(())
    }

    // ── Sellers ───────────────────────────────────────────────────────────

    pub async fn upsert_seller(&self, external_id: i64) -> Result<Seller, StoreError> {
        sqlx::query("INSERT OR IGNORE INTO sellers (external_id, created_at) VALUES (?1, ?2)")
            .bind(external_id)
            .bind(ms(Utc::now()))
            .execute(&self.pool)
            .await?;
        self.seller_by_external(external_id)
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn seller_by_external(&self, external_id: i64) -> Result<Option<Seller>, StoreError> {
        let row = sqlx::query("SELECT * FROM sellers WHERE external_id = ?1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| seller_from_row(&row)).transpose()
    }

    pub async fn seller_by_id(&self, id: i64) -> Result<Option<Seller>, StoreError> {
        let row = sqlx::query("SELECT * FROM sellers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| seller_from_row(&row)).transpose()
    }

    pub async fn credit_packages(&self, seller_id: i64, count: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sellers SET listing_packages_balance = listing_packages_balance + ?2 \
             WHERE id = ?1",
        )
        .bind(seller_id)
        .bind(count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic check-then-debit; false when the balance was already zero.
    pub async fn debit_package(&self, seller_id: i64) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        let result = with_busy_retry("debit_package", || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "UPDATE sellers SET listing_packages_balance = listing_packages_balance - 1 \
                     WHERE id = ?1 AND listing_packages_balance > 0",
                )
                .bind(seller_id)
                .execute(&pool)
                .await
            }
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flips the one-time free-ad flag; false when it was already spent.
    pub async fn mark_free_ad_used(&self, seller_id: i64) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        let result = with_busy_retry("mark_free_ad_used", || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "UPDATE sellers SET has_used_free_ad = 1 \
                     WHERE id = ?1 AND has_used_free_ad = 0",
                )
                .bind(seller_id)
                .execute(&pool)
                .await
            }
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_balance(&self, seller_id: i64, balance: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE sellers SET balance = ?2 WHERE id = ?1")
            .bind(seller_id)
            .bind(balance)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomic conditional debit; false when funds are insufficient.
    pub async fn debit_balance(&self, seller_id: i64, amount: f64) -> Result<bool, StoreError> {
        let pool = self.pool.clone();
        let result = with_busy_retry("debit_balance", || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "UPDATE sellers SET balance = balance - ?2 \
                     WHERE id = ?1 AND balance >= ?2",
                )
                .bind(seller_id)
                .bind(amount)
                .execute(&pool)
                .await
            }
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Listings ──────────────────────────────────────────────────────────

    pub async fn insert_listing(
        &self,
        seller_id: i64,
        request: &NewListing,
        images: &[String],
        status: ListingStatus,
        funding: ActivationFunding,
    ) -> Result<Listing, StoreError> {
        let now = ms(Utc::now());
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO listings (seller_id, title, description, price, currency, category, \
             subcategory, condition, location, images, status, moderation_status, funding, \
             created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14) \
             RETURNING id",
        )
        .bind(seller_id)
        .bind(&request.title)
        .bind(&request.description)
        .bind(&request.price)
        .bind(&request.currency)
        .bind(&request.category)
        .bind(&request.subcategory)
        .bind(request.condition.map(|c| c.as_str()))
        .bind(&request.location)
        .bind(encode_refs(images))
        .bind(status.as_str())
        .bind(ModerationStatus::Pending.as_str())
        .bind(funding.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        self.listing(id).await?.ok_or(StoreError::NotFound)
    }

    pub async fn listing(&self, id: i64) -> Result<Option<Listing>, StoreError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| listing_from_row(&row)).transpose()
    }

    /// Persists the edited scalar fields immediately. The caller is
    /// responsible for the status consequences of the edit.
    pub async fn update_listing_fields(
        &self,
        id: i64,
        update: &ListingUpdate,
    ) -> Result<(), StoreError> {
        let mut sets: Vec<String> = Vec::new();
        let mut texts: Vec<String> = Vec::new();

        let push = |sets: &mut Vec<String>, texts: &mut Vec<String>, col: &str, value: &str| {
            texts.push(value.to_string());
            sets.push(format!("{col} = ?{}", texts.len() + 2));
        };

        if let Some(title) = &update.title {
            push(&mut sets, &mut texts, "title", title);
        }
        if let Some(description) = &update.description {
            push(&mut sets, &mut texts, "description", description);
        }
        if let Some(price) = &update.price {
            push(&mut sets, &mut texts, "price", price);
        }
        if let Some(currency) = &update.currency {
            push(&mut sets, &mut texts, "currency", currency);
        }
        if let Some(category) = &update.category {
            push(&mut sets, &mut texts, "category", category);
        }
        if let Some(subcategory) = &update.subcategory {
            push(&mut sets, &mut texts, "subcategory", subcategory);
        }
        if let Some(condition) = update.condition {
            push(&mut sets, &mut texts, "condition", condition.as_str());
        }
        if let Some(location) = &update.location {
            push(&mut sets, &mut texts, "location", location);
        }

        let mut sql = String::from("UPDATE listings SET updated_at = ?2");
        for clause in &sets {
            sql.push_str(", ");
            sql.push_str(clause);
        }
        sql.push_str(" WHERE id = ?1");

        let mut query = sqlx::query(&sql).bind(id).bind(ms(Utc::now()));
        for text in &texts {
            query = query.bind(text);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    /// Replaces the original image list with the retained set and rebuilds
    /// the optimized list as the longest aligned prefix, so per-index
    /// fallback stays correct after removals and reorders.
    pub async fn set_retained_images(
        &self,
        id: i64,
        retained: &[String],
    ) -> Result<(), StoreError> {
        let Some(current) = self.listing(id).await? else {
            return Ok(());
        };
        let mut optimized = Vec::new();
        for kept in retained {
            let slot = current.images.iter().position(|orig| orig == kept);
            match slot.and_then(|idx| current.optimized_images.get(idx)) {
                Some(opt) => optimized.push(opt.clone()),
                None => break,
            }
        }
        sqlx::query(
            "UPDATE listings SET images = ?2, optimized_images = ?3, updated_at = ?4 \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(encode_refs(retained))
        .bind(encode_refs(&optimized))
        .bind(ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Appends freshly ingested originals. Computed against the latest
    /// persisted list; a no-op when the listing has been deleted meanwhile.
    pub async fn append_images(&self, id: i64, new_refs: &[String]) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let new_refs = new_refs.to_vec();
        with_busy_retry("append_images", || {
            let pool = pool.clone();
            let new_refs = new_refs.clone();
            async move {
                let Some(raw) =
                    sqlx::query_scalar::<_, String>("SELECT images FROM listings WHERE id = ?1")
                        .bind(id)
                        .fetch_optional(&pool)
                        .await?
                else {
                    debug!(target = "bazaar.store", listing = id, "append after delete, skipped");
                    return Ok(());
                };
                let mut images: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
                for blob_ref in &new_refs {
                    if !images.contains(blob_ref) {
                        images.push(blob_ref.clone());
                    }
                }
                sqlx::query("UPDATE listings SET images = ?2, updated_at = ?3 WHERE id = ?1")
                    .bind(id)
                    .bind(encode_refs(&images))
                    .bind(ms(Utc::now()))
                    .execute(&pool)
                    .await?;
                Ok(())
            }
        })
        .await
        .map_err(StoreError::from)
    }

    /// Appends optimized variants idempotently: duplicate refs are dropped,
    /// already-filled slots are skipped, and the list never grows past the
    /// originals. Safe to re-run for a retried job.
    pub async fn append_optimized(&self, id: i64, refs: &[String]) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        let refs = refs.to_vec();
        with_busy_retry("append_optimized", || {
            let pool = pool.clone();
            let refs = refs.clone();
            async move {
                let Some(row) = sqlx::query(
                    "SELECT images, optimized_images FROM listings WHERE id = ?1",
                )
                .bind(id)
                .fetch_optional(&pool)
                .await?
                else {
                    debug!(target = "bazaar.store", listing = id, "optimize after delete, skipped");
                    return Ok(());
                };
                let originals: Vec<String> =
                    serde_json::from_str(&row.get::<String, _>("images")).unwrap_or_default();
                let mut optimized: Vec<String> =
                    serde_json::from_str(&row.get::<String, _>("optimized_images"))
                        .unwrap_or_default();
                let filled = optimized.len();
                for blob_ref in refs.iter().skip(filled) {
                    if optimized.len() >= originals.len() {
                        break;
                    }
                    if !optimized.contains(blob_ref) {
                        optimized.push(blob_ref.clone());
                    }
                }
                sqlx::query("UPDATE listings SET optimized_images = ?2 WHERE id = ?1")
                    .bind(id)
                    .bind(encode_refs(&optimized))
                    .execute(&pool)
                    .await?;
                Ok(())
            }
        })
        .await
        .map_err(StoreError::from)
    }

    /// Atomic guarded status flip; false when the listing was not in one of
    /// the expected source states (including the concurrent-writer case).
    pub async fn transition_status(
        &self,
        id: i64,
        from: &[ListingStatus],
        to: ListingStatus,
    ) -> Result<bool, StoreError> {
        let placeholders = (0..from.len())
            .map(|idx| format!("?{}", idx + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE listings SET status = ?2, updated_at = ?{} \
             WHERE id = ?1 AND status IN ({placeholders})",
            from.len() + 3,
        );
        let pool = self.pool.clone();
        let from: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();
        let result = with_busy_retry("transition_status", || {
            let pool = pool.clone();
            let sql = sql.clone();
            let from = from.clone();
            async move {
                let mut query = sqlx::query(&sql).bind(id).bind(to.as_str());
                for status in &from {
                    query = query.bind(*status);
                }
                query.bind(ms(Utc::now())).execute(&pool).await
            }
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Routes the listing (back) into review. Clears any previous rejection
    /// reason and records how the activation was funded.
    pub async fn submit_for_moderation(
        &self,
        id: i64,
        from: &[ListingStatus],
        funding: ActivationFunding,
    ) -> Result<bool, StoreError> {
        let placeholders = (0..from.len())
            .map(|idx| format!("?{}", idx + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE listings SET status = 'pending_moderation', moderation_status = 'pending', \
             rejection_reason = NULL, funding = ?2, updated_at = ?3 \
             WHERE id = ?1 AND status IN ({placeholders})",
        );
        let pool = self.pool.clone();
        let from: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();
        let result = with_busy_retry("submit_for_moderation", || {
            let pool = pool.clone();
            let sql = sql.clone();
            let from = from.clone();
            async move {
                let mut query = sqlx::query(&sql)
                    .bind(id)
                    .bind(funding.as_str())
                    .bind(ms(Utc::now()));
                for status in &from {
                    query = query.bind(*status);
                }
                query.execute(&pool).await
            }
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records how an activation was funded after the fact. Reactivation
    /// wins the status race first and only then spends the credit, so the
    /// funding column is written in a second step.
    pub async fn set_funding(&self, id: i64, funding: ActivationFunding) -> Result<(), StoreError> {
        sqlx::query("UPDATE listings SET funding = ?2 WHERE id = ?1")
            .bind(id)
            .bind(funding.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moderator approval: guarded on pending, stamps the publication window.
    pub async fn approve_listing(&self, id: i64, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let expires = now + chrono::Duration::days(LISTING_TTL_DAYS);
        let result = sqlx::query(
            "UPDATE listings SET status = 'active', moderation_status = 'approved', \
             rejection_reason = NULL, published_at = ?2, expires_at = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status = 'pending_moderation'",
        )
        .bind(id)
        .bind(ms(now))
        .bind(ms(expires))
        .bind(ms(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn reject_listing(&self, id: i64, reason: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE listings SET status = 'rejected', moderation_status = 'rejected', \
             rejection_reason = ?2, updated_at = ?3 \
             WHERE id = ?1 AND status = 'pending_moderation'",
        )
        .bind(id)
        .bind(reason)
        .bind(ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn apply_promotion(
        &self,
        id: i64,
        tier: PromotionTier,
        ends_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE listings SET promotion_type = ?2, promotion_ends_at = ?3, updated_at = ?4 \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(tier.as_str())
        .bind(ms(ends_at))
        .bind(ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_listing(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM listings WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM favorites WHERE listing_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_views(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE listings SET view_count = view_count + 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Same-owner-plus-title duplicate probe used by bulk import. Advisory;
    /// not a uniqueness constraint.
    pub async fn owner_has_title(&self, seller_id: i64, title: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM listings WHERE seller_id = ?1 AND title = ?2",
        )
        .bind(seller_id)
        .bind(title)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // ── Favorites ─────────────────────────────────────────────────────────

    pub async fn add_favorite(&self, seller_id: i64, listing_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO favorites (seller_id, listing_id, created_at) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(seller_id)
        .bind(listing_id)
        .bind(ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_favorite(&self, seller_id: i64, listing_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM favorites WHERE seller_id = ?1 AND listing_id = ?2")
            .bind(seller_id)
            .bind(listing_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Payments ──────────────────────────────────────────────────────────

    pub async fn record_pending_payment(
        &self,
        reference: &str,
        listing_id: i64,
        tier: PromotionTier,
        amount: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO pending_payments (reference, listing_id, tier, amount, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(reference)
        .bind(listing_id)
        .bind(tier.as_str())
        .bind(amount)
        .bind(ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Consumes the pending payment row so a replayed confirmation callback
    /// cannot double-apply.
    pub async fn take_pending_payment(
        &self,
        reference: &str,
    ) -> Result<Option<(i64, PromotionTier)>, StoreError> {
        let row = sqlx::query(
            "DELETE FROM pending_payments WHERE reference = ?1 RETURNING listing_id, tier",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let tier_raw: String = row.try_get("tier")?;
        let tier = PromotionTier::from_str(&tier_raw)
            .ok_or_else(|| StoreError::Corrupt(format!("tier `{tier_raw}`")))?;
        Ok(Some((row.try_get("listing_id")?, tier)))
    }

    // ── Catalog / profile queries ─────────────────────────────────────────

    /// Opportunistically persists the lazy `active → expired` transition for
    /// rows whose window has passed. Visibility never depends on this write.
    pub async fn expire_due_listings(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE listings SET status = 'expired', updated_at = ?1 \
             WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(ms(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn catalog_count(&self, plan: &QueryPlan) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM listings WHERE {}", plan.where_sql);
        let mut query = sqlx::query_scalar(&sql);
        for bind in &plan.where_binds {
            query = bind.apply_scalar(query);
        }
        Ok(query.fetch_one(&self.pool).await?)
    }

    pub async fn catalog_rows(
        &self,
        plan: &QueryPlan,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<Listing>, StoreError> {
        let mut sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE {} ORDER BY {}",
            plan.where_sql, plan.order_sql,
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        }
        let mut query = sqlx::query(&sql);
        for bind in plan.where_binds.iter().chain(plan.order_binds.iter()) {
            query = bind.apply(query);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Profile listings. The owner sees everything; other viewers only the
    /// statuses worth showing. Ordered by status band, then recency.
    pub async fn profile_listings(
        &self,
        seller_id: i64,
        viewer_is_owner: bool,
    ) -> Result<Vec<Listing>, StoreError> {
        let visibility = if viewer_is_owner {
            ""
        } else {
            " AND status IN ('active', 'pending_moderation')"
        };
        let sql = format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE seller_id = ?1{visibility} \
             ORDER BY CASE status \
                WHEN 'active' THEN 0 \
                WHEN 'pending_moderation' THEN 1 \
                WHEN 'sold' THEN 2 \
                WHEN 'expired' THEN 3 \
                WHEN 'rejected' THEN 4 \
                WHEN 'deactivated' THEN 5 \
                ELSE 6 END ASC, created_at DESC",
        );
        let rows = sqlx::query(&sql)
            .bind(seller_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }
}
