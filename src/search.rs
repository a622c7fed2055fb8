//! Catalog retrieval: builds the SQL filter/sort for public queries and owns
//! the ranking rules. Promotion tier always outranks the requested sort key;
//! an expired promotion window ranks as untiered without being cleared.

use crate::models::{CatalogPage, CatalogQuery, Listing, SortKey};
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use sqlx::Sqlite;
use sqlx::query::{Query, QueryScalar};
use sqlx::sqlite::SqliteArguments;
use tracing::debug;

/// Queries longer than this are matched by fetching the filtered set and
/// re-filtering in application code: LIKE-variant explosion stops being
/// reliable for long mixed-script input.
pub const VARIANT_QUERY_MAX_CHARS: usize = 20;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub enum BindValue {
    Text(String),
    Int(i64),
}

impl BindValue {
    pub fn apply<'q>(
        &'q self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            BindValue::Text(value) => query.bind(value),
            BindValue::Int(value) => query.bind(*value),
        }
    }

    pub fn apply_scalar<'q, T>(
        &'q self,
        query: QueryScalar<'q, Sqlite, T, SqliteArguments<'q>>,
    ) -> QueryScalar<'q, Sqlite, T, SqliteArguments<'q>> {
        match self {
            BindValue::Text(value) => query.bind(value),
            BindValue::Int(value) => query.bind(*value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub where_sql: String,
    pub where_binds: Vec<BindValue>,
    pub order_sql: String,
    pub order_binds: Vec<BindValue>,
    /// Lowercased needle for the long-query application-side match.
    pub refilter: Option<String>,
}

/// SQLite's LIKE only case-folds ASCII, so non-Latin queries are expanded
/// into a fixed set of case variants and any field may match any variant.
pub fn case_variants(input: &str) -> Vec<String> {
    let lower = input.to_lowercase();
    let upper = input.to_uppercase();
    let title = title_case(input);
    let mut variants = vec![lower];
    for candidate in [upper, title] {
        if !variants.contains(&candidate) {
            variants.push(candidate);
        }
    }
    variants
}

fn title_case(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn plan_query(query: &CatalogQuery, now: DateTime<Utc>) -> QueryPlan {
    let now_ms = now.timestamp_millis();
    let mut parts: Vec<String> = vec![
        "status = 'active'".into(),
        "(expires_at IS NULL OR expires_at > ?)".into(),
    ];
    let mut where_binds: Vec<BindValue> = vec![BindValue::Int(now_ms)];

    let filters = &query.filters;
    if let Some(category) = &filters.category {
        parts.push("category = ?".into());
        where_binds.push(BindValue::Text(category.clone()));
    }
    if let Some(subcategory) = &filters.subcategory {
        parts.push("subcategory = ?".into());
        where_binds.push(BindValue::Text(subcategory.clone()));
    }
    if filters.free_only {
        parts.push("price = 'Free'".into());
    }
    if !filters.cities.is_empty() {
        let clause = filters
            .cities
            .iter()
            .map(|_| "location LIKE ?")
            .collect::<Vec<_>>()
            .join(" OR ");
        parts.push(format!("({clause})"));
        for city in &filters.cities {
            where_binds.push(BindValue::Text(format!("%{city}%")));
        }
    }

    let mut refilter = None;
    if let Some(text) = filters.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        if text.chars().count() <= VARIANT_QUERY_MAX_CHARS {
            let mut clauses = Vec::new();
            for variant in case_variants(text) {
                for field in ["title", "description", "location"] {
                    clauses.push(format!("{field} LIKE ?"));
                    where_binds.push(BindValue::Text(format!("%{variant}%")));
                }
            }
            parts.push(format!("({})", clauses.join(" OR ")));
        } else {
            refilter = Some(text.to_lowercase());
        }
    }

    // `top_category` only earns its ranking weight inside the category it
    // was bought for, i.e. when the query is category-scoped.
    let scoped = filters.category.is_some() || filters.subcategory.is_some();
    let top_category_rank = if scoped { 2 } else { 0 };
    let order_sql = format!(
        "CASE WHEN promotion_ends_at IS NOT NULL AND promotion_ends_at > ? THEN \
            CASE promotion_type \
                WHEN 'vip' THEN 3 \
                WHEN 'top_category' THEN {top_category_rank} \
                WHEN 'highlighted' THEN 1 \
                ELSE 0 END \
         ELSE 0 END DESC, {}",
        sort_clause(query.sort),
    );
    let order_binds = vec![BindValue::Int(now_ms)];

    QueryPlan {
        where_sql: parts.join(" AND "),
        where_binds,
        order_sql,
        order_binds,
        refilter,
    }
}

fn sort_clause(sort: SortKey) -> &'static str {
    match sort {
        SortKey::Newest => "created_at DESC, id DESC",
        // Free listings always lead an ascending price sort and trail a
        // descending one, before any numeric comparison happens.
        SortKey::PriceAsc => {
            "CASE WHEN price = 'Free' THEN 0 ELSE 1 END ASC, CAST(price AS REAL) ASC, id DESC"
        }
        SortKey::PriceDesc => {
            "CASE WHEN price = 'Free' THEN 1 ELSE 0 END ASC, CAST(price AS REAL) DESC, id DESC"
        }
        SortKey::Views => "view_count DESC, id DESC",
    }
}

fn matches_needle(listing: &Listing, needle: &str) -> bool {
    listing.title.to_lowercase().contains(needle)
        || listing.description.to_lowercase().contains(needle)
        || listing.location.to_lowercase().contains(needle)
}

/// Public catalog query: always scoped to publicly visible listings, with
/// `total` reflecting the full filtered count.
pub async fn catalog(store: &Store, query: &CatalogQuery) -> Result<CatalogPage, StoreError> {
    let now = Utc::now();
    let swept = store.expire_due_listings(now).await?;
    if swept > 0 {
        debug!(target = "bazaar.search", swept, "lazily expired listings");
    }

    let limit = if query.limit <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        query.limit.min(MAX_PAGE_SIZE)
    };
    let offset = query.offset.max(0);
    let plan = plan_query(query, now);

    if let Some(needle) = &plan.refilter {
        let rows = store.catalog_rows(&plan, None, 0).await?;
        let filtered: Vec<Listing> = rows
            .into_iter()
            .filter(|listing| matches_needle(listing, needle))
            .collect();
        let total = filtered.len() as i64;
        let items = filtered
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        return Ok(CatalogPage { items, total });
    }

    let total = store.catalog_count(&plan).await?;
    let items = store.catalog_rows(&plan, Some(limit), offset).await?;
    Ok(CatalogPage { items, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ActivationFunding, CatalogFilters, ImageUpload, ListingStatus, NewListing, PromotionTier,
    };
    use chrono::Duration;

    async fn test_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.expect("connect");
        store.ensure_schema().await.expect("schema");
        store
    }

    fn listing_request(title: &str, price: &str, category: &str, location: &str) -> NewListing {
        NewListing {
            seller_external_id: 1,
            title: title.into(),
            description: format!("{title} in good shape"),
            price: price.into(),
            currency: "EUR".into(),
            category: category.into(),
            subcategory: None,
            condition: None,
            location: location.into(),
            images: vec![ImageUpload {
                filename: "a.jpg".into(),
                data: String::new(),
            }],
            promotion: None,
        }
    }

    async fn seed_active(store: &Store, request: &NewListing) -> i64 {
        let seller = store
            .upsert_seller(request.seller_external_id)
            .await
            .expect("seller");
        let listing = store
            .insert_listing(
                seller.id,
                request,
                &["orig".into()],
                ListingStatus::PendingModeration,
                ActivationFunding::None,
            )
            .await
            .expect("insert");
        assert!(store
            .approve_listing(listing.id, Utc::now())
            .await
            .expect("approve"));
        listing.id
    }

    fn query_with(filters: CatalogFilters, sort: SortKey) -> CatalogQuery {
        CatalogQuery {
            filters,
            sort,
            offset: 0,
            limit: 50,
        }
    }

    #[test]
    fn variants_cover_lower_upper_title() {
        let variants = case_variants("квартира");
        assert!(variants.contains(&"квартира".to_string()));
        assert!(variants.contains(&"КВАРТИРА".to_string()));
        assert!(variants.contains(&"Квартира".to_string()));
    }

    #[tokio::test]
    async fn promotion_tier_outranks_recency() {
        let store = test_store().await;
        let older = seed_active(&store, &listing_request("Old vip chair", "10", "furniture", "Riga")).await;
        store
            .apply_promotion(older, PromotionTier::Vip, Utc::now() + Duration::days(7))
            .await
            .expect("promote");
        let newer =
            seed_active(&store, &listing_request("New plain chair", "10", "furniture", "Riga")).await;

        let page = catalog(&store, &query_with(CatalogFilters::default(), SortKey::Newest))
            .await
            .expect("catalog");
        let ids: Vec<i64> = page.items.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![older, newer]);
    }

    #[tokio::test]
    async fn expired_tier_ranks_as_untiered() {
        let store = test_store().await;
        let promoted =
            seed_active(&store, &listing_request("Stale vip", "10", "misc", "Riga")).await;
        store
            .apply_promotion(promoted, PromotionTier::Vip, Utc::now() - Duration::hours(1))
            .await
            .expect("promote");
        let plain = seed_active(&store, &listing_request("Plain newer", "10", "misc", "Riga")).await;

        let page = catalog(&store, &query_with(CatalogFilters::default(), SortKey::Newest))
            .await
            .expect("catalog");
        let ids: Vec<i64> = page.items.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![plain, promoted]);
    }

    #[tokio::test]
    async fn top_category_rank_only_applies_in_scope() {
        let store = test_store().await;
        let boosted =
            seed_active(&store, &listing_request("Boosted bike", "90", "sports", "Riga")).await;
        store
            .apply_promotion(boosted, PromotionTier::TopCategory, Utc::now() + Duration::days(7))
            .await
            .expect("promote");
        let plain = seed_active(&store, &listing_request("Plain bike", "90", "sports", "Riga")).await;

        let scoped = catalog(
            &store,
            &query_with(
                CatalogFilters {
                    category: Some("sports".into()),
                    ..CatalogFilters::default()
                },
                SortKey::Newest,
            ),
        )
        .await
        .expect("scoped");
        let ids: Vec<i64> = scoped.items.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![boosted, plain]);

        let global = catalog(&store, &query_with(CatalogFilters::default(), SortKey::Newest))
            .await
            .expect("global");
        let ids: Vec<i64> = global.items.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![plain, boosted], "unscoped query ignores the boost");
    }

    #[tokio::test]
    async fn free_listings_bracket_price_sorts() {
        let store = test_store().await;
        let cheap = seed_active(&store, &listing_request("Cheap", "5", "misc", "Riga")).await;
        let pricey = seed_active(&store, &listing_request("Pricey", "500", "misc", "Riga")).await;
        let free = seed_active(&store, &listing_request("Giveaway", "Free", "misc", "Riga")).await;

        let asc = catalog(&store, &query_with(CatalogFilters::default(), SortKey::PriceAsc))
            .await
            .expect("asc");
        let ids: Vec<i64> = asc.items.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![free, cheap, pricey]);

        let desc = catalog(&store, &query_with(CatalogFilters::default(), SortKey::PriceDesc))
            .await
            .expect("desc");
        let ids: Vec<i64> = desc.items.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![pricey, cheap, free]);
    }

    #[tokio::test]
    async fn cyrillic_query_matches_via_case_variants() {
        let store = test_store().await;
        let flat =
            seed_active(&store, &listing_request("Квартира 3 к.", "45000", "realty", "Минск")).await;
        seed_active(&store, &listing_request("Garage box", "4000", "realty", "Минск")).await;

        let page = catalog(
            &store,
            &query_with(
                CatalogFilters {
                    text: Some("квартира".into()),
                    ..CatalogFilters::default()
                },
                SortKey::Newest,
            ),
        )
        .await
        .expect("search");
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, flat);
    }

    #[tokio::test]
    async fn long_query_takes_the_refilter_path() {
        let store = test_store().await;
        let wanted = seed_active(
            &store,
            &listing_request("Трёхкомнатная квартира в центре города", "45000", "realty", "Минск"),
        )
        .await;
        seed_active(&store, &listing_request("Дача у озера", "15000", "realty", "Минск")).await;

        let needle = "ТРЁХКОМНАТНАЯ КВАРТИРА В ЦЕНТРЕ";
        assert!(needle.chars().count() > VARIANT_QUERY_MAX_CHARS);
        let page = catalog(
            &store,
            &query_with(
                CatalogFilters {
                    text: Some(needle.into()),
                    ..CatalogFilters::default()
                },
                SortKey::Newest,
            ),
        )
        .await
        .expect("search");
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, wanted);
    }

    #[tokio::test]
    async fn total_reflects_full_filtered_count() {
        let store = test_store().await;
        for idx in 0..5 {
            seed_active(&store, &listing_request(&format!("Item {idx}"), "10", "misc", "Riga")).await;
        }
        let mut query = query_with(CatalogFilters::default(), SortKey::Newest);
        query.limit = 2;
        query.offset = 2;
        let page = catalog(&store, &query).await.expect("catalog");
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn non_active_listings_never_surface() {
        let store = test_store().await;
        let seller = store.upsert_seller(9).await.expect("seller");
        let pending = store
            .insert_listing(
                seller.id,
                &listing_request("Pending thing", "10", "misc", "Riga"),
                &["orig".into()],
                ListingStatus::PendingModeration,
                ActivationFunding::None,
            )
            .await
            .expect("insert");
        let page = catalog(&store, &query_with(CatalogFilters::default(), SortKey::Newest))
            .await
            .expect("catalog");
        assert!(page.items.iter().all(|l| l.id != pending.id));
        assert_eq!(page.total, 0);
    }
}
