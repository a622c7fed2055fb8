//! Redis-backed idempotency cache for listing creation. When no Redis is
//! configured the server falls back to an in-process map; see `main.rs`.

use crate::lifecycle::ListingOutcome;
use redis::AsyncCommands;

fn cache_key(key: &str) -> String {
    format!("bazaar:idem:{key}")
}

pub async fn redis_get(client: &redis::Client, key: &str) -> Option<ListingOutcome> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(cache_key(key)).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set(client: &redis::Client, key: &str, value: &ListingOutcome, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(cache_key(key), json, ttl_secs).await;
    }
}
