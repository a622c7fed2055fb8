//! Monetization: the activation gate (free ad / package credits), promotion
//! tiers and their pricing, and the payment split between balance debits and
//! hosted checkout. Debits are conditional single-statement writes so two
//! concurrent activations can never both spend the same credit.

use crate::external::{ChargeOutcome, PaymentGateway};
use crate::lifecycle::LifecycleError;
use crate::models::{ActivationFunding, Listing, PaymentMethod, PromotionTier, Seller};
use crate::store::Store;
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::info;

/// How long a purchased tier stays in effect.
pub const PROMOTION_WINDOW_DAYS: i64 = 7;

struct TierPrices {
    highlighted: f64,
    top_category: f64,
    vip: f64,
}

static TIER_PRICES: Lazy<TierPrices> = Lazy::new(|| TierPrices {
    highlighted: price_from_env("PRICE_HIGHLIGHTED", 1.0),
    top_category: price_from_env("PRICE_TOP_CATEGORY", 3.0),
    vip: price_from_env("PRICE_VIP", 5.0),
});

fn price_from_env(key: &str, fallback: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| *value >= 0.0)
        .unwrap_or(fallback)
}

pub fn tier_price(tier: PromotionTier) -> f64 {
    match tier {
        PromotionTier::Highlighted => TIER_PRICES.highlighted,
        PromotionTier::TopCategory => TIER_PRICES.top_category,
        PromotionTier::Vip => TIER_PRICES.vip,
    }
}

/// Upgrade pricing: the positive difference between the target tier and the
/// currently active tier, floored at zero. Downgrades cost nothing.
pub fn price_for_tier(tier: PromotionTier, current: Option<PromotionTier>) -> f64 {
    let credit = current.map(tier_price).unwrap_or(0.0);
    (tier_price(tier) - credit).max(0.0)
}

#[derive(Debug, Clone, Copy)]
pub struct ActivationGate {
    pub needs_package: bool,
}

#[derive(Debug, Clone)]
pub enum PromotionOutcome {
    Applied,
    /// Hosted checkout started; the lifecycle must not submit to moderation
    /// until the payment-confirmed callback lands.
    PendingPayment { redirect_url: String },
}

#[derive(Clone)]
pub struct PromotionLedger {
    store: Store,
    gateway: Arc<dyn PaymentGateway>,
    paid_listings_enabled: bool,
}

impl PromotionLedger {
    pub fn new(store: Store, gateway: Arc<dyn PaymentGateway>, paid_listings_enabled: bool) -> Self {
        Self {
            store,
            gateway,
            paid_listings_enabled,
        }
    }

    /// Non-consuming precondition check. `needs_package` routes the seller
    /// to the purchase step; it is a blocking precondition, not a warning.
    pub fn check_activation_gate(&self, seller: &Seller) -> ActivationGate {
        if !self.paid_listings_enabled {
            return ActivationGate {
                needs_package: false,
            };
        }
        if !seller.has_used_free_ad {
            return ActivationGate {
                needs_package: false,
            };
        }
        ActivationGate {
            needs_package: seller.listing_packages_balance <= 0,
        }
    }

    /// Consuming counterpart: spends a package credit or claims the one-time
    /// free-ad entitlement. The credit debit is atomic, so of two racing
    /// activations only one can succeed on a balance of one.
    pub async fn consume_package_or_free_ad(
        &self,
        seller: &Seller,
    ) -> Result<ActivationFunding, LifecycleError> {
        if !self.paid_listings_enabled {
            return Ok(ActivationFunding::None);
        }
        if !seller.has_used_free_ad {
            // The flag itself flips at approval time, when the activation
            // actually lands without a credit.
            return Ok(ActivationFunding::FreeAd);
        }
        if self.store.debit_package(seller.id).await? {
            Ok(ActivationFunding::PackageCredit)
        } else {
            Err(LifecycleError::NeedsPackage)
        }
    }

    /// Applies a tier to a listing, charging via the requested method.
    /// Balance debits either apply fully or fail; a direct charge parks the
    /// tier in `pending_payments` until the gateway confirms.
    pub async fn apply_promotion(
        &self,
        listing: &Listing,
        tier: PromotionTier,
        method: PaymentMethod,
    ) -> Result<PromotionOutcome, LifecycleError> {
        let now = Utc::now();
        let current = listing.active_tier(now);
        let amount = price_for_tier(tier, current);
        // No tier-downgrade operation exists; paying the zero delta for a
        // lower tier leaves the higher one in place.
        let takes_effect = current.is_none_or(|held| tier >= held);

        if amount <= 0.0 {
            if takes_effect {
                self.store
                    .apply_promotion(listing.id, tier, now + Duration::days(PROMOTION_WINDOW_DAYS))
                    .await?;
            }
            return Ok(PromotionOutcome::Applied);
        }

        match method {
            PaymentMethod::Balance => {
                if !self.store.debit_balance(listing.seller_id, amount).await? {
                    return Err(LifecycleError::InsufficientBalance);
                }
                self.store
                    .apply_promotion(listing.id, tier, now + Duration::days(PROMOTION_WINDOW_DAYS))
                    .await?;
                info!(
                    target = "bazaar.promotion",
                    listing = listing.id,
                    tier = tier.as_str(),
                    amount,
                    "promotion charged from balance",
                );
                Ok(PromotionOutcome::Applied)
            }
            PaymentMethod::Direct => {
                let outcome = self
                    .gateway
                    .charge_or_redirect(amount, PaymentMethod::Direct)
                    .await
                    .map_err(|err| LifecycleError::Storage(err.to_string()))?;
                match outcome {
                    ChargeOutcome::CompletedNow => {
                        self.store
                            .apply_promotion(
                                listing.id,
                                tier,
                                now + Duration::days(PROMOTION_WINDOW_DAYS),
                            )
                            .await?;
                        Ok(PromotionOutcome::Applied)
                    }
                    ChargeOutcome::PendingRedirect { url, reference } => {
                        self.store
                            .record_pending_payment(&reference, listing.id, tier, amount)
                            .await?;
                        info!(
                            target = "bazaar.promotion",
                            listing = listing.id,
                            tier = tier.as_str(),
                            reference = %reference,
                            "promotion awaiting external payment",
                        );
                        Ok(PromotionOutcome::PendingPayment { redirect_url: url })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::CheckoutGateway;
    use crate::models::{ImageUpload, ListingStatus, NewListing};

    async fn test_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.expect("connect");
        store.ensure_schema().await.expect("schema");
        store
    }

    fn ledger(store: &Store, paid: bool) -> PromotionLedger {
        PromotionLedger::new(store.clone(), Arc::new(CheckoutGateway), paid)
    }

    async fn seed_listing(store: &Store) -> Listing {
        let seller = store.upsert_seller(500).await.expect("seller");
        store
            .insert_listing(
                seller.id,
                &NewListing {
                    seller_external_id: 500,
                    title: "Lamp".into(),
                    description: "Desk lamp".into(),
                    price: "12".into(),
                    currency: "EUR".into(),
                    category: "home".into(),
                    subcategory: None,
                    condition: None,
                    location: "Riga".into(),
                    images: vec![ImageUpload {
                        filename: "lamp.jpg".into(),
                        data: String::new(),
                    }],
                    promotion: None,
                },
                &["orig".into()],
                ListingStatus::Draft,
                ActivationFunding::None,
            )
            .await
            .expect("insert")
    }

    #[test]
    fn upgrade_pricing_is_a_floored_delta() {
        let vip = tier_price(PromotionTier::Vip);
        let highlighted = tier_price(PromotionTier::Highlighted);
        assert_eq!(
            price_for_tier(PromotionTier::Vip, Some(PromotionTier::Highlighted)),
            vip - highlighted,
        );
        assert_eq!(price_for_tier(PromotionTier::Highlighted, Some(PromotionTier::Vip)), 0.0);
        assert_eq!(price_for_tier(PromotionTier::Vip, Some(PromotionTier::Vip)), 0.0);
        assert_eq!(price_for_tier(PromotionTier::Vip, None), vip);
    }

    #[tokio::test]
    async fn gate_passes_when_paid_mode_is_off() {
        let store = test_store().await;
        let seller = store.upsert_seller(1).await.expect("seller");
        store.mark_free_ad_used(seller.id).await.expect("spend free ad");
        let seller = store.seller_by_id(seller.id).await.expect("get").expect("row");
        assert!(!ledger(&store, false).check_activation_gate(&seller).needs_package);
        assert!(ledger(&store, true).check_activation_gate(&seller).needs_package);
    }

    #[tokio::test]
    async fn first_activation_is_free_regardless_of_packages() {
        let store = test_store().await;
        let seller = store.upsert_seller(2).await.expect("seller");
        let ledger = ledger(&store, true);
        assert!(!ledger.check_activation_gate(&seller).needs_package);
        let funding = ledger
            .consume_package_or_free_ad(&seller)
            .await
            .expect("consume");
        assert_eq!(funding, ActivationFunding::FreeAd);
    }

    #[tokio::test]
    async fn spent_free_ad_and_empty_balance_block() {
        let store = test_store().await;
        let seller = store.upsert_seller(3).await.expect("seller");
        store.mark_free_ad_used(seller.id).await.expect("spend");
        let seller = store.seller_by_id(seller.id).await.expect("get").expect("row");
        let ledger = ledger(&store, true);
        assert!(ledger.check_activation_gate(&seller).needs_package);
        let err = ledger
            .consume_package_or_free_ad(&seller)
            .await
            .expect_err("blocked");
        assert!(matches!(err, LifecycleError::NeedsPackage));

        store.credit_packages(seller.id, 1).await.expect("credit");
        let funding = ledger
            .consume_package_or_free_ad(&seller)
            .await
            .expect("consume");
        assert_eq!(funding, ActivationFunding::PackageCredit);
    }

    #[tokio::test]
    async fn balance_debit_rejects_insufficient_funds() {
        let store = test_store().await;
        let listing = seed_listing(&store).await;
        let ledger = ledger(&store, true);
        let err = ledger
            .apply_promotion(&listing, PromotionTier::Vip, PaymentMethod::Balance)
            .await
            .expect_err("no funds");
        assert!(matches!(err, LifecycleError::InsufficientBalance));

        store
            .set_balance(listing.seller_id, tier_price(PromotionTier::Vip))
            .await
            .expect("fund");
        let outcome = ledger
            .apply_promotion(&listing, PromotionTier::Vip, PaymentMethod::Balance)
            .await
            .expect("charge");
        assert!(matches!(outcome, PromotionOutcome::Applied));
        let listing = store.listing(listing.id).await.expect("get").expect("row");
        assert_eq!(listing.promotion_type, Some(PromotionTier::Vip));
        assert!(listing.promotion_ends_at.expect("window") > Utc::now());
    }

    #[tokio::test]
    async fn direct_payment_defers_application() {
        let store = test_store().await;
        let listing = seed_listing(&store).await;
        let outcome = ledger(&store, true)
            .apply_promotion(&listing, PromotionTier::Highlighted, PaymentMethod::Direct)
            .await
            .expect("redirect");
        let PromotionOutcome::PendingPayment { redirect_url } = outcome else {
            panic!("expected pending payment");
        };
        assert!(redirect_url.starts_with("https://"));
        // Tier must not be live before the confirmation callback.
        let listing = store.listing(listing.id).await.expect("get").expect("row");
        assert_eq!(listing.promotion_type, None);
    }
}
