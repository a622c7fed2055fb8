use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Price sentinel for giveaway listings. Stored verbatim in the price column.
pub const FREE_PRICE: &str = "Free";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Draft,
    PendingModeration,
    Active,
    Rejected,
    Sold,
    Deactivated,
    Expired,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Draft => "draft",
            ListingStatus::PendingModeration => "pending_moderation",
            ListingStatus::Active => "active",
            ListingStatus::Rejected => "rejected",
            ListingStatus::Sold => "sold",
            ListingStatus::Deactivated => "deactivated",
            ListingStatus::Expired => "expired",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "draft" => Some(ListingStatus::Draft),
            "pending_moderation" => Some(ListingStatus::PendingModeration),
            "active" => Some(ListingStatus::Active),
            "rejected" => Some(ListingStatus::Rejected),
            "sold" => Some(ListingStatus::Sold),
            "deactivated" => Some(ListingStatus::Deactivated),
            "expired" => Some(ListingStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    Pending,
    Approved,
    Rejected,
}

impl ModerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationStatus::Pending => "pending",
            ModerationStatus::Approved => "approved",
            ModerationStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "pending" => Some(ModerationStatus::Pending),
            "approved" => Some(ModerationStatus::Approved),
            "rejected" => Some(ModerationStatus::Rejected),
            _ => None,
        }
    }
}

/// Paid visibility tiers, strictly ordered `Highlighted < TopCategory < Vip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionTier {
    Highlighted,
    TopCategory,
    Vip,
}

impl PromotionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionTier::Highlighted => "highlighted",
            PromotionTier::TopCategory => "top_category",
            PromotionTier::Vip => "vip",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "highlighted" => Some(PromotionTier::Highlighted),
            "top_category" => Some(PromotionTier::TopCategory),
            "vip" => Some(PromotionTier::Vip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemCondition {
    New,
    Used,
}

impl ItemCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemCondition::New => "new",
            ItemCondition::Used => "used",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "new" => Some(ItemCondition::New),
            "used" => Some(ItemCondition::Used),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Balance,
    Direct,
}

/// How the activation that put this listing in front of moderators was paid
/// for. Approval consults this to decide whether the free-ad entitlement has
/// now been spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFunding {
    None,
    FreeAd,
    PackageCredit,
}

impl ActivationFunding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationFunding::None => "none",
            ActivationFunding::FreeAd => "free_ad",
            ActivationFunding::PackageCredit => "package_credit",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "none" => Some(ActivationFunding::None),
            "free_ad" => Some(ActivationFunding::FreeAd),
            "package_credit" => Some(ActivationFunding::PackageCredit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub seller_id: i64,
    pub title: String,
    pub description: String,
    pub price: String,
    pub currency: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub condition: Option<ItemCondition>,
    pub location: String,
    pub images: Vec<String>,
    pub optimized_images: Vec<String>,
    pub status: ListingStatus,
    pub moderation_status: ModerationStatus,
    pub rejection_reason: Option<String>,
    pub promotion_type: Option<PromotionTier>,
    pub promotion_ends_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub funding: ActivationFunding,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub view_count: i64,
    pub favorites_count: i64,
}

impl Listing {
    pub fn is_free(&self) -> bool {
        self.price == FREE_PRICE
    }

    /// Promotion is never swept; an expired window simply stops counting.
    pub fn active_tier(&self, now: DateTime<Utc>) -> Option<PromotionTier> {
        match (self.promotion_type, self.promotion_ends_at) {
            (Some(tier), Some(ends)) if ends > now => Some(tier),
            _ => None,
        }
    }

    /// Publicness is decided here, not by the lazily persisted status flip.
    pub fn is_public(&self, now: DateTime<Utc>) -> bool {
        self.status == ListingStatus::Active && self.expires_at.is_none_or(|at| at > now)
    }

    /// Optimized variant when one landed for that slot, original otherwise.
    pub fn effective_images(&self) -> Vec<String> {
        self.images
            .iter()
            .enumerate()
            .map(|(idx, original)| {
                self.optimized_images
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| original.clone())
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Seller {
    pub id: i64,
    pub external_id: i64,
    pub has_used_free_ad: bool,
    pub listing_packages_balance: i64,
    pub balance: f64,
    pub created_at: DateTime<Utc>,
}

/// A raw upload as it arrives over the wire. `data` is base64 so the JSON
/// body stays transportable; handlers decode before the pipeline sees it.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageUpload {
    pub filename: String,
    pub data: String,
}

/// A decoded upload, past the transport boundary.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewListing {
    pub seller_external_id: i64,
    pub title: String,
    pub description: String,
    pub price: String,
    pub currency: String,
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub condition: Option<ItemCondition>,
    pub location: String,
    pub images: Vec<ImageUpload>,
    #[serde(default)]
    pub promotion: Option<PromotionChoice>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PromotionChoice {
    pub tier: PromotionTier,
    pub payment_method: PaymentMethod,
}

/// Edit payload. `retained_images` distinguishes "leave the images alone"
/// (absent) from "drop every existing image" (`[]`); collapsing the two would
/// make removal unexpressible.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingUpdate {
    pub seller_external_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub condition: Option<ItemCondition>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub retained_images: Option<Vec<String>>,
    #[serde(default)]
    pub new_images: Vec<ImageUpload>,
    #[serde(default)]
    pub promotion: Option<PromotionChoice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Newest,
    PriceAsc,
    PriceDesc,
    Views,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogFilters {
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub free_only: bool,
    pub cities: Vec<String>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogQuery {
    pub filters: CatalogFilters,
    pub sort: SortKey,
    pub offset: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogPage {
    pub items: Vec<Listing>,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModerationDecision {
    pub listing_id: i64,
    pub verdict: Verdict,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub fn validate_price(price: &str) -> bool {
    price == FREE_PRICE
        || price
            .parse::<f64>()
            .map(|value| value.is_finite() && value >= 0.0)
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_listing() -> Listing {
        let now = Utc::now();
        Listing {
            id: 1,
            seller_id: 1,
            title: "Mountain bike".into(),
            description: "Hardtail, barely ridden".into(),
            price: "250".into(),
            currency: "USD".into(),
            category: "sports".into(),
            subcategory: None,
            condition: Some(ItemCondition::Used),
            location: "Riga".into(),
            images: vec!["orig-a".into(), "orig-b".into(), "orig-c".into()],
            optimized_images: vec!["opt-a".into()],
            status: ListingStatus::Active,
            moderation_status: ModerationStatus::Approved,
            rejection_reason: None,
            promotion_type: None,
            promotion_ends_at: None,
            expires_at: Some(now + Duration::days(30)),
            published_at: Some(now),
            funding: ActivationFunding::FreeAd,
            created_at: now,
            updated_at: now,
            view_count: 0,
            favorites_count: 0,
        }
    }

    #[test]
    fn effective_images_falls_back_per_index() {
        let listing = sample_listing();
        assert_eq!(listing.effective_images(), vec!["opt-a", "orig-b", "orig-c"]);
    }

    #[test]
    fn expired_window_drops_the_tier() {
        let mut listing = sample_listing();
        let now = Utc::now();
        listing.promotion_type = Some(PromotionTier::Vip);
        listing.promotion_ends_at = Some(now - Duration::hours(1));
        assert_eq!(listing.active_tier(now), None);

        listing.promotion_ends_at = Some(now + Duration::hours(1));
        assert_eq!(listing.active_tier(now), Some(PromotionTier::Vip));
    }

    #[test]
    fn publicness_checks_expiry_not_just_status() {
        let mut listing = sample_listing();
        let now = Utc::now();
        assert!(listing.is_public(now));
        listing.expires_at = Some(now - Duration::seconds(1));
        assert!(!listing.is_public(now));
    }

    #[test]
    fn price_validation_accepts_sentinel() {
        assert!(validate_price(FREE_PRICE));
        assert!(validate_price("19.99"));
        assert!(!validate_price("-1"));
        assert!(!validate_price("cheap"));
    }
}
