//! Review-channel submission: formats a listing into a bounded caption,
//! attaches up to ten images, and delivers to the moderation channel. Media
//! failures degrade to fewer attachments; text delivery is the part that
//! must not be lost.

use crate::external::{BlobStore, ChannelError, ModerationChannel};
use crate::models::Listing;
use std::sync::Arc;
use tracing::{info, warn};

/// Channel-imposed caption ceiling, in characters.
pub const CAPTION_LIMIT: usize = 1024;

/// Most channels cap album size; anything past this many images is noise to
/// a reviewer anyway.
pub const MAX_ATTACHMENTS: usize = 10;

#[derive(Clone)]
pub struct ModerationQueue {
    channel: Arc<dyn ModerationChannel>,
    blob: Arc<dyn BlobStore>,
}

impl ModerationQueue {
    pub fn new(channel: Arc<dyn ModerationChannel>, blob: Arc<dyn BlobStore>) -> Self {
        Self { channel, blob }
    }

    /// Delivers the listing for review. Image loads are best-effort; a
    /// submission with zero loadable images still goes out as text.
    pub async fn submit(&self, listing: &Listing, is_edit: bool) -> Result<String, ChannelError> {
        let summary = build_summary(listing, is_edit);
        let mut images = Vec::new();
        for blob_ref in listing.effective_images().iter().take(MAX_ATTACHMENTS) {
            match self.blob.read(blob_ref).await {
                Ok(bytes) => images.push(bytes),
                Err(err) => {
                    warn!(
                        target = "bazaar.moderation",
                        listing = listing.id,
                        blob_ref = %blob_ref,
                        error = %err,
                        "image unavailable for review, submitting without it",
                    );
                }
            }
        }
        let attached = images.len();
        let handle = self.channel.submit(&summary, images).await?;
        info!(
            target = "bazaar.moderation",
            listing = listing.id,
            handle = %handle,
            attached,
            is_edit,
            "listing submitted for review",
        );
        Ok(handle)
    }
}

/// Renders the reviewer-facing caption. Edits are flagged so a moderator
/// knows a previously seen listing is back.
pub fn build_summary(listing: &Listing, is_edit: bool) -> String {
    let mut text = String::new();
    if is_edit {
        text.push_str("✏️ Resubmitted after edit\n\n");
    }
    text.push_str(&format!("#{} {}\n", listing.id, listing.title));
    if listing.is_free() {
        text.push_str("Price: Free\n");
    } else {
        text.push_str(&format!("Price: {} {}\n", listing.price, listing.currency));
    }
    match &listing.subcategory {
        Some(sub) => text.push_str(&format!("Category: {} / {}\n", listing.category, sub)),
        None => text.push_str(&format!("Category: {}\n", listing.category)),
    }
    if let Some(condition) = listing.condition {
        text.push_str(&format!("Condition: {}\n", condition.as_str()));
    }
    text.push_str(&format!("Location: {}\n", listing.location));
    text.push_str(&format!("Seller: {}\n", listing.seller_id));
    text.push('\n');
    text.push_str(&listing.description);
    truncate_caption(&text, CAPTION_LIMIT)
}

/// Fits text into `limit` characters, cutting back to whitespace rather than
/// mid-token and trimming an unbalanced `*`/`_` marker left dangling by the
/// cut. Appends an ellipsis when anything was dropped.
pub fn truncate_caption(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut prefix: String = text.chars().take(limit.saturating_sub(1)).collect();
    if let Some(pos) = prefix.rfind(char::is_whitespace) {
        prefix.truncate(pos);
    }
    for marker in ['*', '_'] {
        if prefix.matches(marker).count() % 2 == 1 {
            if let Some(pos) = prefix.rfind(marker) {
                prefix.truncate(pos);
            }
        }
    }
    let mut out = prefix.trim_end().to_string();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{BlobError, MemoryBlobStore, RecordingModerationChannel};
    use crate::models::{ActivationFunding, ItemCondition, ListingStatus, ModerationStatus, FREE_PRICE};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    fn sample_listing() -> Listing {
        Listing {
            id: 7,
            seller_id: 3,
            title: "Mountain bike".into(),
            description: "Hardtail, barely used".into(),
            price: "250".into(),
            currency: "EUR".into(),
            category: "sport".into(),
            subcategory: Some("bikes".into()),
            condition: Some(ItemCondition::Used),
            location: "Riga".into(),
            images: vec![],
            optimized_images: vec![],
            status: ListingStatus::PendingModeration,
            moderation_status: ModerationStatus::Pending,
            rejection_reason: None,
            funding: ActivationFunding::FreeAd,
            promotion_type: None,
            promotion_ends_at: None,
            view_count: 0,
            favorites_count: 0,
            published_at: None,
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Delegates to a memory store but refuses reads for poisoned refs.
    struct FlakyBlobStore {
        inner: MemoryBlobStore,
        poisoned: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl crate::external::BlobStore for FlakyBlobStore {
        async fn save(&self, bytes: &[u8]) -> Result<String, BlobError> {
            self.inner.save(bytes).await
        }

        async fn read(&self, blob_ref: &str) -> Result<Vec<u8>, BlobError> {
            if self.poisoned.lock().await.contains(blob_ref) {
                return Err(BlobError::Unavailable(blob_ref.to_string()));
            }
            self.inner.read(blob_ref).await
        }

        async fn exists(&self, blob_ref: &str) -> bool {
            self.inner.exists(blob_ref).await
        }
    }

    #[test]
    fn summary_carries_the_essentials() {
        let summary = build_summary(&sample_listing(), false);
        assert!(summary.contains("#7 Mountain bike"));
        assert!(summary.contains("Price: 250 EUR"));
        assert!(summary.contains("Category: sport / bikes"));
        assert!(summary.contains("Hardtail, barely used"));
        assert!(!summary.contains("Resubmitted"));
    }

    #[test]
    fn edited_listings_are_flagged_for_the_reviewer() {
        let summary = build_summary(&sample_listing(), true);
        assert!(summary.starts_with("✏️ Resubmitted after edit"));
    }

    #[test]
    fn free_listings_render_without_currency() {
        let mut listing = sample_listing();
        listing.price = FREE_PRICE.into();
        let summary = build_summary(&listing, false);
        assert!(summary.contains("Price: Free\n"));
        assert!(!summary.contains("Free EUR"));
    }

    #[test]
    fn truncation_cuts_at_whitespace() {
        let text = "word ".repeat(300);
        let out = truncate_caption(&text, CAPTION_LIMIT);
        assert!(out.chars().count() <= CAPTION_LIMIT);
        assert!(out.ends_with("word…"));
    }

    #[test]
    fn truncation_drops_dangling_markup() {
        let mut text = "a ".repeat(510);
        text.push_str("*bold run that will straddle the cut boundary and keep going*");
        let out = truncate_caption(&text, CAPTION_LIMIT);
        assert_eq!(out.matches('*').count() % 2, 0);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn short_captions_pass_through_untouched() {
        assert_eq!(truncate_caption("fine as is", CAPTION_LIMIT), "fine as is");
    }

    #[tokio::test]
    async fn unavailable_image_still_delivers_the_rest() {
        let blob = MemoryBlobStore::new();
        let a = blob.save(b"first").await.expect("save");
        let b = blob.save(b"second").await.expect("save");
        let c = blob.save(b"third").await.expect("save");
        let flaky = Arc::new(FlakyBlobStore {
            inner: blob,
            poisoned: Mutex::new(HashSet::from([b.clone()])),
        });
        let channel = RecordingModerationChannel::new();
        let queue = ModerationQueue::new(Arc::new(channel.clone()), flaky);

        let mut listing = sample_listing();
        listing.images = vec![a, b, c];
        queue.submit(&listing, false).await.expect("submit");

        let submissions = channel.submissions.lock().await;
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].1, 2);
        assert!(submissions[0].0.contains("Mountain bike"));
    }

    #[tokio::test]
    async fn attachment_count_is_capped() {
        let blob = Arc::new(MemoryBlobStore::new());
        let mut refs = Vec::new();
        for n in 0..12u8 {
            refs.push(blob.save(&[n]).await.expect("save"));
        }
        let channel = RecordingModerationChannel::new();
        let queue = ModerationQueue::new(Arc::new(channel.clone()), blob);

        let mut listing = sample_listing();
        listing.images = refs;
        queue.submit(&listing, false).await.expect("submit");

        let submissions = channel.submissions.lock().await;
        assert_eq!(submissions[0].1, MAX_ATTACHMENTS);
    }
}
