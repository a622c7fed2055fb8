//! The listing lifecycle engine. Every state change funnels through here:
//! creation and its activation gate, edits and re-moderation, the
//! sold/deactivate/reactivate transitions, moderator decisions, and payment
//! confirmations. Status flips are guarded single-statement updates, so a
//! concurrent writer loses cleanly instead of corrupting state.

use crate::external::{Notifier, NotifyKind};
use crate::images::{first_image_fingerprint, BatchDeduper, ImagePipeline};
use crate::jobs::{JobKind, JobQueue};
use crate::models::{
    validate_price, ActivationFunding, CatalogPage, CatalogQuery, ImageFile, ImageUpload, Listing,
    ListingStatus, ListingUpdate, ModerationDecision, NewListing, Seller, Verdict,
};
use crate::promotion::{PromotionLedger, PromotionOutcome};
use crate::search;
use crate::store::{Store, StoreError};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(String),
    #[error("activation requires a listing package")]
    NeedsPackage,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("cannot move a `{from}` listing to `{to}`")]
    IllegalTransition {
        from: ListingStatus,
        to: ListingStatus,
    },
    #[error("listing not found")]
    NotFound,
    #[error("not the listing owner")]
    Forbidden,
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("background queue unavailable: {0}")]
    Queue(String),
}

impl LifecycleError {
    /// Machine-readable error code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::Validation(_) => "validation_failed",
            LifecycleError::NeedsPackage => "needs_package",
            LifecycleError::InsufficientBalance => "insufficient_balance",
            LifecycleError::IllegalTransition { .. } => "illegal_transition",
            LifecycleError::NotFound => "not_found",
            LifecycleError::Forbidden => "forbidden",
            LifecycleError::Storage(_) => "storage_error",
            LifecycleError::Queue(_) => "queue_unavailable",
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => LifecycleError::NotFound,
            other => LifecycleError::Storage(other.to_string()),
        }
    }
}

/// Result of an operation that may have started a hosted checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingOutcome {
    pub listing: Listing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub created: Vec<i64>,
    pub skipped_duplicates: usize,
    pub failed: usize,
}

/// Decodes base64 upload payloads at the transport boundary.
pub fn decode_uploads(uploads: &[ImageUpload]) -> Result<Vec<ImageFile>, LifecycleError> {
    let engine = base64::engine::general_purpose::STANDARD;
    uploads
        .iter()
        .map(|upload| {
            let bytes = engine.decode(&upload.data).map_err(|_| {
                LifecycleError::Validation(format!("image `{}` is not valid base64", upload.filename))
            })?;
            Ok(ImageFile {
                filename: upload.filename.clone(),
                bytes,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct Lifecycle {
    store: Store,
    images: ImagePipeline,
    ledger: PromotionLedger,
    notifier: Arc<dyn Notifier>,
    jobs: JobQueue,
}

impl Lifecycle {
    pub fn new(
        store: Store,
        images: ImagePipeline,
        ledger: PromotionLedger,
        notifier: Arc<dyn Notifier>,
        jobs: JobQueue,
    ) -> Self {
        Self {
            store,
            images,
            ledger,
            notifier,
            jobs,
        }
    }

    async fn enqueue(&self, kind: JobKind) -> Result<(), LifecycleError> {
        self.jobs
            .enqueue(kind)
            .await
            .map(|_| ())
            .map_err(|err| LifecycleError::Queue(err.detail.unwrap_or(err.error)))
    }

    /// Resolves the caller to an owned seller row, or refuses.
    async fn owner(
        &self,
        listing: &Listing,
        seller_external_id: i64,
    ) -> Result<(), LifecycleError> {
        let seller = self
            .store
            .seller_by_external(seller_external_id)
            .await?
            .ok_or(LifecycleError::Forbidden)?;
        if seller.id != listing.seller_id {
            return Err(LifecycleError::Forbidden);
        }
        Ok(())
    }

    // ── Creation ──────────────────────────────────────────────────────────

    /// Creates a listing and routes it into moderation. Originals are stored
    /// durably before the row exists; optimization and the review-channel
    /// delivery run in the background. When the promotion choice needs an
    /// external payment the listing stays in `draft` until the confirmation
    /// callback lands.
    pub async fn create_listing(
        &self,
        request: NewListing,
        files: Vec<ImageFile>,
    ) -> Result<ListingOutcome, LifecycleError> {
        validate_new_listing(&request)?;
        if files.is_empty() {
            return Err(LifecycleError::Validation(
                "at least one image is required".into(),
            ));
        }
        self.images.validate_sizes(&files)?;

        let seller = self.store.upsert_seller(request.seller_external_id).await?;
        let gate = self.ledger.check_activation_gate(&seller);
        if gate.needs_package {
            self.notifier
                .notify(seller.external_id, NotifyKind::PackageRequired, json!({}))
                .await;
            return Err(LifecycleError::NeedsPackage);
        }
        let funding = self.ledger.consume_package_or_free_ad(&seller).await?;

        let refs = match self.images.ingest_originals(&files).await {
            Ok(refs) => refs,
            Err(err) => {
                self.refund_funding(&seller, funding).await;
                return Err(err);
            }
        };
        let listing = match self
            .store
            .insert_listing(seller.id, &request, &refs, ListingStatus::Draft, funding)
            .await
        {
            Ok(listing) => listing,
            Err(err) => {
                self.refund_funding(&seller, funding).await;
                return Err(err.into());
            }
        };
        info!(
            target = "bazaar.lifecycle",
            listing = listing.id,
            seller = seller.external_id,
            funding = funding.as_str(),
            images = refs.len(),
            "listing created",
        );

        let mut redirect = None;
        if let Some(choice) = request.promotion {
            match self
                .ledger
                .apply_promotion(&listing, choice.tier, choice.payment_method)
                .await?
            {
                PromotionOutcome::Applied => {}
                PromotionOutcome::PendingPayment { redirect_url } => {
                    redirect = Some(redirect_url);
                }
            }
        }

        if redirect.is_none() {
            self.store
                .submit_for_moderation(listing.id, &[ListingStatus::Draft], funding)
                .await?;
            self.enqueue(JobKind::OptimizeImages {
                listing_id: listing.id,
            })
            .await?;
            self.enqueue(JobKind::SubmitModeration {
                listing_id: listing.id,
                is_edit: false,
            })
            .await?;
        }

        let listing = self
            .store
            .listing(listing.id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        Ok(ListingOutcome {
            listing,
            redirect_url: redirect,
        })
    }

    /// Puts a consumed package credit back when creation aborts before the
    /// row exists. Free-ad funding needs no refund; that flag only flips at
    /// approval.
    async fn refund_funding(&self, seller: &Seller, funding: ActivationFunding) {
        if funding != ActivationFunding::PackageCredit {
            return;
        }
        if let Err(err) = self.store.credit_packages(seller.id, 1).await {
            warn!(
                target = "bazaar.lifecycle",
                seller = seller.external_id,
                error = %err,
                "package refund failed after aborted creation",
            );
        }
    }

    /// Bulk creation for catalog imports. Skips listings whose first image
    /// repeats inside the batch and titles the seller already has; promotion
    /// choices are ignored here.
    pub async fn import_batch(
        &self,
        items: Vec<(NewListing, Vec<ImageFile>)>,
    ) -> Result<ImportReport, LifecycleError> {
        let mut report = ImportReport::default();
        let mut dedupe = BatchDeduper::new();
        for (mut request, files) in items {
            if let Some(fingerprint) = first_image_fingerprint(&files) {
                if dedupe.seen_before(fingerprint) {
                    report.skipped_duplicates += 1;
                    continue;
                }
            }
            let seller = self.store.upsert_seller(request.seller_external_id).await?;
            if self.store.owner_has_title(seller.id, &request.title).await? {
                report.skipped_duplicates += 1;
                continue;
            }
            request.promotion = None;
            match self.create_listing(request, files).await {
                Ok(outcome) => report.created.push(outcome.listing.id),
                Err(err) => {
                    debug!(target = "bazaar.lifecycle", error = %err, "import item failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    // ── Edits ─────────────────────────────────────────────────────────────

    /// Applies an edit. Field changes and image retention persist
    /// immediately; new uploads are validated now and ingested in the
    /// background. An edit to a live listing pulls it back into moderation,
    /// and an edit to a rejected one resubmits it, optionally with a fresh
    /// promotion choice.
    pub async fn edit_listing(
        &self,
        id: i64,
        update: ListingUpdate,
        new_files: Vec<ImageFile>,
    ) -> Result<ListingOutcome, LifecycleError> {
        let listing = self
            .store
            .listing(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        self.owner(&listing, update.seller_external_id).await?;
        if matches!(
            listing.status,
            ListingStatus::Sold | ListingStatus::Deactivated | ListingStatus::Expired
        ) {
            return Err(LifecycleError::IllegalTransition {
                from: listing.status,
                to: ListingStatus::PendingModeration,
            });
        }
        if let Some(price) = &update.price {
            if !validate_price(price) {
                return Err(LifecycleError::Validation(format!(
                    "invalid price: {price}"
                )));
            }
        }
        self.images.validate_sizes(&new_files)?;

        if let Some(retained) = &update.retained_images {
            for kept in retained {
                if !listing.images.contains(kept) {
                    return Err(LifecycleError::Validation(format!(
                        "retained image is not on the listing: {kept}"
                    )));
                }
            }
            if retained.is_empty() && new_files.is_empty() {
                return Err(LifecycleError::Validation(
                    "a listing must keep at least one image".into(),
                ));
            }
            self.store.set_retained_images(id, retained).await?;
        }
        self.store.update_listing_fields(id, &update).await?;

        if !new_files.is_empty() {
            self.enqueue(JobKind::IngestUploads {
                listing_id: id,
                files: new_files,
            })
            .await?;
        }

        let mut redirect = None;
        match listing.status {
            ListingStatus::Active => {
                self.store
                    .submit_for_moderation(id, &[ListingStatus::Active], listing.funding)
                    .await?;
                self.enqueue(JobKind::SubmitModeration {
                    listing_id: id,
                    is_edit: true,
                })
                .await?;
                info!(
                    target = "bazaar.lifecycle",
                    listing = id,
                    "live listing edited, back to moderation",
                );
            }
            ListingStatus::Rejected => {
                if let Some(choice) = update.promotion {
                    match self
                        .ledger
                        .apply_promotion(&listing, choice.tier, choice.payment_method)
                        .await?
                    {
                        PromotionOutcome::Applied => {}
                        PromotionOutcome::PendingPayment { redirect_url } => {
                            redirect = Some(redirect_url);
                        }
                    }
                }
                if redirect.is_none() {
                    self.store
                        .submit_for_moderation(id, &[ListingStatus::Rejected], listing.funding)
                        .await?;
                    self.enqueue(JobKind::SubmitModeration {
                        listing_id: id,
                        is_edit: true,
                    })
                    .await?;
                }
            }
            ListingStatus::PendingModeration => {
                // Refresh the reviewer's snapshot.
                self.enqueue(JobKind::SubmitModeration {
                    listing_id: id,
                    is_edit: true,
                })
                .await?;
            }
            // A draft is still waiting on its payment; nothing to resubmit.
            ListingStatus::Draft => {}
            ListingStatus::Sold | ListingStatus::Deactivated | ListingStatus::Expired => {
                unreachable!("refused above")
            }
        }

        let listing = self
            .store
            .listing(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        Ok(ListingOutcome {
            listing,
            redirect_url: redirect,
        })
    }

    // ── Seller transitions ────────────────────────────────────────────────

    pub async fn mark_sold(
        &self,
        id: i64,
        seller_external_id: i64,
    ) -> Result<Listing, LifecycleError> {
        self.seller_transition(
            id,
            seller_external_id,
            &[
                ListingStatus::Active,
                ListingStatus::Deactivated,
                ListingStatus::Expired,
            ],
            ListingStatus::Sold,
        )
        .await
    }

    pub async fn deactivate(
        &self,
        id: i64,
        seller_external_id: i64,
    ) -> Result<Listing, LifecycleError> {
        self.seller_transition(
            id,
            seller_external_id,
            &[
                ListingStatus::Draft,
                ListingStatus::PendingModeration,
                ListingStatus::Active,
                ListingStatus::Rejected,
                ListingStatus::Expired,
            ],
            ListingStatus::Deactivated,
        )
        .await
    }

    async fn seller_transition(
        &self,
        id: i64,
        seller_external_id: i64,
        from: &[ListingStatus],
        to: ListingStatus,
    ) -> Result<Listing, LifecycleError> {
        let listing = self
            .store
            .listing(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        self.owner(&listing, seller_external_id).await?;
        if !self.store.transition_status(id, from, to).await? {
            let current = self
                .store
                .listing(id)
                .await?
                .ok_or(LifecycleError::NotFound)?;
            return Err(LifecycleError::IllegalTransition {
                from: current.status,
                to,
            });
        }
        info!(
            target = "bazaar.lifecycle",
            listing = id,
            to = to.as_str(),
            "listing transitioned",
        );
        self.store.listing(id).await?.ok_or(LifecycleError::NotFound)
    }

    /// Brings a dormant listing back through the activation gate and into
    /// moderation. The status flip happens before the credit is spent, so of
    /// two racing reactivations only the winner can debit; the loser sees an
    /// illegal transition. On a direct-payment promotion the review-channel
    /// delivery waits for the confirmation callback.
    pub async fn reactivate(
        &self,
        id: i64,
        seller_external_id: i64,
        promotion: Option<crate::models::PromotionChoice>,
    ) -> Result<ListingOutcome, LifecycleError> {
        const FROM: &[ListingStatus] = &[
            ListingStatus::Sold,
            ListingStatus::Deactivated,
            ListingStatus::Rejected,
            ListingStatus::Expired,
        ];
        let listing = self
            .store
            .listing(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        self.owner(&listing, seller_external_id).await?;
        if !FROM.contains(&listing.status) {
            return Err(LifecycleError::IllegalTransition {
                from: listing.status,
                to: ListingStatus::Active,
            });
        }
        let seller = self
            .store
            .seller_by_external(seller_external_id)
            .await?
            .ok_or(LifecycleError::Forbidden)?;
        if self.ledger.check_activation_gate(&seller).needs_package {
            self.notifier
                .notify(seller.external_id, NotifyKind::PackageRequired, json!({}))
                .await;
            return Err(LifecycleError::NeedsPackage);
        }

        if !self
            .store
            .submit_for_moderation(id, FROM, ActivationFunding::None)
            .await?
        {
            let current = self
                .store
                .listing(id)
                .await?
                .ok_or(LifecycleError::NotFound)?;
            return Err(LifecycleError::IllegalTransition {
                from: current.status,
                to: ListingStatus::PendingModeration,
            });
        }
        let funding = match self.ledger.consume_package_or_free_ad(&seller).await {
            Ok(funding) => funding,
            Err(err) => {
                // Lost the gate after winning the status race; put the
                // listing back where it was.
                self.store
                    .transition_status(id, &[ListingStatus::PendingModeration], listing.status)
                    .await?;
                if matches!(err, LifecycleError::NeedsPackage) {
                    self.notifier
                        .notify(seller.external_id, NotifyKind::PackageRequired, json!({}))
                        .await;
                }
                return Err(err);
            }
        };
        self.store.set_funding(id, funding).await?;

        let mut redirect = None;
        if let Some(choice) = promotion {
            match self
                .ledger
                .apply_promotion(&listing, choice.tier, choice.payment_method)
                .await?
            {
                PromotionOutcome::Applied => {}
                PromotionOutcome::PendingPayment { redirect_url } => {
                    redirect = Some(redirect_url);
                }
            }
        }
        if redirect.is_none() {
            self.enqueue(JobKind::SubmitModeration {
                listing_id: id,
                is_edit: false,
            })
            .await?;
        }
        info!(
            target = "bazaar.lifecycle",
            listing = id,
            funding = funding.as_str(),
            "listing reactivated into moderation",
        );

        let listing = self
            .store
            .listing(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        Ok(ListingOutcome {
            listing,
            redirect_url: redirect,
        })
    }

    pub async fn delete_listing(
        &self,
        id: i64,
        seller_external_id: i64,
    ) -> Result<(), LifecycleError> {
        let listing = self
            .store
            .listing(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        self.owner(&listing, seller_external_id).await?;
        self.store.delete_listing(id).await?;
        info!(target = "bazaar.lifecycle", listing = id, "listing deleted");
        Ok(())
    }

    // ── Promotion of a live listing ───────────────────────────────────────

    pub async fn promote(
        &self,
        id: i64,
        seller_external_id: i64,
        choice: crate::models::PromotionChoice,
    ) -> Result<ListingOutcome, LifecycleError> {
        let listing = self
            .store
            .listing(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        self.owner(&listing, seller_external_id).await?;
        if listing.status != ListingStatus::Active {
            return Err(LifecycleError::Validation(
                "only active listings can be promoted".into(),
            ));
        }
        let redirect = match self
            .ledger
            .apply_promotion(&listing, choice.tier, choice.payment_method)
            .await?
        {
            PromotionOutcome::Applied => None,
            PromotionOutcome::PendingPayment { redirect_url } => Some(redirect_url),
        };
        let listing = self
            .store
            .listing(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        Ok(ListingOutcome {
            listing,
            redirect_url: redirect,
        })
    }

    // ── Moderation decisions ──────────────────────────────────────────────

    /// Applies a moderator verdict. Approval stamps the publication window
    /// and spends the free-ad entitlement when no package credit funded the
    /// activation; rejection requires a non-empty reason. Either way the
    /// seller is notified, fire-and-forget.
    pub async fn apply_decision(
        &self,
        decision: ModerationDecision,
    ) -> Result<Listing, LifecycleError> {
        let listing = self
            .store
            .listing(decision.listing_id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        let seller = self
            .store
            .seller_by_id(listing.seller_id)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        match decision.verdict {
            Verdict::Approve => {
                if !self.store.approve_listing(listing.id, Utc::now()).await? {
                    return Err(LifecycleError::IllegalTransition {
                        from: listing.status,
                        to: ListingStatus::Active,
                    });
                }
                if listing.funding != ActivationFunding::PackageCredit
                    && self.store.mark_free_ad_used(listing.seller_id).await?
                {
                    debug!(
                        target = "bazaar.lifecycle",
                        seller = seller.external_id,
                        "free ad entitlement spent",
                    );
                }
                self.notifier
                    .notify(
                        seller.external_id,
                        NotifyKind::ListingApproved,
                        json!({ "listing_id": listing.id, "title": listing.title }),
                    )
                    .await;
                self.notifier
                    .notify(
                        seller.external_id,
                        NotifyKind::ListingPublished,
                        json!({ "listing_id": listing.id }),
                    )
                    .await;
            }
            Verdict::Reject => {
                let reason = decision
                    .reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|reason| !reason.is_empty())
                    .ok_or_else(|| {
                        LifecycleError::Validation("a rejection requires a reason".into())
                    })?;
                if !self.store.reject_listing(listing.id, reason).await? {
                    return Err(LifecycleError::IllegalTransition {
                        from: listing.status,
                        to: ListingStatus::Rejected,
                    });
                }
                self.notifier
                    .notify(
                        seller.external_id,
                        NotifyKind::ListingRejected,
                        json!({ "listing_id": listing.id, "reason": reason }),
                    )
                    .await;
            }
        }
        self.store
            .listing(listing.id)
            .await?
            .ok_or(LifecycleError::NotFound)
    }

    // ── Payments ──────────────────────────────────────────────────────────

    /// Handles the gateway's payment-confirmed callback. The pending-payment
    /// row is consumed exactly once, so a replayed callback is a no-op. The
    /// tier goes live and the listing finally enters moderation.
    pub async fn confirm_payment(
        &self,
        reference: &str,
    ) -> Result<Option<Listing>, LifecycleError> {
        let Some((listing_id, tier)) = self.store.take_pending_payment(reference).await? else {
            debug!(
                target = "bazaar.lifecycle",
                reference, "unknown or replayed payment confirmation",
            );
            return Ok(None);
        };
        let Some(listing) = self.store.listing(listing_id).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        self.store
            .apply_promotion(
                listing.id,
                tier,
                now + chrono::Duration::days(crate::promotion::PROMOTION_WINDOW_DAYS),
            )
            .await?;

        if listing.status == ListingStatus::PendingModeration {
            // A reactivation already holds the status; only the delivery was
            // deferred on the payment.
            self.enqueue(JobKind::SubmitModeration {
                listing_id: listing.id,
                is_edit: false,
            })
            .await?;
        } else {
            self.store
                .submit_for_moderation(
                    listing.id,
                    &[ListingStatus::Draft, ListingStatus::Rejected],
                    listing.funding,
                )
                .await?;
            self.enqueue(JobKind::OptimizeImages {
                listing_id: listing.id,
            })
            .await?;
            self.enqueue(JobKind::SubmitModeration {
                listing_id: listing.id,
                is_edit: false,
            })
            .await?;
        }
        info!(
            target = "bazaar.lifecycle",
            listing = listing.id,
            reference,
            tier = tier.as_str(),
            "payment confirmed, promotion live",
        );
        self.store
            .listing(listing.id)
            .await
            .map_err(LifecycleError::from)
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    /// Public single-listing read. Owners always see their listing; anyone
    /// else only sees it while it is live, and their visit bumps the view
    /// counter.
    pub async fn get_listing(
        &self,
        id: i64,
        viewer_external_id: Option<i64>,
    ) -> Result<Listing, LifecycleError> {
        let mut listing = self
            .store
            .listing(id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        let is_owner = match viewer_external_id {
            Some(external) => self
                .store
                .seller_by_external(external)
                .await?
                .is_some_and(|seller| seller.id == listing.seller_id),
            None => false,
        };
        if !is_owner {
            if !listing.is_public(Utc::now()) {
                return Err(LifecycleError::NotFound);
            }
            self.store.increment_views(id).await?;
            listing.view_count += 1;
        }
        Ok(listing)
    }

    pub async fn catalog(&self, query: &CatalogQuery) -> Result<CatalogPage, LifecycleError> {
        Ok(search::catalog(&self.store, query).await?)
    }

    /// A seller's profile listings. Owners see everything grouped live-first;
    /// visitors only see live and in-review listings.
    pub async fn profile(
        &self,
        seller_external_id: i64,
        viewer_external_id: Option<i64>,
    ) -> Result<Vec<Listing>, LifecycleError> {
        let seller = self
            .store
            .seller_by_external(seller_external_id)
            .await?
            .ok_or(LifecycleError::NotFound)?;
        let is_owner = viewer_external_id == Some(seller_external_id);
        Ok(self.store.profile_listings(seller.id, is_owner).await?)
    }

    // ── Favorites ─────────────────────────────────────────────────────────

    pub async fn favorite(
        &self,
        listing_id: i64,
        viewer_external_id: i64,
    ) -> Result<(), LifecycleError> {
        if self.store.listing(listing_id).await?.is_none() {
            return Err(LifecycleError::NotFound);
        }
        let viewer = self.store.upsert_seller(viewer_external_id).await?;
        self.store.add_favorite(viewer.id, listing_id).await?;
        Ok(())
    }

    pub async fn unfavorite(
        &self,
        listing_id: i64,
        viewer_external_id: i64,
    ) -> Result<(), LifecycleError> {
        let viewer = self.store.upsert_seller(viewer_external_id).await?;
        self.store.remove_favorite(viewer.id, listing_id).await?;
        Ok(())
    }
}

fn validate_new_listing(request: &NewListing) -> Result<(), LifecycleError> {
    let required = [
        ("title", &request.title),
        ("description", &request.description),
        ("currency", &request.currency),
        ("category", &request.category),
        ("location", &request.location),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(LifecycleError::Validation(format!("{field} is required")));
        }
    }
    if !validate_price(&request.price) {
        return Err(LifecycleError::Validation(format!(
            "invalid price: {}",
            request.price
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{
        BlobError, BlobStore, CheckoutGateway, MemoryBlobStore, RecordingModerationChannel,
        TraceNotifier,
    };
    use async_trait::async_trait;
    use crate::jobs::JobContext;
    use crate::models::{PaymentMethod, PromotionChoice, PromotionTier, SortKey};
    use crate::moderation::ModerationQueue;
    use std::time::Duration;

    struct Harness {
        lifecycle: Lifecycle,
        store: Store,
        channel: RecordingModerationChannel,
    }

    async fn harness(paid: bool) -> Harness {
        harness_with_blob(paid, Arc::new(MemoryBlobStore::new())).await
    }

    async fn harness_with_blob(paid: bool, blob: Arc<dyn BlobStore>) -> Harness {
        let store = Store::connect("sqlite::memory:").await.expect("connect");
        store.ensure_schema().await.expect("schema");
        let channel = RecordingModerationChannel::new();
        let images = ImagePipeline::new(blob.clone(), 1024 * 1024);
        let moderation = ModerationQueue::new(Arc::new(channel.clone()), blob.clone());
        let (jobs, _worker) = JobQueue::spawn(JobContext {
            store: store.clone(),
            images: images.clone(),
            moderation,
        });
        let ledger = PromotionLedger::new(store.clone(), Arc::new(CheckoutGateway), paid);
        let lifecycle = Lifecycle::new(
            store.clone(),
            images,
            ledger,
            Arc::new(TraceNotifier),
            jobs,
        );
        Harness {
            lifecycle,
            store,
            channel,
        }
    }

    fn request(seller: i64, title: &str) -> NewListing {
        NewListing {
            seller_external_id: seller,
            title: title.into(),
            description: "Solid condition".into(),
            price: "50".into(),
            currency: "EUR".into(),
            category: "home".into(),
            subcategory: None,
            condition: None,
            location: "Riga".into(),
            images: vec![],
            promotion: None,
        }
    }

    fn files(count: usize) -> Vec<ImageFile> {
        (0..count)
            .map(|n| ImageFile {
                filename: format!("img-{n}.jpg"),
                bytes: format!("image bytes {n}").into_bytes(),
            })
            .collect()
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn creation_lands_in_moderation_and_reaches_the_channel() {
        let h = harness(true).await;
        let outcome = h
            .lifecycle
            .create_listing(request(1, "Sofa"), files(3))
            .await
            .expect("create");
        assert_eq!(outcome.listing.status, ListingStatus::PendingModeration);
        assert_eq!(outcome.listing.funding, ActivationFunding::FreeAd);
        assert_eq!(outcome.listing.images.len(), 3);

        let channel = h.channel.clone();
        eventually(|| {
            let channel = channel.clone();
            async move { channel.submissions.lock().await.len() == 1 }
        })
        .await;
        let submissions = h.channel.submissions.lock().await;
        assert_eq!(submissions[0].1, 3);
        assert!(submissions[0].0.contains("Sofa"));
    }

    #[tokio::test]
    async fn creation_without_images_is_rejected() {
        let h = harness(true).await;
        let err = h
            .lifecycle
            .create_listing(request(1, "Sofa"), vec![])
            .await
            .expect_err("no images");
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    /// Blob store that is down for every operation.
    struct OutageBlobStore;

    #[async_trait]
    impl BlobStore for OutageBlobStore {
        async fn save(&self, _bytes: &[u8]) -> Result<String, BlobError> {
            Err(BlobError::Unavailable("outage".into()))
        }

        async fn read(&self, blob_ref: &str) -> Result<Vec<u8>, BlobError> {
            Err(BlobError::Unavailable(blob_ref.to_string()))
        }

        async fn exists(&self, _blob_ref: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn failed_creation_refunds_the_package_credit() {
        let h = harness_with_blob(true, Arc::new(OutageBlobStore)).await;
        let seller = h.store.upsert_seller(31).await.expect("seller");
        h.store.mark_free_ad_used(seller.id).await.expect("flag");
        h.store.credit_packages(seller.id, 1).await.expect("credit");

        let err = h
            .lifecycle
            .create_listing(request(31, "Lamp"), files(1))
            .await
            .expect_err("blob outage");
        assert!(matches!(err, LifecycleError::Storage(_)));

        let seller = h
            .store
            .seller_by_id(seller.id)
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(seller.listing_packages_balance, 1);
    }

    #[tokio::test]
    async fn approval_publishes_and_spends_the_free_ad() {
        let h = harness(true).await;
        let created = h
            .lifecycle
            .create_listing(request(2, "Desk"), files(1))
            .await
            .expect("create");

        let approved = h
            .lifecycle
            .apply_decision(ModerationDecision {
                listing_id: created.listing.id,
                verdict: Verdict::Approve,
                reason: None,
            })
            .await
            .expect("approve");
        assert_eq!(approved.status, ListingStatus::Active);
        assert!(approved.expires_at.expect("ttl") > Utc::now());

        let seller = h
            .store
            .seller_by_external(2)
            .await
            .expect("get")
            .expect("row");
        assert!(seller.has_used_free_ad);

        // The entitlement is spent; the next activation needs a package.
        let err = h
            .lifecycle
            .create_listing(request(2, "Chair"), files(1))
            .await
            .expect_err("gated");
        assert!(matches!(err, LifecycleError::NeedsPackage));
    }

    #[tokio::test]
    async fn package_credit_preserves_the_free_ad() {
        let h = harness(true).await;
        let seller = h.store.upsert_seller(3).await.expect("seller");
        h.store.mark_free_ad_used(seller.id).await.expect("spend");
        h.store.credit_packages(seller.id, 1).await.expect("credit");

        let created = h
            .lifecycle
            .create_listing(request(3, "Bike"), files(1))
            .await
            .expect("create");
        assert_eq!(created.listing.funding, ActivationFunding::PackageCredit);
        let seller = h.store.seller_by_id(seller.id).await.expect("get").expect("row");
        assert_eq!(seller.listing_packages_balance, 0);
    }

    #[tokio::test]
    async fn rejection_requires_a_reason_and_records_it() {
        let h = harness(false).await;
        let created = h
            .lifecycle
            .create_listing(request(4, "Lamp"), files(1))
            .await
            .expect("create");

        let err = h
            .lifecycle
            .apply_decision(ModerationDecision {
                listing_id: created.listing.id,
                verdict: Verdict::Reject,
                reason: Some("   ".into()),
            })
            .await
            .expect_err("blank reason");
        assert!(matches!(err, LifecycleError::Validation(_)));

        let rejected = h
            .lifecycle
            .apply_decision(ModerationDecision {
                listing_id: created.listing.id,
                verdict: Verdict::Reject,
                reason: Some("blurry photos".into()),
            })
            .await
            .expect("reject");
        assert_eq!(rejected.status, ListingStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("blurry photos"));

        // Editing the rejected listing resubmits it and clears the reason.
        let edited = h
            .lifecycle
            .edit_listing(
                created.listing.id,
                ListingUpdate {
                    seller_external_id: 4,
                    title: Some("Lamp, better photos".into()),
                    description: None,
                    price: None,
                    currency: None,
                    category: None,
                    subcategory: None,
                    condition: None,
                    location: None,
                    retained_images: None,
                    new_images: vec![],
                    promotion: None,
                },
                vec![],
            )
            .await
            .expect("edit");
        assert_eq!(edited.listing.status, ListingStatus::PendingModeration);
        assert_eq!(edited.listing.rejection_reason, None);
    }

    #[tokio::test]
    async fn editing_a_live_listing_pulls_it_from_the_catalog() {
        let h = harness(false).await;
        let created = h
            .lifecycle
            .create_listing(request(5, "Guitar"), files(1))
            .await
            .expect("create");
        h.lifecycle
            .apply_decision(ModerationDecision {
                listing_id: created.listing.id,
                verdict: Verdict::Approve,
                reason: None,
            })
            .await
            .expect("approve");

        let page = h
            .lifecycle
            .catalog(&CatalogQuery {
                sort: SortKey::Newest,
                ..Default::default()
            })
            .await
            .expect("catalog");
        assert_eq!(page.total, 1);

        let edited = h
            .lifecycle
            .edit_listing(
                created.listing.id,
                ListingUpdate {
                    seller_external_id: 5,
                    title: None,
                    description: Some("Now with a case".into()),
                    price: None,
                    currency: None,
                    category: None,
                    subcategory: None,
                    condition: None,
                    location: None,
                    retained_images: None,
                    new_images: vec![],
                    promotion: None,
                },
                vec![],
            )
            .await
            .expect("edit");
        assert_eq!(edited.listing.status, ListingStatus::PendingModeration);

        let page = h.lifecycle.catalog(&CatalogQuery::default()).await.expect("catalog");
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn sold_is_refused_from_review_states() {
        let h = harness(false).await;
        let created = h
            .lifecycle
            .create_listing(request(6, "Skis"), files(1))
            .await
            .expect("create");

        let err = h
            .lifecycle
            .mark_sold(created.listing.id, 6)
            .await
            .expect_err("pending cannot sell");
        assert!(matches!(
            err,
            LifecycleError::IllegalTransition {
                from: ListingStatus::PendingModeration,
                to: ListingStatus::Sold,
            }
        ));

        h.lifecycle
            .apply_decision(ModerationDecision {
                listing_id: created.listing.id,
                verdict: Verdict::Approve,
                reason: None,
            })
            .await
            .expect("approve");
        let sold = h
            .lifecycle
            .mark_sold(created.listing.id, 6)
            .await
            .expect("sell");
        assert_eq!(sold.status, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn reactivation_is_gated_then_proceeds_with_a_credit() {
        let h = harness(true).await;
        let created = h
            .lifecycle
            .create_listing(request(7, "Printer"), files(1))
            .await
            .expect("create");
        h.lifecycle
            .apply_decision(ModerationDecision {
                listing_id: created.listing.id,
                verdict: Verdict::Approve,
                reason: None,
            })
            .await
            .expect("approve");
        h.lifecycle
            .deactivate(created.listing.id, 7)
            .await
            .expect("deactivate");

        // Free ad spent at approval, no packages: blocked.
        let err = h
            .lifecycle
            .reactivate(created.listing.id, 7, None)
            .await
            .expect_err("gated");
        assert!(matches!(err, LifecycleError::NeedsPackage));
        let listing = h
            .store
            .listing(created.listing.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(listing.status, ListingStatus::Deactivated);

        let seller = h.store.seller_by_external(7).await.expect("get").expect("row");
        h.store.credit_packages(seller.id, 1).await.expect("credit");
        let outcome = h
            .lifecycle
            .reactivate(created.listing.id, 7, None)
            .await
            .expect("reactivate");
        assert_eq!(outcome.listing.status, ListingStatus::PendingModeration);
        assert_eq!(outcome.listing.funding, ActivationFunding::PackageCredit);
        let seller = h.store.seller_by_external(7).await.expect("get").expect("row");
        assert_eq!(seller.listing_packages_balance, 0);
    }

    #[tokio::test]
    async fn direct_payment_holds_the_listing_in_draft() {
        let h = harness(true).await;
        let mut req = request(8, "Camera");
        req.promotion = Some(PromotionChoice {
            tier: PromotionTier::Vip,
            payment_method: PaymentMethod::Direct,
        });
        let outcome = h
            .lifecycle
            .create_listing(req, files(1))
            .await
            .expect("create");
        assert_eq!(outcome.listing.status, ListingStatus::Draft);
        let redirect = outcome.redirect_url.expect("redirect");
        let reference = redirect
            .rsplit('/')
            .next()
            .and_then(|tail| tail.split('?').next())
            .expect("reference");

        // Nothing reaches the channel while the payment is outstanding.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.channel.submissions.lock().await.is_empty());

        let confirmed = h
            .lifecycle
            .confirm_payment(reference)
            .await
            .expect("confirm")
            .expect("listing");
        assert_eq!(confirmed.status, ListingStatus::PendingModeration);
        assert_eq!(confirmed.promotion_type, Some(PromotionTier::Vip));

        // A replayed callback is a no-op.
        assert!(h.lifecycle.confirm_payment(reference).await.expect("replay").is_none());

        let channel = h.channel.clone();
        eventually(|| {
            let channel = channel.clone();
            async move { channel.submissions.lock().await.len() == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn views_count_for_visitors_but_not_the_owner() {
        let h = harness(false).await;
        let created = h
            .lifecycle
            .create_listing(request(9, "Tent"), files(1))
            .await
            .expect("create");
        h.lifecycle
            .apply_decision(ModerationDecision {
                listing_id: created.listing.id,
                verdict: Verdict::Approve,
                reason: None,
            })
            .await
            .expect("approve");

        h.lifecycle
            .get_listing(created.listing.id, None)
            .await
            .expect("visit");
        let owner_view = h
            .lifecycle
            .get_listing(created.listing.id, Some(9))
            .await
            .expect("owner");
        assert_eq!(owner_view.view_count, 1);
    }

    #[tokio::test]
    async fn strangers_cannot_edit_or_transition() {
        let h = harness(false).await;
        let created = h
            .lifecycle
            .create_listing(request(10, "Boots"), files(1))
            .await
            .expect("create");
        // The stranger has to exist as a seller to even be resolvable.
        h.store.upsert_seller(11).await.expect("seller");
        let err = h
            .lifecycle
            .mark_sold(created.listing.id, 11)
            .await
            .expect_err("not the owner");
        assert!(matches!(err, LifecycleError::Forbidden));
    }

    #[tokio::test]
    async fn import_skips_batch_and_title_duplicates() {
        let h = harness(false).await;
        let mut same_image = files(1);
        same_image[0].bytes = b"identical first image".to_vec();

        h.lifecycle
            .create_listing(request(12, "Existing title"), files(1))
            .await
            .expect("seed");

        let report = h
            .lifecycle
            .import_batch(vec![
                (request(12, "Fresh one"), same_image.clone()),
                (request(12, "Another"), same_image.clone()),
                (request(12, "Existing title"), files(2)),
            ])
            .await
            .expect("import");
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.skipped_duplicates, 2);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn favorites_round_trip() {
        let h = harness(false).await;
        let created = h
            .lifecycle
            .create_listing(request(13, "Kettle"), files(1))
            .await
            .expect("create");
        h.lifecycle.favorite(created.listing.id, 14).await.expect("fav");
        h.lifecycle.favorite(created.listing.id, 14).await.expect("idempotent");
        h.lifecycle.favorite(created.listing.id, 15).await.expect("fav");

        let listing = h
            .store
            .listing(created.listing.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(listing.favorites_count, 2);

        h.lifecycle.unfavorite(created.listing.id, 14).await.expect("unfav");
        let listing = h
            .store
            .listing(created.listing.id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(listing.favorites_count, 1);
    }
}
