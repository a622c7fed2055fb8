//! Seams to the systems this service talks to but does not own: the blob
//! store holding image bytes, the human moderation channel, the payment
//! gateway, and the seller notifier. Everything behind these traits is
//! replaceable; the in-process implementations below back the default wiring
//! and the tests.

use crate::models::PaymentMethod;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

/// Refs are opaque strings; nothing here assumes a URL scheme.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save(&self, bytes: &[u8]) -> Result<String, BlobError>;
    async fn read(&self, blob_ref: &str) -> Result<Vec<u8>, BlobError>;
    async fn exists(&self, blob_ref: &str) -> bool;
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("moderation channel delivery failed: {0}")]
    Delivery(String),
}

/// The review channel consumes a preformatted caption plus loadable image
/// bytes and answers with an opaque submission handle.
#[async_trait]
pub trait ModerationChannel: Send + Sync {
    async fn submit(&self, summary: &str, images: Vec<Vec<u8>>) -> Result<String, ChannelError>;
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway error: {0}")]
    Gateway(String),
}

#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    CompletedNow,
    PendingRedirect { url: String, reference: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge_or_redirect(
        &self,
        amount: f64,
        method: PaymentMethod,
    ) -> Result<ChargeOutcome, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    ListingApproved,
    ListingRejected,
    ListingPublished,
    PackageRequired,
}

impl NotifyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyKind::ListingApproved => "listing_approved",
            NotifyKind::ListingRejected => "listing_rejected",
            NotifyKind::ListingPublished => "listing_published",
            NotifyKind::PackageRequired => "package_required",
        }
    }
}

/// Fire-and-forget by contract: implementations must swallow their own
/// failures (log them) and never make the caller wait on delivery problems.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, seller_external_id: i64, kind: NotifyKind, params: Value);
}

// ---------------------------------------------------------------------------
// In-process implementations
// ---------------------------------------------------------------------------

/// Keeps blobs in a map keyed by generated refs. Fine for tests and demo
/// runs; a real deployment plugs an object store in behind the same trait.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    pub blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let blob_ref = format!("blob-{}", Uuid::new_v4().simple());
        self.blobs
            .lock()
            .await
            .insert(blob_ref.clone(), bytes.to_vec());
        Ok(blob_ref)
    }

    async fn read(&self, blob_ref: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .await
            .get(blob_ref)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(blob_ref.to_string()))
    }

    async fn exists(&self, blob_ref: &str) -> bool {
        self.blobs.lock().await.contains_key(blob_ref)
    }
}

/// Records every submission and acks immediately. Doubles as the assertion
/// surface in lifecycle tests.
#[derive(Clone, Default)]
pub struct RecordingModerationChannel {
    pub submissions: Arc<Mutex<Vec<(String, usize)>>>,
}

impl RecordingModerationChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModerationChannel for RecordingModerationChannel {
    async fn submit(&self, summary: &str, images: Vec<Vec<u8>>) -> Result<String, ChannelError> {
        let handle = format!("sub-{}", Uuid::new_v4().simple());
        info!(
            target = "bazaar.moderation",
            handle = %handle,
            caption_len = summary.len(),
            attached = images.len(),
            "moderation submission delivered",
        );
        self.submissions
            .lock()
            .await
            .push((summary.to_string(), images.len()));
        Ok(handle)
    }
}

/// Balance charges complete instantly; direct charges hand back a hosted
/// checkout URL and wait for the confirmation callback.
#[derive(Clone, Default)]
pub struct CheckoutGateway;

#[async_trait]
impl PaymentGateway for CheckoutGateway {
    async fn charge_or_redirect(
        &self,
        amount: f64,
        method: PaymentMethod,
    ) -> Result<ChargeOutcome, GatewayError> {
        match method {
            PaymentMethod::Balance => Ok(ChargeOutcome::CompletedNow),
            PaymentMethod::Direct => {
                let reference = format!("pay-{}", Uuid::new_v4().simple());
                Ok(ChargeOutcome::PendingRedirect {
                    url: format!("https://checkout.invalid/{reference}?amount={amount}"),
                    reference,
                })
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct TraceNotifier;

#[async_trait]
impl Notifier for TraceNotifier {
    async fn notify(&self, seller_external_id: i64, kind: NotifyKind, params: Value) {
        info!(
            target = "bazaar.notify",
            seller = seller_external_id,
            kind = kind.as_str(),
            params = %params,
            "seller notification",
        );
    }
}
