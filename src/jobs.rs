//! Background work: image ingestion and optimization, and moderation
//! submissions. One worker drains an mpsc queue; each job's terminal state
//! is kept in a status map so `GET /jobs/{id}` can answer. A failed job is
//! logged and surfaced there, never rolled back into the listing row.

use crate::images::ImagePipeline;
use crate::models::{ApiError, ImageFile, ListingStatus};
use crate::moderation::ModerationQueue;
use crate::store::Store;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

/// Everything a job needs to run. Cloned into the worker at spawn time.
#[derive(Clone)]
pub struct JobContext {
    pub store: Store,
    pub images: ImagePipeline,
    pub moderation: ModerationQueue,
}

#[derive(Clone)]
pub enum JobKind {
    /// Store freshly uploaded originals, attach them to the listing, then
    /// optimize whatever slots are still unfilled.
    IngestUploads {
        listing_id: i64,
        files: Vec<ImageFile>,
    },
    /// Optimize any originals that do not have an optimized variant yet.
    OptimizeImages { listing_id: i64 },
    /// Deliver the listing to the review channel.
    SubmitModeration { listing_id: i64, is_edit: bool },
}

impl JobKind {
    fn name(&self) -> &'static str {
        match self {
            JobKind::IngestUploads { .. } => "ingest_uploads",
            JobKind::OptimizeImages { .. } => "optimize_images",
            JobKind::SubmitModeration { .. } => "submit_moderation",
        }
    }

    fn listing_id(&self) -> i64 {
        match self {
            JobKind::IngestUploads { listing_id, .. }
            | JobKind::OptimizeImages { listing_id }
            | JobKind::SubmitModeration { listing_id, .. } => *listing_id,
        }
    }
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    kind: JobKind,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed { error: String },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(ctx: JobContext) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.insert(job.id, JobState::Running);
                }

                let name = job.kind.name();
                let listing = job.kind.listing_id();
                let result = run_job(&ctx, job.kind).await;
                let mut guard = statuses_bg.lock().await;
                match result {
                    Ok(()) => {
                        guard.insert(job.id, JobState::Completed);
                    }
                    Err(error) => {
                        warn!(
                            target = "bazaar.jobs",
                            job = name,
                            listing,
                            error = %error,
                            "background job failed",
                        );
                        guard.insert(job.id, JobState::Failed { error });
                    }
                }
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue(&self, kind: JobKind) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, JobState::Queued);
        }
        self.tx.send(Job { id, kind }).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

/// Executes one job to completion. Public so tests can drive jobs without
/// going through the queue.
pub async fn run_job(ctx: &JobContext, kind: JobKind) -> Result<(), String> {
    match kind {
        JobKind::IngestUploads { listing_id, files } => {
            let refs = ctx
                .images
                .ingest_originals(&files)
                .await
                .map_err(|err| err.to_string())?;
            ctx.store
                .append_images(listing_id, &refs)
                .await
                .map_err(|err| err.to_string())?;
            optimize_pending(ctx, listing_id).await
        }
        JobKind::OptimizeImages { listing_id } => optimize_pending(ctx, listing_id).await,
        JobKind::SubmitModeration {
            listing_id,
            is_edit,
        } => {
            let Some(listing) = ctx
                .store
                .listing(listing_id)
                .await
                .map_err(|err| err.to_string())?
            else {
                // Deleted in the meantime; nothing to review.
                return Ok(());
            };
            if listing.status != ListingStatus::PendingModeration {
                return Ok(());
            }
            ctx.moderation
                .submit(&listing, is_edit)
                .await
                .map_err(|err| err.to_string())?;
            Ok(())
        }
    }
}

/// Optimizes the slots past the current optimized prefix. Idempotent: a
/// retry sees no pending slots and exits.
async fn optimize_pending(ctx: &JobContext, listing_id: i64) -> Result<(), String> {
    let Some(listing) = ctx
        .store
        .listing(listing_id)
        .await
        .map_err(|err| err.to_string())?
    else {
        return Ok(());
    };
    let filled = listing.optimized_images.len();
    if filled >= listing.images.len() {
        return Ok(());
    }
    let fresh = ctx.images.optimize(&listing.images[filled..]).await;
    let mut aligned = listing.optimized_images.clone();
    aligned.extend(fresh);
    ctx.store
        .append_optimized(listing_id, &aligned)
        .await
        .map_err(|err| err.to_string())
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
