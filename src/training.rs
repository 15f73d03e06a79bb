//! Training orchestration: the per-link ingestion state machine.
//!
//! A run walks `fetch → extract → split → embed → store` and records the
//! outcome on the link:
//!
//! ```text
//!   idle ──────────┐
//!   trained ───────┼──▶ training ──▶ trained (≥1 chunk stored)
//!   failed ────────┘        │
//!                           └──────▶ failed  (fetch error, no sections,
//!                                             or every embedding failed)
//! ```
//!
//! The transition into `training` is a compare-and-swap on the store, so a
//! duplicate trigger while a run is in flight is rejected as benign
//! ([`PipelineError::AlreadyTraining`]) instead of starting a second run.
//! Per-section embedding calls run with bounded parallelism and are
//! collected with all-settle semantics: one bad section never aborts the
//! run, and only total failure fails it.

use std::sync::Arc;

use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::extract;
use crate::provider::ModelClient;
use crate::sections::{self, Section};
use crate::stores::{ChunkMetadata, ChunkRecord, SourceLink, TrainingStatus, VectorBackend};
use crate::types::PipelineError;

/// How a run was triggered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainMode {
    /// First ingestion of a newly registered link.
    Train,
    /// Re-ingestion: wipes the link's existing chunks first, so a failed
    /// retrain never leaves a mix of old and new chunks.
    Retrain,
}

/// Summary of one completed run.
#[derive(Clone, Debug)]
pub struct TrainingReport {
    pub link_id: Uuid,
    pub status: TrainingStatus,
    /// Sections produced by the splitter.
    pub sections: usize,
    /// Chunks whose embeddings succeeded and were stored.
    pub stored: usize,
    /// Sections whose embedding call failed.
    pub failed: usize,
    /// Cause, when the run ended in `Failed`.
    pub error: Option<String>,
}

pub struct TrainingOrchestrator {
    store: Arc<dyn VectorBackend>,
    client: ModelClient,
    http: reqwest::Client,
    concurrency: usize,
}

impl TrainingOrchestrator {
    pub fn new(store: Arc<dyn VectorBackend>, client: ModelClient) -> Self {
        Self {
            store,
            client,
            http: reqwest::Client::new(),
            concurrency: 8,
        }
    }

    /// Bounds the number of concurrent embedding calls per run.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Executes a training run for `link_id`.
    ///
    /// Ingestion faults (fetch errors, empty documents, total embedding
    /// failure) are recorded on the link and reported in the returned
    /// [`TrainingReport`]; they are not bubbled as `Err`. Only the
    /// concurrency-guard rejection, an unknown link, and storage faults
    /// during bookkeeping surface as errors.
    pub async fn run(
        &self,
        link_id: Uuid,
        mode: TrainMode,
    ) -> Result<TrainingReport, PipelineError> {
        let link = self
            .store
            .get_link(link_id)
            .await?
            .ok_or_else(|| PipelineError::link_not_found(link_id))?;

        if !self.store.begin_training(link_id).await? {
            info!(%link_id, "training already in progress, rejecting duplicate trigger");
            return Err(PipelineError::AlreadyTraining(link_id));
        }

        match self.ingest(&link, mode).await {
            Ok(report) => Ok(report),
            Err(err) => {
                warn!(%link_id, url = %link.url, error = %err, "training run failed");
                self.store
                    .finish_training(link_id, TrainingStatus::Failed, None)
                    .await?;
                Ok(TrainingReport {
                    link_id,
                    status: TrainingStatus::Failed,
                    sections: 0,
                    stored: 0,
                    failed: 0,
                    error: Some(err.to_string()),
                })
            }
        }
    }

    async fn ingest(
        &self,
        link: &SourceLink,
        mode: TrainMode,
    ) -> Result<TrainingReport, PipelineError> {
        if mode == TrainMode::Retrain {
            let removed = self.store.delete_chunks_by_link(link.id).await?;
            info!(link_id = %link.id, removed, "cleared existing chunks before retrain");
        }

        let page = extract::fetch_page(&self.http, &link.url).await?;
        let sections = sections::split_markdown(&page.markdown);
        if sections.is_empty() {
            return Err(PipelineError::EmptyDocument);
        }
        let section_count = sections.len();

        let outcomes = self.embed_sections(link, sections).await;
        let mut chunks = Vec::new();
        let mut failures = 0usize;
        for outcome in outcomes {
            match outcome {
                Ok(chunk) => chunks.push(chunk),
                Err(err) => {
                    failures += 1;
                    warn!(link_id = %link.id, error = %err, "section embedding failed");
                }
            }
        }

        if chunks.is_empty() {
            self.store
                .finish_training(link.id, TrainingStatus::Failed, Some(page.metadata))
                .await?;
            return Ok(TrainingReport {
                link_id: link.id,
                status: TrainingStatus::Failed,
                sections: section_count,
                stored: 0,
                failed: failures,
                error: Some("all embedding calls failed".into()),
            });
        }

        let stored = self.store.upsert_chunks(chunks).await?;
        self.store
            .finish_training(link.id, TrainingStatus::Trained, Some(page.metadata))
            .await?;
        info!(
            link_id = %link.id,
            url = %link.url,
            sections = section_count,
            stored,
            failed = failures,
            "training run complete"
        );
        Ok(TrainingReport {
            link_id: link.id,
            status: TrainingStatus::Trained,
            sections: section_count,
            stored,
            failed: failures,
            error: None,
        })
    }

    /// Embeds every section with bounded parallelism, gathering each
    /// outcome instead of aborting on the first error.
    async fn embed_sections(
        &self,
        link: &SourceLink,
        sections: Vec<Section>,
    ) -> Vec<Result<ChunkRecord, PipelineError>> {
        stream::iter(sections)
            .map(|section| {
                let client = self.client.clone();
                let project_id = link.project_id;
                let link_id = link.id;
                async move {
                    let output = client.embed(&section.content).await?;
                    Ok(
                        ChunkRecord::new(project_id, Some(link_id), section.content)
                            .with_embedding(output.vector)
                            .with_token_count(output.token_count)
                            .with_metadata(ChunkMetadata {
                                heading: section.heading,
                                model: Some(output.model),
                            }),
                    )
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}
