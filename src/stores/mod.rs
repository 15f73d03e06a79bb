//! Vector storage and the project/link registry.
//!
//! A single [`VectorBackend`] trait abstracts over storage engines so the
//! orchestrator and chat service never depend on a specific database:
//!
//! ```text
//!                  ┌─────────────────────┐
//!                  │ VectorBackend trait │
//!                  │ (registry + chunks) │
//!                  └──────────┬──────────┘
//!                             │
//!                  ┌──────────┴──────────┐
//!                  ▼                     ▼
//!           ┌─────────────┐      ┌─────────────┐
//!           │   SQLite    │      │  In-memory  │
//!           │ sqlite-vec  │      │ brute force │
//!           └─────────────┘      └─────────────┘
//! ```
//!
//! Retrieval never crosses project boundaries: `search` takes the tenant's
//! project id and implementations must scope every hit to it.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::types::PipelineError;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Per-link ingestion state.
///
/// `Trained` and `Failed` are both re-enterable: a new training request
/// moves either back to `Training`. Only `Training` blocks a new run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    Idle,
    Training,
    Trained,
    Failed,
}

impl TrainingStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Training => "training",
            Self::Trained => "trained",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "training" => Some(Self::Training),
            "trained" => Some(Self::Trained),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tenancy boundary. Only the fields the pipeline reads are modeled;
/// the dashboard owns the rest of the project record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub welcome_message: Option<String>,
    pub placeholder_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            welcome_message: None,
            placeholder_text: None,
            created_at: Utc::now(),
        }
    }
}

/// Typed metadata recorded on a link after training.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMetadata {
    /// The page `<title>`, when extraction found one.
    pub title: Option<String>,
}

/// A URL registered for ingestion, owned by a project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceLink {
    pub id: Uuid,
    pub project_id: Uuid,
    pub url: Url,
    pub training_status: TrainingStatus,
    pub last_trained_at: Option<DateTime<Utc>>,
    pub metadata: LinkMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceLink {
    pub fn new(project_id: Uuid, url: Url) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            url,
            training_status: TrainingStatus::Idle,
            last_trained_at: None,
            metadata: LinkMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Typed metadata recorded on each stored chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Heading of the section this chunk came from.
    pub heading: Option<String>,
    /// Embedding model that produced the vector.
    pub model: Option<String>,
}

/// One unit of retrievable content with its embedding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Absent for content that did not come from a registered link.
    pub link_id: Option<Uuid>,
    pub content: String,
    pub token_count: u32,
    pub metadata: ChunkMetadata,
    /// The embedding vector; records without one are skipped on insert.
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl ChunkRecord {
    pub fn new(project_id: Uuid, link_id: Option<Uuid>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            link_id,
            content: content.into(),
            token_count: 0,
            metadata: ChunkMetadata::default(),
            embedding: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    #[must_use]
    pub fn with_token_count(mut self, token_count: u32) -> Self {
        self.token_count = token_count;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A retrieval hit: the chunk, its similarity to the query, and the URL of
/// the link it came from (for citation).
#[derive(Clone, Debug)]
pub struct ScoredChunk {
    pub chunk: ChunkRecord,
    pub similarity: f32,
    pub url: Option<String>,
}

/// Storage interface shared by the training orchestrator, chat service,
/// and HTTP layer.
///
/// Implementations must uphold two invariants:
/// - `search` only returns chunks whose `project_id` matches the query's.
/// - `begin_training` is a compare-and-swap: it moves a link to
///   [`TrainingStatus::Training`] iff the link is not already training,
///   and reports which happened. This is the pipeline's only
///   concurrency-control point.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn insert_project(&self, project: &Project) -> Result<(), PipelineError>;

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, PipelineError>;

    async fn insert_link(&self, link: &SourceLink) -> Result<(), PipelineError>;

    async fn get_link(&self, id: Uuid) -> Result<Option<SourceLink>, PipelineError>;

    async fn list_links(&self, project_id: Uuid) -> Result<Vec<SourceLink>, PipelineError>;

    /// Deletes a link and its chunks. Fails with [`PipelineError::LinkBusy`]
    /// while a training run holds the link.
    async fn delete_link(&self, id: Uuid) -> Result<(), PipelineError>;

    /// Conditionally moves a link into `Training`.
    ///
    /// Returns `true` when this call performed the transition, `false`
    /// when the link was already training (or does not exist — callers
    /// that care fetch the link first).
    async fn begin_training(&self, link_id: Uuid) -> Result<bool, PipelineError>;

    /// Records the terminal state of a training run, stamping
    /// `last_trained_at` when `status` is `Trained` and merging refreshed
    /// link metadata when provided.
    async fn finish_training(
        &self,
        link_id: Uuid,
        status: TrainingStatus,
        metadata: Option<LinkMetadata>,
    ) -> Result<(), PipelineError>;

    /// Inserts chunk records in bounded-size batches, returning how many
    /// were stored. Records without an embedding are skipped; embeddings
    /// of the wrong dimensionality are rejected.
    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<usize, PipelineError>;

    /// Removes every chunk belonging to a link; used before a retrain and
    /// when the link is deleted.
    async fn delete_chunks_by_link(&self, link_id: Uuid) -> Result<usize, PipelineError>;

    /// Nearest-neighbor retrieval scoped to one project: hits with
    /// similarity ≥ `threshold`, ordered by descending similarity, capped
    /// at `limit`.
    async fn search(
        &self,
        project_id: Uuid,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, PipelineError>;

    async fn count_chunks(&self, project_id: Uuid) -> Result<usize, PipelineError>;
}
