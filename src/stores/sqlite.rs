//! SQLite [`VectorBackend`] backed by the `sqlite-vec` extension.
//!
//! Chunk text and registry rows live in ordinary tables; embeddings are
//! stored per chunk and searched with `vec_distance_cosine`. Similarity
//! reported to callers is `1 - cosine distance`, so a higher score is a
//! closer match and thresholds compare the same way as an inner product
//! over unit-normalized vectors.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::{Connection, OptionalExtension, ffi};
use url::Url;
use uuid::Uuid;

use crate::types::PipelineError;

use super::{
    ChunkMetadata, ChunkRecord, LinkMetadata, Project, ScoredChunk, SourceLink, TrainingStatus,
    VectorBackend,
};

/// Rows per insert transaction; keeps statements bounded on large pages.
const INSERT_BATCH_SIZE: usize = 64;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    welcome_message  TEXT,
    placeholder_text TEXT,
    created_at       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS links (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    url             TEXT NOT NULL,
    training_status TEXT NOT NULL DEFAULT 'idle',
    last_trained_at TEXT,
    metadata        TEXT NOT NULL DEFAULT '{}',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS links_project_idx ON links(project_id);
CREATE TABLE IF NOT EXISTS chunks (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL,
    link_id     TEXT,
    content     TEXT NOT NULL,
    token_count INTEGER NOT NULL DEFAULT 0,
    metadata    TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS chunks_project_idx ON chunks(project_id);
CREATE INDEX IF NOT EXISTS chunks_link_idx ON chunks(link_id);
CREATE TABLE IF NOT EXISTS chunk_embeddings (
    id        TEXT PRIMARY KEY,
    embedding BLOB NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
    dimension: usize,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and prepares the schema.
    ///
    /// The `sqlite-vec` extension is registered process-wide on first use;
    /// opening fails if the extension cannot be loaded.
    pub async fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, PipelineError> {
        register_vector_extension()?;
        let conn = Connection::open(path)
            .await
            .map_err(|err| PipelineError::Storage(err.to_string()))?;
        Self::prepare(conn, dimension).await
    }

    /// Opens an in-memory database; used by tests.
    pub async fn open_in_memory(dimension: usize) -> Result<Self, PipelineError> {
        register_vector_extension()?;
        let conn = Connection::open_in_memory()
            .await
            .map_err(|err| PipelineError::Storage(err.to_string()))?;
        Self::prepare(conn, dimension).await
    }

    async fn prepare(conn: Connection, dimension: usize) -> Result<Self, PipelineError> {
        conn.call(|conn| {
            conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
                ?;
            conn.execute_batch(SCHEMA)
                ?;
            Ok::<_, tokio_rusqlite::rusqlite::Error>(())
        })
        .await
        .map_err(|err| PipelineError::Storage(err.to_string()))?;
        Ok(Self { conn, dimension })
    }
}

fn register_vector_extension() -> Result<(), PipelineError> {
    static INIT: Once = Once::new();
    static OUTCOME: Mutex<Option<Result<(), String>>> = Mutex::new(None);

    INIT.call_once(|| {
        let result = unsafe {
            type ExtensionInit = unsafe extern "C" fn(
                *mut ffi::sqlite3,
                *mut *mut c_char,
                *const ffi::sqlite3_api_routines,
            ) -> i32;

            let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
            let init_fn: ExtensionInit = transmute::<unsafe extern "C" fn(), ExtensionInit>(init);
            let rc = ffi::sqlite3_auto_extension(Some(init_fn));
            if rc == 0 {
                Ok(())
            } else {
                Err(format!("failed to register sqlite-vec extension (code {rc})"))
            }
        };
        *OUTCOME.lock().expect("extension init mutex poisoned") = Some(result);
    });

    OUTCOME
        .lock()
        .expect("extension init mutex poisoned")
        .clone()
        .unwrap_or_else(|| Err("sqlite-vec initialization state missing".into()))
        .map_err(PipelineError::Storage)
}

fn storage(err: tokio_rusqlite::Error) -> PipelineError {
    PipelineError::Storage(err.to_string())
}

fn parse_uuid(value: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(value).map_err(|err| PipelineError::Storage(format!("bad uuid: {err}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| PipelineError::Storage(format!("bad timestamp: {err}")))
}

/// Raw link row as stored; parsed into [`SourceLink`] outside the driver
/// callback so conversion errors surface as storage errors.
struct LinkRow {
    id: String,
    project_id: String,
    url: String,
    training_status: String,
    last_trained_at: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl LinkRow {
    fn into_link(self) -> Result<SourceLink, PipelineError> {
        Ok(SourceLink {
            id: parse_uuid(&self.id)?,
            project_id: parse_uuid(&self.project_id)?,
            url: Url::parse(&self.url)
                .map_err(|err| PipelineError::Storage(format!("bad url: {err}")))?,
            training_status: TrainingStatus::parse(&self.training_status).ok_or_else(|| {
                PipelineError::Storage(format!("bad training status `{}`", self.training_status))
            })?,
            last_trained_at: self
                .last_trained_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            metadata: serde_json::from_str(&self.metadata).unwrap_or_default(),
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

const LINK_COLUMNS: &str =
    "id, project_id, url, training_status, last_trained_at, metadata, created_at, updated_at";

struct ChunkRow {
    id: String,
    project_id: String,
    link_id: Option<String>,
    content: String,
    token_count: i64,
    metadata: String,
    created_at: String,
}

impl ChunkRow {
    fn into_record(self, embedding: Option<Vec<f32>>) -> Result<ChunkRecord, PipelineError> {
        Ok(ChunkRecord {
            id: parse_uuid(&self.id)?,
            project_id: parse_uuid(&self.project_id)?,
            link_id: self.link_id.as_deref().map(parse_uuid).transpose()?,
            content: self.content,
            token_count: u32::try_from(self.token_count.max(0)).unwrap_or(0),
            metadata: serde_json::from_str::<ChunkMetadata>(&self.metadata).unwrap_or_default(),
            embedding,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

enum DeleteOutcome {
    Deleted,
    Missing,
    Busy,
}

#[async_trait]
impl VectorBackend for SqliteStore {
    async fn insert_project(&self, project: &Project) -> Result<(), PipelineError> {
        let row = (
            project.id.to_string(),
            project.name.clone(),
            project.welcome_message.clone(),
            project.placeholder_text.clone(),
            project.created_at.to_rfc3339(),
        );
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO projects \
                     (id, name, welcome_message, placeholder_text, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    row,
                )
                ?;
                Ok(())
            })
            .await
            .map_err(storage)
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, PipelineError> {
        let id_text = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, name, welcome_message, placeholder_text, created_at \
                     FROM projects WHERE id = ?1",
                    [&id_text],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()
            })
            .await
            .map_err(storage)?;

        row.map(|(id, name, welcome_message, placeholder_text, created_at)| {
            Ok(Project {
                id: parse_uuid(&id)?,
                name,
                welcome_message,
                placeholder_text,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .transpose()
    }

    async fn insert_link(&self, link: &SourceLink) -> Result<(), PipelineError> {
        let metadata = serde_json::to_string(&link.metadata)
            .map_err(|err| PipelineError::Storage(err.to_string()))?;
        let row = (
            link.id.to_string(),
            link.project_id.to_string(),
            link.url.to_string(),
            link.training_status.as_str(),
            link.last_trained_at.map(|ts| ts.to_rfc3339()),
            metadata,
            link.created_at.to_rfc3339(),
            link.updated_at.to_rfc3339(),
        );
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO links \
                     (id, project_id, url, training_status, last_trained_at, metadata, \
                      created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    row,
                )
                ?;
                Ok(())
            })
            .await
            .map_err(storage)
    }

    async fn get_link(&self, id: Uuid) -> Result<Option<SourceLink>, PipelineError> {
        let id_text = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {LINK_COLUMNS} FROM links WHERE id = ?1"),
                    [&id_text],
                    |row| {
                        Ok(LinkRow {
                            id: row.get(0)?,
                            project_id: row.get(1)?,
                            url: row.get(2)?,
                            training_status: row.get(3)?,
                            last_trained_at: row.get(4)?,
                            metadata: row.get(5)?,
                            created_at: row.get(6)?,
                            updated_at: row.get(7)?,
                        })
                    },
                )
                .optional()
            })
            .await
            .map_err(storage)?;
        row.map(LinkRow::into_link).transpose()
    }

    async fn list_links(&self, project_id: Uuid) -> Result<Vec<SourceLink>, PipelineError> {
        let project_text = project_id.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {LINK_COLUMNS} FROM links \
                         WHERE project_id = ?1 ORDER BY created_at"
                    ))
                    ?;
                let rows = stmt
                    .query_map([&project_text], |row| {
                        Ok(LinkRow {
                            id: row.get(0)?,
                            project_id: row.get(1)?,
                            url: row.get(2)?,
                            training_status: row.get(3)?,
                            last_trained_at: row.get(4)?,
                            metadata: row.get(5)?,
                            created_at: row.get(6)?,
                            updated_at: row.get(7)?,
                        })
                    })
                    ?;
                let mut collected = Vec::new();
                for row in rows {
                    collected.push(row?);
                }
                Ok(collected)
            })
            .await
            .map_err(storage)?;
        rows.into_iter().map(LinkRow::into_link).collect()
    }

    async fn delete_link(&self, id: Uuid) -> Result<(), PipelineError> {
        let id_text = id.to_string();
        let outcome = self
            .conn
            .call(move |conn| {
                let status: Option<String> = conn
                    .query_row(
                        "SELECT training_status FROM links WHERE id = ?1",
                        [&id_text],
                        |row| row.get(0),
                    )
                    .optional()
                    ?;
                match status.as_deref() {
                    None => Ok(DeleteOutcome::Missing),
                    Some("training") => Ok(DeleteOutcome::Busy),
                    Some(_) => {
                        conn.execute(
                            "DELETE FROM chunk_embeddings WHERE id IN \
                             (SELECT id FROM chunks WHERE link_id = ?1)",
                            [&id_text],
                        )
                        ?;
                        conn.execute("DELETE FROM chunks WHERE link_id = ?1", [&id_text])
                            ?;
                        conn.execute("DELETE FROM links WHERE id = ?1", [&id_text])
                            ?;
                        Ok(DeleteOutcome::Deleted)
                    }
                }
            })
            .await
            .map_err(storage)?;
        match outcome {
            DeleteOutcome::Deleted => Ok(()),
            DeleteOutcome::Missing => Err(PipelineError::link_not_found(id)),
            DeleteOutcome::Busy => Err(PipelineError::LinkBusy(id)),
        }
    }

    async fn begin_training(&self, link_id: Uuid) -> Result<bool, PipelineError> {
        let id_text = link_id.to_string();
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE links SET training_status = 'training', updated_at = ?2 \
                     WHERE id = ?1 AND training_status <> 'training'",
                    (&id_text, &now),
                )
            })
            .await
            .map_err(storage)?;
        Ok(changed > 0)
    }

    async fn finish_training(
        &self,
        link_id: Uuid,
        status: TrainingStatus,
        metadata: Option<LinkMetadata>,
    ) -> Result<(), PipelineError> {
        let id_text = link_id.to_string();
        let now = Utc::now().to_rfc3339();
        let trained_at = (status == TrainingStatus::Trained).then(|| now.clone());
        let metadata = metadata
            .map(|metadata| serde_json::to_string(&metadata))
            .transpose()
            .map_err(|err| PipelineError::Storage(err.to_string()))?;
        let status_text = status.as_str();
        let changed = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE links SET training_status = ?2, updated_at = ?3, \
                     last_trained_at = COALESCE(?4, last_trained_at), \
                     metadata = COALESCE(?5, metadata) \
                     WHERE id = ?1",
                    (&id_text, status_text, &now, &trained_at, &metadata),
                )
            })
            .await
            .map_err(storage)?;
        if changed == 0 {
            return Err(PipelineError::link_not_found(link_id));
        }
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<usize, PipelineError> {
        let mut rows = Vec::new();
        for chunk in chunks {
            let Some(embedding) = chunk.embedding.as_ref() else {
                continue;
            };
            if embedding.len() != self.dimension {
                return Err(PipelineError::Storage(format!(
                    "embedding dimension {} does not match configured dimension {}",
                    embedding.len(),
                    self.dimension
                )));
            }
            let vector_json = serde_json::to_string(embedding)
                .map_err(|err| PipelineError::Storage(err.to_string()))?;
            let metadata = serde_json::to_string(&chunk.metadata)
                .map_err(|err| PipelineError::Storage(err.to_string()))?;
            rows.push((
                chunk.id.to_string(),
                chunk.project_id.to_string(),
                chunk.link_id.map(|id| id.to_string()),
                chunk.content,
                i64::from(chunk.token_count),
                metadata,
                chunk.created_at.to_rfc3339(),
                vector_json,
            ));
        }

        let stored = rows.len();
        for group in rows.chunks(INSERT_BATCH_SIZE) {
            let group = group.to_vec();
            self.conn
                .call(move |conn| {
                    let tx = conn
                        .transaction()
                        ?;
                    {
                        let mut chunk_stmt = tx
                            .prepare(
                                "INSERT OR REPLACE INTO chunks \
                                 (id, project_id, link_id, content, token_count, metadata, \
                                  created_at) \
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            )
                            ?;
                        let mut vector_stmt = tx
                            .prepare(
                                "INSERT OR REPLACE INTO chunk_embeddings (id, embedding) \
                                 VALUES (?1, vec_f32(?2))",
                            )
                            ?;
                        for (id, project_id, link_id, content, token_count, metadata, created_at, vector_json) in
                            &group
                        {
                            chunk_stmt
                                .execute((
                                    id,
                                    project_id,
                                    link_id,
                                    content,
                                    token_count,
                                    metadata,
                                    created_at,
                                ))
                                ?;
                            vector_stmt
                                .execute((id, vector_json))
                                ?;
                        }
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await
                .map_err(storage)?;
        }
        Ok(stored)
    }

    async fn delete_chunks_by_link(&self, link_id: Uuid) -> Result<usize, PipelineError> {
        let id_text = link_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM chunk_embeddings WHERE id IN \
                     (SELECT id FROM chunks WHERE link_id = ?1)",
                    [&id_text],
                )
                ?;
                conn.execute("DELETE FROM chunks WHERE link_id = ?1", [&id_text])
            })
            .await
            .map_err(storage)
    }

    async fn search(
        &self,
        project_id: Uuid,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        if query.len() != self.dimension {
            return Err(PipelineError::Storage(format!(
                "query dimension {} does not match configured dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let query_json =
            serde_json::to_string(query).map_err(|err| PipelineError::Storage(err.to_string()))?;
        let project_text = project_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT c.id, c.project_id, c.link_id, c.content, c.token_count, \
                         c.metadata, c.created_at, l.url, \
                         vec_distance_cosine(e.embedding, vec_f32(?1)) AS distance \
                         FROM chunks c \
                         JOIN chunk_embeddings e ON e.id = c.id \
                         LEFT JOIN links l ON l.id = c.link_id \
                         WHERE c.project_id = ?2 \
                         ORDER BY distance ASC \
                         LIMIT ?3",
                    )
                    ?;
                let rows = stmt
                    .query_map((&query_json, &project_text, limit), |row| {
                        let chunk = ChunkRow {
                            id: row.get(0)?,
                            project_id: row.get(1)?,
                            link_id: row.get(2)?,
                            content: row.get(3)?,
                            token_count: row.get(4)?,
                            metadata: row.get(5)?,
                            created_at: row.get(6)?,
                        };
                        let url: Option<String> = row.get(7)?;
                        let distance: f32 = row.get(8)?;
                        Ok((chunk, url, distance))
                    })
                    ?;
                let mut collected = Vec::new();
                for row in rows {
                    collected.push(row?);
                }
                Ok(collected)
            })
            .await
            .map_err(storage)?;

        let mut hits = Vec::new();
        for (row, url, distance) in rows {
            let similarity = 1.0 - distance;
            if similarity < threshold {
                continue;
            }
            hits.push(ScoredChunk {
                chunk: row.into_record(None)?,
                similarity,
                url,
            });
        }
        Ok(hits)
    }

    async fn count_chunks(&self, project_id: Uuid) -> Result<usize, PipelineError> {
        let project_text = project_id.to_string();
        let count = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM chunks WHERE project_id = ?1",
                    [&project_text],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await
            .map_err(storage)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store() -> (SqliteStore, Project, SourceLink) {
        let store = SqliteStore::open_in_memory(3).await.unwrap();
        let project = Project::new("acme");
        store.insert_project(&project).await.unwrap();
        let link = SourceLink::new(project.id, Url::parse("https://acme.dev/docs").unwrap());
        store.insert_link(&link).await.unwrap();
        (store, project, link)
    }

    fn chunk(project_id: Uuid, link_id: Option<Uuid>, text: &str, v: Vec<f32>) -> ChunkRecord {
        ChunkRecord::new(project_id, link_id, text).with_embedding(v)
    }

    #[tokio::test]
    async fn roundtrips_links_and_projects() {
        let (store, project, link) = seeded_store().await;

        let loaded = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "acme");

        let loaded = store.get_link(link.id).await.unwrap().unwrap();
        assert_eq!(loaded.url.as_str(), "https://acme.dev/docs");
        assert_eq!(loaded.training_status, TrainingStatus::Idle);

        let listed = store.list_links(project.id).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn search_is_project_scoped_and_ranked() {
        let (store, project, link) = seeded_store().await;
        let other_project = Project::new("other");
        store.insert_project(&other_project).await.unwrap();

        store
            .upsert_chunks(vec![
                chunk(project.id, Some(link.id), "exact", vec![1.0, 0.0, 0.0]),
                chunk(project.id, Some(link.id), "near", vec![0.8, 0.2, 0.0]),
                chunk(project.id, Some(link.id), "far", vec![0.0, 0.0, 1.0]),
                chunk(other_project.id, None, "foreign", vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .search(project.id, &[1.0, 0.0, 0.0], 0.5, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.content, "exact");
        assert!(hits[0].similarity >= hits[1].similarity);
        assert!(hits.iter().all(|hit| hit.chunk.project_id == project.id));
        assert_eq!(hits[0].url.as_deref(), Some("https://acme.dev/docs"));
    }

    #[tokio::test]
    async fn training_guard_and_terminal_states() {
        let (store, _, link) = seeded_store().await;

        assert!(store.begin_training(link.id).await.unwrap());
        assert!(!store.begin_training(link.id).await.unwrap());

        store
            .finish_training(
                link.id,
                TrainingStatus::Trained,
                Some(LinkMetadata {
                    title: Some("Docs".into()),
                }),
            )
            .await
            .unwrap();
        let loaded = store.get_link(link.id).await.unwrap().unwrap();
        assert_eq!(loaded.training_status, TrainingStatus::Trained);
        assert_eq!(loaded.metadata.title.as_deref(), Some("Docs"));
        assert!(loaded.last_trained_at.is_some());

        assert!(store.begin_training(link.id).await.unwrap());
        store
            .finish_training(link.id, TrainingStatus::Failed, None)
            .await
            .unwrap();
        let loaded = store.get_link(link.id).await.unwrap().unwrap();
        assert_eq!(loaded.training_status, TrainingStatus::Failed);
        // Metadata and last_trained_at survive a failed run.
        assert_eq!(loaded.metadata.title.as_deref(), Some("Docs"));
        assert!(loaded.last_trained_at.is_some());
    }

    #[tokio::test]
    async fn delete_by_link_removes_chunks_and_vectors() {
        let (store, project, link) = seeded_store().await;
        store
            .upsert_chunks(vec![
                chunk(project.id, Some(link.id), "a", vec![1.0, 0.0, 0.0]),
                chunk(project.id, Some(link.id), "b", vec![0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.count_chunks(project.id).await.unwrap(), 2);

        let deleted = store.delete_chunks_by_link(link.id).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count_chunks(project.id).await.unwrap(), 0);
        let hits = store
            .search(project.id, &[1.0, 0.0, 0.0], 0.0, 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_link_refused_while_training() {
        let (store, _, link) = seeded_store().await;
        store.begin_training(link.id).await.unwrap();
        let err = store.delete_link(link.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::LinkBusy(_)));

        store
            .finish_training(link.id, TrainingStatus::Trained, None)
            .await
            .unwrap();
        store.delete_link(link.id).await.unwrap();
        assert!(store.get_link(link.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn data_survives_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.db");

        let project = Project::new("acme");
        let link = SourceLink::new(project.id, Url::parse("https://acme.dev").unwrap());
        {
            let store = SqliteStore::open(&path, 3).await.unwrap();
            store.insert_project(&project).await.unwrap();
            store.insert_link(&link).await.unwrap();
            store
                .upsert_chunks(vec![chunk(
                    project.id,
                    Some(link.id),
                    "persisted",
                    vec![1.0, 0.0, 0.0],
                )])
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path, 3).await.unwrap();
        let loaded = store.get_link(link.id).await.unwrap().unwrap();
        assert_eq!(loaded.url.as_str(), "https://acme.dev/");
        let hits = store
            .search(project.id, &[1.0, 0.0, 0.0], 0.5, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.content, "persisted");
    }

    #[tokio::test]
    async fn rejects_mismatched_dimensions() {
        let (store, project, link) = seeded_store().await;
        let err = store
            .upsert_chunks(vec![chunk(project.id, Some(link.id), "bad", vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
    }
}
