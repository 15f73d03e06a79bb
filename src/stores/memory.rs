//! In-memory [`VectorBackend`] for tests and embedding-free environments.
//!
//! Vector search is brute-force cosine similarity over every stored chunk.
//! All state lives behind `parking_lot::RwLock`, so the store is cheap to
//! share across tasks.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::PipelineError;

use super::{
    ChunkRecord, LinkMetadata, Project, ScoredChunk, SourceLink, TrainingStatus, VectorBackend,
};

pub struct MemoryStore {
    dimension: usize,
    projects: RwLock<HashMap<Uuid, Project>>,
    links: RwLock<HashMap<Uuid, SourceLink>>,
    chunks: RwLock<Vec<ChunkRecord>>,
}

impl MemoryStore {
    /// Creates a store that accepts embeddings of the given dimensionality.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            projects: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            chunks: RwLock::new(Vec::new()),
        }
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorBackend for MemoryStore {
    async fn insert_project(&self, project: &Project) -> Result<(), PipelineError> {
        self.projects.write().insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, PipelineError> {
        Ok(self.projects.read().get(&id).cloned())
    }

    async fn insert_link(&self, link: &SourceLink) -> Result<(), PipelineError> {
        self.links.write().insert(link.id, link.clone());
        Ok(())
    }

    async fn get_link(&self, id: Uuid) -> Result<Option<SourceLink>, PipelineError> {
        Ok(self.links.read().get(&id).cloned())
    }

    async fn list_links(&self, project_id: Uuid) -> Result<Vec<SourceLink>, PipelineError> {
        let mut links: Vec<SourceLink> = self
            .links
            .read()
            .values()
            .filter(|link| link.project_id == project_id)
            .cloned()
            .collect();
        links.sort_by_key(|link| link.created_at);
        Ok(links)
    }

    async fn delete_link(&self, id: Uuid) -> Result<(), PipelineError> {
        let mut links = self.links.write();
        match links.get(&id) {
            None => return Err(PipelineError::link_not_found(id)),
            Some(link) if link.training_status == TrainingStatus::Training => {
                return Err(PipelineError::LinkBusy(id));
            }
            Some(_) => {
                links.remove(&id);
            }
        }
        drop(links);
        self.chunks.write().retain(|chunk| chunk.link_id != Some(id));
        Ok(())
    }

    async fn begin_training(&self, link_id: Uuid) -> Result<bool, PipelineError> {
        let mut links = self.links.write();
        match links.get_mut(&link_id) {
            Some(link) if link.training_status != TrainingStatus::Training => {
                link.training_status = TrainingStatus::Training;
                link.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_training(
        &self,
        link_id: Uuid,
        status: TrainingStatus,
        metadata: Option<LinkMetadata>,
    ) -> Result<(), PipelineError> {
        let mut links = self.links.write();
        let link = links
            .get_mut(&link_id)
            .ok_or_else(|| PipelineError::link_not_found(link_id))?;
        let now = chrono::Utc::now();
        link.training_status = status;
        link.updated_at = now;
        if status == TrainingStatus::Trained {
            link.last_trained_at = Some(now);
        }
        if let Some(metadata) = metadata {
            link.metadata = metadata;
        }
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: Vec<ChunkRecord>) -> Result<usize, PipelineError> {
        let mut stored = 0;
        let mut all = self.chunks.write();
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
            all.retain(|existing| existing.id != chunk.id);
            all.push(chunk);
            stored += 1;
        }
        Ok(stored)
    }

    async fn delete_chunks_by_link(&self, link_id: Uuid) -> Result<usize, PipelineError> {
        let mut chunks = self.chunks.write();
        let before = chunks.len();
        chunks.retain(|chunk| chunk.link_id != Some(link_id));
        Ok(before - chunks.len())
    }

    async fn search(
        &self,
        project_id: Uuid,
        query: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        let links = self.links.read();
        let chunks = self.chunks.read();
        let mut hits: Vec<ScoredChunk> = chunks
            .iter()
            .filter(|chunk| chunk.project_id == project_id)
            .filter_map(|chunk| {
                let embedding = chunk.embedding.as_ref()?;
                let similarity = cosine_similarity(query, embedding);
                if similarity < threshold {
                    return None;
                }
                let url = chunk
                    .link_id
                    .and_then(|link_id| links.get(&link_id))
                    .map(|link| link.url.to_string());
                Some(ScoredChunk {
                    chunk: chunk.clone(),
                    similarity,
                    url,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn count_chunks(&self, project_id: Uuid) -> Result<usize, PipelineError> {
        Ok(self
            .chunks
            .read()
            .iter()
            .filter(|chunk| chunk.project_id == project_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn chunk(project_id: Uuid, link_id: Option<Uuid>, text: &str, v: Vec<f32>) -> ChunkRecord {
        ChunkRecord::new(project_id, link_id, text).with_embedding(v)
    }

    #[tokio::test]
    async fn search_never_crosses_project_boundaries() {
        let store = MemoryStore::new(3);
        let project_a = Uuid::new_v4();
        let project_b = Uuid::new_v4();
        store
            .upsert_chunks(vec![
                chunk(project_a, None, "alpha", vec![1.0, 0.0, 0.0]),
                chunk(project_b, None, "beta", vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store
            .search(project_a, &[1.0, 0.0, 0.0], 0.0, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.content, "alpha");
        assert!(hits.iter().all(|hit| hit.chunk.project_id == project_a));
    }

    #[tokio::test]
    async fn search_orders_filters_and_caps() {
        let store = MemoryStore::new(2);
        let project = Uuid::new_v4();
        store
            .upsert_chunks(vec![
                chunk(project, None, "exact", vec![1.0, 0.0]),
                chunk(project, None, "close", vec![0.9, 0.1]),
                chunk(project, None, "far", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = store.search(project, &[1.0, 0.0], 0.5, 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.content, "exact");
        assert!(hits[0].similarity > 0.99);
    }

    #[tokio::test]
    async fn begin_training_is_a_compare_and_swap() {
        let store = MemoryStore::new(2);
        let project = Project::new("acme");
        store.insert_project(&project).await.unwrap();
        let link = SourceLink::new(project.id, Url::parse("https://acme.dev/docs").unwrap());
        store.insert_link(&link).await.unwrap();

        assert!(store.begin_training(link.id).await.unwrap());
        // A second request while training is rejected.
        assert!(!store.begin_training(link.id).await.unwrap());

        store
            .finish_training(link.id, TrainingStatus::Trained, None)
            .await
            .unwrap();
        let link = store.get_link(link.id).await.unwrap().unwrap();
        assert_eq!(link.training_status, TrainingStatus::Trained);
        assert!(link.last_trained_at.is_some());

        // Terminal states are re-enterable.
        assert!(store.begin_training(link.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_link_is_refused_while_training() {
        let store = MemoryStore::new(2);
        let project = Project::new("acme");
        store.insert_project(&project).await.unwrap();
        let link = SourceLink::new(project.id, Url::parse("https://acme.dev").unwrap());
        store.insert_link(&link).await.unwrap();
        store
            .upsert_chunks(vec![chunk(project.id, Some(link.id), "c", vec![1.0, 0.0])])
            .await
            .unwrap();

        store.begin_training(link.id).await.unwrap();
        let err = store.delete_link(link.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::LinkBusy(_)));

        store
            .finish_training(link.id, TrainingStatus::Failed, None)
            .await
            .unwrap();
        store.delete_link(link.id).await.unwrap();
        assert_eq!(store.count_chunks(project.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let store = MemoryStore::new(4);
        let err = store
            .upsert_chunks(vec![chunk(Uuid::new_v4(), None, "bad", vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
    }

    #[tokio::test]
    async fn records_without_embeddings_are_skipped() {
        let store = MemoryStore::new(2);
        let project = Uuid::new_v4();
        let stored = store
            .upsert_chunks(vec![
                ChunkRecord::new(project, None, "no vector"),
                chunk(project, None, "with vector", vec![0.5, 0.5]),
            ])
            .await
            .unwrap();
        assert_eq!(stored, 1);
        assert_eq!(store.count_chunks(project).await.unwrap(), 1);
    }
}
