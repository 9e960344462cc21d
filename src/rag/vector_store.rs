use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, CreateCollectionBuilder, DeletePointsBuilder, Distance, PointId,
    PointStruct, PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::config::Secret;
use crate::error::{ChatError, Result};
use crate::models::RetrievedChunk;

/// Similarity search over stored document chunks.
///
/// Results come back best match first. Chunks with equal scores keep whatever
/// order the store produced, which is not guaranteed to be stable across calls.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn query(&self, vector: &[f32], top_k: u64) -> Result<Vec<RetrievedChunk>>;

    async fn health_check(&self) -> bool;
}

/// A chunk ready to be written to the index.
#[derive(Debug, Clone)]
pub struct ChunkPoint {
    pub id: String,
    pub text: String,
    pub source: String,
    pub chunk_index: usize,
    pub vector: Vec<f32>,
}

pub struct QdrantStore {
    client: Qdrant,
    collection_name: String,
}

impl QdrantStore {
    pub fn new(url: &str, api_key: &Secret, collection_name: &str, timeout: Duration) -> Result<Self> {
        tracing::info!("Building Qdrant client for URL: {}", url);
        let client = Qdrant::from_url(url)
            .api_key(api_key.expose().to_string())
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::configuration(format!("Qdrant client build failed: {}", e)))?;

        Ok(Self {
            client,
            collection_name: collection_name.to_string(),
        })
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub async fn exists(&self) -> Result<bool> {
        self.client
            .collection_exists(&self.collection_name)
            .await
            .map_err(|e| ChatError::retrieval(format!("Qdrant collection check failed: {}", e)))
    }

    /// Create the collection with cosine distance when it does not exist yet.
    pub async fn ensure_collection(&self, dimension: u64) -> Result<()> {
        if !self.exists().await? {
            tracing::info!(
                "Creating collection {} (dimension {})",
                self.collection_name,
                dimension
            );
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection_name)
                        .vectors_config(VectorParamsBuilder::new(dimension, Distance::Cosine)),
                )
                .await
                .map_err(|e| ChatError::retrieval(format!("Qdrant create collection failed: {}", e)))?;
        }
        Ok(())
    }

    pub async fn upsert(&self, points: Vec<ChunkPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|p| {
                let mut payload = JsonMap::new();
                payload.insert("text".to_string(), JsonValue::String(p.text));
                payload.insert("source".to_string(), JsonValue::String(p.source));
                payload.insert("chunk_index".to_string(), JsonValue::from(p.chunk_index));
                PointStruct::new(p.id, p.vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(|e| ChatError::retrieval(format!("Qdrant upsert failed: {}", e)))?;

        Ok(())
    }

    /// Every stored point id with its `source` payload, if any.
    pub async fn stored_points(&self) -> Result<Vec<(String, Option<String>)>> {
        let mut points = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(&self.collection_name)
                .limit(256)
                .with_payload(true)
                .with_vectors(false);
            if let Some(off) = offset.take() {
                builder = builder.offset(off);
            }

            let page = self
                .client
                .scroll(builder)
                .await
                .map_err(|e| ChatError::retrieval(format!("Qdrant scroll failed: {}", e)))?;

            for point in page.result {
                let Some(id) = point.id.as_ref().and_then(point_id_string) else {
                    continue;
                };
                let source = point
                    .payload
                    .get("source")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                points.push((id, source));
            }

            offset = page.next_page_offset;
            if offset.is_none() {
                break;
            }
        }

        Ok(points)
    }

    pub async fn delete_points(&self, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<PointId> = ids
            .into_iter()
            .map(|id| PointId {
                point_id_options: Some(match id.parse::<u64>() {
                    Ok(num) => PointIdOptions::Num(num),
                    Err(_) => PointIdOptions::Uuid(id),
                }),
            })
            .collect();

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(|e| ChatError::retrieval(format!("Qdrant delete failed: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn query(&self, vector: &[f32], top_k: u64) -> Result<Vec<RetrievedChunk>> {
        if top_k == 0 {
            return Err(ChatError::validation("top_k must be positive"));
        }

        let search = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, vector.to_vec(), top_k)
                    .with_payload(true),
            )
            .await;

        let response = match search {
            Ok(response) => response,
            Err(e) => {
                // A collection that was never indexed is an empty index, not an outage.
                if let Ok(false) = self.client.collection_exists(&self.collection_name).await {
                    tracing::warn!("Collection {} does not exist", self.collection_name);
                    return Ok(Vec::new());
                }
                return Err(ChatError::retrieval(format!("Qdrant search failed: {}", e)));
            }
        };

        let chunks = response
            .result
            .into_iter()
            .filter_map(|point| to_chunk(point.id.as_ref(), &point.payload, point.score))
            .collect();

        Ok(rank(chunks, top_k))
    }

    async fn health_check(&self) -> bool {
        match self.client.health_check().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Qdrant health check failed: {}", e);
                false
            }
        }
    }
}

/// Points without a `text` payload carry nothing to ground an answer on and are skipped.
fn to_chunk(id: Option<&PointId>, payload: &HashMap<String, Value>, score: f32) -> Option<RetrievedChunk> {
    let text = payload.get("text")?.as_str()?.trim().to_string();
    if text.is_empty() {
        return None;
    }

    let source_id = payload
        .get("source")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .or_else(|| id.and_then(point_id_string))
        .unwrap_or_else(|| "unknown".to_string());

    Some(RetrievedChunk {
        text,
        source_id,
        score,
    })
}

fn point_id_string(id: &PointId) -> Option<String> {
    match id.point_id_options.as_ref()? {
        PointIdOptions::Uuid(uuid) => Some(uuid.clone()),
        PointIdOptions::Num(num) => Some(num.to_string()),
    }
}

/// Descending by score, stable for ties, capped at `top_k`.
fn rank(mut chunks: Vec<RetrievedChunk>, top_k: u64) -> Vec<RetrievedChunk> {
    chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    chunks.truncate(top_k as usize);
    chunks
}
