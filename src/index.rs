//! Exact nearest-neighbor search over document embeddings.
//!
//! [`VectorIndex`] is a flat list of `(document id, vector)` entries searched
//! by brute force with squared Euclidean distance. Entries carry the
//! document's stable id, so hits do not depend on corpus line order.
//!
//! The index is built once per process and only read afterwards; sharing it
//! across concurrent sessions needs nothing more than `&VectorIndex`.

use anyhow::{bail, Result};
use std::cmp::Ordering;
use std::time::Instant;
use tracing::info;

use crate::embedding::EmbeddingProvider;
use crate::models::Document;

#[derive(Debug, Clone)]
struct IndexEntry {
    doc_id: String,
    vector: Vec<f32>,
}

/// A search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub doc_id: String,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

/// Flat L2 index.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dims: Option<usize>,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// An empty index. `dims` may be unknown until the first insert.
    pub fn new(dims: Option<usize>) -> Self {
        Self {
            dims,
            entries: Vec::new(),
        }
    }

    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a vector. All vectors must share one dimension.
    pub fn add(&mut self, doc_id: impl Into<String>, vector: Vec<f32>) -> Result<()> {
        match self.dims {
            Some(d) if d != vector.len() => bail!(
                "embedding dimension mismatch: index has {}, got {}",
                d,
                vector.len()
            ),
            Some(_) => {}
            None => {
                if vector.is_empty() {
                    bail!("cannot index an empty embedding vector");
                }
                self.dims = Some(vector.len());
            }
        }
        self.entries.push(IndexEntry {
            doc_id: doc_id.into(),
            vector,
        });
        Ok(())
    }

    /// The `k` nearest entries, closest first. Returns everything when `k`
    /// exceeds the index size. Equal distances keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if let Some(d) = self.dims {
            if d != query.len() {
                bail!(
                    "query dimension mismatch: index has {}, query has {}",
                    d,
                    query.len()
                );
            }
        }

        let mut hits: Vec<Neighbor> = self
            .entries
            .iter()
            .map(|e| Neighbor {
                doc_id: e.doc_id.clone(),
                distance: squared_l2(query, &e.vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }
}

/// Squared Euclidean distance. Callers guarantee equal lengths.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Embed every document in batches and index the vectors under the
/// documents' ids, in document order.
pub async fn build_index(
    provider: &dyn EmbeddingProvider,
    documents: &[Document],
    batch_size: usize,
) -> Result<VectorIndex> {
    let mut index = VectorIndex::new(provider.dims());
    if documents.is_empty() {
        info!("no documents to index");
        return Ok(index);
    }

    info!(
        documents = documents.len(),
        model = provider.model_name(),
        "embedding corpus"
    );
    let start = Instant::now();

    for batch in documents.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
        let vectors = provider.embed(&texts).await?;
        if vectors.len() != batch.len() {
            bail!(
                "embedding provider returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            );
        }
        for (doc, vector) in batch.iter().zip(vectors) {
            index.add(doc.id.clone(), vector)?;
        }
    }

    info!(
        vectors = index.len(),
        dims = index.dims().unwrap_or(0),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "index ready"
    );
    Ok(index)
}
