//! Query-time retrieval.
//!
//! A [`Retriever`] owns the embedding provider, the vector index built with
//! it, and the documents keyed by id. Queries are embedded with the same
//! provider used at index time.

use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::index::{build_index, VectorIndex};
use crate::models::{Document, RetrievedDocument};

pub struct Retriever {
    provider: Box<dyn EmbeddingProvider>,
    index: VectorIndex,
    documents: HashMap<String, Document>,
}

impl Retriever {
    /// Embed `documents` and build the index over them.
    pub async fn build(
        provider: Box<dyn EmbeddingProvider>,
        documents: Vec<Document>,
        batch_size: usize,
    ) -> Result<Self> {
        let index = build_index(provider.as_ref(), &documents, batch_size).await?;
        Ok(Self::from_parts(provider, index, documents))
    }

    /// Assemble a retriever from an index built elsewhere.
    pub fn from_parts(
        provider: Box<dyn EmbeddingProvider>,
        index: VectorIndex,
        documents: Vec<Document>,
    ) -> Self {
        let documents = documents.into_iter().map(|d| (d.id.clone(), d)).collect();
        Self {
            provider,
            index,
            documents,
        }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// The `k` documents closest to `query`, closest first. Fewer than `k`
    /// are returned when the corpus is smaller.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedDocument>> {
        info!(k, query, "retrieving");
        if self.index.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = embed_query(self.provider.as_ref(), query)
            .await
            .context("Failed to embed query")?;
        let hits = self.index.search(&query_vec, k)?;

        let results: Vec<RetrievedDocument> = hits
            .into_iter()
            .filter_map(|hit| {
                let doc = self.documents.get(&hit.doc_id)?;
                debug!(id = %hit.doc_id, distance = hit.distance, "hit");
                Some(RetrievedDocument {
                    id: doc.id.clone(),
                    text: doc.text.clone(),
                    distance: hit.distance,
                })
            })
            .collect();

        info!(found = results.len(), "retrieval done");
        Ok(results)
    }
}

/// Frame retrieved documents as numbered context blocks ahead of the question.
pub fn build_prompt(query: &str, documents: &[RetrievedDocument]) -> String {
    let mut prompt = String::from(
        "Answer the question using the context below. \
         If the context does not contain the answer, say so.\n\n",
    );
    for (i, doc) in documents.iter().enumerate() {
        prompt.push_str(&format!(
            "### Context {} ({})\n{}\n\n",
            i + 1,
            doc.id,
            doc.text.trim_end()
        ));
    }
    prompt.push_str("### Question\n");
    prompt.push_str(query.trim());
    prompt.push('\n');
    prompt
}
