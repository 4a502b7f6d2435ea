//! Embedding fetcher: reads one run's corpus from the vector index.
//!
//! Points carry their article fields in the payload:
//! `text`, `title`, `url`, `published_at` (RFC 3339), `source_domain`, and
//! `topic_id` once assigned. Embeddings are normalized to unit length on read.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use themewatch_common::{Document, DocumentMetadata, Owner, ThemeWatchError};
use themewatch_store::{VectorIndex, VectorPoint};

use crate::similarity::normalize;

/// Which documents a run clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "since", rename_all = "snake_case")]
pub enum IncludePolicy {
    All,
    /// Skip documents whose payload already carries a topic.
    Unassigned,
    /// Documents published at or after the given time.
    Since(DateTime<Utc>),
    /// Documents published at or after the given time, plus any without a
    /// topic yet (undated or backdated documents ingested since).
    UnassignedOrSince(DateTime<Utc>),
    /// New material since the scope's last finished run. Resolved to
    /// `UnassignedOrSince` (or `All`) by the coordinator before fetching.
    SinceLastCompletedRun,
}

/// Parallel arrays over the fetched documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedCorpus {
    pub document_ids: Vec<String>,
    pub owners: Vec<Owner>,
    pub texts: Vec<String>,
    pub embeddings: Vec<Vec<f32>>,
    pub metadata: Vec<DocumentMetadata>,
}

impl FetchedCorpus {
    pub fn len(&self) -> usize {
        self.document_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document_ids.is_empty()
    }

    fn push(&mut self, doc: Document) {
        self.document_ids.push(doc.id);
        self.owners.push(doc.owner);
        self.texts.push(doc.text);
        self.embeddings.push(doc.embedding);
        self.metadata.push(doc.metadata);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Ready(FetchedCorpus),
    /// Fewer documents than the configured minimum; clustering must not be attempted.
    InsufficientData { found: usize, required: usize },
}

/// Borrows the index for the duration of a fetch; owns no connection of its own.
pub struct EmbeddingFetcher<'a> {
    index: &'a dyn VectorIndex,
    min_documents: usize,
}

impl<'a> EmbeddingFetcher<'a> {
    pub fn new(index: &'a dyn VectorIndex, min_documents: usize) -> Self {
        Self { index, min_documents }
    }

    pub async fn fetch(
        &self,
        collections: &[Owner],
        policy: &IncludePolicy,
    ) -> Result<FetchOutcome, ThemeWatchError> {
        let corpus = self.fetch_all(collections, policy).await?;
        if corpus.len() < self.min_documents {
            info!(
                found = corpus.len(),
                required = self.min_documents,
                "Corpus below minimum size"
            );
            return Ok(FetchOutcome::InsufficientData {
                found: corpus.len(),
                required: self.min_documents,
            });
        }
        Ok(FetchOutcome::Ready(corpus))
    }

    /// Fetch without the minimum-size guard. Used to rebuild a corpus for a
    /// resumed run, whose size was checked when it started.
    pub async fn fetch_all(
        &self,
        collections: &[Owner],
        policy: &IncludePolicy,
    ) -> Result<FetchedCorpus, ThemeWatchError> {
        if *policy == IncludePolicy::SinceLastCompletedRun {
            return Err(ThemeWatchError::Validation(
                "SinceLastCompletedRun must be resolved before fetching".into(),
            ));
        }

        let mut corpus = FetchedCorpus::default();
        let mut seen: HashSet<String> = HashSet::new();

        for owner in collections {
            let collection = owner.collection();
            if !self.index.collection_exists(collection).await? {
                warn!(collection, "Vector collection missing, treating as empty");
                continue;
            }

            let points = self.index.scroll(collection).await?;
            let scanned = points.len();
            let mut kept = 0usize;
            for point in points {
                if !seen.insert(point.id.clone()) {
                    warn!(id = point.id.as_str(), collection, "Document present in more than one population, keeping first");
                    continue;
                }
                let assigned = point
                    .payload
                    .get("topic_id")
                    .is_some_and(|v| !v.is_null());
                let doc = document_from_point(point, *owner);
                if included(&doc, assigned, policy) {
                    corpus.push(doc);
                    kept += 1;
                }
            }
            info!(collection, scanned, kept, "Fetched embeddings");
        }

        Ok(corpus)
    }
}

fn included(doc: &Document, assigned: bool, policy: &IncludePolicy) -> bool {
    match policy {
        IncludePolicy::All | IncludePolicy::SinceLastCompletedRun => true,
        IncludePolicy::Unassigned => !assigned,
        IncludePolicy::Since(ts) => published_since(doc, ts),
        IncludePolicy::UnassignedOrSince(ts) => !assigned || published_since(doc, ts),
    }
}

fn published_since(doc: &Document, ts: &DateTime<Utc>) -> bool {
    doc.metadata.published_at.is_some_and(|p| p >= *ts)
}

fn document_from_point(point: VectorPoint, owner: Owner) -> Document {
    let VectorPoint {
        id,
        mut embedding,
        payload,
    } = point;
    normalize(&mut embedding);

    let field = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
    let url = field("url").unwrap_or_default();
    let source_domain = field("source_domain")
        .filter(|d| !d.is_empty())
        .or_else(|| domain_of(&url));

    Document {
        id,
        owner,
        embedding,
        text: field("text").unwrap_or_default(),
        metadata: DocumentMetadata {
            title: field("title").unwrap_or_default(),
            published_at: field("published_at").and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }),
            url,
            source_domain,
        },
    }
}

/// Host of `url`, lowercased, without a leading `www.`.
pub fn domain_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .map(|h| h.strip_prefix("www.").map(str::to_string).unwrap_or(h))
        .filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use themewatch_store::memory::InMemoryVectorIndex;

    fn point(id: &str, published: &str, topic: Option<i64>) -> VectorPoint {
        let mut payload = json!({
            "text": format!("article {id}"),
            "title": id,
            "url": format!("https://www.{id}.example.com/post"),
            "published_at": published,
        });
        if let Some(t) = topic {
            payload["topic_id"] = json!(t);
        }
        VectorPoint {
            id: id.to_string(),
            embedding: vec![3.0, 4.0],
            payload,
        }
    }

    fn index() -> InMemoryVectorIndex {
        let index = InMemoryVectorIndex::new()
            .with_collection(Owner::Client.collection())
            .with_collection(Owner::Competitor.collection());
        index.insert(Owner::Client.collection(), point("a", "2026-01-10T00:00:00Z", Some(2)));
        index.insert(Owner::Client.collection(), point("b", "2026-03-01T00:00:00Z", None));
        index.insert(Owner::Competitor.collection(), point("c", "2026-02-01T00:00:00Z", None));
        index
    }

    #[tokio::test]
    async fn fetches_both_populations_with_metadata() {
        let index = index();
        let fetcher = EmbeddingFetcher::new(&index, 1);
        let FetchOutcome::Ready(corpus) = fetcher.fetch(&Owner::ALL, &IncludePolicy::All).await.unwrap() else {
            panic!("expected a corpus");
        };

        assert_eq!(corpus.document_ids, vec!["a", "b", "c"]);
        assert_eq!(corpus.owners, vec![Owner::Client, Owner::Client, Owner::Competitor]);
        assert_eq!(corpus.texts[2], "article c");
        assert_eq!(corpus.metadata[0].source_domain.as_deref(), Some("a.example.com"));
        assert!(corpus.metadata[1].published_at.is_some());
        assert!((corpus.embeddings[0][0] - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn below_minimum_is_insufficient_data() {
        let index = index();
        let outcome = EmbeddingFetcher::new(&index, 50)
            .fetch(&Owner::ALL, &IncludePolicy::All)
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::InsufficientData { found: 3, required: 50 });
    }

    #[tokio::test]
    async fn unassigned_policy_skips_documents_with_topics() {
        let index = index();
        let corpus = EmbeddingFetcher::new(&index, 0)
            .fetch_all(&Owner::ALL, &IncludePolicy::Unassigned)
            .await
            .unwrap();
        assert_eq!(corpus.document_ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn since_policy_filters_by_publication_date() {
        let index = index();
        let since = DateTime::parse_from_rfc3339("2026-01-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let corpus = EmbeddingFetcher::new(&index, 0)
            .fetch_all(&Owner::ALL, &IncludePolicy::Since(since))
            .await
            .unwrap();
        assert_eq!(corpus.document_ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn incremental_policy_keeps_new_and_unassigned_documents() {
        let index = index();
        // Undated and never assigned.
        index.insert(Owner::Competitor.collection(), point("d", "", None));
        // Backdated, but already carries a topic.
        index.insert(Owner::Competitor.collection(), point("e", "2025-06-01T00:00:00Z", Some(1)));
        let since = DateTime::parse_from_rfc3339("2026-02-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let corpus = EmbeddingFetcher::new(&index, 0)
            .fetch_all(&Owner::ALL, &IncludePolicy::UnassignedOrSince(since))
            .await
            .unwrap();
        assert_eq!(corpus.document_ids, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn missing_collection_is_empty_not_error() {
        let index = InMemoryVectorIndex::new().with_collection(Owner::Client.collection());
        index.insert(Owner::Client.collection(), point("a", "2026-01-10T00:00:00Z", None));
        let corpus = EmbeddingFetcher::new(&index, 0)
            .fetch_all(&Owner::ALL, &IncludePolicy::All)
            .await
            .unwrap();
        assert_eq!(corpus.len(), 1);
    }

    #[tokio::test]
    async fn unresolved_incremental_policy_is_rejected() {
        let index = index();
        let result = EmbeddingFetcher::new(&index, 0)
            .fetch_all(&Owner::ALL, &IncludePolicy::SinceLastCompletedRun)
            .await;
        assert!(matches!(result, Err(ThemeWatchError::Validation(_))));
    }

    #[test]
    fn domain_strips_www_and_lowercases() {
        assert_eq!(domain_of("https://WWW.Example.com/a?b=1").as_deref(), Some("example.com"));
        assert_eq!(domain_of("not a url"), None);
    }
}
