//! Offline search over a JSON document index
//!
//! The index is a JSON array of `{ "url", "title", "content" }` records, loaded once.
//! Ranking counts query terms found in each record, with title hits weighted double.

use async_trait::async_trait;
use delve_core::text::tokenize;
use delve_core::{DelveError, DelveResult, ErrorContext, SearchProvider, SearchProviderKind, SourceDocument};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// One record of the local index file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalRecord {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub content: String,
}

struct IndexedRecord {
    record: LocalRecord,
    title_terms: BTreeSet<String>,
    body_terms: BTreeSet<String>,
}

/// Search provider backed by an in-memory index
pub struct LocalIndexProvider {
    records: Vec<IndexedRecord>,
}

impl LocalIndexProvider {
    /// Load the index from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> DelveResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DelveError::Config {
            message: format!("Failed to read local index {}: {}", path.display(), e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("local_index")
                .with_operation("load")
                .with_suggestion("Check search.local_index_path"),
        })?;

        let records: Vec<LocalRecord> =
            serde_json::from_str(&content).map_err(|e| DelveError::Config {
                message: format!("Local index {} is not a JSON record list: {}", path.display(), e),
                source: Some(Box::new(e)),
                context: ErrorContext::new("local_index").with_operation("parse"),
            })?;

        info!(path = %path.display(), records = records.len(), "Loaded local search index");

        Ok(Self::from_records(records))
    }

    /// Build the index from records already in memory
    pub fn from_records(records: Vec<LocalRecord>) -> Self {
        let records = records
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .map(|record| IndexedRecord {
                title_terms: tokenize(&record.title),
                body_terms: tokenize(&record.content),
                record,
            })
            .collect();
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn score(record: &IndexedRecord, terms: &BTreeSet<String>) -> usize {
        terms
            .iter()
            .map(|t| {
                let mut score = 0;
                if record.title_terms.contains(t) {
                    score += 2;
                }
                if record.body_terms.contains(t) {
                    score += 1;
                }
                score
            })
            .sum()
    }
}

#[async_trait]
impl SearchProvider for LocalIndexProvider {
    fn kind(&self) -> SearchProviderKind {
        SearchProviderKind::Local
    }

    async fn search(&self, query: &str, limit: usize) -> DelveResult<Vec<SourceDocument>> {
        let terms = tokenize(query);

        let mut scored: Vec<(usize, &LocalRecord)> = self
            .records
            .iter()
            .map(|r| (Self::score(r, &terms), &r.record))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|(a_score, a), (b_score, b)| b_score.cmp(a_score).then_with(|| a.url.cmp(&b.url)));

        debug!(query = query, matches = scored.len(), "Local index search");

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, r)| {
                SourceDocument::new(
                    r.url.clone(),
                    r.title.clone(),
                    r.content.clone(),
                    SearchProviderKind::Local,
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, title: &str, content: &str) -> LocalRecord {
        LocalRecord {
            url: url.to_string(),
            title: title.to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_ranking_prefers_title_matches() {
        let provider = LocalIndexProvider::from_records(vec![
            record("https://a.test", "Gardening", "Tokio is mentioned once"),
            record("https://b.test", "Tokio runtime", "Scheduler internals"),
            record("https://c.test", "Cooking", "Nothing relevant"),
        ]);

        let results = provider.search("tokio runtime", 5).await.unwrap();
        let urls: Vec<&str> = results.iter().map(|d| d.url.as_str()).collect();
        assert_eq!(urls, vec!["https://b.test", "https://a.test"]);
    }

    #[tokio::test]
    async fn test_limit_is_respected() {
        let provider = LocalIndexProvider::from_records(
            (0..10)
                .map(|i| record(&format!("https://{}.test", i), "rust", "rust"))
                .collect(),
        );
        assert_eq!(provider.search("rust", 3).await.unwrap().len(), 3);
        assert!(provider.search("haskell", 3).await.unwrap().is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(
            &path,
            r#"[{"url": "https://a.test", "title": "A", "content": "alpha"}, {"url": "", "content": "dropped"}]"#,
        )
        .unwrap();

        let provider = LocalIndexProvider::from_file(&path).unwrap();
        assert_eq!(provider.len(), 1);

        std::fs::write(&path, r#"{"url": "not a list"}"#).unwrap();
        assert!(matches!(
            LocalIndexProvider::from_file(&path),
            Err(DelveError::Config { .. })
        ));
    }
}
