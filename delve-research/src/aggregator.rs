//! Deduplicating fact aggregation
//!
//! `ResearchState` is append-only: entries are never removed or modified once merged.
//! Findings are keyed by normalized text and documents by normalized URL, so the set of
//! keys is the same whatever order branches deliver their results in.

use delve_core::text::{normalize_url, text_similarity};
use delve_core::{Finding, ResearchSnapshot, SourceDocument};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Counts from a single merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub duplicates: usize,
    pub documents_added: usize,
}

/// The session's accumulated findings and documents
#[derive(Debug, Default)]
pub struct ResearchState {
    findings: Vec<Finding>,
    fact_index: HashMap<String, usize>,
    documents: Vec<SourceDocument>,
    url_index: HashMap<String, usize>,
    /// Positions of single-source findings per normalized URL
    claims_by_url: HashMap<String, Vec<usize>>,
}

impl ResearchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Insert a document unless its URL is already known
    pub fn insert_document(&mut self, document: SourceDocument) -> bool {
        let key = document.key();
        if self.url_index.contains_key(&key) {
            return false;
        }
        self.url_index.insert(key, self.documents.len());
        self.documents.push(document);
        true
    }

    /// Stored URL for a source reference, if the document is known
    fn canonical_url(&self, url: &str) -> Option<String> {
        self.url_index
            .get(&normalize_url(url))
            .map(|p| self.documents[*p].url.clone())
    }

    /// Insert a finding unless it duplicates an existing entry.
    ///
    /// Source URLs are rewritten to the stored document URL; references to unknown
    /// documents are dropped. With a `near_duplicate` threshold, a single-source
    /// finding is also discarded when its URL already backs a similar claim.
    pub fn insert_finding(&mut self, mut finding: Finding, near_duplicate: Option<f64>) -> bool {
        let key = finding.key();
        if key.is_empty() || self.fact_index.contains_key(&key) {
            return false;
        }

        let mut sources: Vec<String> = Vec::new();
        for source in &finding.sources {
            if let Some(url) = self.canonical_url(source) {
                if !sources.contains(&url) {
                    sources.push(url);
                }
            }
        }
        finding.sources = sources;

        let single_source = match finding.sources.as_slice() {
            [only] => Some(normalize_url(only)),
            _ => None,
        };

        if let (Some(threshold), Some(url_key)) = (near_duplicate, &single_source) {
            if let Some(existing) = self.claims_by_url.get(url_key) {
                let duplicate = existing
                    .iter()
                    .any(|p| text_similarity(&self.findings[*p].text, &finding.text) >= threshold);
                if duplicate {
                    return false;
                }
            }
        }

        let position = self.findings.len();
        self.fact_index.insert(key, position);
        if let Some(url_key) = single_source {
            self.claims_by_url.entry(url_key).or_default().push(position);
        }
        self.findings.push(finding);
        true
    }

    pub fn snapshot(&self) -> ResearchSnapshot {
        ResearchSnapshot::new(self.findings.clone(), self.documents.clone())
    }
}

/// Concurrency-safe front of a `ResearchState`
#[derive(Debug, Default)]
pub struct FactAggregator {
    state: RwLock<ResearchState>,
    near_duplicate_threshold: Option<f64>,
}

impl FactAggregator {
    pub fn new(near_duplicate_threshold: Option<f64>) -> Self {
        Self {
            state: RwLock::new(ResearchState::new()),
            near_duplicate_threshold,
        }
    }

    /// Merge one node's documents and findings atomically
    pub async fn merge(
        &self,
        findings: Vec<Finding>,
        documents: Vec<SourceDocument>,
    ) -> MergeReport {
        let mut state = self.state.write().await;
        let mut report = MergeReport::default();

        for document in documents {
            if state.insert_document(document) {
                report.documents_added += 1;
            }
        }

        for finding in findings {
            if state.insert_finding(finding, self.near_duplicate_threshold) {
                report.added += 1;
            } else {
                report.duplicates += 1;
            }
        }

        debug!(
            added = report.added,
            duplicates = report.duplicates,
            documents_added = report.documents_added,
            total = state.len(),
            "Merged findings"
        );

        report
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn document_count(&self) -> usize {
        self.state.read().await.document_count()
    }

    pub async fn snapshot(&self) -> ResearchSnapshot {
        self.state.read().await.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_core::SearchProviderKind;
    use uuid::Uuid;

    fn doc(url: &str) -> SourceDocument {
        SourceDocument::new(url, "t", "c", SearchProviderKind::Local)
    }

    fn finding(text: &str, sources: &[&str]) -> Finding {
        Finding::new(
            text,
            sources.iter().map(|s| s.to_string()).collect(),
            Uuid::new_v4(),
            "q",
            1,
        )
    }

    #[test]
    fn test_normalized_text_duplicates_are_discarded() {
        let mut state = ResearchState::new();
        state.insert_document(doc("https://a.test"));
        assert!(state.insert_finding(finding("Tokio is fast.", &["https://a.test"]), None));
        assert!(!state.insert_finding(finding("tokio IS fast", &["https://a.test"]), None));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_sources_are_canonicalized() {
        let mut state = ResearchState::new();
        state.insert_document(doc("https://a.test/page"));
        assert!(!state.insert_document(doc("https://A.test/page/#top")));
        state.insert_finding(
            finding("claim", &["https://a.test/page/", "https://unknown.test"]),
            None,
        );

        let snapshot = state.snapshot();
        assert_eq!(snapshot.documents.len(), 1);
        assert_eq!(snapshot.findings[0].sources, vec!["https://a.test/page"]);
    }

    #[test]
    fn test_near_duplicate_on_same_url() {
        let mut state = ResearchState::new();
        state.insert_document(doc("https://a.test"));
        state.insert_document(doc("https://b.test"));

        let threshold = Some(0.75);
        assert!(state.insert_finding(
            finding("rust has zero cost abstractions", &["https://a.test"]),
            threshold
        ));
        // Same URL, similar claim
        assert!(!state.insert_finding(
            finding("rust has zero cost abstractions too", &["https://a.test"]),
            threshold
        ));
        // Similar claim from another URL is kept
        assert!(state.insert_finding(
            finding("rust has zero cost abstractions too", &["https://b.test"]),
            threshold
        ));
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_reports_counts() {
        let aggregator = FactAggregator::new(None);
        let report = aggregator
            .merge(
                vec![finding("a", &["https://a.test"]), finding("A!", &["https://a.test"])],
                vec![doc("https://a.test"), doc("https://a.test/")],
            )
            .await;

        assert_eq!(
            report,
            MergeReport {
                added: 1,
                duplicates: 1,
                documents_added: 1
            }
        );
        assert_eq!(aggregator.len().await, 1);
        assert_eq!(aggregator.document_count().await, 1);
    }
}
