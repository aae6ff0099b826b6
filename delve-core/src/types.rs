//! Core data types shared by every delve crate

use crate::error::{DelveError, DelveResult, ErrorContext};
use crate::text::{normalize_text, normalize_url};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A document returned by a search provider. Read-only after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub url: String,
    pub title: String,
    /// Excerpt or markdown body used for extraction
    pub content: String,
    /// Provider that produced the document
    pub provider: SearchProviderKind,
}

impl SourceDocument {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        provider: SearchProviderKind,
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            content: content.into(),
            provider,
        }
    }

    /// Dedup key of the document
    pub fn key(&self) -> String {
        normalize_url(&self.url)
    }
}

/// An extracted fact. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub text: String,
    /// URLs of the documents the fact came from
    pub sources: Vec<String>,
    pub query_id: Uuid,
    pub query: String,
    /// Remaining depth of the originating query
    pub depth: usize,
    pub discovered_at: DateTime<Utc>,
}

impl Finding {
    pub fn new(
        text: impl Into<String>,
        sources: Vec<String>,
        query_id: Uuid,
        query: impl Into<String>,
        depth: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            sources,
            query_id,
            query: query.into(),
            depth,
            discovered_at: Utc::now(),
        }
    }

    /// Dedup key of the finding
    pub fn key(&self) -> String {
        normalize_text(&self.text)
    }
}

/// Immutable, canonically ordered copy of the aggregated research state.
///
/// Findings are sorted by their normalized text and documents by URL so that two
/// snapshots built from the same content compare equal no matter in which order
/// the branches delivered it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchSnapshot {
    pub findings: Vec<Finding>,
    pub documents: Vec<SourceDocument>,
}

impl ResearchSnapshot {
    pub fn new(mut findings: Vec<Finding>, mut documents: Vec<SourceDocument>) -> Self {
        findings.sort_by_cached_key(|f| f.key());
        documents.sort_by(|a, b| a.url.cmp(&b.url));
        Self {
            findings,
            documents,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    /// Normalized fact keys in canonical order
    pub fn fact_keys(&self) -> Vec<String> {
        self.findings.iter().map(|f| f.key()).collect()
    }

    pub fn urls(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.url.as_str()).collect()
    }

    pub fn document(&self, url: &str) -> Option<&SourceDocument> {
        let key = normalize_url(url);
        self.documents.iter().find(|d| d.key() == key)
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.document(url).is_some()
    }

    /// Derive a snapshot without the given document.
    ///
    /// The URL is removed from every finding's provenance and findings that are
    /// left without any source are dropped.
    pub fn without_document(&self, url: &str) -> Self {
        let key = normalize_url(url);
        let documents = self
            .documents
            .iter()
            .filter(|d| d.key() != key)
            .cloned()
            .collect();

        let findings = self
            .findings
            .iter()
            .filter_map(|f| {
                let had_source = f.sources.iter().any(|s| normalize_url(s) == key);
                if !had_source {
                    return Some(f.clone());
                }
                let sources: Vec<String> = f
                    .sources
                    .iter()
                    .filter(|s| normalize_url(s) != key)
                    .cloned()
                    .collect();
                if sources.is_empty() {
                    None
                } else {
                    Some(Finding {
                        sources,
                        ..f.clone()
                    })
                }
            })
            .collect();

        Self::new(findings, documents)
    }

    /// Findings ordered by confidence.
    ///
    /// Confidence is corroboration (distinct sources), then proximity to the root
    /// (larger remaining depth), then canonical text order.
    pub fn ranked_findings(&self) -> Vec<&Finding> {
        let mut ranked: Vec<(usize, &Finding)> = self
            .findings
            .iter()
            .map(|f| {
                let distinct: HashSet<String> = f.sources.iter().map(|s| normalize_url(s)).collect();
                (distinct.len(), f)
            })
            .collect();
        ranked.sort_by(|(a_sources, a), (b_sources, b)| {
            b_sources
                .cmp(a_sources)
                .then_with(|| b.depth.cmp(&a.depth))
                .then_with(|| a.key().cmp(&b.key()))
        });
        ranked.into_iter().map(|(_, f)| f).collect()
    }

    /// Plain fact texts in canonical order
    pub fn learnings(&self) -> Vec<String> {
        self.findings.iter().map(|f| f.text.clone()).collect()
    }

    /// URLs referenced by at least one finding, in canonical document order
    pub fn cited_urls(&self) -> Vec<&str> {
        let cited: BTreeSet<String> = self
            .findings
            .iter()
            .flat_map(|f| f.sources.iter().map(|s| normalize_url(s)))
            .collect();
        self.documents
            .iter()
            .filter(|d| cited.contains(&d.key()))
            .map(|d| d.url.as_str())
            .collect()
    }
}

/// Final artifact shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Report,
    Answer,
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMode::Report => write!(f, "report"),
            OutputMode::Answer => write!(f, "answer"),
        }
    }
}

impl FromStr for OutputMode {
    type Err = DelveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "report" => Ok(OutputMode::Report),
            "answer" => Ok(OutputMode::Answer),
            other => Err(DelveError::Validation {
                message: format!("Unknown output mode: {}", other),
                field: Some("output_mode".to_string()),
                context: ErrorContext::new("types")
                    .with_operation("parse_output_mode")
                    .with_suggestion("Supported modes: report, answer"),
            }),
        }
    }
}

/// Closed set of search backends, chosen once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProviderKind {
    Firecrawl,
    Tavily,
    Local,
}

impl SearchProviderKind {
    pub const ALL: [SearchProviderKind; 3] = [
        SearchProviderKind::Firecrawl,
        SearchProviderKind::Tavily,
        SearchProviderKind::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchProviderKind::Firecrawl => "firecrawl",
            SearchProviderKind::Tavily => "tavily",
            SearchProviderKind::Local => "local",
        }
    }
}

impl fmt::Display for SearchProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchProviderKind {
    type Err = DelveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "firecrawl" => Ok(SearchProviderKind::Firecrawl),
            "tavily" => Ok(SearchProviderKind::Tavily),
            "local" => Ok(SearchProviderKind::Local),
            other => Err(DelveError::UnsupportedProvider {
                provider: other.to_string(),
                context: ErrorContext::new("types")
                    .with_operation("parse_search_provider")
                    .with_suggestion("Supported providers: firecrawl, tavily, local"),
            }),
        }
    }
}

/// JSON schema attached to a structured completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

impl OutputSchema {
    pub fn new(name: &str, schema: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            schema,
        }
    }
}

/// A single request to the completion service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub schema: Option<OutputSchema>,
}

impl CompletionRequest {
    pub fn text(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            schema: None,
        }
    }

    pub fn structured(
        system: impl Into<String>,
        prompt: impl Into<String>,
        schema: OutputSchema,
    ) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            schema: Some(schema),
        }
    }

    /// Name of the requested schema, if any
    pub fn schema_name(&self) -> Option<&str> {
        self.schema.as_ref().map(|s| s.name.as_str())
    }
}

/// Output of the completion service
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutput {
    Text(String),
    Structured(serde_json::Value),
}

/// A research branch excluded from aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFailure {
    pub query_id: Uuid,
    pub query: String,
    pub depth: usize,
    pub reason: String,
}

/// The final text produced for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportArtifact {
    pub mode: OutputMode,
    pub content: String,
    /// Every URL cited by the artifact; all of them belong to the snapshot
    pub citations: Vec<String>,
    pub generated_at: DateTime<Utc>,
    pub finding_count: usize,
}
