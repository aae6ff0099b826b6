//! Final report and answer synthesis
//!
//! Model output is never trusted with citations: links and bare URLs that do not
//! belong to the snapshot are stripped, `[n]` markers outside the source catalog
//! are removed, and the `## Sources` section is always rendered here.

use crate::prompts::{self, AnswerDraft, ReportDraft};
use chrono::Utc;
use delve_core::text::normalize_url;
use delve_core::{
    CancellationToken, CompletionService, DelveResult, Finding, OutputMode, ReportArtifact,
    ResearchSnapshot, RetryPolicy, SourceDocument,
};
use delve_llm::complete_with_repair;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Findings handed to the model in answer mode
const ANSWER_FINDINGS: usize = 10;
/// Findings joined by the deterministic answer fallback
const FALLBACK_ANSWER_FINDINGS: usize = 3;

static LINK_REGEX: OnceLock<Regex> = OnceLock::new();
static URL_REGEX: OnceLock<Regex> = OnceLock::new();
static MARKER_REGEX: OnceLock<Regex> = OnceLock::new();
static SOURCES_HEADING_REGEX: OnceLock<Regex> = OnceLock::new();

fn link_regex() -> &'static Regex {
    LINK_REGEX.get_or_init(|| Regex::new(r"(?i)\[([^\]]*)\]\((https?://[^)\s]+)\)").unwrap())
}

fn url_regex() -> &'static Regex {
    URL_REGEX.get_or_init(|| Regex::new(r"(?i)https?://[^\s)\]>]+").unwrap())
}

fn marker_regex() -> &'static Regex {
    MARKER_REGEX.get_or_init(|| Regex::new(r"\[(\d+(?:\s*,\s*\d+)*)\]").unwrap())
}

fn sources_heading_regex() -> &'static Regex {
    SOURCES_HEADING_REGEX.get_or_init(|| {
        Regex::new(r"(?im)^\s*#{1,6}\s*(sources|references|citations|bibliography)\s*:?\s*$")
            .unwrap()
    })
}

/// Numbered documents a report may cite
struct SourceCatalog<'a> {
    entries: Vec<&'a SourceDocument>,
    numbers: HashMap<String, usize>,
}

impl<'a> SourceCatalog<'a> {
    /// Documents backing at least one finding; every document when none is cited
    fn build(snapshot: &'a ResearchSnapshot) -> Self {
        let cited = snapshot.cited_urls();
        let entries: Vec<&SourceDocument> = if cited.is_empty() {
            snapshot.documents.iter().collect()
        } else {
            cited
                .iter()
                .filter_map(|url| snapshot.document(url))
                .collect()
        };
        let numbers = entries
            .iter()
            .enumerate()
            .map(|(i, d)| (d.key(), i + 1))
            .collect();
        Self { entries, numbers }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn number(&self, url: &str) -> Option<usize> {
        self.numbers.get(&normalize_url(url)).copied()
    }

    fn markers(&self, finding: &Finding) -> String {
        let mut numbers: Vec<usize> = finding.sources.iter().filter_map(|s| self.number(s)).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers.iter().map(|n| format!("[{}]", n)).collect()
    }

    fn numbered(&self) -> Vec<(usize, &'a SourceDocument)> {
        self.entries.iter().enumerate().map(|(i, d)| (i + 1, *d)).collect()
    }
}

/// Turns a snapshot into the session's final artifact
pub struct ReportSynthesizer {
    completion: Arc<dyn CompletionService>,
    retry: RetryPolicy,
}

impl ReportSynthesizer {
    pub fn new(completion: Arc<dyn CompletionService>, retry: RetryPolicy) -> Self {
        Self { completion, retry }
    }

    /// Produce a cited report or a short answer from the snapshot.
    ///
    /// Every URL in the artifact belongs to the snapshot. An empty snapshot yields a
    /// fixed "no findings" artifact without calling the model; a failing model
    /// yields a deterministic rendering of the findings.
    pub async fn synthesize(
        &self,
        topic: &str,
        snapshot: &ResearchSnapshot,
        mode: OutputMode,
        cancel: &CancellationToken,
    ) -> DelveResult<ReportArtifact> {
        info!(
            mode = %mode,
            findings = snapshot.findings.len(),
            documents = snapshot.documents.len(),
            "Synthesizing artifact"
        );

        let (content, citations) = if snapshot.is_empty() {
            (no_findings(topic, mode), Vec::new())
        } else {
            match mode {
                OutputMode::Report => self.report(topic, snapshot, cancel).await,
                OutputMode::Answer => self.answer(topic, snapshot, cancel).await,
            }
        };

        Ok(ReportArtifact {
            mode,
            content,
            citations,
            generated_at: Utc::now(),
            finding_count: snapshot.findings.len(),
        })
    }

    async fn report(
        &self,
        topic: &str,
        snapshot: &ResearchSnapshot,
        cancel: &CancellationToken,
    ) -> (String, Vec<String>) {
        let catalog = SourceCatalog::build(snapshot);
        let findings: Vec<String> = snapshot
            .ranked_findings()
            .into_iter()
            .map(|f| format!("{} {}", f.text, catalog.markers(f)).trim_end().to_string())
            .collect();

        let request = prompts::report(topic, &findings, &catalog.numbered());
        let body = match complete_with_repair::<ReportDraft>(
            self.completion.as_ref(),
            &request,
            &self.retry,
            cancel,
        )
        .await
        {
            Ok(draft) if !draft.report_markdown.trim().is_empty() => {
                sanitize(&draft.report_markdown, snapshot, catalog.len())
            }
            Ok(_) => {
                warn!("Model returned an empty report, using fallback rendering");
                fallback_report(topic, snapshot, &catalog)
            }
            Err(e) => {
                warn!(error = %e, "Report synthesis failed, using fallback rendering");
                fallback_report(topic, snapshot, &catalog)
            }
        };

        let mut cited: Vec<usize> = marker_regex()
            .captures_iter(&body)
            .flat_map(|c| parse_marker(&c[1]))
            .filter(|n| (1..=catalog.len()).contains(n))
            .collect();
        cited.sort_unstable();
        cited.dedup();

        let listed: Vec<(usize, &SourceDocument)> = if cited.is_empty() {
            catalog.numbered()
        } else {
            catalog
                .numbered()
                .into_iter()
                .filter(|(n, _)| cited.contains(n))
                .collect()
        };

        let mut citations: Vec<String> = listed.iter().map(|(_, d)| d.url.clone()).collect();
        for url in linked_urls(&body, snapshot) {
            if !citations.contains(&url) {
                citations.push(url);
            }
        }

        let sources = listed
            .iter()
            .map(|(n, d)| format!("[{}] [{}]({})", n, display_title(d), d.url))
            .collect::<Vec<_>>()
            .join("\n");

        (
            format!("{}\n\n## Sources\n\n{}\n", body.trim_end(), sources),
            citations,
        )
    }

    async fn answer(
        &self,
        topic: &str,
        snapshot: &ResearchSnapshot,
        cancel: &CancellationToken,
    ) -> (String, Vec<String>) {
        let top: Vec<&Finding> = snapshot
            .ranked_findings()
            .into_iter()
            .take(ANSWER_FINDINGS)
            .collect();
        let texts: Vec<String> = top.iter().map(|f| f.text.clone()).collect();

        let request = prompts::answer(topic, &texts);
        let content = match complete_with_repair::<AnswerDraft>(
            self.completion.as_ref(),
            &request,
            &self.retry,
            cancel,
        )
        .await
        {
            Ok(draft) if !draft.exact_answer.trim().is_empty() => {
                one_paragraph(&sanitize(&draft.exact_answer, snapshot, 0))
            }
            Ok(_) => {
                warn!("Model returned an empty answer, using fallback");
                fallback_answer(&top, snapshot)
            }
            Err(e) => {
                warn!(error = %e, "Answer synthesis failed, using fallback");
                fallback_answer(&top, snapshot)
            }
        };

        let mut citations: Vec<String> = Vec::new();
        let mut push = |url: String| {
            if !citations.contains(&url) {
                citations.push(url);
            }
        };
        for finding in &top {
            for source in &finding.sources {
                if let Some(doc) = snapshot.document(source) {
                    push(doc.url.clone());
                }
            }
        }
        for url in linked_urls(&content, snapshot) {
            push(url);
        }

        (content, citations)
    }
}

fn no_findings(topic: &str, mode: OutputMode) -> String {
    match mode {
        OutputMode::Report => format!(
            "# {}\n\nNo findings were gathered for this topic, so there is nothing to report.\n",
            topic.trim()
        ),
        OutputMode::Answer => "No findings were gathered for this topic.".to_string(),
    }
}

fn parse_marker(inner: &str) -> Vec<usize> {
    inner
        .split(',')
        .filter_map(|n| n.trim().parse::<usize>().ok())
        .collect()
}

/// Canonical snapshot URLs that appear in the text
fn linked_urls(text: &str, snapshot: &ResearchSnapshot) -> Vec<String> {
    let mut urls = Vec::new();
    for m in url_regex().find_iter(text) {
        let candidate = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if let Some(doc) = snapshot.document(candidate) {
            if !urls.contains(&doc.url) {
                urls.push(doc.url.clone());
            }
        }
    }
    urls
}

/// Remove everything in model output that does not point into the snapshot.
///
/// `max_marker` is the highest valid `[n]`; zero removes every marker.
fn sanitize(text: &str, snapshot: &ResearchSnapshot, max_marker: usize) -> String {
    let text = match sources_heading_regex().find(text) {
        Some(m) => &text[..m.start()],
        None => text,
    };

    let text = link_regex().replace_all(text, |caps: &Captures| {
        if snapshot.contains_url(&caps[2]) {
            caps[0].to_string()
        } else {
            caps[1].to_string()
        }
    });

    let text = url_regex().replace_all(&text, |caps: &Captures| {
        let raw = &caps[0];
        let candidate = raw.trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if snapshot.contains_url(candidate) {
            raw.to_string()
        } else {
            raw[candidate.len()..].to_string()
        }
    });

    let text = marker_regex().replace_all(&text, |caps: &Captures| {
        let kept: Vec<String> = parse_marker(&caps[1])
            .into_iter()
            .filter(|n| (1..=max_marker).contains(n))
            .map(|n| format!("[{}]", n))
            .collect();
        kept.concat()
    });

    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn one_paragraph(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn display_title(document: &SourceDocument) -> &str {
    if document.title.trim().is_empty() {
        document.url.as_str()
    } else {
        document.title.trim()
    }
}

/// One section per originating query, findings in canonical order.
///
/// Finding text comes from scraped pages, so it is sanitized like model output.
fn fallback_report(topic: &str, snapshot: &ResearchSnapshot, catalog: &SourceCatalog<'_>) -> String {
    let mut by_query: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
    for finding in &snapshot.findings {
        by_query.entry(finding.query.as_str()).or_default().push(finding);
    }

    let mut out = format!("# {}\n", topic.trim());
    for (query, findings) in by_query {
        out.push_str(&format!("\n## {}\n\n", one_paragraph(&sanitize(query, snapshot, 0))));
        for finding in findings {
            let text = one_paragraph(&sanitize(&finding.text, snapshot, 0));
            let line = format!("{} {}", text, catalog.markers(finding));
            let line = line.trim();
            if !line.is_empty() {
                out.push_str(&format!("- {}\n", line));
            }
        }
    }
    out
}

fn fallback_answer(top: &[&Finding], snapshot: &ResearchSnapshot) -> String {
    one_paragraph(
        &top.iter()
            .take(FALLBACK_ANSWER_FINDINGS)
            .map(|f| sanitize(&f.text, snapshot, 0))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_core::SearchProviderKind;
    use uuid::Uuid;

    fn snapshot() -> ResearchSnapshot {
        let docs = vec![
            SourceDocument::new("https://a.test/one", "One", "", SearchProviderKind::Local),
            SourceDocument::new("https://b.test/two", "", "", SearchProviderKind::Local),
        ];
        let findings = vec![
            Finding::new("alpha", vec!["https://a.test/one".into()], Uuid::new_v4(), "q1", 1),
            Finding::new("beta", vec!["https://b.test/two".into()], Uuid::new_v4(), "q2", 0),
        ];
        ResearchSnapshot::new(findings, docs)
    }

    #[test]
    fn test_sanitize_strips_foreign_links_and_markers() {
        let text = "See [one](https://a.test/one) and [evil](https://evil.test/x) [1][7] [2, 9].\n\
                    Bare https://evil.test/y. and https://b.test/two.\n\
                    Loud HTTPS://evil.test/z and [shout](HTTP://evil.test/w) HTTPS://A.TEST/one\n\n\
                    ## References\n- junk";
        let clean = sanitize(text, &snapshot(), 2);

        assert!(clean.contains("[one](https://a.test/one)"));
        assert!(clean.contains("and evil "));
        assert!(!clean.contains("evil.test"));
        assert!(clean.contains("and shout "));
        assert!(clean.contains("HTTPS://A.TEST/one"));
        assert!(clean.contains("[1]"));
        assert!(!clean.contains("[7]"));
        assert!(clean.contains("[2]."));
        assert!(clean.contains("https://b.test/two."));
        assert!(!clean.contains("References"));
        assert!(!clean.contains("junk"));
    }

    #[test]
    fn test_sanitize_with_zero_markers_removes_all() {
        assert_eq!(sanitize("done [1][2]", &snapshot(), 0), "done");
    }

    #[test]
    fn test_catalog_numbers_cited_documents() {
        let snapshot = snapshot();
        let catalog = SourceCatalog::build(&snapshot);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.number("https://b.test/two/"), Some(2));
        assert_eq!(catalog.markers(&snapshot.findings[0]), "[1]");
    }

    #[test]
    fn test_fallback_report_groups_by_query() {
        let snapshot = snapshot();
        let catalog = SourceCatalog::build(&snapshot);
        let report = fallback_report("topic", &snapshot, &catalog);
        assert!(report.starts_with("# topic\n"));
        assert!(report.contains("## q1\n\n- alpha [1]\n"));
        assert!(report.contains("## q2\n\n- beta [2]\n"));
    }

    #[test]
    fn test_fallbacks_strip_urls_from_finding_text() {
        let docs = vec![SourceDocument::new(
            "https://alpha.test/post",
            "Alpha",
            "",
            SearchProviderKind::Local,
        )];
        let findings = vec![Finding::new(
            "Pricing is documented at https://evil.test/pricing and https://alpha.test/post",
            vec!["https://alpha.test/post".into()],
            Uuid::new_v4(),
            "pricing",
            0,
        )];
        let snapshot = ResearchSnapshot::new(findings, docs);
        let catalog = SourceCatalog::build(&snapshot);

        let report = fallback_report("topic", &snapshot, &catalog);
        assert!(!report.contains("evil.test"));
        assert!(report.contains("- Pricing is documented at and https://alpha.test/post [1]\n"));

        let top: Vec<&Finding> = snapshot.findings.iter().collect();
        let answer = fallback_answer(&top, &snapshot);
        assert!(!answer.contains("evil.test"));
        assert!(answer.starts_with("Pricing is documented at"));
    }
}
