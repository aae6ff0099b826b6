//! A single research node: search, extract, plan follow-ups

use crate::aggregator::{FactAggregator, MergeReport};
use crate::planner::QueryPlanner;
use crate::prompts::{self, Extraction};
use crate::tree::child_breadth;
use crate::types::{NodeStatus, ResearchQuery};
use delve_core::{
    retry_cancellable, BranchFailure, CancellationToken, CompletionService, DelveError, Finding,
    RetryPolicy, SearchProvider, SourceDocument,
};
use delve_llm::complete_with_repair;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

/// Collaborators shared by every node of a run
pub struct NodeContext {
    pub search: Arc<dyn SearchProvider>,
    pub completion: Arc<dyn CompletionService>,
    pub planner: Arc<QueryPlanner>,
    pub aggregator: Arc<FactAggregator>,
    pub search_retry: RetryPolicy,
    pub completion_retry: RetryPolicy,
    /// Documents requested per search; the node's breadth when unset
    pub search_limit: Option<usize>,
    pub cancel: CancellationToken,
}

/// What a finished node hands back to the scheduler
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub query: ResearchQuery,
    pub status: NodeStatus,
    /// Follow-up queries to schedule, one level deeper
    pub children: Vec<ResearchQuery>,
    pub report: MergeReport,
    pub failure: Option<BranchFailure>,
    pub note: Option<String>,
}

impl NodeOutcome {
    fn new(query: ResearchQuery, status: NodeStatus) -> Self {
        Self {
            query,
            status,
            children: Vec::new(),
            report: MergeReport::default(),
            failure: None,
            note: None,
        }
    }

    fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

pub struct ResearchNode;

impl ResearchNode {
    /// Run one query node to completion. Never fails: problems are reflected in
    /// the returned status so that siblings keep going.
    pub async fn execute(context: Arc<NodeContext>, query: ResearchQuery) -> NodeOutcome {
        let span = info_span!(
            "research_node",
            query_id = %query.id,
            depth = query.depth,
            breadth = query.breadth
        );
        Self::run(&context, query).instrument(span).await
    }

    async fn run(context: &NodeContext, query: ResearchQuery) -> NodeOutcome {
        let cancel = &context.cancel;
        if cancel.is_cancelled() {
            return NodeOutcome::new(query, NodeStatus::Skipped);
        }

        let limit = context.search_limit.unwrap_or(query.breadth).max(1);
        let search = context.search.as_ref();
        let text = query.text.as_str();
        let documents = match retry_cancellable(&context.search_retry, "search", cancel, || {
            search.search(text, limit)
        })
        .await
        {
            Ok(documents) => documents,
            Err(e) => {
                warn!(query = %query.text, error = %e, "Search failed, excluding branch");
                let failure = BranchFailure {
                    query_id: query.id,
                    query: query.text.clone(),
                    depth: query.depth,
                    reason: e.to_string(),
                };
                let mut outcome =
                    NodeOutcome::new(query, NodeStatus::Failed).with_note(e.to_string());
                outcome.failure = Some(failure);
                return outcome;
            }
        };

        if documents.is_empty() {
            debug!(query = %query.text, "No search results");
            return NodeOutcome::new(query, NodeStatus::Completed).with_note("no search results");
        }

        if cancel.is_cancelled() {
            return NodeOutcome::new(query, NodeStatus::Truncated)
                .with_note("cancelled before extraction");
        }

        let gap_budget = child_breadth(query.breadth);
        let request = prompts::extraction(&query, &documents, query.breadth.max(1), gap_budget);
        let extraction: Extraction = match complete_with_repair(
            context.completion.as_ref(),
            &request,
            &context.completion_retry,
            cancel,
        )
        .await
        {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!(query = %query.text, error = %e, "Extraction failed, truncating branch");
                return NodeOutcome::new(query, NodeStatus::Truncated).with_note(e.to_string());
            }
        };

        let findings = build_findings(&query, &extraction, &documents);
        let learnings: Vec<String> = findings.iter().map(|f| f.text.clone()).collect();
        let report = context.aggregator.merge(findings, documents).await;

        let gaps: Vec<String> = extraction
            .follow_up_questions
            .iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();

        let mut outcome = NodeOutcome::new(query, NodeStatus::Completed);
        outcome.report = report;

        if outcome.query.depth == 0 || gaps.is_empty() {
            return outcome;
        }

        if cancel.is_cancelled() {
            outcome.status = NodeStatus::Truncated;
            return outcome.with_note("cancelled before follow-up planning");
        }

        // Follow-ups see everything learned on the path from the root
        let mut path_learnings = outcome.query.inherited_learnings.as_ref().clone();
        for learning in learnings {
            if !path_learnings.contains(&learning) {
                path_learnings.push(learning);
            }
        }

        let planned = context
            .planner
            .generate_followups(&outcome.query, &gaps, &path_learnings, gap_budget, cancel)
            .await;

        match planned {
            Ok(_) if cancel.is_cancelled() => {
                outcome.status = NodeStatus::Truncated;
                outcome.with_note("cancelled during follow-up planning")
            }
            Ok(planned) => {
                let inherited = Arc::new(path_learnings);
                outcome.children = planned
                    .into_iter()
                    .take(gap_budget)
                    .map(|p| {
                        outcome
                            .query
                            .child(p, gap_budget)
                            .with_inherited_learnings(inherited.clone())
                    })
                    .collect();
                debug!(children = outcome.children.len(), "Scheduled follow-ups");
                outcome
            }
            Err(DelveError::Generation { message, .. }) => {
                debug!(reason = %message, "No follow-ups, node is a leaf");
                outcome.with_note(message)
            }
            Err(e) => {
                warn!(error = %e, "Follow-up planning failed, truncating branch");
                outcome.status = NodeStatus::Truncated;
                outcome.with_note(e.to_string())
            }
        }
    }
}

/// Turn extracted learnings into findings with document provenance.
///
/// Document numbers are 1-based; a learning without any valid number is
/// attributed to every document of the node.
fn build_findings(
    query: &ResearchQuery,
    extraction: &Extraction,
    documents: &[SourceDocument],
) -> Vec<Finding> {
    extraction
        .learnings
        .iter()
        .filter_map(|learning| {
            let text = learning.text().trim();
            if text.is_empty() {
                return None;
            }

            let mut sources: Vec<String> = Vec::new();
            for n in learning.sources() {
                if let Some(doc) = n.checked_sub(1).and_then(|i| documents.get(i)) {
                    if !sources.contains(&doc.url) {
                        sources.push(doc.url.clone());
                    }
                }
            }
            if sources.is_empty() {
                sources = documents.iter().map(|d| d.url.clone()).collect();
            }

            Some(Finding::new(
                text,
                sources,
                query.id,
                query.text.clone(),
                query.depth,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlannedQuery;
    use delve_core::SearchProviderKind;
    use serde_json::json;

    #[test]
    fn test_findings_resolve_document_numbers() {
        let query = ResearchQuery::root(PlannedQuery::new("q", ""), 1, 2);
        let documents = vec![
            SourceDocument::new("https://a.test", "A", "a", SearchProviderKind::Local),
            SourceDocument::new("https://b.test", "B", "b", SearchProviderKind::Local),
        ];
        let extraction: Extraction = serde_json::from_value(json!({
            "learnings": [
                { "learning": "from b", "sources": [2, 2, 9] },
                { "learning": "unattributed", "sources": [0] },
                "   ",
                "plain"
            ],
            "followUpQuestions": []
        }))
        .unwrap();

        let findings = build_findings(&query, &extraction, &documents);
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].sources, vec!["https://b.test"]);
        assert_eq!(findings[1].sources.len(), 2);
        assert_eq!(findings[2].sources.len(), 2);
        assert!(findings.iter().all(|f| f.query_id == query.id && f.depth == 1));
    }
}
