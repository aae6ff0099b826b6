//! Fan-out/fan-in scheduler over the research tree
//!
//! Queries wait in a FIFO queue and run with a bounded number in flight. Each
//! finished node merges its findings and pushes its follow-ups to the back of the
//! queue, so the tree is processed in level order.

use crate::aggregator::FactAggregator;
use crate::node::{NodeContext, ResearchNode};
use crate::planner::QueryPlanner;
use crate::progress::ProgressReporter;
use crate::tree::ResearchTree;
use crate::types::{
    NodeStatus, ResearchOutcome, ResearchProgress, ResearchQuery, ResearchStatus,
};
use delve_core::{
    CancellationToken, CompletionService, DelveConfig, DelveError, DelveResult, ErrorContext,
    RetryPolicy, SearchProvider,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Knobs of one research run
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub breadth: usize,
    pub depth: usize,
    /// Maximum nodes in flight
    pub concurrency: usize,
    /// Overall deadline; trips the run's cancellation token
    pub timeout: Option<Duration>,
    pub search_limit: Option<usize>,
    pub query_similarity_threshold: f64,
    pub fact_similarity_threshold: Option<f64>,
    pub search_retry: RetryPolicy,
    pub completion_retry: RetryPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &DelveConfig) -> Self {
        let research = &config.research;
        Self {
            breadth: research.breadth,
            depth: research.depth,
            concurrency: research.concurrency,
            timeout: research.timeout_secs.map(Duration::from_secs),
            search_limit: research.search_limit,
            query_similarity_threshold: research.query_similarity_threshold,
            fact_similarity_threshold: research.fact_similarity_threshold,
            search_retry: config.search.retry.clone(),
            completion_retry: config.llm.retry.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&DelveConfig::default())
    }
}

/// Drives a topic through the research tree
pub struct ResearchEngine {
    search: Arc<dyn SearchProvider>,
    completion: Arc<dyn CompletionService>,
    settings: EngineSettings,
}

impl ResearchEngine {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        completion: Arc<dyn CompletionService>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            search,
            completion,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn planner(&self) -> QueryPlanner {
        QueryPlanner::new(
            self.completion.clone(),
            self.settings.completion_retry.clone(),
            self.settings.query_similarity_threshold,
        )
    }

    /// Research a topic until the tree is exhausted or `cancel` fires.
    ///
    /// A cancelled run still returns the partial state with status `Cancelled`.
    /// Fails with a generation error when initial planning fails and with
    /// `ResearchFailed` when every root branch failed.
    pub async fn run(
        &self,
        topic: &str,
        cancel: CancellationToken,
        progress: Option<ProgressReporter>,
    ) -> DelveResult<ResearchOutcome> {
        let token = cancel.child_token();

        let timer = self.settings.timeout.map(|limit| {
            let timer_token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(timeout_secs = limit.as_secs(), "Research timeout reached, cancelling");
                timer_token.cancel();
            })
        });

        let result = self.drive(topic, token, progress).await;

        if let Some(handle) = timer {
            handle.abort();
        }
        result
    }

    async fn drive(
        &self,
        topic: &str,
        token: CancellationToken,
        progress: Option<ProgressReporter>,
    ) -> DelveResult<ResearchOutcome> {
        let session_id = Uuid::new_v4();
        let started = Instant::now();
        let settings = &self.settings;

        info!(
            session_id = %session_id,
            breadth = settings.breadth,
            depth = settings.depth,
            concurrency = settings.concurrency,
            "Starting research"
        );

        let aggregator = Arc::new(FactAggregator::new(settings.fact_similarity_threshold));
        let planner = Arc::new(self.planner());
        let mut tree = ResearchTree::new(topic);

        if token.is_cancelled() {
            info!(session_id = %session_id, "Cancelled before planning");
            return Ok(ResearchOutcome {
                session_id,
                topic: topic.to_string(),
                snapshot: aggregator.snapshot().await,
                tree,
                failures: Vec::new(),
                status: ResearchStatus::Cancelled,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let planned = match planner
            .generate_queries(topic, settings.breadth, &[], &token)
            .await
        {
            Ok(planned) => planned,
            Err(_) if token.is_cancelled() => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut queue: VecDeque<ResearchQuery> = planned
            .into_iter()
            .map(|p| ResearchQuery::root(p, settings.depth, settings.breadth))
            .collect();
        for query in &queue {
            tree.insert(query);
        }

        let context = Arc::new(NodeContext {
            search: self.search.clone(),
            completion: self.completion.clone(),
            planner,
            aggregator: aggregator.clone(),
            search_retry: settings.search_retry.clone(),
            completion_retry: settings.completion_retry.clone(),
            search_limit: settings.search_limit,
            cancel: token.clone(),
        });

        let concurrency = settings.concurrency.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut failures = Vec::new();
        let mut completed_nodes = 0usize;

        loop {
            while in_flight.len() < concurrency && !token.is_cancelled() {
                match queue.pop_front() {
                    Some(query) => in_flight.push(ResearchNode::execute(context.clone(), query)),
                    None => break,
                }
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };

            completed_nodes += 1;
            let id = outcome.query.id;
            debug!(
                query = %outcome.query.text,
                status = %outcome.status,
                added = outcome.report.added,
                children = outcome.children.len(),
                "Node finished"
            );

            tree.finish(
                id,
                outcome.status,
                outcome.report.added,
                outcome.report.documents_added,
                outcome.note,
            );
            if let Some(failure) = outcome.failure {
                failures.push(failure);
            }
            for child in outcome.children {
                tree.insert(&child);
                queue.push_back(child);
            }

            if let Some(reporter) = &progress {
                reporter.report(ResearchProgress {
                    query_id: id,
                    query: outcome.query.text,
                    depth: outcome.query.depth,
                    status: outcome.status,
                    completed_nodes,
                    total_nodes: tree.len(),
                    findings_total: aggregator.len().await,
                    documents_total: aggregator.document_count().await,
                });
            }
        }

        for query in queue.drain(..) {
            tree.set_status(query.id, NodeStatus::Skipped);
        }

        let snapshot = aggregator.snapshot().await;
        let cancelled = token.is_cancelled();
        let duration_ms = started.elapsed().as_millis() as u64;

        let roots_total = tree.roots().count();
        let roots_failed = tree
            .roots()
            .filter(|n| n.status == NodeStatus::Failed)
            .count();
        if !cancelled && roots_total > 0 && roots_failed == roots_total {
            return Err(DelveError::ResearchFailed {
                message: format!("All {} root branches failed", roots_total),
                failures,
                snapshot: Box::new(snapshot),
                context: ErrorContext::new("research_engine")
                    .with_operation("run")
                    .with_suggestion("Check the search provider credentials and connectivity"),
            });
        }

        info!(
            session_id = %session_id,
            nodes = tree.len(),
            findings = snapshot.findings.len(),
            documents = snapshot.documents.len(),
            failed = failures.len(),
            skipped = tree.count(NodeStatus::Skipped),
            cancelled = cancelled,
            duration_ms = duration_ms,
            "Research finished"
        );

        Ok(ResearchOutcome {
            session_id,
            topic: topic.to_string(),
            snapshot,
            tree,
            failures,
            status: if cancelled {
                ResearchStatus::Cancelled
            } else {
                ResearchStatus::Completed
            },
            duration_ms,
        })
    }
}
