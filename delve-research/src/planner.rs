//! Query planning: initial sub-queries, follow-ups and clarifying questions

use crate::prompts::{self, ClarifyingQuestions, QueryList};
use crate::types::{PlannedQuery, ResearchQuery};
use delve_core::text::{text_similarity, tokenize};
use delve_core::{
    generation_error, CancellationToken, CompletionRequest, CompletionService, DelveError,
    DelveResult, RetryPolicy,
};
use delve_llm::complete_with_repair;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Produces distinct search queries for a topic or a node's knowledge gaps
pub struct QueryPlanner {
    completion: Arc<dyn CompletionService>,
    retry: RetryPolicy,
    similarity_threshold: f64,
}

impl QueryPlanner {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        retry: RetryPolicy,
        similarity_threshold: f64,
    ) -> Self {
        Self {
            completion,
            retry,
            similarity_threshold,
        }
    }

    /// Generate up to `breadth` distinct queries for the topic.
    ///
    /// Any failure here is fatal for the run and reported as a generation error.
    pub async fn generate_queries(
        &self,
        topic: &str,
        breadth: usize,
        context: &[String],
        cancel: &CancellationToken,
    ) -> DelveResult<Vec<PlannedQuery>> {
        info!(topic = %topic, breadth = breadth, "Planning research queries");

        self.plan(topic, breadth, context, &[], cancel)
            .await
            .map_err(|e| match e {
                DelveError::Generation { .. } => e,
                other => generation_error!(
                    format!("Initial query generation failed: {}", other),
                    "query_planner"
                ),
            })
    }

    /// Generate up to `child_breadth` follow-up queries below `parent`.
    ///
    /// One completion call covers every gap of the node. Queries that repeat the
    /// parent are dropped.
    pub async fn generate_followups(
        &self,
        parent: &ResearchQuery,
        gaps: &[String],
        learnings: &[String],
        child_breadth: usize,
        cancel: &CancellationToken,
    ) -> DelveResult<Vec<PlannedQuery>> {
        let topic = prompts::followup_topic(parent, gaps);
        debug!(
            parent = %parent.text,
            gaps = gaps.len(),
            child_breadth = child_breadth,
            "Planning follow-up queries"
        );
        self.plan(
            &topic,
            child_breadth,
            learnings,
            std::slice::from_ref(&parent.text),
            cancel,
        )
        .await
    }

    /// Ask the model for questions that sharpen the research direction
    pub async fn clarifying_questions(
        &self,
        topic: &str,
        count: usize,
        cancel: &CancellationToken,
    ) -> DelveResult<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let request = prompts::clarifying_questions(topic, count);
        let reply: ClarifyingQuestions =
            complete_with_repair(self.completion.as_ref(), &request, &self.retry, cancel).await?;

        Ok(reply
            .questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .take(count)
            .collect())
    }

    /// Combine the topic with clarifying questions and the user's answer
    pub fn compose_research_prompt(topic: &str, questions: &[String], answer: &str) -> String {
        let mut sections = vec![format!("Initial query:\n{}", topic.trim())];

        if !questions.is_empty() {
            let listed = questions
                .iter()
                .enumerate()
                .map(|(i, q)| format!("{}. {}", i + 1, q))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Follow-up questions:\n{}", listed));
        }

        let answer = answer.trim();
        sections.push(format!(
            "Follow-up answers:\n{}",
            if answer.is_empty() { "none" } else { answer }
        ));

        sections.join("\n\n")
    }

    async fn plan(
        &self,
        topic: &str,
        count: usize,
        context: &[String],
        avoid: &[String],
        cancel: &CancellationToken,
    ) -> DelveResult<Vec<PlannedQuery>> {
        let count = count.max(1);
        let request = prompts::query_generation(topic, count, context);
        let first = self.request_queries(&request, cancel).await?;

        let mut accepted = Vec::new();
        self.accept(first, avoid, &mut accepted);

        if accepted.len() < count && !cancel.is_cancelled() {
            let missing = count - accepted.len();
            debug!(
                accepted = accepted.len(),
                missing = missing,
                "Planner came back short, asking once more"
            );
            let retry = prompts::query_generation_retry(topic, missing, &accepted, context);
            match self.request_queries(&retry, cancel).await {
                Ok(more) => self.accept(more, avoid, &mut accepted),
                Err(e) => warn!(error = %e, "Second planning attempt failed"),
            }
        }

        accepted.truncate(count);

        if accepted.is_empty() {
            return Err(generation_error!(
                "Planner produced no usable queries",
                "query_planner"
            ));
        }

        Ok(accepted)
    }

    async fn request_queries(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> DelveResult<Vec<PlannedQuery>> {
        let list: QueryList =
            complete_with_repair(self.completion.as_ref(), request, &self.retry, cancel).await?;
        Ok(list.queries)
    }

    /// Append candidates that are neither blank nor near duplicates
    fn accept(&self, candidates: Vec<PlannedQuery>, avoid: &[String], accepted: &mut Vec<PlannedQuery>) {
        for mut candidate in candidates {
            candidate.query = candidate.query.trim().to_string();
            if tokenize(&candidate.query).is_empty() {
                continue;
            }

            let similar = avoid
                .iter()
                .map(String::as_str)
                .chain(accepted.iter().map(|q| q.query.as_str()))
                .any(|existing| text_similarity(existing, &candidate.query) >= self.similarity_threshold);

            if similar {
                debug!(query = %candidate.query, "Dropping near-duplicate query");
                continue;
            }
            accepted.push(candidate);
        }
    }
}
