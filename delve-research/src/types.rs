//! Types for the deep research engine

use crate::tree::ResearchTree;
use delve_core::{BranchFailure, ResearchSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// A query as produced by the planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedQuery {
    /// Search engine query text
    pub query: String,
    /// What the query is meant to accomplish and where to go next
    #[serde(rename = "researchGoal", alias = "research_goal", default)]
    pub research_goal: String,
}

impl PlannedQuery {
    pub fn new(query: impl Into<String>, research_goal: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            research_goal: research_goal.into(),
        }
    }
}

/// A node of the research tree waiting to be executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchQuery {
    pub id: Uuid,
    pub text: String,
    pub research_goal: String,
    /// Follow-up levels still allowed below this node
    pub depth: usize,
    /// Breadth budget at this level
    pub breadth: usize,
    /// Lookup-only reference to the parent node
    pub parent_id: Option<Uuid>,
    /// Learnings gathered on the path from the root down to the parent
    #[serde(skip)]
    pub inherited_learnings: Arc<Vec<String>>,
}

impl ResearchQuery {
    /// First-level query under the topic
    pub fn root(planned: PlannedQuery, depth: usize, breadth: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: planned.query,
            research_goal: planned.research_goal,
            depth,
            breadth,
            parent_id: None,
            inherited_learnings: Arc::default(),
        }
    }

    /// Follow-up one level below `self`
    pub fn child(&self, planned: PlannedQuery, breadth: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: planned.query,
            research_goal: planned.research_goal,
            depth: self.depth.saturating_sub(1),
            breadth,
            parent_id: Some(self.id),
            inherited_learnings: Arc::default(),
        }
    }

    pub fn with_inherited_learnings(mut self, learnings: Arc<Vec<String>>) -> Self {
        self.inherited_learnings = learnings;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Lifecycle of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Queued, not started
    Pending,
    /// Search and extraction finished
    Completed,
    /// Stopped early; findings merged so far are kept
    Truncated,
    /// Search failed after retries; excluded from aggregation
    Failed,
    /// Never started because the run was cancelled
    Skipped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Completed => write!(f, "completed"),
            NodeStatus::Truncated => write!(f, "truncated"),
            NodeStatus::Failed => write!(f, "failed"),
            NodeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// How the research phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStatus {
    Completed,
    Cancelled,
}

/// Progress event, one per finished node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchProgress {
    pub query_id: Uuid,
    pub query: String,
    pub depth: usize,
    pub status: NodeStatus,
    /// Nodes finished so far, including this one
    pub completed_nodes: usize,
    /// Nodes known so far; grows as follow-ups are planned
    pub total_nodes: usize,
    pub findings_total: usize,
    pub documents_total: usize,
}

/// Result of the research phase
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub session_id: Uuid,
    pub topic: String,
    pub snapshot: ResearchSnapshot,
    pub tree: ResearchTree,
    /// Branches excluded from aggregation
    pub failures: Vec<BranchFailure>,
    pub status: ResearchStatus,
    pub duration_ms: u64,
}

impl ResearchOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.status == ResearchStatus::Cancelled
    }

    /// Which branches were excluded and why, one line each; `None` when none failed
    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let mut out = format!("Excluded {} failed branches:", self.failures.len());
        for failure in &self.failures {
            out.push_str(&format!(
                "\n  - {} (depth {}): {}",
                failure.query, failure.depth, failure.reason
            ));
        }
        Some(out)
    }
}
