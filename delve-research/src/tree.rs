//! Research tree shape and bookkeeping
//!
//! The arithmetic here is synchronous and never awaits: a node with breadth `b`
//! may spawn at most `max(1, b / 2)` children, each with one less level of depth.

use crate::types::{NodeStatus, ResearchQuery};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Breadth passed to the children of a node with breadth `breadth`
pub fn child_breadth(breadth: usize) -> usize {
    (breadth / 2).max(1)
}

/// Queries per parent at `level` (0 is the first level under the topic)
pub fn level_width(breadth: usize, level: usize) -> usize {
    let shift = u32::try_from(level).unwrap_or(u32::MAX);
    breadth.checked_shr(shift).unwrap_or(0).max(1)
}

/// Upper bound on the number of query nodes for a run
pub fn max_nodes(breadth: usize, depth: usize) -> usize {
    if breadth == 0 {
        return 0;
    }
    let mut total = 0usize;
    let mut at_level = 1usize;
    for level in 0..=depth {
        at_level = at_level.saturating_mul(level_width(breadth, level));
        total = total.saturating_add(at_level);
    }
    total
}

/// One query node of the tree
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub query: String,
    pub research_goal: String,
    pub depth: usize,
    pub breadth: usize,
    /// Distance from the first level
    pub level: usize,
    pub status: NodeStatus,
    pub children: Vec<Uuid>,
    pub findings_added: usize,
    pub documents_added: usize,
    /// Why the node failed or was truncated
    pub note: Option<String>,
}

/// The topic with its query nodes
#[derive(Debug, Clone, Serialize)]
pub struct ResearchTree {
    pub topic: String,
    roots: Vec<Uuid>,
    nodes: Vec<TreeNode>,
    #[serde(skip)]
    index: HashMap<Uuid, usize>,
}

impl ResearchTree {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            roots: Vec::new(),
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a query as a pending node under its parent
    pub fn insert(&mut self, query: &ResearchQuery) {
        if self.index.contains_key(&query.id) {
            return;
        }

        let parent_position = query.parent_id.and_then(|p| self.index.get(&p).copied());
        let level = parent_position
            .map(|p| self.nodes[p].level + 1)
            .unwrap_or(0);

        match parent_position {
            Some(p) => self.nodes[p].children.push(query.id),
            None => self.roots.push(query.id),
        }

        self.index.insert(query.id, self.nodes.len());
        self.nodes.push(TreeNode {
            id: query.id,
            parent_id: query.parent_id,
            query: query.text.clone(),
            research_goal: query.research_goal.clone(),
            depth: query.depth,
            breadth: query.breadth,
            level,
            status: NodeStatus::Pending,
            children: Vec::new(),
            findings_added: 0,
            documents_added: 0,
            note: None,
        });
    }

    fn node_mut(&mut self, id: Uuid) -> Option<&mut TreeNode> {
        let position = *self.index.get(&id)?;
        self.nodes.get_mut(position)
    }

    pub fn set_status(&mut self, id: Uuid, status: NodeStatus) {
        if let Some(node) = self.node_mut(id) {
            node.status = status;
        }
    }

    /// Record the result of a finished node
    pub fn finish(
        &mut self,
        id: Uuid,
        status: NodeStatus,
        findings_added: usize,
        documents_added: usize,
        note: Option<String>,
    ) {
        if let Some(node) = self.node_mut(id) {
            node.status = status;
            node.findings_added = findings_added;
            node.documents_added = documents_added;
            node.note = note;
        }
    }

    pub fn node(&self, id: Uuid) -> Option<&TreeNode> {
        self.index.get(&id).and_then(|p| self.nodes.get(*p))
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn roots(&self) -> impl Iterator<Item = &TreeNode> {
        self.roots.iter().filter_map(|id| self.node(*id))
    }

    pub fn children(&self, id: Uuid) -> Vec<&TreeNode> {
        self.node(id)
            .map(|n| n.children.iter().filter_map(|c| self.node(*c)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes per level
    pub fn level_counts(&self) -> Vec<usize> {
        let mut counts = Vec::new();
        for node in &self.nodes {
            if counts.len() <= node.level {
                counts.resize(node.level + 1, 0);
            }
            counts[node.level] += 1;
        }
        counts
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Indented outline of the tree with node statuses
    pub fn outline(&self) -> String {
        let mut out = format!("{}\n", self.topic);
        for root in &self.roots {
            self.outline_node(*root, 1, &mut out);
        }
        out
    }

    fn outline_node(&self, id: Uuid, indent: usize, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        out.push_str(&format!(
            "{}- [{}] {} ({} findings)\n",
            "  ".repeat(indent),
            node.status,
            node.query,
            node.findings_added
        ));
        for child in &node.children {
            self.outline_node(*child, indent + 1, out);
        }
    }
}
