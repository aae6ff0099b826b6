//! Recursive deep research engine
//!
//! This crate drives a topic through a tree of search queries:
//! - Plans distinct sub-queries and follow-ups from knowledge gaps
//! - Runs sibling nodes concurrently with breadth halving at every level
//! - Aggregates findings into one deduplicated state
//! - Synthesizes a cited Markdown report or a short answer

pub mod aggregator;
pub mod engine;
pub mod history;
pub mod node;
pub mod planner;
pub mod progress;
pub mod prompts;
pub mod session;
pub mod synthesizer;
pub mod tree;
pub mod types;

pub use aggregator::{FactAggregator, MergeReport, ResearchState};
pub use engine::{EngineSettings, ResearchEngine};
pub use history::{HistoryEntry, ResearchHistory};
pub use planner::QueryPlanner;
pub use progress::ProgressReporter;
pub use session::{DeepResearch, ResearchRun};
pub use synthesizer::ReportSynthesizer;
pub use tree::{child_breadth, level_width, max_nodes, ResearchTree, TreeNode};
pub use types::*;
