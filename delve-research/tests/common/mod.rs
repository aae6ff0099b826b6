//! Test doubles for research integration tests
//!
//! `StubSearchProvider` returns deterministic documents per query and can fail or
//! cancel on demand. `ScriptedCompletion` answers every call site by schema name,
//! naming root queries `root-<n>` so that branches can be traced through URLs.

#![allow(dead_code)]

use async_trait::async_trait;
use delve_core::{
    completion_error, provider_error, CancellationToken, CompletionOutput, CompletionRequest,
    CompletionService, DelveResult, SearchProvider, SearchProviderKind, SourceDocument,
};
use delve_research::prompts::{
    ANSWER_SCHEMA, CLARIFY_SCHEMA, EXTRACTION_SCHEMA, QUERIES_SCHEMA, REPORT_SCHEMA,
};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

static TRACING: LazyLock<()> = LazyLock::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(std::io::sink)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    }
});

pub fn init_tracing() {
    LazyLock::force(&TRACING);
}

/// Index of the root branch a query belongs to, from its `root-<n>` label
pub fn root_index(text: &str) -> Option<usize> {
    static ROOT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"root-(\d+)").unwrap());
    ROOT.captures(text).and_then(|c| c[1].parse().ok())
}

fn slug(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Never,
    Always,
    /// Queries of odd-indexed root branches fail
    OddBranches,
    /// The first attempt of every query fails with a retryable error
    FirstAttempt,
}

pub struct StubSearchProvider {
    fail: FailMode,
    delay: Option<Duration>,
    cancel_on_call: Option<(usize, CancellationToken)>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl StubSearchProvider {
    pub fn new() -> Self {
        Self {
            fail: FailMode::Never,
            delay: None,
            cancel_on_call: None,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, fail: FailMode) -> Self {
        self.fail = fail;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Cancel `token` when the `call`-th search (1-based) starts
    pub fn cancel_on_call(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_on_call = Some((call, token));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchProvider for StubSearchProvider {
    fn kind(&self) -> SearchProviderKind {
        SearchProviderKind::Local
    }

    async fn search(&self, query: &str, limit: usize) -> DelveResult<Vec<SourceDocument>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let seen_before = {
            let mut queries = self.queries.lock().unwrap();
            let seen = queries.iter().any(|q| q == query);
            queries.push(query.to_string());
            seen
        };

        if let Some((at, token)) = &self.cancel_on_call {
            if call == *at {
                token.cancel();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fails = match self.fail {
            FailMode::Never => false,
            FailMode::Always => true,
            FailMode::OddBranches => root_index(query).is_some_and(|i| i % 2 == 1),
            FailMode::FirstAttempt => {
                if !seen_before {
                    return Err(provider_error!("stub hiccup", "stub", true));
                }
                false
            }
        };
        if fails {
            return Err(provider_error!("stub outage", "stub", false));
        }

        let host = slug(query);
        Ok((1..=limit)
            .map(|k| {
                SourceDocument::new(
                    format!("https://{}.test/doc-{}", host, k),
                    format!("Document {} for {}", k, query),
                    format!("Content {} about {}", k, query),
                    SearchProviderKind::Local,
                )
            })
            .collect())
    }
}

/// Deterministic completion service keyed by schema name
pub struct ScriptedCompletion {
    failing: HashSet<&'static str>,
    calls: Mutex<HashMap<String, usize>>,
    prompts: Mutex<Vec<(String, String)>>,
    report: String,
    answer: String,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            calls: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            report: "# Findings\n\nThe branches agree [1]. Unrelated [99].\n\
                     See https://invented.example/page for more.\n\n## Sources\n- made up"
                .to_string(),
            answer: "Short answer [1] from https://invented.example/x.".to_string(),
        }
    }

    /// Every call for `schema` fails with a non-retryable completion error
    pub fn failing(mut self, schema: &'static str) -> Self {
        self.failing.insert(schema);
        self
    }

    pub fn with_report(mut self, report: &str) -> Self {
        self.report = report.to_string();
        self
    }

    pub fn calls(&self, schema: &str) -> usize {
        self.calls.lock().unwrap().get(schema).copied().unwrap_or(0)
    }

    /// Prompts received for `schema`, in arrival order
    pub fn prompts(&self, schema: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == schema)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    fn queries(&self, request: &CompletionRequest) -> Value {
        let count = request
            .schema
            .as_ref()
            .and_then(|s| s.schema["properties"]["queries"]["maxItems"].as_u64())
            .unwrap_or(1) as usize;

        let queries: Vec<Value> = if request.prompt.contains("Previous research goal:") {
            let branch = root_index(&request.prompt).unwrap_or(0);
            (0..count)
                .map(|_| {
                    let text = format!("root-{} branch {}", branch, uuid::Uuid::new_v4().simple());
                    json!({ "query": text, "researchGoal": format!("explore {}", text) })
                })
                .collect()
        } else {
            (0..count)
                .map(|i| json!({ "query": format!("root-{}", i), "researchGoal": format!("explore root-{}", i) }))
                .collect()
        };
        json!({ "queries": queries })
    }

    fn extraction(&self, request: &CompletionRequest) -> Value {
        static QUERY: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"<query>(.*?)</query>").unwrap());
        let query = QUERY
            .captures(&request.prompt)
            .map(|c| c[1].to_string())
            .unwrap_or_default();
        let documents = request.prompt.matches("<content id=").count();

        let learnings: Vec<Value> = (1..=documents)
            .map(|k| json!({ "learning": format!("fact {} about {}", k, query), "sources": [k] }))
            .collect();
        json!({
            "learnings": learnings,
            "followUpQuestions": [format!("what else about {}?", query)]
        })
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> DelveResult<CompletionOutput> {
        let schema = request.schema_name().unwrap_or("text").to_string();
        *self.calls.lock().unwrap().entry(schema.clone()).or_insert(0) += 1;
        self.prompts
            .lock()
            .unwrap()
            .push((schema.clone(), request.prompt.clone()));

        if self.failing.contains(schema.as_str()) {
            return Err(completion_error!("scripted failure", schema.as_str()));
        }

        let value = match schema.as_str() {
            QUERIES_SCHEMA => self.queries(request),
            EXTRACTION_SCHEMA => self.extraction(request),
            REPORT_SCHEMA => json!({ "reportMarkdown": self.report }),
            ANSWER_SCHEMA => json!({ "exactAnswer": self.answer }),
            CLARIFY_SCHEMA => json!({ "questions": ["Which period?", "Which region?", "", "Why?"] }),
            _ => return Ok(CompletionOutput::Text("plain text".to_string())),
        };
        Ok(CompletionOutput::Structured(value))
    }
}

/// Replays canned structured replies in order
pub struct ReplayCompletion {
    replies: Mutex<VecDeque<DelveResult<Value>>>,
    prompts: Mutex<Vec<String>>,
}

impl ReplayCompletion {
    pub fn new(replies: Vec<DelveResult<Value>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ReplayCompletion {
    fn model(&self) -> &str {
        "replay"
    }

    async fn complete(&self, request: &CompletionRequest) -> DelveResult<CompletionOutput> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        match self.replies.lock().unwrap().pop_front() {
            Some(reply) => reply.map(CompletionOutput::Structured),
            None => Ok(CompletionOutput::Structured(json!({ "queries": [] }))),
        }
    }
}
