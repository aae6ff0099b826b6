mod common;

use common::{init_tracing, ReplayCompletion, ScriptedCompletion};
use delve_core::{completion_error, CancellationToken, DelveError, RetryPolicy};
use delve_research::{PlannedQuery, QueryPlanner, ResearchQuery};
use serde_json::json;
use std::sync::Arc;

fn planner(completion: Arc<ReplayCompletion>) -> QueryPlanner {
    QueryPlanner::new(completion, RetryPolicy::no_retry(), 0.8)
}

fn queries(texts: &[&str]) -> serde_json::Value {
    let list: Vec<_> = texts
        .iter()
        .map(|q| json!({ "query": q, "researchGoal": format!("goal for {}", q) }))
        .collect();
    json!({ "queries": list })
}

#[tokio::test]
async fn test_short_reply_is_retried_once_with_accepted_queries() {
    init_tracing();
    let completion = Arc::new(ReplayCompletion::new(vec![
        Ok(queries(&["rust async runtimes"])),
        Ok(queries(&["tokio scheduler design", "async std history", "smol executor"])),
    ]));

    let planned = planner(completion.clone())
        .generate_queries("rust async", 3, &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(planned.len(), 3);
    assert_eq!(planned[0].query, "rust async runtimes");
    assert_eq!(planned[0].research_goal, "goal for rust async runtimes");

    let prompts = completion.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("generate 2 more"));
    assert!(prompts[1].contains("- rust async runtimes"));
}

#[tokio::test]
async fn test_still_short_proceeds_with_what_was_returned() {
    init_tracing();
    let completion = Arc::new(ReplayCompletion::new(vec![
        Ok(queries(&["only one"])),
        Ok(queries(&[])),
    ]));

    let planned = planner(completion.clone())
        .generate_queries("topic", 4, &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(planned.len(), 1);
    assert_eq!(completion.prompts().len(), 2);
}

#[tokio::test]
async fn test_zero_queries_is_generation_error() {
    init_tracing();
    let completion = Arc::new(ReplayCompletion::new(vec![
        Ok(queries(&[])),
        Ok(queries(&["   "])),
    ]));

    let result = planner(completion)
        .generate_queries("topic", 2, &[], &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(DelveError::Generation { .. })));
}

#[tokio::test]
async fn test_completion_failure_is_generation_error() {
    init_tracing();
    let completion = Arc::new(ReplayCompletion::new(vec![
        Err(completion_error!("boom", "serp_queries")),
        Err(completion_error!("boom again", "serp_queries")),
    ]));

    let result = planner(completion)
        .generate_queries("topic", 2, &[], &CancellationToken::new())
        .await;

    match result {
        Err(DelveError::Generation { message, .. }) => assert!(message.contains("boom again")),
        other => panic!("expected Generation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_near_duplicates_are_filtered() {
    init_tracing();
    let completion = Arc::new(ReplayCompletion::new(vec![
        Ok(queries(&[
            "rust async runtime comparison",
            "Rust async runtime comparison!",
            "comparison of rust async runtime",
            "embedded rust hal crates",
        ])),
        Ok(queries(&["rust async runtime comparison 2024"])),
    ]));

    let planned = planner(completion)
        .generate_queries("rust", 3, &[], &CancellationToken::new())
        .await
        .unwrap();

    let texts: Vec<&str> = planned.iter().map(|q| q.query.as_str()).collect();
    assert_eq!(
        texts,
        vec!["rust async runtime comparison", "embedded rust hal crates"]
    );
}

#[tokio::test]
async fn test_followups_carry_goal_and_gaps() {
    init_tracing();
    let completion = Arc::new(ReplayCompletion::new(vec![Ok(queries(&[
        "parent query",
        "who funds tokio development",
    ]))]));
    let parent = ResearchQuery::root(PlannedQuery::new("parent query", "understand funding"), 1, 4);

    let planned = planner(completion.clone())
        .generate_followups(
            &parent,
            &["Who pays maintainers?".to_string()],
            &["tokio is maintained by volunteers".to_string()],
            1,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // The parent's own query is never proposed again
    assert_eq!(planned.len(), 1);
    assert_eq!(planned[0].query, "who funds tokio development");

    let prompt = &completion.prompts()[0];
    assert!(prompt.contains("Previous research goal: understand funding"));
    assert!(prompt.contains("- Who pays maintainers?"));
    assert!(prompt.contains("<learning>\ntokio is maintained by volunteers\n</learning>"));
}

#[tokio::test]
async fn test_clarifying_questions_drop_blanks_and_cap() {
    init_tracing();
    let completion = Arc::new(ScriptedCompletion::new());
    let planner = QueryPlanner::new(completion, RetryPolicy::no_retry(), 0.8);

    let questions = planner
        .clarifying_questions("topic", 2, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(questions, vec!["Which period?", "Which region?"]);

    let none = planner
        .clarifying_questions("topic", 0, &CancellationToken::new())
        .await
        .unwrap();
    assert!(none.is_empty());
}
