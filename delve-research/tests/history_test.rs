use chrono::Utc;
use delve_core::{DelveError, OutputMode};
use delve_research::{HistoryEntry, ResearchHistory};
use tempfile::TempDir;
use uuid::Uuid;

fn entry(query: &str) -> HistoryEntry {
    HistoryEntry {
        id: Uuid::new_v4(),
        query: query.to_string(),
        prompt: format!("Initial query:\n{}", query),
        learnings: vec![format!("{} learning", query)],
        mode: OutputMode::Report,
        content: format!("# {}", query),
        citations: vec!["https://a.test".to_string()],
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_missing_file_is_empty_history() {
    let dir = TempDir::new().unwrap();
    let history = ResearchHistory::load(dir.path().join("none.json")).await.unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_append_persists_and_reloads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("history.json");

    let mut history = ResearchHistory::load(&path).await.unwrap();
    let first = entry("first");
    history.append(first.clone()).await.unwrap();
    history.append(entry("second")).await.unwrap();

    let reloaded = ResearchHistory::load(&path).await.unwrap();
    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded.entries()[0], first);

    let prefix = &first.id.to_string()[..8];
    assert_eq!(reloaded.get(prefix).unwrap().query, "first");
    assert!(reloaded.get("").is_none());
}

#[tokio::test]
async fn test_import_skips_known_entries() {
    let dir = TempDir::new().unwrap();
    let mut source = ResearchHistory::load(dir.path().join("source.json")).await.unwrap();
    let shared = entry("shared");
    source.append(shared.clone()).await.unwrap();
    source.append(entry("new one")).await.unwrap();

    let export = dir.path().join("export.json");
    source.export(&export).await.unwrap();

    let mut target = ResearchHistory::load(dir.path().join("target.json")).await.unwrap();
    target.append(shared).await.unwrap();

    assert_eq!(target.import(&export).await.unwrap(), 1);
    assert_eq!(target.len(), 2);
    // A second import adds nothing
    assert_eq!(target.import(&export).await.unwrap(), 0);

    let reloaded = ResearchHistory::load(dir.path().join("target.json")).await.unwrap();
    assert_eq!(reloaded.len(), 2);
}

#[tokio::test]
async fn test_import_rejects_non_list() {
    let dir = TempDir::new().unwrap();
    let bogus = dir.path().join("bogus.json");
    tokio::fs::write(&bogus, r#"{"id": "not a list"}"#).await.unwrap();

    let mut history = ResearchHistory::load(dir.path().join("h.json")).await.unwrap();
    let result = history.import(&bogus).await;
    assert!(matches!(result, Err(DelveError::Validation { .. })));
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_clear_empties_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("history.json");
    let mut history = ResearchHistory::load(&path).await.unwrap();
    history.append(entry("gone soon")).await.unwrap();

    history.clear().await.unwrap();
    assert!(ResearchHistory::load(&path).await.unwrap().is_empty());
}
