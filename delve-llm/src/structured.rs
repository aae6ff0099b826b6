//! Typed structured output on top of any `CompletionService`

use delve_core::{
    retry_cancellable, CancellationToken, CompletionOutput, CompletionRequest, CompletionService,
    DelveError, DelveResult, ErrorContext, RetryPolicy,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

/// Extract the first JSON value embedded in a model reply.
///
/// Handles bare JSON, fenced code blocks and prose around an object or array.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) else {
            continue;
        };
        if end <= start {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
            return Some(value);
        }
    }

    None
}

fn malformed(call_site: &str, message: String) -> DelveError {
    DelveError::Completion {
        message,
        call_site: call_site.to_string(),
        retryable: false,
        context: ErrorContext::new("structured_output")
            .with_operation(call_site)
            .with_suggestion("The model did not follow the requested schema"),
    }
}

/// Run one completion and decode it into `T`
pub async fn complete_structured<T: DeserializeOwned>(
    service: &dyn CompletionService,
    request: &CompletionRequest,
) -> DelveResult<T> {
    let call_site = request.schema_name().unwrap_or("text").to_string();

    let value = match service.complete(request).await? {
        CompletionOutput::Structured(value) => value,
        CompletionOutput::Text(text) => extract_json(&text).ok_or_else(|| {
            malformed(
                &call_site,
                format!(
                    "Reply is not JSON: {}",
                    text.chars().take(120).collect::<String>()
                ),
            )
        })?,
    };

    serde_json::from_value(value)
        .map_err(|e| malformed(&call_site, format!("Reply does not match schema: {}", e)))
}

fn repair_request(request: &CompletionRequest, error: &DelveError) -> CompletionRequest {
    let mut repaired = request.clone();
    repaired.prompt = format!(
        "{}\n\nYour previous reply could not be used ({}). Reply again with exactly one JSON \
         object that matches the schema, with every required field present.",
        request.prompt, error
    );
    repaired
}

/// Structured completion with transient retries and one repair attempt.
///
/// Transient failures are retried per `policy`. If the call still fails, or the reply
/// cannot be decoded, the request is sent once more with an adjusted prompt. Errors
/// other than completion failures are returned unchanged.
pub async fn complete_with_repair<T: DeserializeOwned>(
    service: &dyn CompletionService,
    request: &CompletionRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> DelveResult<T> {
    let call_site = request.schema_name().unwrap_or("text").to_string();

    let first = retry_cancellable(policy, &call_site, cancel, || {
        complete_structured::<T>(service, request)
    })
    .await;

    let error = match first {
        Ok(value) => return Ok(value),
        Err(e) if e.is_completion() => e,
        Err(e) => return Err(e),
    };

    if cancel.is_cancelled() {
        debug!(call_site = %call_site, "Cancelled, skipping repair attempt");
        return Err(error);
    }

    warn!(call_site = %call_site, error = %error, "Retrying completion with adjusted prompt");

    let repaired = repair_request(request, &error);
    retry_cancellable(policy, &call_site, cancel, || {
        complete_structured::<T>(service, &repaired)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use delve_core::OutputSchema;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        answer: String,
    }

    /// Replays canned outputs and records prompts
    struct Replay {
        outputs: Mutex<Vec<DelveResult<CompletionOutput>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Replay {
        fn new(mut outputs: Vec<DelveResult<CompletionOutput>>) -> Self {
            outputs.reverse();
            Self {
                outputs: Mutex::new(outputs),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionService for Replay {
        fn model(&self) -> &str {
            "replay"
        }

        async fn complete(&self, request: &CompletionRequest) -> DelveResult<CompletionOutput> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.outputs
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(CompletionOutput::Text("exhausted".to_string())))
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::structured(
            "system",
            "question",
            OutputSchema::new("answer", serde_json::json!({ "type": "object" })),
        )
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(
            extract_json("{\"a\": 1}"),
            Some(serde_json::json!({ "a": 1 }))
        );
        assert_eq!(
            extract_json("Sure!\n```json\n{\"a\": [1, 2]}\n```\nHope this helps."),
            Some(serde_json::json!({ "a": [1, 2] }))
        );
        assert_eq!(
            extract_json("Here: [\"x\", \"y\"]"),
            Some(serde_json::json!(["x", "y"]))
        );
        assert_eq!(extract_json("no json here"), None);
    }

    #[tokio::test]
    async fn test_text_reply_is_decoded() {
        let service = Replay::new(vec![Ok(CompletionOutput::Text(
            "```json\n{\"answer\": \"42\"}\n```".to_string(),
        ))]);
        let answer: Answer = complete_structured(&service, &request()).await.unwrap();
        assert_eq!(answer.answer, "42");
    }

    #[tokio::test]
    async fn test_malformed_reply_is_repaired_once() {
        let service = Replay::new(vec![
            Ok(CompletionOutput::Text("I refuse to answer in JSON".to_string())),
            Ok(CompletionOutput::Structured(serde_json::json!({ "answer": "ok" }))),
        ]);

        let answer: Answer =
            complete_with_repair(&service, &request(), &fast_policy(), &CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(answer.answer, "ok");

        let prompts = service.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("could not be used"));
    }

    #[tokio::test]
    async fn test_repair_failure_is_reported() {
        let service = Replay::new(vec![
            Ok(CompletionOutput::Structured(serde_json::json!({ "wrong": 1 }))),
            Ok(CompletionOutput::Structured(serde_json::json!({ "still": "wrong" }))),
        ]);

        let result: DelveResult<Answer> =
            complete_with_repair(&service, &request(), &fast_policy(), &CancellationToken::new())
                .await;
        match result {
            Err(DelveError::Completion { call_site, .. }) => assert_eq!(call_site, "answer"),
            other => panic!("Expected Completion error, got {:?}", other),
        }
        assert_eq!(service.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_non_completion_errors_pass_through() {
        let service = Replay::new(vec![Err(DelveError::Config {
            message: "no key".to_string(),
            source: None,
            context: ErrorContext::new("test"),
        })]);

        let result: DelveResult<Answer> =
            complete_with_repair(&service, &request(), &fast_policy(), &CancellationToken::new())
                .await;
        assert!(matches!(result, Err(DelveError::Config { .. })));
        assert_eq!(service.prompts.lock().unwrap().len(), 1);
    }
}
