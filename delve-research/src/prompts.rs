//! Prompt construction and the structured shapes the model answers with

use crate::types::{PlannedQuery, ResearchQuery};
use chrono::Utc;
use delve_core::{CompletionRequest, OutputSchema, SourceDocument};
use serde::Deserialize;
use serde_json::json;

/// Schema names double as call-site labels in logs and errors
pub const QUERIES_SCHEMA: &str = "serp_queries";
pub const EXTRACTION_SCHEMA: &str = "extraction";
pub const REPORT_SCHEMA: &str = "final_report";
pub const ANSWER_SCHEMA: &str = "final_answer";
pub const CLARIFY_SCHEMA: &str = "clarifying_questions";

/// Maximum characters of a single document passed to extraction
const MAX_DOCUMENT_CHARS: usize = 25_000;

/// System prompt shared by every call, stamped with the current time
pub fn system_prompt() -> String {
    format!(
        "You are an expert researcher. Today is {}. Follow these instructions when responding:\n\
         - You may be asked to research subjects that are after your knowledge cutoff; assume the user is right when presented with news.\n\
         - The user is a highly experienced analyst, no need to simplify; be as detailed as possible and make sure your response is correct.\n\
         - Be highly organized.\n\
         - Suggest solutions that the user did not think about.\n\
         - Be proactive and anticipate the user's needs.\n\
         - Mistakes erode trust, so be accurate and thorough.\n\
         - Value good arguments over authorities; the source is irrelevant.\n\
         - Consider new technologies and contrarian ideas, not just the conventional wisdom.\n\
         - You may use high levels of speculation or prediction; just flag it.",
        Utc::now().to_rfc3339()
    )
}

#[derive(Debug, Deserialize)]
pub struct QueryList {
    #[serde(default)]
    pub queries: Vec<PlannedQuery>,
}

/// A learning is either a bare string or an object naming its documents
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ExtractedLearning {
    Plain(String),
    Cited {
        #[serde(alias = "text")]
        learning: String,
        /// 1-based document numbers as shown in the prompt
        #[serde(default)]
        sources: Vec<usize>,
    },
}

impl ExtractedLearning {
    pub fn text(&self) -> &str {
        match self {
            ExtractedLearning::Plain(text) => text,
            ExtractedLearning::Cited { learning, .. } => learning,
        }
    }

    pub fn sources(&self) -> &[usize] {
        match self {
            ExtractedLearning::Plain(_) => &[],
            ExtractedLearning::Cited { sources, .. } => sources,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub learnings: Vec<ExtractedLearning>,
    #[serde(rename = "followUpQuestions", alias = "follow_up_questions", default)]
    pub follow_up_questions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportDraft {
    #[serde(rename = "reportMarkdown", alias = "report_markdown")]
    pub report_markdown: String,
}

#[derive(Debug, Deserialize)]
pub struct AnswerDraft {
    #[serde(rename = "exactAnswer", alias = "exact_answer")]
    pub exact_answer: String,
}

#[derive(Debug, Deserialize)]
pub struct ClarifyingQuestions {
    #[serde(default)]
    pub questions: Vec<String>,
}

fn queries_schema(count: usize) -> OutputSchema {
    OutputSchema::new(
        QUERIES_SCHEMA,
        json!({
            "type": "object",
            "properties": {
                "queries": {
                    "type": "array",
                    "maxItems": count,
                    "description": format!("List of SERP queries, max of {}", count),
                    "items": {
                        "type": "object",
                        "properties": {
                            "query": { "type": "string", "description": "The SERP query" },
                            "researchGoal": {
                                "type": "string",
                                "description": "First talk about the goal of the research that this query is meant to accomplish, then go deeper into how to advance the research once the results are found, mention additional research directions. Be as specific as possible, especially for additional research directions."
                            }
                        },
                        "required": ["query", "researchGoal"]
                    }
                }
            },
            "required": ["queries"]
        }),
    )
}

fn extraction_schema(num_learnings: usize, num_questions: usize) -> OutputSchema {
    OutputSchema::new(
        EXTRACTION_SCHEMA,
        json!({
            "type": "object",
            "properties": {
                "learnings": {
                    "type": "array",
                    "description": format!("List of learnings, max of {}", num_learnings),
                    "items": {
                        "type": "object",
                        "properties": {
                            "learning": { "type": "string" },
                            "sources": {
                                "type": "array",
                                "items": { "type": "integer" },
                                "description": "Numbers of the documents the learning comes from"
                            }
                        },
                        "required": ["learning", "sources"]
                    }
                },
                "followUpQuestions": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": format!(
                        "Knowledge gaps worth researching further, as questions, max of {}. Empty if the contents answer the query fully.",
                        num_questions
                    )
                }
            },
            "required": ["learnings", "followUpQuestions"]
        }),
    )
}

fn report_schema() -> OutputSchema {
    OutputSchema::new(
        REPORT_SCHEMA,
        json!({
            "type": "object",
            "properties": {
                "reportMarkdown": { "type": "string", "description": "Final report on the topic in Markdown" }
            },
            "required": ["reportMarkdown"]
        }),
    )
}

fn answer_schema() -> OutputSchema {
    OutputSchema::new(
        ANSWER_SCHEMA,
        json!({
            "type": "object",
            "properties": {
                "exactAnswer": {
                    "type": "string",
                    "description": "The final answer, short and concise, just the answer, no other text"
                }
            },
            "required": ["exactAnswer"]
        }),
    )
}

fn clarify_schema(count: usize) -> OutputSchema {
    OutputSchema::new(
        CLARIFY_SCHEMA,
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": format!("Follow up questions to clarify the research direction, max of {}", count)
                }
            },
            "required": ["questions"]
        }),
    )
}

fn learnings_block(learnings: &[String]) -> String {
    learnings
        .iter()
        .map(|l| format!("<learning>\n{}\n</learning>", l))
        .collect::<Vec<_>>()
        .join("\n")
}

/// First planning request for a topic
pub fn query_generation(topic: &str, count: usize, context: &[String]) -> CompletionRequest {
    let mut prompt = format!(
        "Given the following prompt from the user, generate a list of SERP queries to research the topic. \
         Return a maximum of {} queries, but feel free to return less if the original prompt is clear. \
         Make sure each query is unique and not similar to each other; every query should approach the topic from a different angle: <prompt>{}</prompt>\n\n",
        count, topic
    );
    if !context.is_empty() {
        prompt.push_str(
            "Here are some learnings from previous research, use them to generate more specific queries:\n",
        );
        prompt.push_str(&learnings_block(context));
    }
    CompletionRequest::structured(system_prompt(), prompt, queries_schema(count))
}

/// Second planning request when the first one came back short
pub fn query_generation_retry(
    topic: &str,
    missing: usize,
    accepted: &[PlannedQuery],
    context: &[String],
) -> CompletionRequest {
    let taken = accepted
        .iter()
        .map(|q| format!("- {}", q.query))
        .collect::<Vec<_>>()
        .join("\n");
    let mut prompt = format!(
        "Given the following prompt from the user, generate {} more SERP queries to research the topic: <prompt>{}</prompt>\n\n\
         These queries are already planned. Do not repeat them or produce close variants; cover angles they miss:\n{}\n\n",
        missing, topic, taken
    );
    if !context.is_empty() {
        prompt.push_str("Here are some learnings from previous research:\n");
        prompt.push_str(&learnings_block(context));
    }
    CompletionRequest::structured(system_prompt(), prompt, queries_schema(missing))
}

/// Topic text for follow-up planning below a node
pub fn followup_topic(parent: &ResearchQuery, gaps: &[String]) -> String {
    let goal = if parent.research_goal.trim().is_empty() {
        parent.text.as_str()
    } else {
        parent.research_goal.as_str()
    };
    let bullets = gaps
        .iter()
        .map(|g| format!("- {}", g))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Previous research goal: {}\nFollow-up research directions:\n{}", goal, bullets)
}

/// Fact and gap extraction over one node's documents
pub fn extraction(
    query: &ResearchQuery,
    documents: &[SourceDocument],
    num_learnings: usize,
    num_questions: usize,
) -> CompletionRequest {
    let contents = documents
        .iter()
        .enumerate()
        .map(|(i, d)| {
            let body: String = d.content.chars().take(MAX_DOCUMENT_CHARS).collect();
            format!(
                "<content id=\"{}\" url=\"{}\" title=\"{}\">\n{}\n</content>",
                i + 1,
                d.url,
                d.title,
                body
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Given the following contents from a SERP search for the query <query>{}</query>, generate a list of learnings from the contents. \
         Return a maximum of {} learnings, but feel free to return less if the contents are clear. \
         Make sure each learning is unique and not similar to each other. The learnings should be concise and to the point, as detailed and information dense as possible. \
         Make sure to include any entities like people, places, companies, products, things, etc in the learnings, as well as any exact metrics, numbers, or dates. \
         For every learning list the ids of the contents it comes from. \
         Then list up to {} follow-up questions for knowledge gaps the contents leave open.\n\n<contents>\n{}\n</contents>",
        query.text, num_learnings, num_questions, contents
    );

    CompletionRequest::structured(
        system_prompt(),
        prompt,
        extraction_schema(num_learnings, num_questions),
    )
}

/// Final report request; `findings` already carry their `[n]` markers
pub fn report(topic: &str, findings: &[String], sources: &[(usize, &SourceDocument)]) -> CompletionRequest {
    let source_list = sources
        .iter()
        .map(|(n, d)| format!("[{}] {} ({})", n, d.title, d.url))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Given the following prompt from the user, write a final report on the topic using the learnings from research. \
         Make it as detailed as possible and include ALL the learnings from research. \
         Organize it with Markdown section headings that group related learnings. \
         Cite sources inline with the bracketed numbers given on each learning, for example [2]. \
         Only use the numbers listed below, do not invent sources and do not add a sources section.\n\n\
         <prompt>{}</prompt>\n\n<learnings>\n{}\n</learnings>\n\n<sources>\n{}\n</sources>",
        topic,
        learnings_block(findings),
        source_list
    );
    CompletionRequest::structured(system_prompt(), prompt, report_schema())
}

/// Short answer request over the highest-confidence learnings
pub fn answer(topic: &str, findings: &[String]) -> CompletionRequest {
    let prompt = format!(
        "Given the following prompt from the user, write a final answer on the topic using the learnings from research. \
         Follow the format specified in the prompt. Do not yap or babble or include any other text than the answer. \
         Keep the answer as concise as possible, a single short paragraph at most.\n\n\
         <prompt>{}</prompt>\n\n<learnings>\n{}\n</learnings>",
        topic,
        learnings_block(findings)
    );
    CompletionRequest::structured(system_prompt(), prompt, answer_schema())
}

/// Questions that sharpen the research direction before starting
pub fn clarifying_questions(topic: &str, count: usize) -> CompletionRequest {
    let prompt = format!(
        "Given the following query from the user, ask some follow up questions to clarify the research direction. \
         Return a maximum of {} questions, but feel free to return less if the original query is clear: <query>{}</query>",
        count, topic
    );
    CompletionRequest::structured(system_prompt(), prompt, clarify_schema(count))
}
