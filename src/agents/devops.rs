use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::{Agent, AgentResult, AgentStats, StatsTracker, Usage, payload_str};
use crate::queue::Task;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::router::{GenerateRequest, ModelRouter};
use crate::validators::CodeRequest;

const TASK_TYPES: &[&str] = &["code", "devops", "deploy", "testing"];

const FUNCTION_PREFIXES: &[&str] = &[
    "def ",
    "async def ",
    "fn ",
    "pub fn ",
    "async fn ",
    "pub async fn ",
    "pub(crate) fn ",
    "function ",
    "async function ",
    "export function ",
    "func ",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeAnalysis {
    pub lines: usize,
    pub non_empty_lines: usize,
    pub functions: usize,
    pub todo_markers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeArtifact {
    pub language: String,
    pub framework: Option<String>,
    pub specification: String,
    pub code: String,
    pub explanation: String,
    pub tests: Option<String>,
    pub analysis: CodeAnalysis,
    pub generation_time_secs: f64,
}

pub struct DevOpsAgent {
    router: Arc<ModelRouter>,
    code_retry: RetryPolicy,
    test_retry: RetryPolicy,
    stats: StatsTracker,
}

impl DevOpsAgent {
    pub fn new(router: Arc<ModelRouter>) -> Self {
        Self {
            router,
            code_retry: RetryPolicy::new(3, Duration::from_secs(2)),
            test_retry: RetryPolicy::new(2, Duration::from_secs(2)),
            stats: StatsTracker::default(),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.code_retry = policy;
        self.test_retry = policy;
        self
    }

    pub async fn generate_code(&self, request: &CodeRequest) -> Result<AgentResult> {
        let started = Instant::now();
        let mut usage = Usage::default();
        tracing::info!(language = %request.language, "generating code");

        let framework = request
            .framework
            .as_deref()
            .map(|framework| format!(" using {framework}"))
            .unwrap_or_default();
        let prompt = format!(
            "Write {language} code{framework} for the following task:\n\n{spec}\n\n\
             Requirements:\n1. Follow best practices\n2. Handle errors\n\
             3. Keep the code readable and documented\n4. Use type annotations where the language supports them\n\n\
             Reply with a single ```{language} code block, then briefly explain the main decisions.",
            language = request.language,
            spec = request.specification,
        );
        let router = &self.router;
        let response = retry_with_backoff(self.code_retry, "code generation", |_| {
            let request = GenerateRequest::new(prompt.clone(), "code", 0.7).with_max_tokens(4000);
            async move { router.generate(request).await }
        })
        .await?;
        usage.add(&response);
        let (code, explanation) = extract_code_block(&response.text, &request.language);

        let tests = if request.include_tests {
            self.generate_tests(&code, request, &mut usage).await
        } else {
            None
        };

        let artifact = CodeArtifact {
            language: request.language.clone(),
            framework: request.framework.clone(),
            specification: request.specification.clone(),
            analysis: analyze_code(&code),
            code,
            explanation,
            tests,
            generation_time_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            language = %artifact.language,
            lines = artifact.analysis.lines,
            with_tests = artifact.tests.is_some(),
            "code generated"
        );
        self.stats.record(&usage);
        Ok(AgentResult::succeeded(
            self.name(),
            serde_json::to_value(&artifact)?,
            usage,
        ))
    }

    /// Test generation is best effort; a failure leaves `tests` empty.
    async fn generate_tests(&self, code: &str, request: &CodeRequest, usage: &mut Usage) -> Option<String> {
        let prompt = format!(
            "Write unit tests in {language} for the following code.\n\
             Specification: {spec}\n\n```{language}\n{code}\n```\n\n\
             Reply with a single ```{language} code block.",
            language = request.language,
            spec = request.specification,
        );
        let router = &self.router;
        let generated = retry_with_backoff(self.test_retry, "test generation", |_| {
            let request = GenerateRequest::new(prompt.clone(), "code", 0.6).with_max_tokens(3000);
            async move { router.generate(request).await }
        })
        .await;
        match generated {
            Ok(response) => {
                usage.add(&response);
                Some(extract_code_block(&response.text, &request.language).0)
            }
            Err(err) => {
                tracing::warn!(error = %err, "test generation failed, continuing without tests");
                None
            }
        }
    }
}

#[async_trait]
impl Agent for DevOpsAgent {
    fn name(&self) -> &str {
        "devops"
    }

    fn capabilities(&self) -> Vec<&'static str> {
        vec!["code_generation", "test_generation", "code_analysis", "deployment"]
    }

    fn handles(&self, task_type: &str) -> bool {
        TASK_TYPES.contains(&task_type)
    }

    async fn execute(&self, task: &Task) -> Result<AgentResult> {
        let Some(specification) = payload_str(task, "specification").or_else(|| {
            let description = task.description().trim();
            (!description.is_empty()).then_some(description)
        }) else {
            return Ok(AgentResult::failed(
                self.name(),
                format!("task '{}' has no specification or description", task.id),
            ));
        };
        let default_language = match task.task_type.as_str() {
            "devops" | "deploy" => "bash",
            _ => "python",
        };
        let request = CodeRequest {
            specification: specification.to_string(),
            language: payload_str(task, "language")
                .unwrap_or(default_language)
                .to_ascii_lowercase(),
            framework: payload_str(task, "framework").map(str::to_string),
            include_tests: task
                .payload
                .get("include_tests")
                .and_then(Value::as_bool)
                .unwrap_or(matches!(task.task_type.as_str(), "code" | "testing")),
        };
        self.generate_code(&request).await
    }

    fn stats(&self) -> AgentStats {
        self.stats.snapshot(self.name())
    }
}

struct FencedBlock<'a> {
    info: &'a str,
    body: &'a str,
    end: usize,
}

fn fenced_blocks(text: &str) -> Vec<FencedBlock<'_>> {
    let mut blocks = Vec::new();
    let mut cursor = 0usize;
    while let Some(open) = text[cursor..].find("```") {
        let info_start = cursor + open + 3;
        let info_end = text[info_start..]
            .find('\n')
            .map(|idx| info_start + idx)
            .unwrap_or(text.len());
        let body_start = (info_end + 1).min(text.len());
        let Some(close) = text[body_start..].find("```") else {
            break;
        };
        let body_end = body_start + close;
        blocks.push(FencedBlock {
            info: text[info_start..info_end].trim(),
            body: &text[body_start..body_end],
            end: body_end + 3,
        });
        cursor = body_end + 3;
    }
    blocks
}

/// Returns `(code, explanation)`. Prefers a block tagged with `language`,
/// then the first fenced block, then the whole reply as code.
pub fn extract_code_block(text: &str, language: &str) -> (String, String) {
    let blocks = fenced_blocks(text);
    let chosen = blocks
        .iter()
        .find(|block| block.info.eq_ignore_ascii_case(language))
        .or_else(|| blocks.first());
    match chosen {
        Some(block) => (
            block.body.trim().to_string(),
            text[block.end..].trim().to_string(),
        ),
        None => (text.trim().to_string(), String::new()),
    }
}

pub fn analyze_code(code: &str) -> CodeAnalysis {
    let mut analysis = CodeAnalysis::default();
    for line in code.lines() {
        analysis.lines += 1;
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        analysis.non_empty_lines += 1;
        if FUNCTION_PREFIXES
            .iter()
            .any(|prefix| trimmed.starts_with(prefix))
        {
            analysis.functions += 1;
        }
        if trimmed.contains("TODO") || trimmed.contains("FIXME") {
            analysis.todo_markers += 1;
        }
    }
    analysis
}
