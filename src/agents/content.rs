use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Agent, AgentResult, AgentStats, StatsTracker, Usage, payload_str};
use crate::parser::{MAX_PAGE_CHARS, PageFetcher, parse_url};
use crate::provider::extract_json_object;
use crate::queue::Task;
use crate::retry::{RetryPolicy, TtlCache, cache_key, retry_with_backoff};
use crate::router::{GenerateRequest, ModelResponse, ModelRouter};
use crate::validators::{
    ArticleRequest, SummarizeRequest, TranslationRequest, sanitize_text, validate_summarize_request,
    validate_text, validate_translation_request,
};

const TASK_TYPES: &[&str] = &["content", "article", "research", "translation"];
const STRUCTURE_CACHE_SIZE: usize = 50;
const STRUCTURE_CACHE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const SUMMARY_CACHE_SIZE: usize = 200;
const SUMMARY_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Pages shorter than this after cleaning are not worth summarizing.
const MIN_PAGE_CHARS: usize = 50;
const SUMMARY_INPUT_CHARS: usize = 4_000;
const MAX_PARAGRAPH_CHARS: usize = 500;
const META_DESCRIPTION_CHARS: usize = 160;
const META_TITLE_CHARS: usize = 60;
const CONTINUATION_MARKER: &str = "[... continued ...]";

const MIN_KEYWORD_DENSITY: f64 = 0.01;
const MAX_KEYWORD_DENSITY: f64 = 0.03;
const TARGET_KEYWORD_DENSITY: f64 = 0.02;

const LANGUAGE_NAMES: &[(&str, &str)] = &[
    ("ru", "Russian"),
    ("en", "English"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("de", "German"),
    ("it", "Italian"),
    ("pt", "Portuguese"),
    ("zh", "Chinese"),
    ("ja", "Japanese"),
    ("ko", "Korean"),
    ("ar", "Arabic"),
    ("tr", "Turkish"),
];

pub fn language_name(code: &str) -> &str {
    LANGUAGE_NAMES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, name)| *name)
        .unwrap_or(code)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleStructure {
    pub title: String,
    #[serde(default)]
    pub introduction: String,
    #[serde(default)]
    pub sections: Vec<SectionPlan>,
    #[serde(default)]
    pub conclusion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionPlan {
    pub heading: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub bullet_points: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordStat {
    pub count: usize,
    pub density: f64,
    pub needs_optimization: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeoReport {
    pub total_words: usize,
    pub unique_words: usize,
    pub headings_count: usize,
    pub keyword_stats: BTreeMap<String, KeywordStat>,
    pub readability_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeoMeta {
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub topic: String,
    pub title: String,
    pub content: String,
    pub word_count: usize,
    pub keywords_used: Vec<String>,
    pub sections: usize,
    pub language: String,
    pub style: String,
    pub seo: SeoReport,
    pub meta: SeoMeta,
    pub generation_time_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Introduction,
    Body,
    Conclusion,
}

impl SectionKind {
    fn label(self) -> &'static str {
        match self {
            SectionKind::Introduction => "introduction",
            SectionKind::Body => "section",
            SectionKind::Conclusion => "conclusion",
        }
    }

    fn complexity(self) -> f64 {
        match self {
            SectionKind::Body => 0.5,
            SectionKind::Introduction | SectionKind::Conclusion => 0.3,
        }
    }
}

/// Splits `target_length` words into a budget for the introduction and the
/// conclusion (each) and one for every body section.
pub fn section_word_budgets(target_length: u64, body_sections: usize) -> (u64, u64) {
    let edge = (target_length / 10).max(50);
    let body_total = target_length.saturating_sub(edge * 2).max(100);
    let body = (body_total / body_sections.max(1) as u64).max(50);
    (edge, body)
}

fn word_range(budget: u64) -> String {
    format!("{}-{}", budget * 4 / 5, budget * 6 / 5)
}

pub struct ContentAgent {
    router: Arc<ModelRouter>,
    fetcher: Arc<dyn PageFetcher>,
    section_retry: RetryPolicy,
    structure_cache: Mutex<TtlCache<ArticleStructure>>,
    summary_cache: Mutex<TtlCache<String>>,
    stats: StatsTracker,
}

impl ContentAgent {
    pub fn new(router: Arc<ModelRouter>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            router,
            fetcher,
            section_retry: RetryPolicy::new(3, Duration::from_secs(2)),
            structure_cache: Mutex::new(TtlCache::new(
                STRUCTURE_CACHE_SIZE,
                Some(STRUCTURE_CACHE_TTL),
            )),
            summary_cache: Mutex::new(TtlCache::new(SUMMARY_CACHE_SIZE, Some(SUMMARY_CACHE_TTL))),
            stats: StatsTracker::default(),
        }
    }

    pub fn with_section_retry(mut self, policy: RetryPolicy) -> Self {
        self.section_retry = policy;
        self
    }

    pub fn cached_structures(&self) -> usize {
        self.structure_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub async fn generate_article(&self, request: &ArticleRequest) -> Result<AgentResult> {
        let started = Instant::now();
        let mut usage = Usage::default();
        tracing::info!(
            topic = %request.topic,
            keywords = request.keywords.len(),
            target_length = request.target_length,
            "generating article"
        );

        let structure = self.create_structure(request, &mut usage).await;
        let (edge_words, body_words) =
            section_word_budgets(request.target_length, structure.sections.len());
        let intro_keywords = structure
            .sections
            .first()
            .map(|section| section.keywords.clone())
            .unwrap_or_default();
        let intro = self
            .generate_section(
                &structure.introduction,
                &intro_keywords,
                &[],
                SectionKind::Introduction,
                edge_words,
                request,
                &mut usage,
            )
            .await?;

        let mut bodies = Vec::with_capacity(structure.sections.len());
        for (idx, section) in structure.sections.iter().enumerate() {
            tracing::debug!(
                section = idx + 1,
                total = structure.sections.len(),
                heading = %section.heading,
                "generating article section"
            );
            let body = self
                .generate_section(
                    &section.heading,
                    &section.keywords,
                    &section.bullet_points,
                    SectionKind::Body,
                    body_words,
                    request,
                    &mut usage,
                )
                .await?;
            bodies.push((section.heading.clone(), body));
        }

        let outro_keywords = structure
            .sections
            .last()
            .map(|section| section.keywords.clone())
            .unwrap_or_default();
        let conclusion = self
            .generate_section(
                &structure.conclusion,
                &outro_keywords,
                &[],
                SectionKind::Conclusion,
                edge_words,
                request,
                &mut usage,
            )
            .await?;

        let title = if structure.title.trim().is_empty() {
            request.topic.clone()
        } else {
            structure.title.clone()
        };
        let body = assemble_body(&title, &intro, &bodies, &conclusion);
        let body = self.optimize_article(body, request, &mut usage).await;
        let content = format!("{body}\n\n{}", keyword_footer(&request.keywords));
        let seo = analyze_seo(&content, &request.keywords);
        let meta = build_meta(&title, &body, &request.keywords);
        let article = Article {
            topic: request.topic.clone(),
            title,
            word_count: seo.total_words,
            content,
            keywords_used: request.keywords.clone(),
            sections: bodies.len(),
            language: request.language.clone(),
            style: request.style.clone(),
            seo,
            meta,
            generation_time_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            topic = %article.topic,
            words = article.word_count,
            secs = article.generation_time_secs,
            "article generated"
        );
        self.stats.record(&usage);
        Ok(AgentResult::succeeded(
            self.name(),
            serde_json::to_value(&article)?,
            usage,
        ))
    }

    async fn create_structure(&self, request: &ArticleRequest, usage: &mut Usage) -> ArticleStructure {
        let key = cache_key(&[
            &request.topic,
            &request.keywords.join(","),
            &request.style,
        ]);
        let cached = self
            .structure_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key);
        if let Some(structure) = cached {
            tracing::debug!(topic = %request.topic, "using cached article structure");
            return structure;
        }

        let prompt = format!(
            "Create an outline for an article on the topic: \"{topic}\"\n\n\
             Keywords: {keywords}\nStyle: {style}\nLanguage: {language}\n\n\
             The outline must contain a title, a short introduction, 3-5 main sections \
             and a short conclusion.\n\n\
             Reply strictly with JSON:\n\
             {{\"title\": \"...\", \"introduction\": \"...\", \"sections\": \
             [{{\"heading\": \"...\", \"keywords\": [\"...\"], \"bullet_points\": [\"...\"]}}], \
             \"conclusion\": \"...\"}}",
            topic = request.topic,
            keywords = request.keywords.join(", "),
            style = request.style,
            language = language_name(&request.language),
        );
        let generated = self
            .router
            .generate(GenerateRequest::new(prompt, "content", 0.7).with_max_tokens(2000))
            .await;
        let response = match generated {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "article outline generation failed, using fallback");
                return fallback_structure(&request.topic, &request.keywords);
            }
        };
        usage.add(&response);

        match parse_structure(&response.text) {
            Some(structure) => {
                self.structure_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key, structure.clone());
                structure
            }
            None => {
                tracing::warn!("article outline was not valid JSON, using fallback");
                fallback_structure(&request.topic, &request.keywords)
            }
        }
    }

    async fn generate_section(
        &self,
        heading: &str,
        keywords: &[String],
        bullet_points: &[String],
        kind: SectionKind,
        words: u64,
        request: &ArticleRequest,
        usage: &mut Usage,
    ) -> Result<String> {
        let mut prompt = format!(
            "Write the content for one part of an article.\n\n\
             Heading: {heading}\nPart: {part}\nKeywords: {keywords}\n",
            part = kind.label(),
            keywords = keywords.join(", "),
        );
        if !bullet_points.is_empty() {
            prompt.push_str(&format!("Key points: {}\n", bullet_points.join(", ")));
        }
        prompt.push_str(&format!(
            "\nRequirements:\n- Length: {} words\n- Style: {}\n- Language: {}\n\
             - Use the keywords naturally and avoid repetition\n\
             - Add examples and practical advice\n\n\
             Reply with the section text only.",
            word_range(words),
            request.style,
            language_name(&request.language),
        ));

        // Roughly two tokens per word, within what local models accept.
        let max_tokens = (words * 2).clamp(500, 4000) as u32;
        let router = &self.router;
        let response: ModelResponse = retry_with_backoff(self.section_retry, "article section", |_| {
            let request = GenerateRequest::new(prompt.clone(), "content", kind.complexity())
                .with_max_tokens(max_tokens);
            async move { router.generate(request).await }
        })
        .await?;
        usage.add(&response);
        Ok(response.text.trim().to_string())
    }

    /// Raises thin keyword coverage, splits overlong paragraphs and caps the
    /// text at `target_length` words. A failed model call leaves the keyword
    /// step out; the other steps always run.
    async fn optimize_article(&self, body: String, request: &ArticleRequest, usage: &mut Usage) -> String {
        let report = analyze_seo(&body, &request.keywords);
        let thin = report
            .keyword_stats
            .iter()
            .filter(|(_, stat)| stat.needs_optimization && stat.density < TARGET_KEYWORD_DENSITY)
            .map(|(keyword, _)| keyword.clone())
            .collect::<Vec<_>>();

        let mut body = body;
        if !thin.is_empty() {
            let prompt = format!(
                "Write 3-5 sentences to insert into an article titled \"{topic}\".\n\n\
                 Keywords to use: {keywords}\nLanguage: {language}\n\n\
                 Use every keyword naturally, stay on topic and do not repeat yourself.\n\
                 Reply with the sentences only, one per line.",
                topic = request.topic,
                keywords = thin.join(", "),
                language = language_name(&request.language),
            );
            match self
                .router
                .generate(GenerateRequest::new(prompt, "content", 0.3).with_max_tokens(500))
                .await
            {
                Ok(response) => {
                    usage.add(&response);
                    let sentences = response
                        .text
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ");
                    body = insert_after_first_paragraph(&body, &sentences);
                }
                Err(err) => {
                    tracing::warn!(error = %err, keywords = ?thin, "keyword density pass failed, skipping");
                }
            }
        }

        let body = split_long_paragraphs(&body, MAX_PARAGRAPH_CHARS);
        truncate_to_words(&body, request.target_length as usize)
    }

    pub async fn translate(&self, request: &TranslationRequest) -> Result<AgentResult> {
        let request = match validate_translation_request(request) {
            Ok(request) => request,
            Err(err) => return Ok(AgentResult::failed(self.name(), err.to_string())),
        };
        let target = language_name(&request.target_language);
        let direction = match request.source_language.as_deref() {
            Some(source) => format!("from {} into {target}", language_name(source)),
            None => format!("into {target}"),
        };
        let prompt = format!(
            "Translate the following text {direction}.\n\n\
             Keep the meaning, tone and markdown formatting of the original. \
             Do not add comments.\n\nText:\n{text}\n\nReply with the translation only.",
            text = request.text,
        );
        tracing::info!(language = %request.target_language, chars = request.text.len(), "translating text");
        let response = self
            .router
            .generate(GenerateRequest::new(prompt, "content", 0.4).with_max_tokens(4000))
            .await?;
        let mut usage = Usage::default();
        usage.add(&response);
        self.stats.record(&usage);
        Ok(AgentResult::succeeded(
            self.name(),
            json!({
                "source_language": request.source_language,
                "target_language": request.target_language,
                "translation": response.text.trim()
            }),
            usage,
        ))
    }

    /// Fetches, cleans and summarizes one page. Failures are reported in the
    /// returned object rather than as errors.
    async fn summarize_page(&self, url: &str, max_words: u64, usage: &mut Usage) -> Value {
        let failed = |error: String| json!({ "url": url, "status": "error", "error": error });
        let text = match parse_url(self.fetcher.as_ref(), url).await {
            Ok(text) => sanitize_text(&text, MAX_PAGE_CHARS),
            Err(err) => {
                tracing::warn!(url, error = %err, "page could not be parsed");
                return failed(format!("could not parse URL: {err:#}"));
            }
        };
        if let Err(err) = validate_text(&text, MIN_PAGE_CHARS, MAX_PAGE_CHARS, false) {
            return failed(format!("page has no usable text: {err}"));
        }

        let key = cache_key(&[&text, &max_words.to_string()]);
        let cached = self
            .summary_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key);
        let summary = match cached {
            Some(summary) => summary,
            None => {
                let excerpt = text.chars().take(SUMMARY_INPUT_CHARS).collect::<String>();
                let prompt = format!(
                    "Summarize the following text and keep its key ideas.\n\n{excerpt}\n\n\
                     Requirements:\n- At most {max_words} words\n- Keep the main points\n\
                     - Use plain language\n- List the key takeaways as bullet points\n\n\
                     Reply with the summary only."
                );
                let response = match self
                    .router
                    .generate(GenerateRequest::new(prompt, "content", 0.4))
                    .await
                {
                    Ok(response) => response,
                    Err(err) => return failed(format!("summarization failed: {err:#}")),
                };
                usage.add(&response);
                let summary = response.text.trim().to_string();
                self.summary_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key, summary.clone());
                summary
            }
        };
        json!({
            "url": url,
            "status": "success",
            "original_length": text.chars().count(),
            "summary_length": summary.chars().count(),
            "summary": summary
        })
    }

    pub async fn summarize_pages(&self, request: &SummarizeRequest) -> Result<AgentResult> {
        let request = match validate_summarize_request(request) {
            Ok(request) => request,
            Err(err) => return Ok(AgentResult::failed(self.name(), err.to_string())),
        };
        let mut usage = Usage::default();
        let mut pages = Vec::with_capacity(request.urls.len());
        for url in &request.urls {
            pages.push(self.summarize_page(url, request.max_length, &mut usage).await);
        }
        let summarized = pages.iter().filter(|page| page["status"] == "success").count();
        if summarized == 0 {
            let reason = pages
                .first()
                .and_then(|page| page["error"].as_str())
                .unwrap_or("no page could be summarized")
                .to_string();
            return Ok(AgentResult::failed(self.name(), reason));
        }
        self.stats.record(&usage);
        Ok(AgentResult::succeeded(
            self.name(),
            json!({ "summarized": summarized, "pages": pages }),
            usage,
        ))
    }

    async fn write_content(&self, task: &Task) -> Result<AgentResult> {
        let description = task.description();
        if description.trim().is_empty() {
            return Ok(AgentResult::failed(
                self.name(),
                format!("task '{}' has no description", task.id),
            ));
        }
        let system_prompt = match task.task_type.as_str() {
            "research" => "You are a research analyst. Summarize findings with key points as a list.",
            "translation" => "You are a professional translator. Preserve meaning and formatting.",
            _ => "You are a professional content writer. Produce clear, well-structured text.",
        };
        let response = self
            .router
            .generate(
                GenerateRequest::new(description, &task.task_type, task.complexity)
                    .with_system_prompt(system_prompt),
            )
            .await?;
        let mut usage = Usage::default();
        usage.add(&response);
        self.stats.record(&usage);
        let text = response.text.trim().to_string();
        Ok(AgentResult::succeeded(
            self.name(),
            json!({
                "task_type": task.task_type,
                "word_count": count_words(&text),
                "content": text
            }),
            usage,
        ))
    }
}

#[async_trait]
impl Agent for ContentAgent {
    fn name(&self) -> &str {
        "content"
    }

    fn capabilities(&self) -> Vec<&'static str> {
        vec![
            "article_generation",
            "seo_analysis",
            "research",
            "translation",
            "url_summarization",
        ]
    }

    fn handles(&self, task_type: &str) -> bool {
        TASK_TYPES.contains(&task_type)
    }

    async fn execute(&self, task: &Task) -> Result<AgentResult> {
        if let Some(urls) = payload_urls(task) {
            let request = SummarizeRequest {
                urls,
                max_length: task
                    .payload
                    .get("max_length")
                    .and_then(Value::as_u64)
                    .unwrap_or(500),
            };
            return self.summarize_pages(&request).await;
        }
        if let (Some(text), Some(target)) = (
            payload_str(task, "text"),
            payload_str(task, "target_language"),
        ) {
            let request = TranslationRequest {
                text: text.to_string(),
                target_language: target.to_string(),
                source_language: payload_str(task, "source_language").map(str::to_string),
            };
            return self.translate(&request).await;
        }

        let keywords = task
            .payload
            .get("keywords")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        match payload_str(task, "topic") {
            Some(topic) if !keywords.is_empty() => {
                let request = ArticleRequest {
                    topic: topic.to_string(),
                    keywords,
                    target_length: task
                        .payload
                        .get("target_length")
                        .and_then(Value::as_u64)
                        .unwrap_or(2000),
                    language: payload_str(task, "language").unwrap_or("ru").to_string(),
                    style: payload_str(task, "style")
                        .unwrap_or("professional")
                        .to_string(),
                };
                self.generate_article(&request).await
            }
            _ => self.write_content(task).await,
        }
    }

    fn stats(&self) -> AgentStats {
        self.stats.snapshot(self.name())
    }
}

fn parse_structure(text: &str) -> Option<ArticleStructure> {
    let value = extract_json_object(text)?;
    let structure = serde_json::from_value::<ArticleStructure>(value).ok()?;
    if structure.sections.is_empty() {
        return None;
    }
    Some(structure)
}

pub fn fallback_structure(topic: &str, keywords: &[String]) -> ArticleStructure {
    let first_two = keywords.iter().take(2).cloned().collect::<Vec<_>>();
    let pick = |range: std::ops::Range<usize>| -> Vec<String> {
        if keywords.len() > 2 {
            keywords[range.start.min(keywords.len())..range.end.min(keywords.len())].to_vec()
        } else {
            first_two.clone()
        }
    };
    let tail_start = keywords.len().saturating_sub(2);
    ArticleStructure {
        title: format!("Everything about {topic}"),
        introduction: format!("In this article we look at {topic}."),
        sections: vec![
            SectionPlan {
                heading: format!("What is {topic}"),
                keywords: first_two.clone(),
                bullet_points: vec!["Basics".to_string(), "Core concepts".to_string()],
            },
            SectionPlan {
                heading: format!("Benefits of {topic}"),
                keywords: pick(2..4),
                bullet_points: vec!["Key benefits".to_string(), "Practical value".to_string()],
            },
            SectionPlan {
                heading: format!("How to use {topic}"),
                keywords: pick(tail_start..keywords.len()),
                bullet_points: vec!["Step by step".to_string(), "Best practices".to_string()],
            },
        ],
        conclusion: format!("To sum up, {topic}."),
    }
}

/// `payload.urls` as a list, or `payload.url` as a single entry.
fn payload_urls(task: &Task) -> Option<Vec<String>> {
    if let Some(items) = task.payload.get("urls").and_then(Value::as_array) {
        return Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        );
    }
    payload_str(task, "url").map(|url| vec![url.to_string()])
}

pub fn assemble_body(title: &str, intro: &str, sections: &[(String, String)], conclusion: &str) -> String {
    let mut parts = vec![format!("# {title}"), intro.to_string()];
    for (heading, body) in sections {
        parts.push(format!("## {heading}"));
        parts.push(body.clone());
    }
    parts.push("## Conclusion".to_string());
    parts.push(conclusion.to_string());
    parts.join("\n\n")
}

pub fn keyword_footer(keywords: &[String]) -> String {
    format!("---\n**Keywords:** {}", keywords.join(", "))
}

fn is_heading(paragraph: &str) -> bool {
    paragraph.trim_start().starts_with('#')
}

/// Inserts `extra` as its own paragraph after the first non-heading paragraph.
pub fn insert_after_first_paragraph(content: &str, extra: &str) -> String {
    if extra.trim().is_empty() {
        return content.to_string();
    }
    let mut paragraphs = content.split("\n\n").collect::<Vec<_>>();
    let position = paragraphs
        .iter()
        .position(|paragraph| !paragraph.trim().is_empty() && !is_heading(paragraph))
        .map(|idx| idx + 1)
        .unwrap_or(paragraphs.len());
    paragraphs.insert(position, extra.trim());
    paragraphs.join("\n\n")
}

/// Splits paragraphs longer than `max_chars` in two at a sentence boundary
/// near the middle. Headings are left alone.
pub fn split_long_paragraphs(content: &str, max_chars: usize) -> String {
    let mut out = Vec::new();
    for paragraph in content.split("\n\n") {
        if is_heading(paragraph) || paragraph.trim().chars().count() <= max_chars {
            out.push(paragraph.to_string());
            continue;
        }
        let sentences = split_sentences(paragraph);
        if sentences.len() < 2 {
            out.push(paragraph.to_string());
            continue;
        }
        let mid = sentences.len() / 2;
        out.push(sentences[..mid].join(" "));
        out.push(sentences[mid..].join(" "));
    }
    out.join("\n\n")
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some((_, next)) = chars.peek() {
                if next.is_whitespace() {
                    let end = idx + c.len_utf8();
                    sentences.push(text[start..end].trim());
                    start = end;
                }
            }
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

/// Cuts `content` after `max_words` words, backing up to the last sentence
/// end, and marks the cut. Shorter content is returned unchanged.
pub fn truncate_to_words(content: &str, max_words: usize) -> String {
    let mut seen = 0usize;
    let mut in_word = false;
    let mut cut = None;
    for (idx, c) in content.char_indices() {
        if c.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            seen += 1;
            if seen > max_words {
                cut = Some(idx);
                break;
            }
        }
    }
    let Some(cut) = cut else {
        return content.to_string();
    };
    let kept = &content[..cut];
    let kept = match kept.rfind(['.', '!', '?']) {
        Some(end) if end > 0 => &kept[..=end],
        _ => kept.trim_end(),
    };
    format!("{kept}\n\n{CONTINUATION_MARKER}")
}

pub fn build_meta(title: &str, body: &str, keywords: &[String]) -> SeoMeta {
    let text = body
        .split("\n\n")
        .filter(|paragraph| !is_heading(paragraph))
        .collect::<Vec<_>>()
        .join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let description = if text.chars().count() <= META_DESCRIPTION_CHARS {
        text
    } else {
        let head = text.chars().take(META_DESCRIPTION_CHARS).collect::<String>();
        let head = match head.rfind(' ') {
            Some(space) => head[..space].to_string(),
            None => head,
        };
        format!("{head}...")
    };
    SeoMeta {
        title: title.chars().take(META_TITLE_CHARS).collect(),
        description,
        keywords: keywords.to_vec(),
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub fn count_words(text: &str) -> usize {
    words(text).len()
}

/// Keyword counts match whole words; multi-word keywords match as phrases.
pub fn analyze_seo(content: &str, keywords: &[String]) -> SeoReport {
    let all_words = words(content);
    let total_words = all_words.len();
    let mut frequency: HashMap<&str, usize> = HashMap::new();
    for word in &all_words {
        *frequency.entry(word.as_str()).or_insert(0) += 1;
    }

    let mut keyword_stats = BTreeMap::new();
    for keyword in keywords {
        let needle = words(keyword);
        let count = match needle.len() {
            0 => 0,
            1 => frequency.get(needle[0].as_str()).copied().unwrap_or(0),
            n => all_words
                .windows(n)
                .filter(|window| window.iter().eq(needle.iter()))
                .count(),
        };
        let density = if total_words > 0 {
            count as f64 / total_words as f64
        } else {
            0.0
        };
        keyword_stats.insert(
            keyword.clone(),
            KeywordStat {
                count,
                density,
                needs_optimization: !(MIN_KEYWORD_DENSITY..=MAX_KEYWORD_DENSITY).contains(&density),
            },
        );
    }

    SeoReport {
        total_words,
        unique_words: frequency.len(),
        headings_count: content
            .lines()
            .filter(|line| {
                let trimmed = line.trim_start_matches('#');
                trimmed.len() < line.len() && trimmed.starts_with(char::is_whitespace)
            })
            .count(),
        keyword_stats,
        readability_score: readability_score(content),
    }
}

/// `100 - (avg_word_len * 2 + avg_sentence_len * 0.5)`, clamped to 0..=100.
pub fn readability_score(content: &str) -> f64 {
    let all_words = content
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>();
    if all_words.is_empty() {
        return 100.0;
    }
    let avg_word_len = all_words
        .iter()
        .map(|word| word.chars().count())
        .sum::<usize>() as f64
        / all_words.len() as f64;

    let sentence_pieces = content
        .split(['.', '!', '?'])
        .filter(|piece| !piece.is_empty())
        .count()
        .max(1);
    let avg_sentence_len = if sentence_pieces > 1 {
        all_words.len() as f64 / sentence_pieces as f64
    } else {
        0.0
    };

    (100.0 - (avg_word_len * 2.0 + avg_sentence_len * 0.5)).clamp(0.0, 100.0)
}
