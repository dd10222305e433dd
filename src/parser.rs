use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use htmd::HtmlToMarkdown;

pub const MAX_PAGE_CHARS: usize = 10_000;
const TRUNCATION_MARKER: &str = "\n\n[... text truncated ...]";
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "iframe", "noscript", "aside", "form",
];

/// Downloads the raw HTML of a page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ai-corp/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client for page fetching")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to '{url}' failed"))?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(anyhow::anyhow!("'{url}' answered HTTP {}", status.as_u16()));
        }
        response
            .text()
            .await
            .with_context(|| format!("failed to read body of '{url}'"))
    }
}

/// Narrows the document to its `<article>` or `<main>` element when present.
fn main_content(html: &str) -> &str {
    // ASCII lowercasing keeps byte offsets aligned with `html`.
    let lower = html.to_ascii_lowercase();
    for tag in ["article", "main"] {
        let open = format!("<{tag}");
        let close = format!("</{tag}>");
        if let (Some(start), Some(end)) = (lower.find(&open), lower.rfind(&close)) {
            if start < end {
                return &html[start..end + close.len()];
            }
        }
    }
    html
}

fn next_url(text: &str) -> Option<usize> {
    [text.find("http://"), text.find("https://")]
        .into_iter()
        .flatten()
        .min()
}

fn strip_bare_urls(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(pos) = next_url(rest) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let end = tail
            .find(|c: char| c.is_whitespace() || c == ')')
            .unwrap_or(tail.len());
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

/// Collapses blank runs and repeated spaces, drops bare URLs and caps the
/// result at [`MAX_PAGE_CHARS`].
pub fn post_process(text: &str) -> String {
    let mut lines = Vec::new();
    let mut blank_run = 0usize;
    for line in text.lines() {
        let cleaned = strip_bare_urls(line)
            .split(' ')
            .filter(|piece| !piece.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let cleaned = cleaned.trim_end().to_string();
        if cleaned.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            lines.push(String::new());
        } else {
            blank_run = 0;
            lines.push(cleaned);
        }
    }
    let joined = lines.join("\n").trim().to_string();
    if joined.chars().count() <= MAX_PAGE_CHARS {
        return joined;
    }
    let mut truncated = joined.chars().take(MAX_PAGE_CHARS).collect::<String>();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

pub fn clean_html(html: &str) -> Result<String> {
    let converter = HtmlToMarkdown::builder()
        .skip_tags(SKIPPED_TAGS.to_vec())
        .build();
    let markdown = converter
        .convert(main_content(html))
        .context("failed to convert HTML to text")?;
    Ok(post_process(&markdown))
}

pub async fn parse_url(fetcher: &dyn PageFetcher, url: &str) -> Result<String> {
    tracing::info!(url, "parsing page");
    let html = fetcher.fetch(url).await?;
    let text = clean_html(&html)?;
    tracing::debug!(url, chars = text.chars().count(), "page parsed");
    Ok(text)
}
