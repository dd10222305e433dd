use serde::Deserialize;
use thiserror::Error;
use url::{Host, Url};

use crate::cli::Priority;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} too short (min {min} characters)")]
    TooShort { field: &'static str, min: usize },
    #[error("{field} too long (max {max} characters)")]
    TooLong { field: &'static str, max: usize },
    #[error("{field} must have between {min} and {max} items")]
    ItemCount {
        field: &'static str,
        min: usize,
        max: usize,
    },
    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
    },
    #[error("{field} '{value}' not supported. Use: {allowed}")]
    Unsupported {
        field: &'static str,
        value: String,
        allowed: String,
    },
    #[error("{field} contains forbidden characters")]
    ForbiddenCharacters { field: &'static str },
    #[error("text contains non-printable characters")]
    NonPrintable,
    #[error("invalid URL format")]
    InvalidUrl,
    #[error("forbidden URL scheme")]
    ForbiddenScheme,
}

pub const FORBIDDEN_SHELL_CHARS: &[char] = &[';', '|', '&', '$', '>', '<', '`'];
pub const FORBIDDEN_URL_SCHEMES: &[&str] = &["javascript:", "data:", "vbscript:", "file:"];
pub const SANITIZE_ALLOWED_PUNCTUATION: &str = ".,!?-_:()[]{}\"'=@#%*+/";

pub const ARTICLE_LANGUAGES: &[&str] = &[
    "ru", "en", "es", "fr", "de", "it", "pt", "zh", "ja", "ko", "ar", "tr",
];
pub const ARTICLE_STYLES: &[&str] = &["professional", "casual", "technical", "academic"];
pub const CODE_LANGUAGES: &[&str] = &[
    "python",
    "javascript",
    "typescript",
    "java",
    "go",
    "rust",
    "cpp",
    "csharp",
    "php",
];

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn check_length(
    field: &'static str,
    text: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let len = char_len(text);
    if len < min {
        return Err(ValidationError::TooShort { field, min });
    }
    if len > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

fn check_allowed(
    field: &'static str,
    value: &str,
    allowed: &[&str],
) -> Result<String, ValidationError> {
    let normalized = value.trim().to_ascii_lowercase();
    if allowed.contains(&normalized.as_str()) {
        Ok(normalized)
    } else {
        Err(ValidationError::Unsupported {
            field,
            value: value.to_string(),
            allowed: allowed.join(", "),
        })
    }
}

pub fn validate_text(
    text: &str,
    min_length: usize,
    max_length: usize,
    allow_empty: bool,
) -> Result<String, ValidationError> {
    if !allow_empty && text.trim().is_empty() {
        return Err(ValidationError::Empty { field: "text" });
    }
    check_length("text", text, min_length, max_length)?;
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(ValidationError::NonPrintable);
    }
    Ok(text.to_string())
}

/// Truncates, then keeps only alphanumerics, whitespace, and a small set of
/// punctuation. Shell metacharacters never survive.
pub fn sanitize_text(text: &str, max_length: usize) -> String {
    let sanitized = text
        .chars()
        .take(max_length)
        .filter(|c| {
            c.is_alphanumeric() || c.is_whitespace() || SANITIZE_ALLOWED_PUNCTUATION.contains(*c)
        })
        .collect::<String>();
    sanitized.trim().to_string()
}

pub fn validate_url(url: &str, max_length: usize) -> Result<String, ValidationError> {
    if url.trim().is_empty() {
        return Err(ValidationError::Empty { field: "url" });
    }
    if char_len(url) > max_length {
        return Err(ValidationError::TooLong {
            field: "url",
            max: max_length,
        });
    }
    let url = url.trim();
    let lower = url.to_ascii_lowercase();
    if FORBIDDEN_URL_SCHEMES
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return Err(ValidationError::ForbiddenScheme);
    }

    let parsed = Url::parse(url).map_err(|_| ValidationError::InvalidUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUrl);
    }
    let host_ok = match parsed.host() {
        Some(Host::Domain(domain)) => {
            domain.eq_ignore_ascii_case("localhost")
                || domain
                    .rsplit('.')
                    .next()
                    .map(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()))
                    .unwrap_or(false)
                    && domain.contains('.')
        }
        Some(Host::Ipv4(_)) => true,
        Some(Host::Ipv6(_)) | None => false,
    };
    if !host_ok {
        return Err(ValidationError::InvalidUrl);
    }
    Ok(url.to_string())
}

pub fn validate_urls(urls: &[String], max_urls: usize) -> Result<Vec<String>, ValidationError> {
    if urls.len() > max_urls {
        return Err(ValidationError::ItemCount {
            field: "urls",
            min: 0,
            max: max_urls,
        });
    }
    urls.iter().map(|url| validate_url(url, 2000)).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MissionRequest {
    pub description: String,
    #[serde(default = "default_mission_priority")]
    pub priority: String,
    pub user_id: Option<String>,
}

fn default_mission_priority() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidMission {
    pub description: String,
    pub priority: Priority,
    pub user_id: Option<String>,
}

pub fn validate_mission_request(request: &MissionRequest) -> Result<ValidMission, ValidationError> {
    let description = request.description.trim();
    check_length("description", description, 5, 1000)?;
    if description.contains(FORBIDDEN_SHELL_CHARS) {
        return Err(ValidationError::ForbiddenCharacters {
            field: "description",
        });
    }
    let priority = check_allowed(
        "priority",
        &request.priority,
        &["low", "medium", "high", "critical"],
    )?;
    if let Some(user_id) = request.user_id.as_deref() {
        check_length("user_id", user_id, 0, 100)?;
    }
    Ok(ValidMission {
        description: description.to_string(),
        priority: Priority::parse_or_medium(&priority),
        user_id: request
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArticleRequest {
    pub topic: String,
    pub keywords: Vec<String>,
    #[serde(default = "default_target_length")]
    pub target_length: u64,
    #[serde(default = "default_article_language")]
    pub language: String,
    #[serde(default = "default_article_style")]
    pub style: String,
}

fn default_target_length() -> u64 {
    2000
}

fn default_article_language() -> String {
    "ru".to_string()
}

fn default_article_style() -> String {
    "professional".to_string()
}

pub fn validate_article_request(request: &ArticleRequest) -> Result<ArticleRequest, ValidationError> {
    let topic = request.topic.trim();
    check_length("topic", topic, 3, 500)?;
    if request.keywords.is_empty() || request.keywords.len() > 20 {
        return Err(ValidationError::ItemCount {
            field: "keywords",
            min: 1,
            max: 20,
        });
    }
    let keywords = request
        .keywords
        .iter()
        .map(|keyword| {
            let keyword = keyword.trim();
            check_length("keyword", keyword, 2, 50).map(|_| keyword.to_string())
        })
        .collect::<Result<Vec<String>, ValidationError>>()?;
    if !(100..=10_000).contains(&request.target_length) {
        return Err(ValidationError::OutOfRange {
            field: "target_length",
            min: 100,
            max: 10_000,
        });
    }
    Ok(ArticleRequest {
        topic: topic.to_string(),
        keywords,
        target_length: request.target_length,
        language: check_allowed("language", &request.language, ARTICLE_LANGUAGES)?,
        style: check_allowed("style", &request.style, ARTICLE_STYLES)?,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeRequest {
    pub specification: String,
    #[serde(default = "default_code_language")]
    pub language: String,
    pub framework: Option<String>,
    #[serde(default = "default_include_tests")]
    pub include_tests: bool,
}

fn default_code_language() -> String {
    "python".to_string()
}

fn default_include_tests() -> bool {
    true
}

pub fn validate_code_request(request: &CodeRequest) -> Result<CodeRequest, ValidationError> {
    let specification = request.specification.trim();
    check_length("specification", specification, 10, 2000)?;
    if let Some(framework) = request.framework.as_deref() {
        check_length("framework", framework, 0, 100)?;
    }
    Ok(CodeRequest {
        specification: specification.to_string(),
        language: check_allowed("language", &request.language, CODE_LANGUAGES)?,
        framework: request
            .framework
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        include_tests: request.include_tests,
    })
}

pub const MAX_SUMMARY_URLS: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct SummarizeRequest {
    pub urls: Vec<String>,
    #[serde(default = "default_summary_words")]
    pub max_length: u64,
}

fn default_summary_words() -> u64 {
    500
}

pub fn validate_summarize_request(request: &SummarizeRequest) -> Result<SummarizeRequest, ValidationError> {
    if request.urls.is_empty() {
        return Err(ValidationError::ItemCount {
            field: "urls",
            min: 1,
            max: MAX_SUMMARY_URLS,
        });
    }
    let urls = validate_urls(&request.urls, MAX_SUMMARY_URLS)?;
    if !(50..=2_000).contains(&request.max_length) {
        return Err(ValidationError::OutOfRange {
            field: "max_length",
            min: 50,
            max: 2_000,
        });
    }
    Ok(SummarizeRequest {
        urls,
        max_length: request.max_length,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    pub target_language: String,
    pub source_language: Option<String>,
}

pub fn validate_translation_request(request: &TranslationRequest) -> Result<TranslationRequest, ValidationError> {
    let text = validate_text(request.text.trim(), 1, 20_000, false)?;
    let source_language = request
        .source_language
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| check_allowed("source_language", value, ARTICLE_LANGUAGES))
        .transpose()?;
    Ok(TranslationRequest {
        text,
        target_language: check_allowed("target_language", &request.target_language, ARTICLE_LANGUAGES)?,
        source_language,
    })
}
