#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Queue,
    Deploy,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Queue => "QUEUE",
            ErrorCategory::Deploy => "DEPLOY",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Set OPENAI_API_KEY or ANTHROPIC_API_KEY, or make sure Ollama is reachable at --ollama-base-url."
            }
            ErrorCategory::Queue => {
                "Check queue settings (max_concurrent_tasks, task_timeout_secs, max_retries) and retry with RUST_LOG=debug."
            }
            ErrorCategory::Deploy => {
                "Run ai-corp doctor, check 'ai-corp compose logs', and verify the health URL is reachable."
            }
            ErrorCategory::Input => "Run ai-corp --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

/// First matching rule wins, so deploy failures that mention a model are
/// still reported as deploy errors.
const CATEGORY_RULES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Deploy,
        &["prerequisite", "health check", "compose", "docker"],
    ),
    (
        ErrorCategory::Provider,
        &["api_key", "provider", "ollama", "model"],
    ),
    (
        ErrorCategory::Input,
        &["--force", "invalid value", "validation", "configuration"],
    ),
    (ErrorCategory::Queue, &["task", "queue", "mission"]),
];

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();
    CATEGORY_RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| msg.contains(needle)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Internal)
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let text = format!("{err:#}");
    if show_sensitive_config {
        text
    } else {
        redact_sensitive_text(&text)
    }
}

pub fn redact_sensitive_text(text: &str) -> String {
    redact_connection_urls(text)
}

const CONNECTION_PREFIXES: &[&str] = &["postgresql", "postgres", "sqlite:", "redis://", "rediss://"];

fn ends_connection_token(ch: char) -> bool {
    ch.is_whitespace() || "\"'()[]{},;".contains(ch)
}

/// Replaces every connection string (up to the next delimiter) with its
/// redacted form.
pub fn redact_connection_urls(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut rest = 0usize;
    loop {
        let next = CONNECTION_PREFIXES
            .iter()
            .filter_map(|prefix| lower[rest..].find(prefix))
            .min();
        let Some(offset) = next else {
            out.push_str(&text[rest..]);
            return out;
        };
        let start = rest + offset;
        let len = text[start..]
            .find(ends_connection_token)
            .unwrap_or(text.len() - start)
            .max(1);
        out.push_str(&text[rest..start]);
        out.push_str(&redact_connection_url_value(&text[start..start + len]));
        rest = start + len;
    }
}

/// Keeps the scheme and replaces everything after it.
pub fn redact_connection_url_value(value: &str) -> String {
    match value.split_once("://") {
        Some((scheme, _)) => format!("{scheme}://[REDACTED]"),
        None => match value.split_once(':') {
            Some((scheme, _)) => format!("{scheme}:[REDACTED]"),
            None => value.to_string(),
        },
    }
}
