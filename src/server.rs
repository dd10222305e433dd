use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};

use crate::agents::AgentResult;
use crate::agents::ceo::Mission;
use crate::app::Corporation;
use crate::router::AvailableModels;
use crate::telemetry::TelemetrySink;
use crate::validators::{
    ArticleRequest, CodeRequest, MissionRequest, SummarizeRequest, TranslationRequest,
    validate_article_request, validate_code_request, validate_mission_request,
    validate_summarize_request, validate_translation_request,
};

pub const API_TOKEN_ENV: &str = "AI_CORP_API_TOKEN";

#[derive(Clone)]
pub struct ServerState {
    pub corp: Arc<Corporation>,
    pub telemetry: TelemetrySink,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MissionAccepted {
    pub mission_id: String,
    pub status: &'static str,
    pub description: String,
    pub estimated_time: f64,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Malformed or incomplete bodies get the same 400 shape as validation errors.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| api_error(StatusCode::BAD_REQUEST, rejection.body_text()))
}

fn internal_error(err: anyhow::Error) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

pub fn check_server_auth(
    state: &ServerState,
    headers: &axum::http::HeaderMap,
) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let provided_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }

    Ok(())
}

pub async fn handle_root() -> Json<Value> {
    Json(json!({
        "name": "ai-corp",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

pub async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

pub async fn handle_status(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let corp = &state.corp;
    let gpu = corp.router.vram().status();
    let loaded_models = gpu
        .loaded_models
        .iter()
        .map(|model| model.name.clone())
        .collect::<Vec<_>>();
    Json(json!({
        "status": "operational",
        "queue": corp.queue.queue_status(),
        "gpu": gpu,
        "loaded_models": loaded_models,
        "agents": corp.registry.stats(),
        "missions": corp.ceo.mission_count().await,
        "usage": corp.router.usage()
    }))
}

pub async fn handle_create_mission(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    payload: Result<Json<MissionRequest>, JsonRejection>,
) -> ApiResult<MissionAccepted> {
    check_server_auth(&state, &headers)?;
    let request = json_body(payload)?;
    let mission = validate_mission_request(&request)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;

    let mission_id = state
        .corp
        .ceo
        .receive_mission(&mission.description, mission.user_id, mission.priority)
        .await
        .map_err(internal_error)?;
    let estimated_hours = state
        .corp
        .ceo
        .get_mission(&mission_id)
        .await
        .map(|mission| mission.estimated_time_hours)
        .unwrap_or(1.0);

    Ok(Json(MissionAccepted {
        mission_id,
        status: "accepted",
        description: mission.description,
        estimated_time: estimated_hours * 3600.0,
    }))
}

pub async fn handle_list_missions(State(state): State<Arc<ServerState>>) -> Json<Vec<Mission>> {
    Json(state.corp.ceo.list_missions().await)
}

pub async fn handle_get_mission(
    State(state): State<Arc<ServerState>>,
    Path(mission_id): Path<String>,
) -> ApiResult<Mission> {
    state
        .corp
        .ceo
        .get_mission(&mission_id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Mission not found"))
}

fn agent_outcome(result: Result<AgentResult>) -> ApiResult<AgentResult> {
    match result {
        Ok(result) if result.success => Ok(Json(result)),
        Ok(result) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            result
                .error
                .unwrap_or_else(|| "agent reported failure".to_string()),
        )),
        Err(err) => Err(internal_error(err)),
    }
}

pub async fn handle_generate_article(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    payload: Result<Json<ArticleRequest>, JsonRejection>,
) -> ApiResult<AgentResult> {
    check_server_auth(&state, &headers)?;
    let request = validate_article_request(&json_body(payload)?)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    let outcome = agent_outcome(state.corp.content.generate_article(&request).await);
    state.telemetry.emit(
        "server.article",
        json!({ "topic": request.topic, "ok": outcome.is_ok() }),
    );
    outcome
}

pub async fn handle_summarize(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    payload: Result<Json<SummarizeRequest>, JsonRejection>,
) -> ApiResult<AgentResult> {
    check_server_auth(&state, &headers)?;
    let request = validate_summarize_request(&json_body(payload)?)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    let outcome = agent_outcome(state.corp.content.summarize_pages(&request).await);
    state.telemetry.emit(
        "server.summarize",
        json!({ "urls": request.urls.len(), "ok": outcome.is_ok() }),
    );
    outcome
}

pub async fn handle_translate(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    payload: Result<Json<TranslationRequest>, JsonRejection>,
) -> ApiResult<AgentResult> {
    check_server_auth(&state, &headers)?;
    let request = validate_translation_request(&json_body(payload)?)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    let outcome = agent_outcome(state.corp.content.translate(&request).await);
    state.telemetry.emit(
        "server.translate",
        json!({ "language": request.target_language, "ok": outcome.is_ok() }),
    );
    outcome
}

pub async fn handle_generate_code(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    payload: Result<Json<CodeRequest>, JsonRejection>,
) -> ApiResult<AgentResult> {
    check_server_auth(&state, &headers)?;
    let request = validate_code_request(&json_body(payload)?)
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    let outcome = agent_outcome(state.corp.devops.generate_code(&request).await);
    state.telemetry.emit(
        "server.code",
        json!({ "language": request.language, "ok": outcome.is_ok() }),
    );
    outcome
}

pub async fn handle_models(State(state): State<Arc<ServerState>>) -> Json<AvailableModels> {
    Json(state.corp.router.available_models())
}

pub async fn handle_docs() -> Json<Value> {
    Json(json!({
        "name": "ai-corp",
        "version": env!("CARGO_PKG_VERSION"),
        "auth": format!("Bearer token required on POST routes when {API_TOKEN_ENV} is set"),
        "routes": [
            { "method": "GET", "path": "/", "description": "Service banner" },
            { "method": "GET", "path": "/health", "description": "Liveness check" },
            { "method": "GET", "path": "/status", "description": "Queue, GPU and agent status" },
            { "method": "GET", "path": "/api/status", "description": "Alias of /status" },
            { "method": "POST", "path": "/missions", "description": "Submit a mission {description, priority?, user_id?}" },
            { "method": "GET", "path": "/missions", "description": "List missions, newest first" },
            { "method": "GET", "path": "/missions/{id}", "description": "Mission detail with task results" },
            { "method": "POST", "path": "/content/articles", "description": "Generate an article {topic, keywords, target_length?, language?, style?}" },
            { "method": "POST", "path": "/content/summarize", "description": "Summarize web pages {urls, max_length?}" },
            { "method": "POST", "path": "/content/translate", "description": "Translate text {text, target_language, source_language?}" },
            { "method": "POST", "path": "/code/generate", "description": "Generate code {specification, language?, framework?, include_tests?}" },
            { "method": "GET", "path": "/models", "description": "Loaded, local and cloud models" },
            { "method": "GET", "path": "/docs", "description": "This index" }
        ]
    }))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/api/status", get(handle_status))
        .route(
            "/missions",
            post(handle_create_mission).get(handle_list_missions),
        )
        .route("/missions/{mission_id}", get(handle_get_mission))
        .route("/content/articles", post(handle_generate_article))
        .route("/content/summarize", post(handle_summarize))
        .route("/content/translate", post(handle_translate))
        .route("/code/generate", post(handle_generate_code))
        .route("/models", get(handle_models))
        .route("/docs", get(handle_docs))
        .with_state(state)
}

pub fn api_token_from_env() -> Option<String> {
    std::env::var(API_TOKEN_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn run_server(
    corp: Arc<Corporation>,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;

    corp.start().await;
    let state = Arc::new(ServerState {
        corp: corp.clone(),
        telemetry: telemetry.clone(),
        auth_token: api_token_from_env(),
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "auth": state.auth_token.is_some()
        }),
    );
    println!(
        "API listening on http://{} (health: /health, status: /api/status, docs: /docs)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind server listener on {addr}"))?;
    let served = axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed");
    corp.shutdown().await?;
    served
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
