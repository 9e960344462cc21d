//! HTTP surface: chat endpoint, health, resources and the static chat UI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    async_trait,
    error_handling::HandleErrorLayer,
    extract::{FromRef, FromRequest, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    BoxError, Form, Json, Router,
};
use axum_extra::extract::cookie::{Cookie, Key, SameSite, SignedCookieJar};
use chrono::Utc;
use sha2::{Digest, Sha512};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::config::Secret;
use crate::error::{ChatError, Result};
use crate::models::{
    Answer, ChatRequest, ChatResponse, DependencyStatus, HealthResponse, ResourceLink,
    ResourcesResponse,
};
use crate::rag::ChatEngine;

pub const SESSION_COOKIE: &str = "cisnr_session";
const SERVICE_NAME: &str = "CISNR Research Assistant";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: ChatEngine,
    cookie_key: Key,
    static_dir: PathBuf,
}

impl AppState {
    pub fn new(engine: ChatEngine, secret_key: &Secret, static_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                engine,
                cookie_key: derive_cookie_key(secret_key),
                static_dir: static_dir.into(),
            }),
        }
    }

    pub fn engine(&self) -> &ChatEngine {
        &self.inner.engine
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.inner.cookie_key.clone()
    }
}

/// Cookie signing needs 64 bytes of key material; SHA-512 stretches any secret to that.
fn derive_cookie_key(secret: &Secret) -> Key {
    let digest = Sha512::digest(secret.expose().as_bytes());
    Key::from(digest.as_slice())
}

/// `request_timeout` bounds a whole request, on top of the per-call timeouts in the engine.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let static_files = ServeDir::new(&state.inner.static_dir);

    Router::new()
        .route("/chat", post(chat_handler))
        .route("/api/health", get(health_check))
        .route("/api/resources", get(list_resources))
        .fallback_service(static_files)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(HandleErrorLayer::new(handle_timeout))
                .timeout(request_timeout),
        )
        .layer(cors)
        .with_state(state)
}

async fn handle_timeout(err: BoxError) -> (StatusCode, Json<serde_json::Value>) {
    if err.is::<tower::timeout::error::Elapsed>() {
        tracing::warn!("Request timed out");
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(serde_json::json!({
                "error": { "type": "timeout", "message": "The request took too long. Please try again." }
            })),
        )
    } else {
        tracing::error!("Unhandled middleware error: {}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": { "type": "internal_error", "message": crate::error::GENERIC_FAILURE_MESSAGE }
            })),
        )
    }
}

/// A chat request decoded from either a JSON or a urlencoded form body.
pub struct ChatInput(pub ChatRequest);

#[async_trait]
impl<S> FromRequest<S> for ChatInput
where
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            let Form(request) = Form::<ChatRequest>::from_request(req, state)
                .await
                .map_err(|e| ChatError::validation(e.body_text()))?;
            Ok(Self(request))
        } else {
            let Json(request) = Json::<ChatRequest>::from_request(req, state)
                .await
                .map_err(|e| ChatError::validation(e.body_text()))?;
            Ok(Self(request))
        }
    }
}

async fn chat_handler(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    headers: HeaderMap,
    ChatInput(request): ChatInput,
) -> Result<(SignedCookieJar, Response)> {
    let question = match request.question.as_deref().map(str::trim) {
        None => return Err(ChatError::validation("question is required")),
        Some("") => return Err(ChatError::validation("question cannot be empty")),
        Some(q) => q.to_string(),
    };

    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .or_else(|| jar.get(SESSION_COOKIE).map(|c| c.value().to_string()))
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let request_id = Uuid::new_v4();

    tracing::info!(%request_id, session = %session_id, "Received question: {}", question);

    let answer = state
        .engine()
        .answer_as(&question, request.role.as_deref())
        .await?;

    tracing::info!(
        %request_id,
        sources = answer.sources.len(),
        "Answered question"
    );

    let cookie = Cookie::build((SESSION_COOKIE, session_id.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    let jar = jar.add(cookie);

    let response = if prefers_html(&headers) {
        Html(render_answer(&answer)).into_response()
    } else {
        Json(ChatResponse {
            answer: answer.text,
            sources: answer.sources,
            question,
            session_id,
            timestamp: Utc::now(),
        })
        .into_response()
    };

    Ok((jar, response))
}

/// True when `text/html` has a higher `Accept` quality than `application/json`.
/// Equal qualities go to whichever is listed first; wildcards count for neither.
fn prefers_html(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };

    let mut best: Option<(f32, bool)> = None;
    for media in accept.split(',') {
        let mut params = media.split(';');
        let is_html = match params.next().unwrap_or("").trim() {
            "text/html" => true,
            "application/json" => false,
            _ => continue,
        };
        let quality = params
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);

        if quality > 0.0 && best.map_or(true, |(q, _)| quality > q) {
            best = Some((quality, is_html));
        }
    }
    best.is_some_and(|(_, html)| html)
}

fn render_answer(answer: &Answer) -> String {
    let body = escape_html(&answer.text).replace('\n', "<br>\n");
    let mut html = format!(
        "<div class=\"message assistant\">\n<div class=\"answer\">{}</div>\n",
        body
    );
    if !answer.sources.is_empty() {
        html.push_str("<ul class=\"sources\">\n");
        for source in &answer.sources {
            html.push_str(&format!("<li>{}</li>\n", escape_html(source)));
        }
        html.push_str("</ul>\n");
    }
    html.push_str("</div>\n");
    html
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let engine = state.engine();
    let vector_store = engine.vector_store_healthy().await;
    let (status, code) = if vector_store {
        ("healthy", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            dependencies: DependencyStatus {
                vector_store,
                embedding_provider: engine.embedder_name().to_string(),
                generation_provider: engine.generator_name().to_string(),
            },
        }),
    )
}

fn resource(title: &str, url: &str, icon: &str, category: &str, description: &str) -> ResourceLink {
    ResourceLink {
        title: title.to_string(),
        url: url.to_string(),
        icon: icon.to_string(),
        category: category.to_string(),
        description: description.to_string(),
    }
}

async fn list_resources() -> Json<ResourcesResponse> {
    let resources = vec![
        resource(
            "Research Publications",
            "/publications",
            "file-pdf",
            "academic",
            "Access our latest research papers and publications",
        ),
        resource(
            "Academic Programs",
            "/programs",
            "graduation-cap",
            "education",
            "Learn about our academic offerings and collaborations",
        ),
        resource(
            "Research Team",
            "/team",
            "users",
            "people",
            "Meet our researchers and faculty members",
        ),
        resource(
            "Facilities & Equipment",
            "/facilities",
            "microscope",
            "infrastructure",
            "Explore our laboratories and research equipment",
        ),
    ];

    Json(ResourcesResponse {
        count: resources.len(),
        resources,
        last_updated: Utc::now().format("%Y-%m-%d").to_string(),
    })
}
