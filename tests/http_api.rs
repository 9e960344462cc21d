use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use cisnr_assistant::config::Secret;
use cisnr_assistant::models::{ChatResponse, HealthResponse, ResourcesResponse};
use cisnr_assistant::rag::embeddings::Embedder;
use cisnr_assistant::rag::generation::Generator;
use cisnr_assistant::rag::prompt::PromptComposer;
use cisnr_assistant::rag::vector_store::VectorStore;
use cisnr_assistant::server::{build_router, AppState, SESSION_COOKIE};
use cisnr_assistant::{ChatEngine, ChatError, Result, RetrievedChunk};

struct FakeEmbedder;

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![0.1, 0.2, 0.3])
    }

    fn name(&self) -> &str {
        "fake-embedder"
    }
}

struct FakeStore {
    chunks: Vec<RetrievedChunk>,
    healthy: bool,
    fail: bool,
}

#[async_trait]
impl VectorStore for FakeStore {
    async fn query(&self, _vector: &[f32], top_k: u64) -> Result<Vec<RetrievedChunk>> {
        if self.fail {
            return Err(ChatError::retrieval("qdrant search failed: status Unavailable at 10.0.3.7:6334"));
        }
        Ok(self.chunks.iter().take(top_k as usize).cloned().collect())
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}

#[derive(Default)]
struct FakeGenerator {
    fail: bool,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
        if self.fail {
            return Err(ChatError::generation("upstream 503: quota-project-1234 exhausted"));
        }
        Ok("CISNR researches wireless sensor networks and embedded systems.".to_string())
    }

    fn name(&self) -> &str {
        "fake-generator"
    }
}

fn chunk(text: &str, source: &str, score: f32) -> RetrievedChunk {
    RetrievedChunk {
        text: text.to_string(),
        source_id: source.to_string(),
        score,
    }
}

fn cisnr_chunks() -> Vec<RetrievedChunk> {
    vec![
        chunk("CISNR works on wireless sensor networks.", "doc-1", 0.92),
        chunk("CISNR runs an embedded systems lab.", "doc-3", 0.87),
        chunk("The sensor lab hosts student projects.", "doc-1", 0.80),
    ]
}

struct Harness {
    app: Router,
    generator: Arc<FakeGenerator>,
    _static_dir: tempfile::TempDir,
}

fn harness(chunks: Vec<RetrievedChunk>, healthy: bool, fail_generation: bool) -> Harness {
    let store = FakeStore {
        chunks,
        healthy,
        fail: false,
    };
    harness_with_store(store, fail_generation)
}

fn harness_with_store(store: FakeStore, fail_generation: bool) -> Harness {
    let static_dir = tempfile::tempdir().unwrap();
    std::fs::write(static_dir.path().join("index.html"), "<h1>CISNR chat</h1>").unwrap();

    let generator = Arc::new(FakeGenerator {
        fail: fail_generation,
        ..FakeGenerator::default()
    });
    let engine = ChatEngine::new(
        Arc::new(FakeEmbedder),
        Arc::new(store),
        generator.clone(),
        PromptComposer::default(),
        6,
    );
    let state = AppState::new(engine, &Secret::new("test-secret"), static_dir.path());

    Harness {
        app: build_router(state, Duration::from_secs(5)),
        generator,
        _static_dir: static_dir,
    }
}

fn json_chat(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

#[tokio::test]
async fn chat_returns_answer_with_distinct_sources() {
    let h = harness(cisnr_chunks(), true, false);

    let response = h
        .app
        .oneshot(json_chat(serde_json::json!({ "question": "What does CISNR do?" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(cookie.starts_with(SESSION_COOKIE));

    let body = body_bytes(response).await;
    let parsed: ChatResponse = tokio_test::assert_ok!(serde_json::from_slice(&body));
    assert_eq!(parsed.sources, vec!["doc-1", "doc-3"]);
    assert_eq!(parsed.question, "What does CISNR do?");
    assert!(parsed.answer.contains("wireless sensor networks"));
    assert!(!parsed.session_id.is_empty());

    let prompt = h.generator.last_prompt.lock().unwrap().clone().unwrap();
    assert!(prompt.contains("CISNR runs an embedded systems lab."));
}

#[tokio::test]
async fn chat_accepts_form_body_with_role() {
    let h = harness(cisnr_chunks(), true, false);

    let request = Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("question=Which+labs+exist%3F&role=Student"))
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let parsed: ChatResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(parsed.question, "Which labs exist?");

    let prompt = h.generator.last_prompt.lock().unwrap().clone().unwrap();
    assert!(prompt.contains("Question: [User: Student] Which labs exist?"));
}

#[tokio::test]
async fn chat_accepts_message_alias_and_keeps_session_id() {
    let h = harness(cisnr_chunks(), true, false);

    let response = h
        .app
        .oneshot(json_chat(serde_json::json!({
            "message": "Who leads CISNR?",
            "session_id": "session-42"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let parsed: ChatResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(parsed.question, "Who leads CISNR?");
    assert_eq!(parsed.session_id, "session-42");
}

#[tokio::test]
async fn missing_or_blank_question_is_rejected_without_generation() {
    for body in [serde_json::json!({}), serde_json::json!({ "question": "   " })] {
        let h = harness(cisnr_chunks(), true, false);
        let response = h.app.oneshot(json_chat(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let parsed: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(parsed["error"]["type"], "validation_error");
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let h = harness(cisnr_chunks(), true, false);
    let request = Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"question\": "))
        .unwrap();

    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn generation_failure_hides_provider_details() {
    let h = harness(cisnr_chunks(), true, true);

    let response = h
        .app
        .oneshot(json_chat(serde_json::json!({ "question": "What does CISNR do?" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("generation_error"));
    assert!(text.contains("Please try again"));
    assert!(!text.contains("quota-project-1234"));
    assert!(!text.contains("503"));
}

#[tokio::test]
async fn vector_store_failure_is_a_generic_server_error() {
    let h = harness_with_store(
        FakeStore {
            chunks: cisnr_chunks(),
            healthy: true,
            fail: true,
        },
        false,
    );

    let response = h
        .app
        .oneshot(json_chat(serde_json::json!({ "question": "What does CISNR do?" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("retrieval_error"));
    assert!(text.contains("Please try again"));
    assert!(!text.contains("qdrant"));
    assert!(!text.contains("10.0.3.7"));
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn html_clients_get_a_rendered_fragment() {
    let h = harness(cisnr_chunks(), true, false);

    let request = Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::ACCEPT, "text/html")
        .body(Body::from("question=What+does+CISNR+do%3F"))
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/html"));
    let html = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(html.contains("class=\"answer\""));
    assert!(html.contains("<li>doc-1</li>"));
    assert!(html.contains("<li>doc-3</li>"));
}

#[tokio::test]
async fn empty_index_still_answers() {
    let h = harness(Vec::new(), true, false);

    let response = h
        .app
        .oneshot(json_chat(serde_json::json!({ "question": "Who founded CISNR?" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let parsed: ChatResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert!(parsed.sources.is_empty());

    let prompt = h.generator.last_prompt.lock().unwrap().clone().unwrap();
    assert!(prompt.contains("No relevant documents were found"));
}

#[tokio::test]
async fn health_reports_vector_store_state() {
    for (healthy, status, label) in [
        (true, StatusCode::OK, "healthy"),
        (false, StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    ] {
        let h = harness(cisnr_chunks(), healthy, false);
        let request = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let response = h.app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), status);
        let parsed: HealthResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(parsed.status, label);
        assert_eq!(parsed.dependencies.vector_store, healthy);
        assert_eq!(parsed.dependencies.embedding_provider, "fake-embedder");
        assert_eq!(parsed.dependencies.generation_provider, "fake-generator");
    }
}

#[tokio::test]
async fn resources_lists_static_links() {
    let h = harness(cisnr_chunks(), true, false);
    let request = Request::builder().uri("/api/resources").body(Body::empty()).unwrap();
    let response = h.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let parsed: ResourcesResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(parsed.count, 4);
    assert_eq!(parsed.resources.len(), 4);
    assert_eq!(parsed.resources[0].title, "Research Publications");
}

#[tokio::test]
async fn root_serves_the_chat_page() {
    let h = harness(cisnr_chunks(), true, false);
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = h.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let html = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(html.contains("CISNR chat"));
}
