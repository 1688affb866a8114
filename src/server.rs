//! HTTP front end for the chat chain.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Minimal browser chat page |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/chat` | `{ message, history }` → `{ answer, standalone_question, sources }` |
//! | `POST` | `/search` | `{ query, mode?, doc_type?, since?, limit? }` → `{ results }` |
//!
//! The server keeps no conversation state: the client sends the transcript
//! with every `/chat` request.
//!
//! Errors are JSON:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::chat::{
    count_documents, ChatAnswer, ChatMessage, ConversationMemory, ConversationalRetrieval,
    StoreRetriever,
};
use crate::config::Config;
use crate::db;
use crate::migrate::migrate_pool;
use crate::llm::{ChatModel, OpenAiChat};
use crate::search::{search_documents, SearchFilter, SearchMode, SearchResult};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    model: Arc<dyn ChatModel>,
}

pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    let model: Arc<dyn ChatModel> = Arc::new(OpenAiChat::from_config(&config.llm)?);
    println!("Documents in store: {}", count_documents(&pool).await?);

    let app = router(config.clone(), pool, model);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("chat server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(config: Config, pool: SqlitePool, model: Arc<dyn ChatModel>) -> Router {
    let state = AppState {
        config: Arc::new(config),
        pool,
        model,
    };
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .route("/search", post(handle_search))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

/// Map a pipeline error to a response. Configuration problems and bad
/// input are the caller's to fix; anything else is ours.
fn classify(err: anyhow::Error) -> AppError {
    let message = format!("{:#}", err);
    if message.contains("requires embeddings") {
        AppError {
            status: StatusCode::BAD_REQUEST,
            code: "embeddings_disabled",
            message,
        }
    } else if message.contains("invalid --since") {
        bad_request(message)
    } else {
        tracing::error!("request failed: {}", message);
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn handle_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatAnswer>, AppError> {
    let message = request.message.trim();
    if message.is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let memory = ConversationMemory::from_history(
        &request.history,
        state.config.chat.max_history_turns,
    );
    let retriever = StoreRetriever::new(state.pool.clone(), (*state.config).clone());
    let mut chain = ConversationalRetrieval::new(state.model.clone(), Arc::new(retriever), memory);
    let answer = chain.ask(message).await.map_err(classify)?;
    Ok(Json(answer))
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    mode: SearchMode,
    #[serde(flatten)]
    filter: SearchFilter,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let limit = request
        .limit
        .unwrap_or(state.config.retrieval.final_limit.max(1) as usize);
    let results = search_documents(
        &state.pool,
        &state.config,
        &request.query,
        request.mode,
        &request.filter,
        limit,
    )
    .await
    .map_err(classify)?;
    Ok(Json(SearchResponse { results }))
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>dchat</title>
<style>
body { font-family: sans-serif; max-width: 46rem; margin: 2rem auto; }
#log div { margin: .5rem 0; white-space: pre-wrap; }
.user { font-weight: bold; }
.sources { font-size: .85rem; color: #555; }
form { display: flex; gap: .5rem; }
input { flex: 1; padding: .4rem; }
</style>
</head>
<body>
<h1>Chat with your Drive</h1>
<div id="log"></div>
<form id="ask"><input id="q" autocomplete="off" autofocus><button>Send</button></form>
<script>
const history = [];
const log = document.getElementById("log");
function line(cls, text) {
  const d = document.createElement("div");
  d.className = cls;
  d.textContent = text;
  log.appendChild(d);
}
document.getElementById("ask").addEventListener("submit", async (e) => {
  e.preventDefault();
  const q = document.getElementById("q");
  const message = q.value.trim();
  if (!message) return;
  q.value = "";
  line("user", message);
  const res = await fetch("/chat", {
    method: "POST",
    headers: { "content-type": "application/json" },
    body: JSON.stringify({ message, history }),
  });
  const body = await res.json();
  if (!res.ok) { line("error", body.error.message); return; }
  line("bot", body.answer);
  if (body.sources.length) {
    line("sources", body.sources.map(s => s.source_url || s.source_id).join("\n"));
  }
  history.push({ role: "user", content: message }, { role: "assistant", content: body.answer });
});
</script>
</body>
</html>
"#;
