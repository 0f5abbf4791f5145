//! REST API server for the financial assistant
//!
//! Exposes the chat agent and the transaction ledger over HTTP. The chat
//! endpoints require a bearer token whenever a token verifier is configured;
//! auth failures are hard rejections, never chat replies.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::{FinancialAgent, ReplyChunk};
use crate::auth::{TokenVerifier, UserIdentity};
use crate::currency;
use crate::error::AgentError;
use crate::models::{parse_date_input, ChatMessage, NewTransaction, TransactionType};
use crate::store::TransactionStore;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionCreateRequest {
    pub amount: f64,
    pub description: String,
    pub category: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub date: Option<String>,
}

/// =============================
/// Response Models
/// =============================

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub message: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<FinancialAgent>,
    pub store: Arc<TransactionStore>,
    pub verifier: Option<Arc<TokenVerifier>>,
}

/// Validate the bearer token when a verifier is configured. Without one the
/// API runs open and the caller is anonymous.
async fn authorize(state: &ApiState, headers: &HeaderMap) -> crate::Result<Option<UserIdentity>> {
    let Some(verifier) = &state.verifier else {
        return Ok(None);
    };

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AgentError::UpstreamAuth("Missing bearer token".to_string()))?;

    verifier.verify(token).await.map(Some)
}

fn status_for_error(error: &AgentError) -> StatusCode {
    match error {
        AgentError::UpstreamAuth(_) => StatusCode::UNAUTHORIZED,
        AgentError::InvalidAmount(_) | AgentError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoints
/// =============================

async fn root() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "success".to_string(),
        message: "Financial Assistant API is running!".to_string(),
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        message: "API is operational".to_string(),
    })
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> (StatusCode, Json<ChatResponse>) {
    if let Err(error) = authorize(&state, &headers).await {
        return (
            status_for_error(&error),
            Json(ChatResponse {
                response: error.to_string(),
                message: request.message,
                status: "error".to_string(),
            }),
        );
    }

    info!("Chat request: {}", request.message);

    match state.agent.chat(&request.message, &request.chat_history).await {
        Ok(reply) => (
            StatusCode::OK,
            Json(ChatResponse {
                response: reply,
                message: request.message,
                status: "success".to_string(),
            }),
        ),
        Err(error) => (
            status_for_error(&error),
            Json(ChatResponse {
                response: format!("Error processing your request: {}", error),
                message: request.message,
                status: "error".to_string(),
            }),
        ),
    }
}

/// =============================
/// Streaming Chat Endpoint
/// =============================

type EventStream = Sse<ReceiverStream<std::result::Result<Event, Infallible>>>;

async fn chat_stream_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> std::result::Result<EventStream, (StatusCode, Json<ChatResponse>)> {
    if let Err(error) = authorize(&state, &headers).await {
        return Err((
            status_for_error(&error),
            Json(ChatResponse {
                response: error.to_string(),
                message: request.message,
                status: "error".to_string(),
            }),
        ));
    }

    let (chunk_sender, mut chunk_receiver) = mpsc::channel::<ReplyChunk>(32);
    let (event_sender, event_receiver) = mpsc::channel(32);

    let agent = state.agent.clone();
    tokio::spawn(async move {
        agent
            .chat_stream(&request.message, &request.chat_history, chunk_sender)
            .await;
    });

    tokio::spawn(async move {
        while let Some(chunk) = chunk_receiver.recv().await {
            let event = match chunk {
                ReplyChunk::Content(content) => Event::default().data(
                    serde_json::json!({ "type": "content", "content": content }).to_string(),
                ),
                ReplyChunk::Error(message) => Event::default().data(
                    serde_json::json!({ "type": "error", "message": message }).to_string(),
                ),
                // Terminal marker: the stream is complete.
                ReplyChunk::Done => Event::default().data("[DONE]"),
            };
            if event_sender.send(Ok(event)).await.is_err() {
                break;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(event_receiver)).keep_alive(KeepAlive::default()))
}

/// =============================
/// Transaction Endpoint
/// =============================

async fn create_transaction_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<TransactionCreateRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if let Err(error) = authorize(&state, &headers).await {
        return (
            status_for_error(&error),
            Json(serde_json::json!({ "detail": error.to_string() })),
        );
    }

    let result = async {
        let amount = currency::f64_to_minor_units(request.amount)?;
        currency::validate_minor_units(amount)?;

        let kind: TransactionType = request.kind.parse()?;
        let date = match &request.date {
            Some(text) if !text.trim().is_empty() => Some(parse_date_input(text)?),
            _ => None,
        };

        state
            .store
            .insert(NewTransaction {
                amount,
                description: request.description.clone(),
                category: request.category.clone(),
                kind,
                date,
            })
            .await
    }
    .await;

    match result {
        Ok(transaction) => (StatusCode::CREATED, Json(transaction.to_api_json())),
        Err(error) => (
            status_for_error(&error),
            Json(serde_json::json!({ "detail": error.to_string() })),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/chat", post(chat_handler))
        .route("/chat/stream", post(chat_stream_handler))
        .route("/transaction", post(create_transaction_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ChatModel;
    use crate::gemini::{Content, FunctionDeclaration, LlmTurn};
    use crate::tools::ToolRegistry;

    struct SilentModel;

    #[async_trait::async_trait]
    impl ChatModel for SilentModel {
        async fn generate_turn(
            &self,
            _system: &str,
            _contents: Vec<Content>,
            _declarations: &[FunctionDeclaration],
        ) -> crate::Result<LlmTurn> {
            Err(AgentError::Llm("no model in tests".to_string()))
        }
    }

    fn test_state() -> ApiState {
        ApiState {
            agent: Arc::new(FinancialAgent::new(
                Arc::new(SilentModel),
                ToolRegistry::new(),
            )),
            store: Arc::new(TransactionStore::in_memory()),
            verifier: None,
        }
    }

    #[tokio::test]
    async fn test_authorize_is_anonymous_without_verifier() {
        let state = test_state();
        let identity = authorize(&state, &HeaderMap::new()).await.unwrap();
        assert!(identity.is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for_error(&AgentError::UpstreamAuth("no".to_string())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for_error(&AgentError::Validation("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for_error(&AgentError::InvalidAmount("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for_error(&AgentError::Database("down".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_create_transaction_handler_round_trip() {
        let state = test_state();
        let store = state.store.clone();

        let (status, Json(body)) = create_transaction_handler(
            State(state),
            HeaderMap::new(),
            Json(TransactionCreateRequest {
                amount: 50.0,
                description: "Groceries".to_string(),
                category: "groceries".to_string(),
                kind: "expense".to_string(),
                date: Some("2025-03-01".to_string()),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["amount"], 5000);
        assert_eq!(body["type"], "expense");
        assert!(body["date"].as_str().unwrap().starts_with("2025-03-01"));

        let stored = store.query(&Default::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_create_transaction_handler_rejects_bad_date() {
        let (status, Json(body)) = create_transaction_handler(
            State(test_state()),
            HeaderMap::new(),
            Json(TransactionCreateRequest {
                amount: 10.0,
                description: "Lunch".to_string(),
                category: "food".to_string(),
                kind: "expense".to_string(),
                date: Some("03/01/2025".to_string()),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("Invalid date"));
    }
}
