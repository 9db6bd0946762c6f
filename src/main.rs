//! canvas-store - document service for per-customer canvas documents
//!
//! Serves the sled document store over:
//! - `GET/PUT /api/documents/:subject_id` for loading and saving documents
//! - `GET /ws/:subject_id`, a push channel announcing every stored save
//! - Binary framed protocol on the push channel, JSON text frames for debugging

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use canvas_sync::protocol::{
    ClientMessage, ErrorCode, PushProtocol, ServerMessage, PROTOCOL_VERSION,
};
use canvas_sync::scene::{Document, Scene, SubjectId};
use canvas_sync::source::SaveRequest;
use canvas_sync::storage::{DocumentMetadata, DocumentStore, StorageConfig, StorageError};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Server settings, read from the environment (and `.env`)
#[derive(Debug, Clone)]
struct ServerConfig {
    port: u16,
    storage_path: String,
    /// JSON file holding the scene new subjects are seeded from
    template_path: Option<String>,
    flush_interval: Duration,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5000),
            storage_path: std::env::var("STORAGE_PATH")
                .unwrap_or_else(|_| "./data/canvas.sled".to_string()),
            template_path: std::env::var("TEMPLATE_PATH").ok(),
            flush_interval: Duration::from_millis(
                std::env::var("FLUSH_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5000),
            ),
        }
    }
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    store: DocumentStore,
    /// Server start time
    started_at: std::time::Instant,
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    documents: usize,
    push_subscribers: usize,
}

#[derive(Debug, Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentMetadata>,
    total: usize,
}

#[derive(Debug, Serialize)]
struct SaveResponse {
    subject_id: SubjectId,
    save_count: u64,
    updated_at: i64,
}

type ApiError = (StatusCode, String);

fn storage_error(e: StorageError) -> ApiError {
    match e {
        StorageError::InvalidSubject(subject) => (
            StatusCode::BAD_REQUEST,
            format!("Not a document subject: {}", subject),
        ),
        other => {
            error!("Storage error: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.store.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        documents: stats.document_count,
        push_subscribers: stats.subscriber_count,
    })
}

/// List stored documents
async fn list_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DocumentListResponse>, ApiError> {
    let documents = state.store.list_documents().map_err(storage_error)?;
    let total = documents.len();
    Ok(Json(DocumentListResponse { documents, total }))
}

/// Load one document; 404 when the subject has none
async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    let subject = SubjectId::new(subject_id);
    state
        .store
        .load_document(&subject)
        .map_err(storage_error)?
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("No document for {}", subject)))
}

/// Store one save
async fn put_document(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
    Json(request): Json<SaveRequest>,
) -> Result<Json<SaveResponse>, ApiError> {
    let subject = SubjectId::new(subject_id);
    state
        .store
        .apply_save(&subject, request)
        .map_err(storage_error)?;

    let meta = state
        .store
        .get_metadata(&subject)
        .map_err(storage_error)?
        .unwrap_or_else(|| DocumentMetadata::new(subject.clone()));

    debug!("Saved {} via HTTP", subject);
    Ok(Json(SaveResponse {
        subject_id: subject,
        save_count: meta.save_count,
        updated_at: meta.updated_at,
    }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(subject_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket upgrade request for subject: {}", subject_id);
    ws.on_upgrade(move |socket| handle_websocket(socket, SubjectId::new(subject_id), state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, subject: SubjectId, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4();

    info!(
        "New push connection: id={}, subject={}",
        connection_id, subject
    );

    // Create channel for sending messages to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Subscribed subject; updates for anything else are not forwarded
    let current = Arc::new(Mutex::new(Some(subject.clone())));
    let mut updates = state.store.subscribe();

    let _ = tx.send(snapshot_message(&state.store, &subject));

    // Task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match PushProtocol::encode_server(&msg) {
                Ok(bytes) => {
                    if ws_sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode message: {}", e);
                }
            }
        }
        debug!("Send task ended for connection {}", connection_id);
    });

    // Task to forward stored saves for the subscribed subject
    let forward_current = current.clone();
    let forward_tx = tx.clone();
    let forward_store = state.store.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    let wanted = forward_current.lock().as_ref() == Some(&update.document.subject_id);
                    if wanted && forward_tx.send(ServerMessage::DocumentUpdated { update }).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Connection {} lagged by {} updates, resending snapshot",
                        connection_id, skipped
                    );
                    let subject = forward_current.lock().clone();
                    if let Some(subject) = subject {
                        let _ = forward_tx.send(snapshot_message(&forward_store, &subject));
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Task to handle incoming WebSocket messages
    let recv_state = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => match PushProtocol::decode_client(&data) {
                    Ok(client_msg) => {
                        handle_client_message(client_msg, &current, &recv_state, &tx);
                    }
                    Err(e) => {
                        warn!("Failed to decode binary message: {}", e);
                        let _ = tx.send(PushProtocol::error_response(
                            ErrorCode::InvalidMessage,
                            e.to_string(),
                            None,
                        ));
                    }
                },
                Message::Text(text) => {
                    // Also support JSON for debugging
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => {
                            handle_client_message(client_msg, &current, &recv_state, &tx);
                        }
                        Err(e) => {
                            let _ = tx.send(PushProtocol::error_response(
                                ErrorCode::InvalidMessage,
                                e.to_string(),
                                None,
                            ));
                        }
                    }
                }
                Message::Ping(_) => {
                    // Pong is handled automatically
                }
                Message::Close(_) => {
                    info!("WebSocket closed by client: {}", connection_id);
                    break;
                }
                _ => {}
            }
        }
        debug!("Receive task ended for connection {}", connection_id);
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
    forward_task.abort();

    info!("Push connection {} closed", connection_id);
}

/// Handle a decoded client message
fn handle_client_message(
    msg: ClientMessage,
    current: &Mutex<Option<SubjectId>>,
    state: &AppState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match msg {
        ClientMessage::Subscribe { subject_id } => {
            debug!("Subscribing connection to {}", subject_id);
            *current.lock() = Some(subject_id.clone());
            let _ = tx.send(snapshot_message(&state.store, &subject_id));
        }

        ClientMessage::Unsubscribe => {
            if current.lock().take().is_none() {
                let _ = tx.send(PushProtocol::error_response(
                    ErrorCode::NotSubscribed,
                    "No subject subscribed",
                    None,
                ));
            }
        }

        ClientMessage::Ping { timestamp } => {
            let _ = tx.send(ServerMessage::Pong { timestamp });
        }
    }
}

/// Current stored state of `subject` as a push message
fn snapshot_message(store: &DocumentStore, subject: &SubjectId) -> ServerMessage {
    match store.load_document(subject) {
        Ok(Some(document)) => ServerMessage::Snapshot { document },
        Ok(None) => ServerMessage::NotFound {
            subject_id: subject.clone(),
        },
        Err(e) => {
            error!("Failed to load {} for push: {}", subject, e);
            PushProtocol::error_response(ErrorCode::StorageError, e.to_string(), Some(subject.clone()))
        }
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Periodically flush the store until shutdown, then flush once more
fn start_flush_task(
    store: DocumentStore,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = store.flush() {
                        warn!("Periodic flush failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Flush task shutting down");
                    if let Err(e) = store.flush() {
                        error!("Final flush failed: {}", e);
                    }
                    break;
                }
            }
        }
    })
}

fn load_template(path: &str) -> anyhow::Result<Scene> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read template {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid template scene in {}", path))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canvas_sync=info,canvas_store=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env();

    // Initialize storage
    info!("Initializing storage at: {}", config.storage_path);
    let store = DocumentStore::open(StorageConfig::new(&config.storage_path))
        .context("Failed to open storage")?;

    if let Some(path) = &config.template_path {
        let scene = load_template(path)?;
        store.seed_template(scene).context("Failed to store template")?;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let flush_task = start_flush_task(store.clone(), config.flush_interval, shutdown_tx.subscribe());

    // Create application state
    let state = Arc::new(AppState {
        store,
        started_at: std::time::Instant::now(),
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/documents", get(list_documents))
        .route(
            "/api/documents/:subject_id",
            get(get_document).put(put_document),
        )
        .route("/ws/:subject_id", get(ws_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("canvas-store v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:subject_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(());
    if let Err(e) = flush_task.await {
        warn!("Flush task ended abnormally: {}", e);
    }

    info!("canvas-store stopped");
    Ok(())
}
