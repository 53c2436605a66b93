//! HTTP API server for cadence.
//!
//! Exposes contact enrollment, reminder CRUD, the inbound SMS webhook, the
//! per-account activity feed, and an SSE stream of live state changes. The
//! dispatcher worker runs inside this process; `DISPATCH_ENABLED=false`
//! turns it off for API-only deployments.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Form, Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use cadence_core::{
    ContactRepository, ContactStatus, CreateReminderRequest, EnrollContactRequest,
    FeedEventRepository, InboundMessage, NewFeedEvent, ReminderRepository, ResponseRepository,
    UpdateReminderRequest,
};
use cadence_dispatch::{
    Dispatcher, DispatcherConfig, MessagingGateway, MockGateway, ResponseCorrelator, TwilioConfig,
    TwilioGateway,
};
use cadence_store::Database;
use cadence_sync::SyncCoordinator;

// =============================================================================
// APPLICATION STATE
// =============================================================================

#[derive(Clone)]
struct AppState {
    db: Database,
    correlator: ResponseCorrelator,
    sync: SyncCoordinator,
    gateway: Arc<dyn MessagingGateway>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "cadence_api=debug,tower_http=debug")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cadence_api=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        let mut layer = tracing_subscriber::fmt::layer();
        if let Some(ansi) = log_ansi {
            layer = layer.with_ansi(ansi);
        }
        registry.with(layer).init();
    }

    info!(log_format = %log_format, "Logging initialized");

    // Get configuration from environment
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:cadence.db".to_string());
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .unwrap_or(3000);

    // Connect to database (runs pending migrations)
    info!("Connecting to database...");
    let db = Database::connect(&database_url).await?;
    info!("Database connected");

    // Outbound messaging gateway. GATEWAY=mock swaps in an in-memory fake for
    // local development without Twilio credentials.
    let gateway: Arc<dyn MessagingGateway> = match std::env::var("GATEWAY").as_deref() {
        Ok("mock") => {
            warn!("Using mock messaging gateway; no real SMS will be sent");
            Arc::new(MockGateway::new())
        }
        _ => Arc::new(TwilioGateway::new(TwilioConfig::from_env()?)?),
    };

    let state = AppState {
        correlator: ResponseCorrelator::new(db.clone()),
        sync: SyncCoordinator::new(db.clone()),
        gateway: gateway.clone(),
        db: db.clone(),
    };

    // Start the dispatcher worker in-process
    let dispatch_config = DispatcherConfig::from_env();
    let dispatcher = if dispatch_config.enabled {
        Some(Dispatcher::new(db, gateway, dispatch_config).start())
    } else {
        info!("Dispatcher disabled (DISPATCH_ENABLED=false)");
        None
    };

    let app = build_router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = dispatcher {
        handle.shutdown().await?;
    }
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health))
        // Contacts
        .route("/api/v1/contacts", post(enroll_contact))
        .route(
            "/api/v1/contacts/:id",
            get(get_contact).delete(delete_contact),
        )
        .route("/api/v1/contacts/:id/reminders", get(list_reminders))
        .route("/api/v1/contacts/:id/responses", get(list_responses))
        // Reminders
        .route("/api/v1/reminders", post(create_reminder))
        .route(
            "/api/v1/reminders/:id",
            get(get_reminder).patch(update_reminder),
        )
        // Accounts
        .route("/api/v1/accounts/:id/contacts", get(list_contacts))
        .route("/api/v1/accounts/:id/feed", get(list_feed))
        .route("/api/v1/accounts/:id/events", get(sse_events))
        .route("/api/v1/accounts/:id", axum::routing::delete(delete_account))
        // Inbound messaging gateway webhook
        .route("/webhooks/sms", post(sms_webhook))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT]),
        )
        .with_state(state)
}

// =============================================================================
// HEALTH
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// CONTACT HANDLERS
// =============================================================================

async fn enroll_contact(
    State(state): State<AppState>,
    Json(req): Json<EnrollContactRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let contact = state.db.contacts.upsert(req).await?;

    state
        .db
        .feed
        .append(NewFeedEvent::contact_enrolled(&contact))
        .await?;

    // Ask the contact to confirm. A failed confirmation send does not undo
    // the enrollment; the contact stays pending and can still reply.
    if contact.status == ContactStatus::Pending {
        let body = format!(
            "Hi {}! Reply YES to start receiving reminders. Reply STOP to opt out.",
            contact.display_name
        );
        if let Err(e) = state.gateway.send(&contact.phone, &body, &[]).await {
            warn!(contact_id = %contact.id, error = %e, "Confirmation send failed");
        }
    }

    Ok((StatusCode::CREATED, Json(contact)))
}

async fn get_contact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let contact = state.db.contacts.fetch(id).await?;
    Ok(Json(contact))
}

async fn list_contacts(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let contacts = state.db.contacts.list_for_account(account_id).await?;
    Ok(Json(contacts))
}

async fn delete_contact(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.db.lifecycle.delete_contact(id).await?;
    Ok(Json(serde_json::json!({
        "contacts": stats.contacts,
        "reminders": stats.reminders,
        "responses": stats.responses,
        "feed_events": stats.feed_events,
    })))
}

async fn delete_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.db.lifecycle.delete_account(id).await?;
    Ok(Json(serde_json::json!({
        "contacts": stats.contacts,
        "reminders": stats.reminders,
        "responses": stats.responses,
        "feed_events": stats.feed_events,
    })))
}

// =============================================================================
// REMINDER HANDLERS
// =============================================================================

async fn create_reminder(
    State(state): State<AppState>,
    Json(req): Json<CreateReminderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reminder = state.db.reminders.create(req).await?;
    Ok((StatusCode::CREATED, Json(reminder)))
}

async fn get_reminder(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let reminder = state.db.reminders.fetch(id).await?;
    Ok(Json(reminder))
}

async fn update_reminder(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateReminderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reminder = state.db.reminders.update(id, req).await?;
    Ok(Json(reminder))
}

async fn list_reminders(
    State(state): State<AppState>,
    Path(contact_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let reminders = state.db.reminders.list_for_contact(contact_id).await?;
    Ok(Json(reminders))
}

// =============================================================================
// RESPONSE / FEED HANDLERS
// =============================================================================

#[derive(Debug, Deserialize)]
struct ListResponsesQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

#[derive(Debug, Deserialize)]
struct ListFeedQuery {
    #[serde(default)]
    after_seq: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_responses(
    State(state): State<AppState>,
    Path(contact_id): Path<Uuid>,
    Query(query): Query<ListResponsesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let responses = state
        .db
        .responses
        .list_for_contact(contact_id, query.limit)
        .await?;
    Ok(Json(responses))
}

async fn list_feed(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<ListFeedQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let events = state
        .db
        .feed
        .list_for_account(account_id, query.after_seq, query.limit)
        .await?;
    Ok(Json(events))
}

// =============================================================================
// INBOUND SMS WEBHOOK
// =============================================================================

/// Twilio-style inbound webhook: form-encoded `From`, `Body`, `MessageSid`,
/// and `NumMedia` + `MediaUrl{i}` pairs. Redeliveries of the same
/// `MessageSid` return the originally recorded response.
async fn sms_webhook(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let from_number = form
        .get("From")
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("Missing From".to_string()))?;
    let gateway_message_id = form
        .get("MessageSid")
        .cloned()
        .ok_or_else(|| ApiError::BadRequest("Missing MessageSid".to_string()))?;
    let body = form.get("Body").cloned().unwrap_or_default();

    let num_media: usize = form
        .get("NumMedia")
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    let media_urls: Vec<String> = (0..num_media)
        .filter_map(|i| form.get(&format!("MediaUrl{}", i)).cloned())
        .collect();

    let response = state
        .correlator
        .handle_inbound(InboundMessage {
            from_number,
            body,
            media_urls,
            gateway_message_id,
            received_at: Utc::now(),
        })
        .await?;

    Ok(Json(serde_json::json!({
        "response_id": response.id,
        "outcome": response.outcome,
    })))
}

// =============================================================================
// SSE EVENT STREAM
// =============================================================================

#[derive(Debug, Deserialize)]
struct SseQuery {
    /// Last feed `seq` the client has seen; the session replays everything
    /// after it. Falls back to the `Last-Event-ID` header on reconnect.
    after_seq: Option<i64>,
}

async fn sse_events(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<SseQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    let resume_from = query.after_seq.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    });

    let session = state.sync.attach(account_id, resume_from).await?;

    let stream = futures::stream::unfold(session, |mut session| async move {
        let update = session.recv().await?;
        let event = Event::default().event(update.event_type());
        // Feed events carry their seq as the SSE id so browsers resume via
        // Last-Event-ID after a dropped connection.
        let event = match &update {
            cadence_sync::SyncUpdate::FeedEvent { event: fe } => event.id(fe.seq.to_string()),
            _ => event,
        };
        let event = match serde_json::to_string(&update) {
            Ok(json) => event.data(json),
            Err(e) => {
                warn!(error = %e, "Failed to serialize sync update");
                return Some((None, session));
            }
        };
        Some((Some(Ok(event)), session))
    });

    use tokio_stream::StreamExt as _;
    let stream = stream.filter_map(|item| item);

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

// =============================================================================
// ERROR HANDLING
// =============================================================================

#[derive(Debug)]
enum ApiError {
    Database(cadence_core::Error),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Gateway(String),
}

impl From<cadence_core::Error> for ApiError {
    fn from(err: cadence_core::Error) -> Self {
        match &err {
            cadence_core::Error::NotFound(msg) => ApiError::NotFound(msg.clone()),
            cadence_core::Error::ContactNotFound(id) => {
                ApiError::NotFound(format!("Contact not found: {}", id))
            }
            cadence_core::Error::ReminderNotFound(id) => {
                ApiError::NotFound(format!("Reminder not found: {}", id))
            }
            cadence_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg.clone()),
            cadence_core::Error::Config(msg) => ApiError::BadRequest(msg.clone()),
            cadence_core::Error::Gateway(msg) => ApiError::Gateway(msg.clone()),
            cadence_core::Error::Database(sqlx_err) => {
                let msg = sqlx_err.to_string();
                if msg.contains("UNIQUE constraint") || msg.contains("unique constraint") {
                    return ApiError::Conflict(msg);
                }
                ApiError::Database(err)
            }
            _ => ApiError::Database(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Database(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Gateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

// =============================================================================
// TESTS
// =============================================================================
