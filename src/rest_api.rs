//! HTTP ingress.
//!
//! Every route from the broker's public API surface: health and readiness,
//! component registration and lookup, message ingestion, synchronous
//! forwarding, and the user-input round-trip. Handlers validate at the
//! boundary and translate router errors to gateway-style statuses.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Redirect, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::warn;

use crate::broker::BrokerTransport;
use crate::clients::ClientRegistry;
use crate::config::PostOfficeConfig;
use crate::discovery::DiscoveryClient;
use crate::domain_types::ComponentId;
use crate::error::RouterError;
use crate::fallback::{FallbackQueues, Sweeper};
use crate::message::Message;
use crate::mission_index::MissionIndex;
use crate::readiness::Readiness;
use crate::registry::ServiceRegistry;
use crate::resolver::RecipientResolver;
use crate::router::{MessageOrigin, RouteOutcome, Router};
use crate::service_client::ServiceClient;
use crate::user_input::{self, UserInputRegistry};
use crate::ws::{self, SocketParams};

/// Shared state behind every handler.
pub struct AppState {
    pub config: PostOfficeConfig,
    pub clients: Arc<ClientRegistry>,
    pub missions: Arc<MissionIndex>,
    pub registry: Arc<ServiceRegistry>,
    pub discovery: Arc<DiscoveryClient>,
    pub resolver: Arc<RecipientResolver>,
    pub router: Arc<Router>,
    pub readiness: Arc<Readiness>,
    pub fallback: Arc<FallbackQueues>,
    pub user_input: Arc<UserInputRegistry>,
    pub http: ServiceClient,
}

impl AppState {
    /// Wires the full component graph around a broker transport.
    pub fn build(
        config: PostOfficeConfig,
        broker: Arc<dyn BrokerTransport>,
        readiness: Arc<Readiness>,
    ) -> Result<Arc<Self>, reqwest::Error> {
        let clients = Arc::new(ClientRegistry::new(config.offline_queue_cap));
        let missions = Arc::new(MissionIndex::new());
        let registry = Arc::new(ServiceRegistry::new());
        let http = ServiceClient::new(config.http_timeout, config.service_token.clone())?;
        let discovery = Arc::new(DiscoveryClient::new(
            config.discovery_url.clone(),
            http.http(),
        ));
        let resolver = Arc::new(RecipientResolver::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&discovery),
        ));
        let fallback = Arc::new(FallbackQueues::new());
        let router = Arc::new(Router::new(
            config.component_id.clone(),
            Arc::clone(&clients),
            Arc::clone(&missions),
            broker,
            Arc::clone(&fallback),
        ));

        Ok(Arc::new(Self {
            config,
            clients,
            missions,
            registry,
            discovery,
            resolver,
            router,
            readiness,
            fallback,
            user_input: Arc::new(UserInputRegistry::new()),
            http,
        }))
    }

    /// The fallback sweeper for this state, ready to spawn.
    #[must_use]
    pub fn sweeper(self: &Arc<Self>) -> Sweeper {
        Sweeper::new(
            Arc::clone(&self.fallback),
            Arc::clone(&self.readiness),
            Arc::clone(&self.resolver),
            self.http.clone(),
            Arc::clone(&self.clients),
            Arc::clone(&self.missions),
            self.config.sweeper_interval,
        )
    }
}

/// Error body shared by all failing responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Builds the Axum application router with all API endpoints.
pub fn create_app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/", get(root))
        .route("/healthy", get(healthy))
        .route("/ready", get(ready))
        .route("/health", get(health_redirect))
        .route("/registerComponent", post(register_component))
        .route("/deregisterComponent", post(deregister_component))
        .route("/requestComponent", get(request_component))
        .route("/getServices", get(get_services))
        .route("/message", post(ingest_message))
        .route("/sendMessage", post(send_message))
        .route("/submitUserInput", post(submit_user_input))
        .route("/sendUserInputRequest", post(send_user_input_request))
        .with_state(state)
}

/// Binds a listener for the configured port.
///
/// # Errors
///
/// Returns an error when the port cannot be bound.
pub async fn bind(config: &PostOfficeConfig) -> std::io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", config.port)).await
}

/// Root: socket upgrades land here with `?clientId=...&token=...`; plain
/// GETs receive the liveness text.
async fn root(
    upgrade: Result<
        WebSocketUpgrade,
        <WebSocketUpgrade as axum::extract::FromRequestParts<Arc<AppState>>>::Rejection,
    >,
    Query(params): Query<SocketParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match upgrade {
        Ok(upgrade) => ws::handle_upgrade(upgrade, params, state),
        Err(_) => Html("PostOffice message broker").into_response(),
    }
}

async fn healthy() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ReadyParams {
    detail: Option<String>,
}

async fn ready(
    Query(params): Query<ReadyParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let snapshot = state.readiness.snapshot();
    let status = if snapshot.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = if params.detail.as_deref() == Some("full") {
        json!({
            "ready": snapshot.ready,
            "degraded": snapshot.degraded,
            "brokerConnected": snapshot.broker_connected,
            "brokerHealthy": snapshot.broker_healthy,
            "discoveryRegistered": snapshot.discovery_registered,
            "connectedClients": state.clients.connected_count(),
            "fallbackQueueDepth": state.fallback.total_depth(),
            "componentsByType": state.registry.counts_by_type(),
        })
    } else {
        json!({ "ready": snapshot.ready, "degraded": snapshot.degraded })
    };

    (status, Json(body)).into_response()
}

async fn health_redirect() -> Redirect {
    Redirect::temporary("/ready?detail=full")
}

#[derive(Debug, Deserialize)]
struct RegisterComponentRequest {
    id: String,
    #[serde(rename = "type")]
    component_type: String,
    url: String,
}

async fn register_component(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterComponentRequest>,
) -> Response {
    let Ok(id) = ComponentId::try_new(request.id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("component id must not be empty")),
        )
            .into_response();
    };
    if request.component_type.trim().is_empty() || request.url.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("type and url must not be empty")),
        )
            .into_response();
    }

    state
        .resolver
        .register(id.clone(), request.component_type, request.url)
        .await;
    (StatusCode::OK, Json(json!({ "status": "registered", "id": id }))).into_response()
}

#[derive(Debug, Deserialize)]
struct DeregisterComponentRequest {
    id: String,
}

async fn deregister_component(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeregisterComponentRequest>,
) -> Response {
    let Ok(id) = ComponentId::try_new(request.id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("component id must not be empty")),
        )
            .into_response();
    };
    match state.registry.deregister(&id) {
        Some(_) => (StatusCode::OK, Json(json!({ "status": "deregistered" }))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::with_details(
                "component not found",
                id.to_string(),
            )),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct RequestComponentParams {
    id: Option<String>,
    #[serde(rename = "type")]
    component_type: Option<String>,
}

async fn request_component(
    Query(params): Query<RequestComponentParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(id) = params.id.and_then(|id| ComponentId::try_new(id).ok()) {
        return match state.registry.get_by_id(&id) {
            Some(component) => (StatusCode::OK, Json(json!({ "component": component }))).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::with_details(
                    "component not found",
                    id.to_string(),
                )),
            )
                .into_response(),
        };
    }
    if let Some(component_type) = params.component_type {
        let components = state.registry.get_by_type(&component_type);
        return (StatusCode::OK, Json(json!({ "components": components }))).into_response();
    }
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new("id or type query parameter required")),
    )
        .into_response()
}

async fn get_services(State(state): State<Arc<AppState>>) -> Json<HashMap<String, String>> {
    Json(state.resolver.known_services().await)
}

/// Queues any message for routing. A synchronous request returns the RPC
/// response body; everything else returns once accepted.
async fn ingest_message(
    State(state): State<Arc<AppState>>,
    Json(message): Json<Message>,
) -> Response {
    match state.router.route(message, MessageOrigin::Http).await {
        Ok(RouteOutcome::RpcResponse(response)) => {
            (StatusCode::OK, Json(*response)).into_response()
        }
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "accepted" }))).into_response(),
        Err(RouterError::RpcTimeout { timeout_ms }) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(ErrorResponse::with_details(
                "broker RPC timed out",
                format!("{timeout_ms}ms"),
            )),
        )
            .into_response(),
        Err(err) => {
            warn!(%err, "message ingestion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(err.to_string())),
            )
                .into_response()
        }
    }
}

/// Resolves the recipient and POSTs the message to that service directly,
/// propagating the downstream status and body verbatim.
async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(message): Json<Message>,
) -> Response {
    let Some(recipient) = message.recipient_tag().map(str::to_string) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("message has no recipient")),
        )
            .into_response();
    };
    let Some(url) = state.resolver.resolve(&recipient).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::with_details(
                "recipient not resolvable",
                recipient,
            )),
        )
            .into_response();
    };

    match state.http.post_message(&url, &message, None).await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = response.text().await.unwrap_or_default();
            (status, body).into_response()
        }
        Err(err) => {
            warn!(%err, %recipient, "synchronous forward failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::new(err.to_string())),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitUserInputRequest {
    request_id: String,
    #[serde(default)]
    response: serde_json::Value,
}

async fn submit_user_input(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitUserInputRequest>,
) -> Response {
    let Some(waiter) = state.user_input.complete(&request.request_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::with_details(
                "unknown user input request",
                request.request_id,
            )),
        )
            .into_response();
    };

    if let Some(sender) = waiter.sender {
        let answer = user_input::response_message(&request.request_id, &sender, request.response);
        if let Err(err) = state.router.route(answer, MessageOrigin::Internal).await {
            warn!(%err, %sender, "user input answer failed to route");
        }
    }
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

#[derive(Debug, Deserialize)]
struct UserInputRequestBody {
    #[serde(default)]
    question: serde_json::Value,
    #[serde(rename = "answerType")]
    answer_type: Option<String>,
    sender: Option<String>,
}

async fn send_user_input_request(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UserInputRequestBody>,
) -> Response {
    let request_id = state.user_input.open(request.sender);
    let frame = user_input::request_frame(
        &request_id,
        request.question,
        request.answer_type.as_deref(),
    );
    let (delivered, _failed) = state.clients.broadcast(&frame);
    (
        StatusCode::OK,
        Json(json!({ "request_id": request_id, "clientsNotified": delivered })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockBroker;

    fn test_state() -> Arc<AppState> {
        let readiness = Arc::new(Readiness::new(false));
        AppState::build(
            PostOfficeConfig::default(),
            Arc::new(MockBroker::new(true)),
            readiness,
        )
        .unwrap()
    }

    #[test]
    fn error_response_serializes_without_empty_details() {
        let body = serde_json::to_value(ErrorResponse::new("nope")).unwrap();
        assert_eq!(body, json!({ "error": "nope" }));
    }

    #[tokio::test]
    async fn app_builds_with_all_routes() {
        let app = create_app(test_state());
        assert!(!format!("{app:?}").is_empty());
    }
}
