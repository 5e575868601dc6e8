use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::JsonRejection,
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use runtime::ApprovalDecision;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use types::{ErrorKind, StreamEvent};

use crate::broadcast::Subscription;
use crate::coordinator::{Attachment, SessionCoordinator, TurnRequest};
use crate::errors::GatewayError;

pub const PRINCIPAL_HEADER: &str = "x-principal-id";
pub const RUN_ID_HEADER: &str = "x-run-id";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const RATE_LIMIT_CODE: &str = "RATE_LIMIT_EXCEEDED";

pub fn router(coordinator: Arc<SessionCoordinator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat", post(chat))
        .route("/v1/approvals", post(resolve_approval))
        .route("/v1/memories", post(remember))
        .route("/v1/sessions/{session_id}/events", get(resume_events))
        .route("/v1/sessions/{session_id}/cancel", post(cancel_run))
        .route("/v1/sessions/{session_id}/ws", get(upgrade_websocket))
        .with_state(coordinator)
}

/// Serves `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let address = listener.local_addr()?;
    tracing::info!(%address, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    session_id: String,
    principal_id: String,
    message: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default = "default_stream")]
    stream: bool,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DecisionKind {
    Approve,
    Reject,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalRequest {
    session_id: String,
    tool_call_id: String,
    decision: DecisionKind,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryRequest {
    principal_id: String,
    content: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemoryCreated {
    record_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelAccepted {
    run_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResumeQuery {
    since: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn chat(
    State(coordinator): State<Arc<SessionCoordinator>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(body) = body.map_err(rejected)?;
    let request = TurnRequest {
        session_id: body.session_id,
        principal_id: body.principal_id,
        message: body.message,
        attachments: body.attachments,
    };
    let handle = coordinator.handle_turn(request).await?;
    let mut guard = DisconnectGuard::new(
        coordinator.clone(),
        handle.session_id.clone(),
        handle.run_id.clone(),
    );
    if !body.stream {
        let result = handle.wait().await;
        guard.disarm();
        return Ok(Json(result?).into_response());
    }
    let run_id = handle.run_id.clone();
    let mut response = sse_response(handle.events, Some(guard));
    if let Ok(value) = HeaderValue::from_str(&run_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(RUN_ID_HEADER), value);
    }
    Ok(response)
}

async fn resume_events(
    State(coordinator): State<Arc<SessionCoordinator>>,
    Path(session_id): Path<String>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let principal_id = principal(&headers)?;
    let since = match query.since {
        Some(since) => Some(since),
        None => last_event_id(&headers)?,
    };
    let subscription = coordinator
        .subscribe(&session_id, &principal_id, since)
        .await?;
    let guard = DisconnectGuard::new(coordinator, session_id, subscription.run_id().to_owned());
    Ok(sse_response(subscription, Some(guard)))
}

async fn resolve_approval(
    State(coordinator): State<Arc<SessionCoordinator>>,
    headers: HeaderMap,
    body: Result<Json<ApprovalRequest>, JsonRejection>,
) -> Result<StatusCode, GatewayError> {
    let principal_id = principal(&headers)?;
    let Json(body) = body.map_err(rejected)?;
    let decision = match body.decision {
        DecisionKind::Approve => ApprovalDecision::Approve,
        DecisionKind::Reject => ApprovalDecision::Reject {
            reason: body.reason,
        },
    };
    coordinator
        .resolve_approval(&body.session_id, &principal_id, &body.tool_call_id, decision)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_run(
    State(coordinator): State<Arc<SessionCoordinator>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<CancelAccepted>), GatewayError> {
    let principal_id = principal(&headers)?;
    let run_id = coordinator.cancel(&session_id, &principal_id).await?;
    Ok((StatusCode::ACCEPTED, Json(CancelAccepted { run_id })))
}

async fn remember(
    State(coordinator): State<Arc<SessionCoordinator>>,
    body: Result<Json<MemoryRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MemoryCreated>), GatewayError> {
    let Json(body) = body.map_err(rejected)?;
    let record = coordinator
        .remember(&body.principal_id, &body.content, body.category.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(MemoryCreated {
            record_id: record.record_id,
        }),
    ))
}

async fn upgrade_websocket(
    State(coordinator): State<Arc<SessionCoordinator>>,
    Path(session_id): Path<String>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    let principal_id = principal(&headers)?;
    let subscription = coordinator
        .subscribe(&session_id, &principal_id, query.since)
        .await?;
    let guard = DisconnectGuard::new(
        coordinator,
        session_id.clone(),
        subscription.run_id().to_owned(),
    );
    Ok(ws.on_upgrade(move |socket| async move {
        forward_to_socket(socket, session_id, subscription, guard).await;
    }))
}

async fn forward_to_socket(
    socket: WebSocket,
    session_id: String,
    mut subscription: Subscription,
    mut guard: DisconnectGuard,
) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else {
                    break;
                };
                if event.payload.is_terminal() {
                    guard.disarm();
                }
                if send_event_frame(&mut sender, &event).await.is_err() {
                    drop(subscription);
                    return;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(AxumWsMessage::Ping(payload))) => {
                        if sender.send(AxumWsMessage::Pong(payload)).await.is_err() {
                            drop(subscription);
                            return;
                        }
                    }
                    Some(Ok(AxumWsMessage::Close(_))) | None => {
                        drop(subscription);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::debug!(%session_id, %error, "websocket receive failed");
                        drop(subscription);
                        return;
                    }
                }
            }
        }
    }
    let _ = sender.send(AxumWsMessage::Close(None)).await;
}

async fn send_event_frame(
    sender: &mut SplitSink<WebSocket, AxumWsMessage>,
    event: &StreamEvent,
) -> Result<(), ()> {
    let payload = serde_json::to_string(event).map_err(|error| {
        tracing::error!(%error, "failed to encode stream event");
    })?;
    sender
        .send(AxumWsMessage::Text(payload.into()))
        .await
        .map_err(|error| {
            tracing::debug!(%error, "failed to send stream event frame");
        })
}

/// Cancels the watched run when dropped before the run's terminal event
/// reached this client, unless another client is still watching.
pub(crate) struct DisconnectGuard {
    coordinator: Arc<SessionCoordinator>,
    session_id: String,
    run_id: String,
    armed: bool,
}

impl DisconnectGuard {
    pub(crate) fn new(
        coordinator: Arc<SessionCoordinator>,
        session_id: String,
        run_id: String,
    ) -> Self {
        Self {
            coordinator,
            session_id,
            run_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.abandon_run(&self.session_id, &self.run_id);
        }
    }
}

pub(crate) fn sse_response(
    subscription: Subscription,
    guard: Option<DisconnectGuard>,
) -> Response {
    // The subscription drops before the guard so this client no longer
    // counts as a watcher.
    let events = futures::stream::unfold(
        (subscription, guard),
        |(mut subscription, mut guard)| async move {
            let event = subscription.next().await?;
            if event.payload.is_terminal()
                && let Some(guard) = guard.as_mut()
            {
                guard.disarm();
            }
            Some((event, (subscription, guard)))
        },
    )
    .map(|event| {
        Event::default()
            .event(event.payload.event_type())
            .id(event.cursor.to_string())
            .json_data(&event)
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn principal(headers: &HeaderMap) -> Result<String, GatewayError> {
    headers
        .get(PRINCIPAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| GatewayError::validation(format!("missing `{PRINCIPAL_HEADER}` header")))
}

fn last_event_id(headers: &HeaderMap) -> Result<Option<u64>, GatewayError> {
    let Some(value) = headers.get(LAST_EVENT_ID_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| GatewayError::validation("`Last-Event-ID` must be a cursor number"))
}

fn rejected(rejection: JsonRejection) -> GatewayError {
    GatewayError::validation(rejection.body_text())
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::SessionBusy => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::TransientExternal | ErrorKind::FatalExternal => StatusCode::BAD_GATEWAY,
        ErrorKind::Cancelled | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::warn!(error = %self, %kind, "request failed");
        }
        if let Self::RateLimited { retry_after_ms } = self {
            let body = ErrorBody {
                code: RATE_LIMIT_CODE.to_owned(),
                message: self.to_string(),
                retry_after_ms: Some(retry_after_ms),
            };
            let seconds = retry_after_ms.div_ceil(1000).max(1);
            return (
                status,
                [(header::RETRY_AFTER, seconds.to_string())],
                Json(body),
            )
                .into_response();
        }
        let body = ErrorBody {
            code: kind.as_str().to_owned(),
            message: self.to_string(),
            retry_after_ms: None,
        };
        (status, Json(body)).into_response()
    }
}
