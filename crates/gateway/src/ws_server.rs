//! WebSocket acceptor using Axum: wires downstream channels to session
//! mediators.

use crate::error::GatewayError;
use crate::protocol::{ClientCommand, DownstreamEvent};
use crate::registry::SessionIndex;
use crate::session::{Session, SessionConfig};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use exchange::AssetRegistry;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared application state.
pub struct AppState {
    pub index: Arc<SessionIndex>,
    pub assets: Arc<AssetRegistry>,
    pub upstream_url: String,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(r#"{{"status":"ok","sessions":{}}}"#, state.index.count())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle one downstream connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // All session tasks emit through this channel; one writer owns the sink.
    let (egress, mut egress_rx) = mpsc::unbounded_channel::<DownstreamEvent>();

    let send_task = tokio::spawn(async move {
        while let Some(event) = egress_rx.recv().await {
            if ws_tx
                .send(Message::Text(event.to_text().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    counter!("proxy_connections_total").increment(1);
    gauge!("proxy_active_connections").increment(1.0);
    info!("downstream client connected");

    // The session is created lazily on the first `authenticate`.
    let mut session: Option<Session> = None;

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("downstream socket error: {:?}", e);
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text.to_string(),
            // Older clients send JSON in binary frames.
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        let command: ClientCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(e) => {
                let _ = egress.send(DownstreamEvent::error(format!("unrecognized command: {e}")));
                continue;
            }
        };

        if !handle_command(&state, &egress, &mut session, command).await {
            break;
        }
    }

    if let Some(session) = session.take() {
        session.teardown().await;
    }
    send_task.abort();

    gauge!("proxy_active_connections").decrement(1.0);
    info!("downstream client disconnected");
}

/// Dispatch one downstream command. Returns false when the channel should
/// close.
async fn handle_command(
    state: &Arc<AppState>,
    egress: &mpsc::UnboundedSender<DownstreamEvent>,
    session: &mut Option<Session>,
    command: ClientCommand,
) -> bool {
    match command {
        ClientCommand::Authenticate(request) => {
            // Exactly one active session per channel: a re-authenticate
            // replaces the previous session.
            if let Some(old) = session.take() {
                old.teardown().await;
            }
            *session = Some(Session::spawn(
                request.credential,
                request.account_flavor,
                state.assets.clone(),
                state.index.clone(),
                egress.clone(),
                SessionConfig {
                    upstream_url: state.upstream_url.clone(),
                },
            ));
            true
        }
        ClientCommand::Disconnect => {
            if let Some(old) = session.take() {
                old.teardown().await;
            }
            let _ = egress.send(DownstreamEvent::disconnected());
            false
        }
        ClientCommand::SubscribeActive(payload) => {
            match session.as_ref() {
                Some(active) => report(egress, active.subscribe_active(&payload).await),
                None => no_session(egress),
            }
            true
        }
        ClientCommand::SendMessage(envelope) => {
            match session.as_ref() {
                Some(active) => report(egress, active.send_raw(envelope).await),
                None => no_session(egress),
            }
            true
        }
        ClientCommand::OpenPosition(request) => {
            match session.as_ref() {
                Some(active) => {
                    // Order failures use the order-specific event.
                    if let Err(e) = active.open_position(&request).await {
                        counter!("proxy_command_errors_total").increment(1);
                        let _ = egress.send(DownstreamEvent::new(
                            "order-error",
                            json!({"message": e.to_string()}),
                        ));
                    }
                }
                None => no_session(egress),
            }
            true
        }
        ClientCommand::GetBalance => {
            match session.as_ref() {
                Some(active) => active.report_balance(),
                None => no_session(egress),
            }
            true
        }
    }
}

fn report(egress: &mpsc::UnboundedSender<DownstreamEvent>, result: crate::error::Result<()>) {
    if let Err(e) = result {
        counter!("proxy_command_errors_total").increment(1);
        let _ = egress.send(DownstreamEvent::error(e.to_string()));
    }
}

fn no_session(egress: &mpsc::UnboundedSender<DownstreamEvent>) {
    let _ = egress.send(DownstreamEvent::error(GatewayError::NoSession.to_string()));
}
