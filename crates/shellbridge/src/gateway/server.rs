//! Websocket server hosting the gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::GatewayAdapter;
use crate::client::ClientHandle;
use crate::config::GatewayConfig;
use crate::protocol::{InboundFrame, OutboundFrame};
use crate::Result;

/// Shared state of the websocket route.
#[derive(Clone)]
pub struct AppState {
    adapter: Arc<GatewayAdapter>,
    outbound_capacity: usize,
}

impl AppState {
    pub fn new(adapter: Arc<GatewayAdapter>, outbound_capacity: usize) -> Self {
        Self {
            adapter,
            outbound_capacity,
        }
    }
}

/// Builds the router serving `GET <ws_path>` upgrades.
pub fn router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

/// Runs one client connection until the socket closes.
///
/// Outgoing events are funneled through the client's queue so controllers can
/// push without holding the socket; a sender task drains it into the sink.
async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (client, mut outbound) = ClientHandle::channel(Some(peer), state.outbound_capacity);
    state.adapter.on_connect(&client);

    let client_id = client.id().clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&OutboundFrame::from(event)) {
                Ok(text) => text,
                Err(err) => {
                    error!(client_id = %client_id, error = %err, "Failed to encode frame");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundFrame>(text.as_str()) {
                Ok(frame) => state.adapter.dispatch(&client, frame).await,
                Err(err) => state.adapter.on_malformed(&client, text.as_str(), &err).await,
            },
            Ok(Message::Binary(_)) => {
                debug!(client_id = %client.id(), "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(client_id = %client.id(), error = %err, "Websocket receive failed");
                break;
            }
        }
    }

    state.adapter.on_disconnect(&client).await;
    send_task.abort();
}

/// Binds the configured address and serves until ctrl-c, then closes every
/// session.
pub async fn serve(config: &GatewayConfig, adapter: Arc<GatewayAdapter>) -> Result<()> {
    let addr: SocketAddr = config.listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, path = %config.ws_path, "Gateway listening");

    let app = router(
        AppState::new(Arc::clone(&adapter), config.outbound_queue),
        &config.ws_path,
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    adapter.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
