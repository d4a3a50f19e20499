pub mod data;
pub mod error;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use prometheus::{Encoder, TextEncoder};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info};

use self::data::{
    ClaimRewardRequest, ClaimSocketQuery, FaucetStatusResponse, QueueStatusResponse,
    SessionStatusQuery, SessionStatusResponse,
};
use self::error::Error;
use crate::app::App;
use crate::claims::ClaimProgress;
use crate::config::ServerConfig;
use crate::notifications::SubscriberEvent;
use crate::shutdown::Shutdown;

async fn claim_reward(
    State(app): State<Arc<App>>,
    Json(request): Json<ClaimRewardRequest>,
) -> Result<Json<SessionStatusResponse>, Error> {
    let result = app.claim_reward(&request.session).await?;

    Ok(Json(result))
}

async fn get_session_status(
    State(app): State<Arc<App>>,
    Query(query): Query<SessionStatusQuery>,
) -> Result<Json<SessionStatusResponse>, Error> {
    let result = app
        .session_status(&query.session, query.wants_details())
        .await?;

    Ok(Json(result))
}

async fn get_queue_status(State(app): State<Arc<App>>) -> Json<QueueStatusResponse> {
    Json(app.queue_status().await)
}

async fn get_faucet_status(State(app): State<Arc<App>>) -> Json<FaucetStatusResponse> {
    Json(app.faucet_status())
}

async fn health() -> Result<(), Error> {
    Ok(())
}

async fn metrics() -> Result<Response, Error> {
    let encoder = TextEncoder::new();

    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Other(e.into()))?;

    let response = Response::builder()
        .status(200)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|e| Error::Other(e.into()))?;

    Ok(response)
}

/// JSON frame sent to claim subscribers.
#[derive(serde::Serialize)]
struct WsEnvelope<'a, T: serde::Serialize> {
    action: &'a str,
    data: T,
}

async fn ws_claim(
    State(app): State<Arc<App>>,
    Query(query): Query<ClaimSocketQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_claim_socket(app, query.session, socket))
}

/// Attaches the socket to the notification hub, bound to the session's
/// live claim. Keepalive traffic refreshes the hub's liveness clock; hub
/// events drive outbound frames until the claim confirms or the
/// subscription is dropped.
async fn handle_claim_socket(app: Arc<App>, session_id: String, mut socket: WebSocket) {
    // The session must exist, be claiming, and carry a claim record.
    let Some(info) = app.pipeline.live_claim(&session_id) else {
        let frame = WsEnvelope {
            action: "error",
            data: "session is not claiming",
        };
        if let Ok(text) = serde_json::to_string(&frame) {
            socket.send(Message::Text(text)).await.ok();
        }
        socket.send(Message::Close(None)).await.ok();
        return;
    };

    let mut subscription = app.hub.subscribe(info.claim.claim_idx);
    debug!(session = %session_id, claim_idx = info.claim.claim_idx, "Claim subscriber attached");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.events.recv() => match event {
                Some(SubscriberEvent::Update(progress)) => {
                    if send_update(&mut sender, progress).await.is_err() {
                        break;
                    }
                }
                Some(SubscriberEvent::Ping) => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Some(SubscriberEvent::Close { reason }) => {
                    sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await
                        .ok();
                    break;
                }
                None => break,
            },
            message = receiver.next() => match message {
                Some(Ok(Message::Ping(data))) => {
                    app.hub.seen(subscription.id);
                    sender.send(Message::Pong(data)).await.ok();
                }
                Some(Ok(Message::Pong(_))) => app.hub.seen(subscription.id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => app.hub.seen(subscription.id),
                Some(Err(_)) => break,
            },
        }
    }

    app.hub.unsubscribe(subscription.id);
}

async fn send_update(
    sender: &mut SplitSink<WebSocket, Message>,
    progress: ClaimProgress,
) -> Result<(), ()> {
    let frame = WsEnvelope {
        action: "update",
        data: progress,
    };
    let text = serde_json::to_string(&frame).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

pub fn router(app: Arc<App>, config: &ServerConfig) -> Router {
    Router::new()
        .route("/api/claimReward", post(claim_reward))
        .route("/api/getSessionStatus", get(get_session_status))
        .route("/api/getQueueStatus", get(get_queue_status))
        .route("/api/getFaucetStatus", get(get_faucet_status))
        .route("/ws/claim", get(ws_claim))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(config.serve_timeout))
        .with_state(app)
}

/// # Errors
///
/// Will return `Err` if the server cannot bind to the configured address.
pub async fn run(app: Arc<App>, config: ServerConfig, shutdown: Shutdown) -> anyhow::Result<()> {
    info!("Will listen on {}", config.address);
    let listener = tokio::net::TcpListener::bind(config.address).await?;

    axum::serve(listener, router(app, &config))
        .with_graceful_shutdown(async move { shutdown.await_shutdown_begin().await })
        .await?;

    Ok(())
}
