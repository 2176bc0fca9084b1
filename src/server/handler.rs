//! HTTP Handler
//!
//! Exposes the engine over a single endpoint: JSON-RPC requests arrive as
//! POST /sbp, and the push channel is a server-sent-event stream on
//! GET /sbp. Sessions are established on first contact and echoed through
//! the Sbp-Session-Id header; a reconnecting subscriber may present
//! Last-Event-ID to replay retained trigger events.

use anyhow::Result;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use warp::sse::Event;
use warp::Filter;

use crate::core::error::PARSE_ERROR;
use crate::core::ops::TriggerPayload;
use crate::core::{Blackboard, Config};
use crate::server::rpc::{self, RpcRequest, RpcResponse};
use crate::server::session::{Session, SessionRegistry};

pub const PROTOCOL_VERSION: &str = "0.1";
pub const SESSION_HEADER: &str = "sbp-session-id";
pub const AGENT_HEADER: &str = "sbp-agent-id";
pub const VERSION_HEADER: &str = "sbp-protocol-version";

/// Start the HTTP server
pub async fn start_server(
    config: Arc<Config>,
    board: Arc<Blackboard>,
    sessions: Arc<SessionRegistry>,
) -> Result<()> {
    let port = config.server.port;
    let filter = routes(config, board, sessions);

    info!("🌐 SBP server starting on port {}", port);

    warp::serve(filter).run(([0, 0, 0, 0], port)).await;

    Ok(())
}

/// Compose the full route set (separate from serving, for tests)
pub fn routes(
    config: Arc<Config>,
    board: Arc<Blackboard>,
    sessions: Arc<SessionRegistry>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let board_filter = {
        let board = board.clone();
        warp::any().map(move || board.clone())
    };
    let sessions_filter = {
        let sessions = sessions.clone();
        warp::any().map(move || sessions.clone())
    };
    let config_filter = warp::any().map(move || config.clone());

    let rpc_route = warp::path("sbp")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::bytes())
        .and(warp::header::optional::<String>(SESSION_HEADER))
        .and(warp::header::optional::<String>(AGENT_HEADER))
        .and(board_filter.clone())
        .and(sessions_filter.clone())
        .and_then(handle_rpc);

    let sse_route = warp::path("sbp")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::header::optional::<String>(SESSION_HEADER))
        .and(warp::header::optional::<String>("last-event-id"))
        .and(board_filter)
        .and(sessions_filter)
        .and(config_filter)
        .and_then(handle_stream);

    // Health check route
    let health = warp::path("health")
        .map(|| warp::reply::json(&json!({"status": "ok"})));

    // CORS for development
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST"])
        .allow_headers(vec![
            "content-type",
            SESSION_HEADER,
            AGENT_HEADER,
            VERSION_HEADER,
            "last-event-id",
        ]);

    rpc_route.or(sse_route).or(health).with(cors)
}

/// Handle one JSON-RPC request
async fn handle_rpc(
    body: warp::hyper::body::Bytes,
    session_id: Option<String>,
    agent_id: Option<String>,
    board: Arc<Blackboard>,
    sessions: Arc<SessionRegistry>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let session = sessions.get_or_create(session_id.as_deref()).await;

    if let Some(agent) = &agent_id {
        debug!("Request from agent '{}' (session {})", agent, session.id);
    }

    let response = match serde_json::from_slice::<RpcRequest>(&body) {
        Ok(request) => rpc::dispatch(&board, &session, request).await,
        Err(e) => RpcResponse::failure(Value::Null, PARSE_ERROR, format!("parse error: {}", e)),
    };

    let reply = warp::reply::json(&response);
    let reply = warp::reply::with_header(reply, SESSION_HEADER, session.id.clone());
    let reply = warp::reply::with_header(reply, VERSION_HEADER, PROTOCOL_VERSION);
    Ok(reply)
}

/// Open the push channel for a session
async fn handle_stream(
    session_id: Option<String>,
    last_event_id: Option<String>,
    board: Arc<Blackboard>,
    sessions: Arc<SessionRegistry>,
    config: Arc<Config>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let session = sessions.get_or_create(session_id.as_deref()).await;
    let last_seen = last_event_id.and_then(|raw| raw.parse::<u64>().ok());

    info!(
        "📡 Push channel opened (session {}, resume from {:?})",
        session.id, last_seen
    );

    let stream = trigger_stream(session.clone(), board.subscribe_triggers(), last_seen);
    let stream = warp::sse::keep_alive()
        .interval(std::time::Duration::from_secs(config.server.keepalive_secs))
        .text("keepalive")
        .stream(stream);

    let reply = warp::sse::reply(stream);
    let reply = warp::reply::with_header(reply, SESSION_HEADER, session.id.clone());
    let reply = warp::reply::with_header(reply, VERSION_HEADER, PROTOCOL_VERSION);
    Ok(reply)
}

/// The event sequence for one connection: `connected`, then any retained
/// events newer than the resume point, then live triggers filtered to the
/// session's subscriptions. Failures on this stream affect only this
/// subscriber.
fn trigger_stream(
    session: Arc<Session>,
    receiver: broadcast::Receiver<TriggerPayload>,
    last_seen: Option<u64>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let connected = stream::once(async {
        Ok::<Event, Infallible>(Event::default().event("connected").data("{}"))
    });

    let replay_session = session.clone();
    let replay = stream::once(async move {
        match last_seen {
            Some(last) => replay_session.replay_after(last).await,
            None => Vec::new(),
        }
    })
    .map(stream::iter)
    .flatten()
    .map(|stored| {
        Ok(Event::default()
            .event("message")
            .id(stored.id.to_string())
            .data(stored.data))
    });

    let live = BroadcastStream::new(receiver).filter_map(move |item| {
        let session = session.clone();
        async move {
            let payload = match item {
                Ok(payload) => payload,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(
                        "Push channel for session {} lagged; {} triggers dropped",
                        session.id, skipped
                    );
                    return None;
                }
            };

            if !session.is_subscribed(&payload.scent_id).await {
                return None;
            }

            let data = json!({"method": "sbp/trigger", "params": payload}).to_string();
            let id = session.record(data.clone()).await;

            Some(Ok(Event::default()
                .event("message")
                .id(id.to_string())
                .data(data)))
        }
    });

    connected.chain(replay).chain(live)
}
