use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::Method,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::{future, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use gogo_shared::protocol::MessageView;

use crate::cache::{conversation_key, group_key};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionContext, Frame, FrameSink, FrameStream};
use crate::error::{ConnectionError, ServerError};
use crate::hub::{ClientInfo, HubHandle};
use crate::persistence::Persistence;
use crate::transport::Transport;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub persistence: Persistence,
    pub transport: Transport,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            hub: self.hub.clone(),
            transport: self.transport.clone(),
            persistence: self.persistence.clone(),
            channel_size: self.config.channel_size,
            ping_interval: self.config.ping_interval,
            read_deadline: self.config.read_deadline,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/wss", get(ws_login))
        .route("/wss/online", get(ws_online))
        .route("/user/wsLogout", post(ws_logout))
        .route("/message/getMessageList", post(get_message_list))
        .route("/message/getGroupMessageList", post(get_group_message_list))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct ClientQuery {
    client_id: Option<String>,
}

impl ClientQuery {
    fn identity(self) -> Result<String, ServerError> {
        self.client_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ServerError::BadRequest("missing client_id".into()))
    }
}

#[derive(Serialize)]
struct OnlineResponse {
    online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<ClientInfo>,
}

#[derive(Deserialize)]
struct WsLogoutRequest {
    owner_id: String,
}

#[derive(Serialize)]
struct WsLogoutResponse {
    message: &'static str,
    code: i32,
}

#[derive(Deserialize)]
struct MessageListRequest {
    user_one_id: String,
    user_two_id: String,
}

#[derive(Deserialize)]
struct GroupMessageListRequest {
    group_id: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ws_login(
    State(state): State<AppState>,
    Query(query): Query<ClientQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let identity = query.identity()?;
    Ok(ws.on_upgrade(move |socket| serve_socket(state, identity, socket)))
}

async fn serve_socket(state: AppState, identity: String, socket: WebSocket) {
    let (sink, stream) = adapt_socket(socket);
    match Connection::open(identity.clone(), sink, stream, state.connection_context()).await {
        Ok(connection) => {
            info!(user = %identity, session = %connection.session(), "Client connected");
            connection.closed().await;
        }
        Err(e) => warn!(user = %identity, error = %e, "Could not register connection"),
    }
}

/// Wrap an axum socket as transport-neutral frame halves.
fn adapt_socket(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (ws_tx, ws_rx) = socket.split();

    let sink = ws_tx
        .sink_map_err(ConnectionError::from)
        .with(|frame: Frame| future::ready(Ok::<_, ConnectionError>(into_ws(frame))));
    let stream = ws_rx.map(|msg| msg.map(from_ws).map_err(ConnectionError::from));

    (Box::pin(sink), Box::pin(stream))
}

fn into_ws(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text),
        Frame::Binary(bytes) => WsMessage::Binary(bytes),
        Frame::Ping(data) => WsMessage::Ping(data),
        Frame::Pong(data) => WsMessage::Pong(data),
        Frame::Close => WsMessage::Close(None),
    }
}

fn from_ws(msg: WsMessage) -> Frame {
    match msg {
        WsMessage::Text(text) => Frame::Text(text),
        WsMessage::Binary(bytes) => Frame::Binary(bytes),
        WsMessage::Ping(data) => Frame::Ping(data),
        WsMessage::Pong(data) => Frame::Pong(data),
        WsMessage::Close(_) => Frame::Close,
    }
}

async fn ws_online(
    State(state): State<AppState>,
    Query(query): Query<ClientQuery>,
) -> Result<Json<OnlineResponse>, ServerError> {
    let identity = query.identity()?;
    let client = state.hub.get_client(&identity).await?;
    Ok(Json(OnlineResponse {
        online: client.is_some(),
        client,
    }))
}

async fn ws_logout(
    State(state): State<AppState>,
    Json(req): Json<WsLogoutRequest>,
) -> Result<Json<WsLogoutResponse>, ServerError> {
    let outcome = state.hub.logout(&req.owner_id).await?;
    info!(user = %req.owner_id, ?outcome, "Logout requested");
    Ok(Json(WsLogoutResponse {
        message: outcome.message(),
        code: outcome.code(),
    }))
}

/// Recent history between two users. Served from the cache when present;
/// a miss is answered from the store and leaves the cache untouched.
async fn get_message_list(
    State(state): State<AppState>,
    Json(req): Json<MessageListRequest>,
) -> Result<Json<Vec<MessageView>>, ServerError> {
    let key = conversation_key(&req.user_one_id, &req.user_two_id);
    if let Some(list) = cached(&state.persistence, &key).await {
        return Ok(Json(list));
    }
    let list = state
        .persistence
        .conversation_history(&req.user_one_id, &req.user_two_id)
        .await?;
    Ok(Json(list))
}

async fn get_group_message_list(
    State(state): State<AppState>,
    Json(req): Json<GroupMessageListRequest>,
) -> Result<Json<Vec<MessageView>>, ServerError> {
    let key = group_key(&req.group_id);
    if let Some(list) = cached(&state.persistence, &key).await {
        return Ok(Json(list));
    }
    let list = state.persistence.group_history(&req.group_id).await?;
    Ok(Json(list))
}

/// Cache lookup that degrades to a miss when the cache is unreachable.
async fn cached(persistence: &Persistence, key: &str) -> Option<Vec<MessageView>> {
    match persistence.cache_list(key).await {
        Ok(list) => list,
        Err(e) => {
            warn!(key, error = %e, "Cache read failed, falling back to store");
            None
        }
    }
}

pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use gogo_shared::constants::FAREWELL_TEXT;
    use gogo_shared::types::MessageType;
    use gogo_store::Message;

    use super::*;
    use crate::test_support::{next_frame, request, Harness};

    fn router(h: &Harness) -> Router {
        build_router(AppState {
            hub: h.hub.clone(),
            persistence: h.persistence.clone(),
            transport: Transport::Direct,
            config: Arc::new(ServerConfig::default()),
        })
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn store_text(h: &Harness, from: &str, to: &str, content: &str) -> Message {
        let mut req = request(from, to, MessageType::Text);
        req.content = content.to_string();
        let message = Message::from_request(&req);
        h.persistence.append(&message).await.unwrap();
        message
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new();
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let (status, json) = call(router(&h), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_online_lookup() {
        let h = Harness::new();
        let (session, _rx) = h.connect("U1").await;

        let req = Request::get("/wss/online?client_id=U1").body(Body::empty()).unwrap();
        let (status, json) = call(router(&h), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["online"], true);
        assert_eq!(json["client"]["session"], session.to_string());

        let req = Request::get("/wss/online?client_id=U2").body(Body::empty()).unwrap();
        let (_, json) = call(router(&h), req).await;
        assert_eq!(json["online"], false);

        let req = Request::get("/wss/online").body(Body::empty()).unwrap();
        let (status, _) = call(router(&h), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_logout_endpoint() {
        let h = Harness::new();
        let (_, mut rx) = h.connect("U1").await;
        next_frame(&mut rx).await;

        let body = serde_json::json!({ "owner_id": "U1" });
        let (status, json) = call(router(&h), post_json("/user/wsLogout", body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["code"], 0);
        assert_eq!(next_frame(&mut rx).await.payload, FAREWELL_TEXT);

        let (_, json) = call(router(&h), post_json("/user/wsLogout", body)).await;
        assert_eq!(json["code"], 1);
        assert_eq!(json["message"], "User is not connected");
    }

    #[tokio::test]
    async fn test_message_list_prefers_cache() {
        let h = Harness::new();
        let first = store_text(&h, "U1", "U2", "first").await;
        store_text(&h, "U2", "U1", "second").await;

        let body = serde_json::json!({ "user_one_id": "U2", "user_two_id": "U1" });
        let (status, json) = call(router(&h), post_json("/message/getMessageList", body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let contents: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);

        // A miss does not populate the cache.
        let key = conversation_key("U1", "U2");
        assert!(h.persistence.cache_list(&key).await.unwrap().is_none());

        h.persistence
            .append_to_cache(&key, &first.to_view())
            .await
            .unwrap();
        let (_, json) = call(router(&h), post_json("/message/getMessageList", body)).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_group_message_list() {
        let h = Harness::new();
        store_text(&h, "U1", "G1", "hello group").await;

        let body = serde_json::json!({ "group_id": "G1" });
        let (status, json) = call(router(&h), post_json("/message/getGroupMessageList", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["content"], "hello group");
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let h = Harness::new();
        let req = Request::post("/message/getMessageList")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _) = call(router(&h), req).await;
        assert!(status.is_client_error());
    }

    #[test]
    fn test_frame_conversion() {
        assert_eq!(from_ws(WsMessage::Text("hi".into())), Frame::Text("hi".into()));
        assert_eq!(from_ws(WsMessage::Close(None)), Frame::Close);
        assert!(matches!(into_ws(Frame::Ping(vec![1])), WsMessage::Ping(p) if p == vec![1]));
    }
}
