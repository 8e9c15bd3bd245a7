//! Thin HTTP binding over the relay gateway core's external interfaces.
//! Every handler extracts credentials, calls into the core, and
//! serializes the result; no business logic lives here.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use relay_gateway::models::{CanonicalChatRequest, CanonicalEmbeddingsRequest, Channel, ModelPrice, Token};
use relay_gateway::repository::{ChannelRepository, PricingRepository, TokenRepository};
use relay_gateway::{Gateway, GatewayConfig, GatewayError};
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

type AppState = Arc<Gateway>;

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())))
        .collect()
}

fn err_response(e: GatewayError) -> (StatusCode, Json<serde_json::Value>) {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

#[derive(Deserialize)]
struct SseConnectQuery {
    client_id: String,
    token: Option<String>,
}

async fn chat_completions(
    State(gateway): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CanonicalChatRequest>,
) -> impl IntoResponse {
    let header_values = header_map(&headers);
    let query = HashMap::new();
    let auth = gateway
        .auth
        .authenticate(&header_values, &query, None, Some(&request.model), chrono::Utc::now())
        .await;
    let (user, _token) = match auth {
        Ok(pair) => pair,
        Err(e) => return err_response(e).into_response(),
    };

    let request_id = uuid::Uuid::new_v4().to_string();

    if request.stream {
        let Some(client_id) = header_values.get("x-sse-client-id").cloned() else {
            return err_response(GatewayError::InternalInvariant(
                "streaming requests require x-sse-client-id naming an already-registered SSE connection".into(),
            ))
            .into_response();
        };
        let gateway = gateway.clone();
        let group = user.group.clone();
        let spawned_request_id = request_id.clone();
        tokio::spawn(async move {
            match gateway
                .pipeline
                .relay_chat_stream(&user.id, &group, &spawned_request_id, &client_id, request)
                .await
            {
                Ok(()) => gateway.metrics.record_request(false),
                Err(e) => {
                    gateway.metrics.record_request(true);
                    error!("stream relay {spawned_request_id} failed: {e}");
                }
            }
        });
        return (StatusCode::ACCEPTED, Json(serde_json::json!({ "request_id": request_id }))).into_response();
    }

    match gateway.pipeline.relay_chat(&user.id, &user.group, &request_id, request).await {
        Ok(outcome) => {
            gateway.metrics.record_request(false);
            Json(outcome.response).into_response()
        }
        Err(e) => {
            gateway.metrics.record_request(true);
            err_response(e).into_response()
        }
    }
}

async fn embeddings(
    State(gateway): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CanonicalEmbeddingsRequest>,
) -> impl IntoResponse {
    let header_values = header_map(&headers);
    let auth = gateway
        .auth
        .authenticate(&header_values, &HashMap::new(), None, Some(&request.model), chrono::Utc::now())
        .await;
    if let Err(e) = auth {
        return err_response(e).into_response();
    }
    // Embeddings share the adapter contract's canonical chat types only;
    // a dedicated embeddings adapter method is out of scope for this core.
    err_response(GatewayError::InternalInvariant(
        "embeddings relay is not implemented by any registered adapter".into(),
    ))
    .into_response()
}

async fn not_implemented() -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, Json(serde_json::json!({ "error": "not implemented" })))
}

async fn sse_connect(
    State(gateway): State<AppState>,
    Query(query): Query<SseConnectQuery>,
) -> impl IntoResponse {
    let Some(rx) = gateway.broadcaster.register(query.client_id.clone()) else {
        return err_response(GatewayError::RateLimitedLocal("sse client capacity reached".into())).into_response();
    };
    info!("sse client {} connected", query.client_id);

    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(stream::unfold(rx, |mut rx| async move {
            let frame = rx.recv().await?;
            let mut event = Event::default().data(frame.data);
            if let Some(name) = frame.event {
                event = event.event(name);
            }
            Some((Ok(event), rx))
        }));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))).into_response()
}

#[derive(Deserialize)]
struct BroadcastBody {
    event: Option<String>,
    data: String,
}

async fn sse_broadcast(State(gateway): State<AppState>, Json(body): Json<BroadcastBody>) -> impl IntoResponse {
    let frame = match body.event {
        Some(name) => relay_gateway::relay::SseFrame::named(name, body.data),
        None => relay_gateway::relay::SseFrame::data(body.data),
    };
    gateway.broadcaster.broadcast(frame);
    StatusCode::NO_CONTENT
}

async fn sse_send(State(gateway): State<AppState>, Path(id): Path<String>, Json(body): Json<BroadcastBody>) -> impl IntoResponse {
    let frame = match body.event {
        Some(name) => relay_gateway::relay::SseFrame::named(name, body.data),
        None => relay_gateway::relay::SseFrame::data(body.data),
    };
    gateway.broadcaster.send(&id, frame);
    StatusCode::NO_CONTENT
}

async fn admin_list_channels(State(gateway): State<AppState>) -> impl IntoResponse {
    match gateway.repo.list_channels().await {
        Ok(channels) => Json(channels).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn admin_upsert_channel(State(gateway): State<AppState>, Json(channel): Json<Channel>) -> impl IntoResponse {
    let snapshot = channel.config_clone();
    gateway.channels.upsert(channel).await;
    match gateway.repo.save_channel(snapshot).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn admin_delete_channel(State(gateway): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    gateway.channels.remove(&id).await;
    StatusCode::NO_CONTENT
}

/// Explicit admin transition to `Disabled`. A full-struct channel upsert
/// can never reach this status since `Channel::status` is not part of the
/// wire representation.
async fn admin_disable_channel(State(gateway): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let slot = match gateway.channels.get(&id).await {
        Ok(slot) => slot,
        Err(e) => return err_response(e).into_response(),
    };
    let snapshot = {
        let mut ch = slot.write().await;
        ch.disable();
        ch.config_clone()
    };
    match gateway.repo.save_channel(snapshot).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

/// Explicit admin recovery from `Unavailable` back to `Healthy`. No-op if
/// the channel is not currently `Unavailable` (see `Channel::recover`).
async fn admin_recover_channel(State(gateway): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let slot = match gateway.channels.get(&id).await {
        Ok(slot) => slot,
        Err(e) => return err_response(e).into_response(),
    };
    let snapshot = {
        let mut ch = slot.write().await;
        ch.recover();
        ch.config_clone()
    };
    match gateway.repo.save_channel(snapshot).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

#[derive(Deserialize)]
struct PricingQuery {
    model: String,
    group: String,
}

async fn admin_get_pricing(State(gateway): State<AppState>, Query(q): Query<PricingQuery>) -> impl IntoResponse {
    match gateway.pricing.current(&q.model, &q.group).await {
        Some(price) => Json(price).into_response(),
        None => err_response(GatewayError::NotFound(format!("price for {}/{}", q.model, q.group))).into_response(),
    }
}

async fn admin_put_pricing(State(gateway): State<AppState>, Json(price): Json<ModelPrice>) -> impl IntoResponse {
    gateway.pricing.upsert(price.clone()).await;
    match gateway.repo.save_price(price).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn admin_put_token(State(gateway): State<AppState>, Json(token): Json<Token>) -> impl IntoResponse {
    match gateway.repo.save_token(token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn metrics_snapshot(State(gateway): State<AppState>) -> impl IntoResponse {
    Json(gateway.metrics.snapshot())
}

fn router(gateway: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(not_implemented))
        .route("/v1/audio/transcriptions", post(not_implemented))
        .route("/v1/audio/speech", post(not_implemented))
        .route("/api/sse/connect", get(sse_connect))
        .route("/api/sse/broadcast", post(sse_broadcast))
        .route("/api/sse/send/:id", post(sse_send))
        .route("/api/admin/channels", get(admin_list_channels).post(admin_upsert_channel))
        .route("/api/admin/channels/:id", delete(admin_delete_channel))
        .route("/api/admin/channels/:id/disable", post(admin_disable_channel))
        .route("/api/admin/channels/:id/recover", post(admin_recover_channel))
        .route("/api/admin/pricing", get(admin_get_pricing).put(admin_put_pricing))
        .route("/api/admin/tokens", post(admin_put_token))
        .route("/metrics", get(metrics_snapshot))
        .with_state(gateway)
        .layer(tower_http::cors::CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = GatewayConfig::load(std::env::var("RELAY_CONFIG_FILE").ok().as_deref())?;
    let repo = Arc::new(relay_gateway::repository::InMemoryRepository::new());
    let gateway = Arc::new(Gateway::new(config, repo));
    let _background = gateway.start();

    let app = router(gateway);
    let addr: std::net::SocketAddr = std::env::var("RELAY_BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;
    info!("relay gateway listening on {addr}");

    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}
