//! Vocore Server Library
//!
//! Exposes the voice/presence SFU core for the binary entry point and for
//! integration tests: configuration, the SFU/screen-share/peer machinery,
//! the voice hub that brokers WebSocket connections, and the ambient
//! auth/rate-limit/TURN/admission-control pieces it's built from.

pub mod admission;
pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod peer;
pub mod rate_limit;
pub mod screen_share;
pub mod sfu;
pub mod turn;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use admission::AdmissionControl;
use auth::{CurrentSessionVersion, RosterSource, SessionVerifier, StaticSecretVerifier};
use config::Config;
use hub::{Hub, HubDeps};
use sfu::SfuCore;

/// Builds the hub and the axum [`Router`] it's served behind. `session_verifier`,
/// `current_session_version`, and `roster_source` are the external
/// collaborators (account/session service, roster store) this repository
/// never implements; pass [`StaticSecretVerifier`] for a standalone
/// deployment with no such service.
pub async fn build_app(
    config: Arc<Config>,
    session_verifier: Arc<dyn SessionVerifier>,
    current_session_version: Arc<dyn CurrentSessionVersion>,
    roster_source: Arc<dyn RosterSource>,
) -> Result<(Router, Arc<Hub>)> {
    let sfu = SfuCore::new(&config)?;
    let hub = Hub::new(HubDeps {
        config: config.clone(),
        sfu,
        session_verifier,
        current_session_version,
        roster_source,
    })
    .await;

    let admission = AdmissionControl::new(config.max_unauth_per_ip, config.max_unauth_global);
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(AppState { config, hub: hub.clone(), admission });

    Ok((router, hub))
}

/// Convenience wrapper for standalone deployments with no external
/// session-revocation or roster authority: every session_version is
/// considered current, and roster entries fall back to the user id.
pub async fn build_standalone_app(config: Arc<Config>) -> Result<(Router, Arc<Hub>)> {
    let verifier = Arc::new(StaticSecretVerifier::new(config.jwt_secret.clone()));
    build_app(config, verifier.clone(), verifier, Arc::new(NullRosterSource)).await
}

struct NullRosterSource;

#[async_trait::async_trait]
impl RosterSource for NullRosterSource {
    async fn username(&self, _user_id: uuid::Uuid) -> Option<String> {
        None
    }
    async fn avatar_url(&self, _user_id: uuid::Uuid) -> Option<String> {
        None
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    hub: Arc<Hub>,
    admission: Arc<AdmissionControl>,
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    if !admission::origin_allowed(&state.config.ws_allowed_origins, origin) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let forwarded_for = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let ip = admission::resolve_client_ip(peer.ip(), &state.config.trusted_proxy_cidrs, forwarded_for);

    let Some(permit) = state.admission.try_admit(ip).await else {
        return (StatusCode::SERVICE_UNAVAILABLE, "too many pending connections").into_response();
    };

    ws.on_upgrade(move |socket| async move {
        state.hub.spawn_connection(socket, ip, permit);
    })
}
