use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth;
use crate::config::AppConfig;
use crate::db::{self, DbPool};
use crate::error::{AppError, AppResult};
use crate::models::{AuthResponse, LoginRequest, RegisterRequest, UserPublic};
use crate::relay::{self, RelayState};

/// Minutes a refresh token stays valid for before rotation is required.
const REFRESH_TOKEN_TTL_DAYS: i64 = 30;

#[derive(serde::Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(serde::Serialize)]
struct PublicKeyResponse {
    public_key_pem: String,
    algorithm: String,
}

#[derive(serde::Serialize)]
struct InstanceInfo {
    name: &'static str,
    version: &'static str,
    anonymous_mode_enabled: bool,
    welcome_enabled: bool,
    max_messages_per_channel: i64,
    max_message_age_secs: i64,
}

pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/instance/info", get(instance_info))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/public-key", get(public_key_endpoint))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn instance_info(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(InstanceInfo {
        name: "walkie-relay",
        version: env!("CARGO_PKG_VERSION"),
        anonymous_mode_enabled: state.config.relay.anonymous_mode_enabled,
        welcome_enabled: state.config.relay.welcome_enabled,
        max_messages_per_channel: state.config.history.max_count_per_channel,
        max_message_age_secs: state.config.history.max_age_secs,
    })
}

async fn register(
    State(state): State<Arc<RelayState>>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<Json<AuthResponse>> {
    if !state.config.auth.registration_enabled {
        return Err(AppError::Forbidden);
    }
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(AppError::BadRequest(
            "Username must be 3-32 characters".to_string(),
        ));
    }
    if req.password.len() < 8 {
        return Err(AppError::BadRequest(
            "Password must be at least 8 characters".to_string(),
        ));
    }

    if db::users::find_active_by_username(&state.db, &req.username)
        .await?
        .is_some()
    {
        return Err(AppError::Conflict("Username already taken".to_string()));
    }

    // CPU-intensive Argon2 hash — run on the blocking threadpool.
    let password = req.password.clone();
    let password_hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Password hashing task failed: {}", e)))??;

    let user_id = Uuid::now_v7();
    let user = db::users::create(&state.db, user_id, &req.username, &password_hash).await?;

    issue_auth_response(&state, user).await
}

async fn login(
    State(state): State<Arc<RelayState>>,
    Json(req): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let user = db::users::find_active_by_username(&state.db, &req.username)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let password = req.password.clone();
    let hash = user.password_hash.clone();
    let valid = tokio::task::spawn_blocking(move || auth::verify_password(&password, &hash))
        .await
        .map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Password verification task failed: {}", e))
        })??;
    if !valid {
        return Err(AppError::Unauthorized);
    }

    db::users::update_last_login(&state.db, user.id).await?;

    issue_auth_response(&state, user).await
}

async fn refresh(
    State(state): State<Arc<RelayState>>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<Json<AuthResponse>> {
    let token_hash = auth::hash_refresh_token(&req.refresh_token);
    let existing = db::refresh_tokens::find_valid_by_hash(&state.db, &token_hash)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let user = db::users::find_by_id(&state.db, existing.user_id)
        .await?
        .ok_or(AppError::Unauthorized)?;

    db::refresh_tokens::revoke(&state.db, existing.id).await?;

    issue_auth_response(&state, user).await
}

/// Mints a bearer token plus a fresh refresh token for `user`, persisting the
/// refresh token's lookup digest (§6.1 — `AccountStore`/`TokenValidator`).
async fn issue_auth_response(
    state: &RelayState,
    user: crate::models::User,
) -> AppResult<Json<AuthResponse>> {
    let token = auth::create_token(&state.config.auth, user.id, &user.username)?;

    let refresh_token = auth::generate_refresh_token();
    let token_hash = auth::hash_refresh_token(&refresh_token);
    let expires_at = Utc::now() + ChronoDuration::days(REFRESH_TOKEN_TTL_DAYS);
    db::refresh_tokens::create(
        &state.db,
        Uuid::now_v7(),
        user.id,
        &token_hash,
        expires_at,
        None,
        None,
    )
    .await?;

    Ok(Json(AuthResponse {
        token,
        refresh_token,
        user: UserPublic::from(user),
    }))
}

async fn public_key_endpoint(State(state): State<Arc<RelayState>>) -> AppResult<Json<PublicKeyResponse>> {
    let pem = auth::read_public_key_pem(&state.config.auth)?;
    Ok(Json(PublicKeyResponse {
        public_key_pem: pem,
        algorithm: "RS256".to_string(),
    }))
}

/// Resolves the effective client IP per the trusted-proxy rule (§6/§8
/// property 8): the direct peer unless it's a configured trusted proxy, in
/// which case the first `X-Forwarded-For` entry wins.
fn resolve_client_ip(config: &AppConfig, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
    let peer_str = peer.to_string();
    if !config.relay.trusted_proxies.iter().any(|p| p == &peer_str) {
        return peer;
    }

    headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or(peer)
}

async fn ws_upgrade(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let client_ip = resolve_client_ip(&state.config, addr.ip(), &headers);
    ws.on_upgrade(move |socket| async move {
        relay::handle_socket(state, socket, client_ip).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_proxies(proxies: &[&str]) -> AppConfig {
        let mut config: AppConfig = toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            [database]
            url = "postgres://localhost/test"
            max_connections = 5
            [auth]
            jwt_public_key_path = "public.pem"
            token_expiry = 3600
            registration_enabled = true
            [history]
            max_count_per_channel = 50
            max_age_secs = 3600
            [screen_name]
            min_length = 1
            max_length = 32
            pattern = "^.+$"
            [relay]
            anonymous_mode_enabled = true
            welcome_enabled = true
            [logging]
            level = "info"
            format = "plain"
            "#,
        )
        .unwrap();
        config.relay.trusted_proxies = proxies.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn untrusted_peer_is_used_verbatim() {
        let config = config_with_proxies(&[]);
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "10.0.0.1".parse().unwrap());
        assert_eq!(resolve_client_ip(&config, peer, &headers), peer);
    }

    #[test]
    fn trusted_peer_defers_to_forwarded_header() {
        let config = config_with_proxies(&["203.0.113.7"]);
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "10.0.0.1, 203.0.113.7".parse().unwrap());
        let forwarded: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(resolve_client_ip(&config, peer, &headers), forwarded);
    }

    #[test]
    fn trusted_peer_without_header_falls_back_to_peer() {
        let config = config_with_proxies(&["203.0.113.7"]);
        let peer: IpAddr = "203.0.113.7".parse().unwrap();
        let headers = HeaderMap::new();
        assert_eq!(resolve_client_ip(&config, peer, &headers), peer);
    }
}
