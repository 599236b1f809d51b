use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth;
use crate::channel::{validate_channel_id, ChannelRegistry};
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::error::ProtocolError;
use crate::history::HistoryRetention;
use crate::identity::{ConnectionId, IdentityRegistry};
use crate::protocol::{AuthenticatedUser, ClientFrame, DeclaredCodec, HistoryEntry, ServerFrame};
use crate::transmission::TransmissionBuffer;
use crate::welcome::{welcome_client_prefix, WelcomeHook, WelcomeOccasion};

/// Per-connection protocol phase (§4.1). A connection holds at most one
/// channel membership at a time; joining atomically supersedes it.
#[derive(Debug, Clone)]
enum Phase {
    Unnamed,
    Named,
    InChannel { channel: String },
    Talking { channel: String, client_id: String },
}

impl Phase {
    fn current_channel(&self) -> Option<&str> {
        match self {
            Phase::InChannel { channel } | Phase::Talking { channel, .. } => Some(channel),
            _ => None,
        }
    }
}

/// Shared state behind every live WebSocket connection: the registries from
/// §4, plus one outbound queue per connection for fan-out delivery.
pub struct RelayState {
    pub db: DbPool,
    pub config: AppConfig,
    pub identities: IdentityRegistry,
    pub channels: ChannelRegistry,
    pub transmissions: TransmissionBuffer,
    pub history: HistoryRetention,
    pub welcome: WelcomeHook,
    screen_name_pattern: Regex,
    outboxes: DashMap<ConnectionId, mpsc::UnboundedSender<ServerFrame>>,
}

impl RelayState {
    pub fn new(db: DbPool, config: AppConfig) -> Arc<Self> {
        let history = HistoryRetention::new(db.clone(), &config.history);
        let welcome = WelcomeHook::new(db.clone(), config.relay.welcome_enabled);
        let screen_name_pattern = Regex::new(&config.screen_name.pattern)
            .expect("screen_name.pattern must be a valid regular expression");
        Arc::new(Self {
            db,
            config,
            identities: IdentityRegistry::new(),
            channels: ChannelRegistry::new(),
            transmissions: TransmissionBuffer::new(),
            history,
            welcome,
            screen_name_pattern,
            outboxes: DashMap::new(),
        })
    }

    fn send(&self, conn_id: ConnectionId, frame: ServerFrame) {
        if let Some(tx) = self.outboxes.get(&conn_id) {
            let _ = tx.send(frame);
        }
    }

    /// Fan out to every member of `channel` except `except`, copying the
    /// member list first so a peer's concurrent detach during delivery
    /// can't invalidate iteration (§5).
    async fn broadcast_except(&self, channel: &str, except: ConnectionId, frame: ServerFrame) {
        for member in self.channels.members(channel).await {
            if member != except {
                self.send(member, frame.clone());
            }
        }
    }

    async fn send_welcome(&self, conn_id: ConnectionId, occasion: WelcomeOccasion, channel: Option<&str>) {
        let prefix = welcome_client_prefix(conn_id);
        for frame in self.welcome.play(occasion, channel, &prefix).await {
            self.send(conn_id, frame);
        }
    }
}

/// Entry point for one accepted WebSocket (called from the `/ws` handler in
/// `api.rs`). Owns the connection's lifetime end to end: registration,
/// dispatch loop, and cleanup-on-disconnect.
pub async fn handle_socket(state: Arc<RelayState>, socket: WebSocket, _client_ip: IpAddr) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    state.outboxes.insert(conn_id, tx);

    let (mut sink, mut stream) = socket.split();

    let forward_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(%err, "failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut phase = Phase::Unnamed;

    if !state.config.relay.anonymous_mode_enabled {
        state.send(conn_id, ServerFrame::AuthenticationRequired);
    }

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%err, %conn_id, "websocket receive error, closing");
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(_) => {
                        tracing::debug!(%conn_id, "dropped malformed or unrecognized frame");
                        continue;
                    }
                };
                phase = dispatch(&state, conn_id, phase, frame).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    cleanup(&state, conn_id, &phase).await;
    forward_task.abort();
}

async fn dispatch(state: &Arc<RelayState>, conn_id: ConnectionId, phase: Phase, frame: ClientFrame) -> Phase {
    match frame {
        ClientFrame::Authenticate { token } => handle_authenticate(state, conn_id, phase, token).await,
        ClientFrame::SetScreenName { screen_name } => {
            handle_set_screen_name(state, conn_id, phase, screen_name).await
        }
        ClientFrame::JoinChannel { channel } => handle_join_channel(state, conn_id, phase, channel).await,
        ClientFrame::LeaveChannel => handle_leave_channel(state, conn_id, phase).await,
        ClientFrame::PushToTalkStart {
            client_id,
            sample_rate,
            codec,
            format,
            bitrate,
        } => handle_ptt_start(state, conn_id, phase, client_id, sample_rate, codec, format, bitrate).await,
        ClientFrame::AudioData { data, duration_ms } => {
            handle_audio_data(state, conn_id, phase, data, duration_ms).await
        }
        ClientFrame::PushToTalkEnd => handle_ptt_end(state, conn_id, phase).await,
        ClientFrame::HistoryRequest { channel } => {
            handle_history_request(state, conn_id, phase, channel).await
        }
        ClientFrame::ReloadWelcomeMessages => handle_reload_welcome(state, conn_id, phase).await,
    }
}

fn error(state: &Arc<RelayState>, conn_id: ConnectionId, err: ProtocolError) {
    state.send(
        conn_id,
        ServerFrame::Error {
            message: err.to_string(),
            code: err.code(),
        },
    );
}

async fn handle_authenticate(
    state: &Arc<RelayState>,
    conn_id: ConnectionId,
    phase: Phase,
    token: String,
) -> Phase {
    if !matches!(phase, Phase::Unnamed) {
        error(state, conn_id, ProtocolError::AlreadyNamed);
        return phase;
    }

    let claims = match auth::validate_token(&state.config.auth, &token) {
        Ok(claims) => claims,
        Err(_) => {
            error(state, conn_id, ProtocolError::InvalidToken);
            return phase;
        }
    };

    let user_id = match auth::user_id_from_claims(&claims) {
        Ok(id) => id,
        Err(_) => {
            error(state, conn_id, ProtocolError::InvalidToken);
            return phase;
        }
    };

    match state
        .identities
        .bind_authenticated(conn_id, user_id, claims.username.clone())
    {
        Ok(()) => {
            state.send(
                conn_id,
                ServerFrame::Authenticated {
                    user: AuthenticatedUser {
                        id: user_id.to_string(),
                        username: claims.username,
                    },
                },
            );
            state.send_welcome(conn_id, WelcomeOccasion::Connect, None).await;
            Phase::Named
        }
        Err(err) => {
            error(state, conn_id, err);
            phase
        }
    }
}

async fn handle_set_screen_name(
    state: &Arc<RelayState>,
    conn_id: ConnectionId,
    phase: Phase,
    screen_name: String,
) -> Phase {
    if !state.config.relay.anonymous_mode_enabled {
        error(state, conn_id, ProtocolError::AnonymousDisabled);
        return phase;
    }
    if !matches!(phase, Phase::Unnamed) {
        error(state, conn_id, ProtocolError::AlreadyNamed);
        return phase;
    }

    if !is_valid_screen_name(state, &screen_name) {
        error(state, conn_id, ProtocolError::NameInvalid);
        return phase;
    }

    if state.identities.is_name_in_use(&screen_name) {
        error(state, conn_id, ProtocolError::NameTaken);
        return phase;
    }

    match crate::db::users::find_active_by_username(&state.db, &screen_name).await {
        Ok(Some(_)) => {
            error(state, conn_id, ProtocolError::NameTaken);
            return phase;
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(%err, "account lookup failed during name claim");
            error(state, conn_id, ProtocolError::InternalStoreError);
            return phase;
        }
    }

    match state.identities.bind_anonymous(conn_id, screen_name.clone()) {
        Ok(()) => {
            state.send(conn_id, ServerFrame::ScreenNameSet { screen_name });
            state.send_welcome(conn_id, WelcomeOccasion::Connect, None).await;
            Phase::Named
        }
        Err(err) => {
            error(state, conn_id, err);
            phase
        }
    }
}

fn is_valid_screen_name(state: &Arc<RelayState>, name: &str) -> bool {
    let config = &state.config.screen_name;
    let len = name.chars().count();
    len >= config.min_length && len <= config.max_length && state.screen_name_pattern.is_match(name)
}

async fn handle_join_channel(
    state: &Arc<RelayState>,
    conn_id: ConnectionId,
    phase: Phase,
    channel: String,
) -> Phase {
    if matches!(phase, Phase::Unnamed) {
        error(state, conn_id, ProtocolError::AuthRequired);
        return phase;
    }

    if validate_channel_id(&channel).is_err() {
        error(state, conn_id, ProtocolError::InvalidChannel);
        return phase;
    }

    if let Some(previous) = phase.current_channel() {
        leave_current_channel(state, conn_id, previous).await;
    }

    state.channels.attach(&channel, conn_id).await;
    let participants = state.channels.member_count(&channel).await;

    state.send(
        conn_id,
        ServerFrame::ChannelJoined {
            channel: channel.clone(),
            participants,
        },
    );

    let screen_name = state
        .identities
        .identity_of(conn_id)
        .screen_name()
        .unwrap_or_default()
        .to_string();

    state
        .broadcast_except(
            &channel,
            conn_id,
            ServerFrame::ParticipantJoined {
                screen_name,
                participants,
            },
        )
        .await;

    state
        .send_welcome(conn_id, WelcomeOccasion::ChannelJoin, Some(&channel))
        .await;

    Phase::InChannel { channel }
}

/// Detach from `channel` and tell remaining members, used both on explicit
/// `leave_channel` and when `join_channel` supersedes a prior membership.
async fn leave_current_channel(state: &Arc<RelayState>, conn_id: ConnectionId, channel: &str) {
    state.transmissions.discard(conn_id);
    state.channels.detach_all(conn_id).await;
    let participants = state.channels.member_count(channel).await;
    state
        .broadcast_except(channel, conn_id, ServerFrame::ParticipantLeft { participants })
        .await;
}

async fn handle_leave_channel(state: &Arc<RelayState>, conn_id: ConnectionId, phase: Phase) -> Phase {
    let Phase::InChannel { channel } = &phase else {
        error(state, conn_id, ProtocolError::NotInChannel);
        return phase;
    };

    leave_current_channel(state, conn_id, channel).await;
    state.send(conn_id, ServerFrame::ChannelLeft { channel: channel.clone() });
    Phase::Named
}

#[allow(clippy::too_many_arguments)]
async fn handle_ptt_start(
    state: &Arc<RelayState>,
    conn_id: ConnectionId,
    phase: Phase,
    client_id: String,
    sample_rate: i32,
    codec: Option<String>,
    format: Option<String>,
    bitrate: Option<i32>,
) -> Phase {
    let Phase::InChannel { channel } = &phase else {
        error(state, conn_id, ProtocolError::NotInChannel);
        return phase;
    };
    let channel = channel.clone();

    let identity = state.identities.identity_of(conn_id);
    let screen_name = identity.screen_name().unwrap_or_default().to_string();
    let declared = ClientFrame::declared_field(&codec, &format);
    let codec = ClientFrame::declared_codec(&codec, &format);

    state.transmissions.start(
        conn_id,
        channel.clone(),
        client_id.clone(),
        identity.user_id(),
        screen_name.clone(),
        sample_rate,
        codec,
        declared,
        bitrate,
    );

    state
        .broadcast_except(
            &channel,
            conn_id,
            ServerFrame::UserSpeaking {
                speaking: true,
                screen_name: Some(screen_name),
            },
        )
        .await;

    Phase::Talking { channel, client_id }
}

async fn handle_audio_data(
    state: &Arc<RelayState>,
    conn_id: ConnectionId,
    phase: Phase,
    data: String,
    duration_ms: Option<i64>,
) -> Phase {
    let channel = match phase.current_channel() {
        Some(channel) => channel.to_string(),
        None => {
            error(state, conn_id, ProtocolError::NotInChannel);
            return phase;
        }
    };

    let lazy_client_id = if !state.transmissions.is_active(conn_id) {
        // `ptt.start` was missed — open a transmission lazily (§4.1) using
        // conservative defaults since no explicit sample rate was declared.
        let client_id = Uuid::new_v4().to_string();
        let identity = state.identities.identity_of(conn_id);
        state.transmissions.start(
            conn_id,
            channel.clone(),
            client_id.clone(),
            identity.user_id(),
            identity.screen_name().unwrap_or_default().to_string(),
            48000,
            "pcm16".to_string(),
            DeclaredCodec::Codec {
                codec: "pcm16".to_string(),
            },
            None,
        );
        Some(client_id)
    } else {
        None
    };

    if let Err(err) = state.transmissions.push_chunk(conn_id, &data, duration_ms) {
        error(state, conn_id, err);
        return phase;
    }

    if let Some((sample_rate, declared, bitrate)) = state.transmissions.params(conn_id) {
        state
            .broadcast_except(
                &channel,
                conn_id,
                ServerFrame::AudioData {
                    channel: channel.clone(),
                    data,
                    declared,
                    sample_rate,
                    channels: 1,
                    bitrate,
                },
            )
            .await;
    }

    match phase {
        Phase::Talking { .. } => phase,
        Phase::InChannel { channel } => Phase::Talking {
            client_id: lazy_client_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            channel,
        },
        other => other,
    }
}

async fn handle_ptt_end(state: &Arc<RelayState>, conn_id: ConnectionId, phase: Phase) -> Phase {
    let Phase::Talking { channel, .. } = &phase else {
        error(state, conn_id, ProtocolError::NotInChannel);
        return phase;
    };
    let channel = channel.clone();

    let screen_name = state
        .identities
        .identity_of(conn_id)
        .screen_name()
        .unwrap_or_default()
        .to_string();

    state
        .broadcast_except(
            &channel,
            conn_id,
            ServerFrame::UserSpeaking {
                speaking: false,
                screen_name: Some(screen_name),
            },
        )
        .await;

    if let Some(finalized) = state.transmissions.finalize(conn_id) {
        let timestamp_ms = finalized_timestamp_ms();
        let result = state
            .history
            .record(
                &finalized.channel,
                &finalized.client_id,
                finalized.user_id,
                &finalized.screen_name,
                &finalized.audio_data,
                finalized.sample_rate,
                &finalized.codec,
                finalized.bitrate,
                finalized.duration_ms,
                timestamp_ms,
            )
            .await;

        if let Err(err) = result {
            error(state, conn_id, err);
        }
    }

    Phase::InChannel { channel }
}

fn finalized_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn handle_history_request(
    state: &Arc<RelayState>,
    conn_id: ConnectionId,
    phase: Phase,
    requested_channel: Option<String>,
) -> Phase {
    if matches!(phase, Phase::Unnamed) {
        error(state, conn_id, ProtocolError::AuthRequired);
        return phase;
    }

    let channel = requested_channel
        .or_else(|| phase.current_channel().map(str::to_string));

    let Some(channel) = channel else {
        error(state, conn_id, ProtocolError::NotInChannel);
        return phase;
    };

    let now_ms = finalized_timestamp_ms();
    match state.history.fetch(&channel, now_ms).await {
        Ok(rows) => {
            let messages: Vec<HistoryEntry> = rows.into_iter().map(HistoryEntry::from).collect();
            state.send(conn_id, ServerFrame::HistoryResponse { channel, messages });
        }
        Err(err) => error(state, conn_id, err),
    }

    phase
}

async fn handle_reload_welcome(state: &Arc<RelayState>, conn_id: ConnectionId, phase: Phase) -> Phase {
    if matches!(phase, Phase::Unnamed) {
        error(state, conn_id, ProtocolError::AuthRequired);
        return phase;
    }

    let count = match crate::db::welcome::list_enabled(&state.db).await {
        Ok(rows) => rows.len(),
        Err(err) => {
            tracing::warn!(%err, "failed to reload welcome messages");
            error(state, conn_id, ProtocolError::InternalStoreError);
            return phase;
        }
    };

    state.send(conn_id, ServerFrame::WelcomeMessagesReloaded { count });
    phase
}

/// Cleanup-on-disconnect (§5, §8 property 7): release the name, detach from
/// any channel and notify remaining members, discard any open transmission.
async fn cleanup(state: &Arc<RelayState>, conn_id: ConnectionId, phase: &Phase) {
    if let Some(channel) = phase.current_channel() {
        leave_current_channel(state, conn_id, channel).await;
    }
    state.transmissions.discard(conn_id);
    state.identities.release(conn_id);
    state.outboxes.remove(&conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use sqlx::postgres::PgPoolOptions;

    /// A `DbPool` that never actually connects — fine for every dispatch
    /// path exercised here, none of which touch the database (welcome is
    /// disabled, and `set_screen_name`'s account lookup is never reached
    /// because these tests hit the disallowed-state branch ahead of it).
    fn test_db_pool() -> DbPool {
        PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool construction never touches the network")
    }

    fn test_config(anonymous_mode_enabled: bool) -> AppConfig {
        toml::from_str(&format!(
            r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            [database]
            url = "postgres://localhost/unused"
            max_connections = 1
            [auth]
            jwt_public_key_path = "unused-public.pem"
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
            anonymous_mode_enabled = {anonymous_mode_enabled}
            welcome_enabled = false
            [logging]
            level = "info"
            format = "plain"
            "#,
        ))
        .unwrap()
    }

    fn test_state(anonymous_mode_enabled: bool) -> Arc<RelayState> {
        RelayState::new(test_db_pool(), test_config(anonymous_mode_enabled))
    }

    /// Register a connection's outbox the way `handle_socket` does, without
    /// opening a real socket.
    fn register(state: &Arc<RelayState>) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        state.outboxes.insert(conn_id, tx);
        (conn_id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn error_message(frame: &ServerFrame) -> Option<&str> {
        match frame {
            ServerFrame::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    #[tokio::test]
    async fn authenticate_while_already_named_is_rejected_with_error() {
        let state = test_state(true);
        let (conn_id, mut rx) = register(&state);

        let result = dispatch(
            &state,
            conn_id,
            Phase::Named,
            ClientFrame::Authenticate {
                token: "irrelevant".to_string(),
            },
        )
        .await;

        assert!(matches!(result, Phase::Named));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            error_message(&frames[0]),
            Some(ProtocolError::AlreadyNamed.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn set_screen_name_while_already_named_is_rejected_with_error() {
        let state = test_state(true);
        let (conn_id, mut rx) = register(&state);

        let result = dispatch(
            &state,
            conn_id,
            Phase::Named,
            ClientFrame::SetScreenName {
                screen_name: "AnotherName".to_string(),
            },
        )
        .await;

        assert!(matches!(result, Phase::Named));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            error_message(&frames[0]),
            Some(ProtocolError::AlreadyNamed.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn membership_exclusivity_across_join_and_leave() {
        let state = test_state(true);
        let (conn_a, _rx_a) = register(&state);
        let (conn_b, _rx_b) = register(&state);

        let phase_a = dispatch(&state, conn_a, Phase::Named, ClientFrame::JoinChannel {
            channel: "7".to_string(),
        })
        .await;
        let phase_b = dispatch(&state, conn_b, Phase::Named, ClientFrame::JoinChannel {
            channel: "7".to_string(),
        })
        .await;
        assert!(matches!(&phase_a, Phase::InChannel { channel } if channel == "7"));
        assert!(matches!(&phase_b, Phase::InChannel { channel } if channel == "7"));
        assert_eq!(state.channels.member_count("7").await, 2);

        // Joining a second channel atomically supersedes membership in the first.
        let phase_b = dispatch(&state, conn_b, phase_b, ClientFrame::JoinChannel {
            channel: "8".to_string(),
        })
        .await;
        assert!(matches!(&phase_b, Phase::InChannel { channel } if channel == "8"));
        assert_eq!(state.channels.member_count("7").await, 1);
        assert_eq!(state.channels.member_count("8").await, 1);

        let phase_a = dispatch(&state, conn_a, phase_a, ClientFrame::LeaveChannel).await;
        assert!(matches!(phase_a, Phase::Named));
        assert_eq!(state.channels.member_count("7").await, 0);
    }

    #[tokio::test]
    async fn fan_out_never_echoes_and_preserves_send_order() {
        let state = test_state(true);
        let (sender, mut sender_rx) = register(&state);
        let (listener, mut listener_rx) = register(&state);
        state.channels.attach("7", sender).await;
        state.channels.attach("7", listener).await;

        let phase = dispatch(&state, sender, Phase::InChannel { channel: "7".to_string() }, ClientFrame::PushToTalkStart {
            client_id: "client-1".to_string(),
            sample_rate: 48000,
            codec: None,
            format: Some("opus".to_string()),
            bitrate: None,
        })
        .await;
        assert!(matches!(&phase, Phase::Talking { channel, client_id } if channel == "7" && client_id == "client-1"));

        let phase = dispatch(&state, sender, phase, ClientFrame::AudioData {
            data: BASE64.encode("first"),
            duration_ms: Some(20),
        })
        .await;
        let _phase = dispatch(&state, sender, phase, ClientFrame::AudioData {
            data: BASE64.encode("second"),
            duration_ms: Some(20),
        })
        .await;

        assert!(drain(&mut sender_rx).is_empty(), "sender must never receive its own fan-out");

        let frames = drain(&mut listener_rx);
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], ServerFrame::UserSpeaking { speaking: true, .. }));

        let ServerFrame::AudioData { data, declared, .. } = &frames[1] else {
            panic!("expected audio_data frame, got {:?}", frames[1]);
        };
        assert_eq!(BASE64.decode(data).unwrap(), b"first");
        assert!(matches!(declared, DeclaredCodec::Format { format } if format == "opus"));

        let ServerFrame::AudioData { data, .. } = &frames[2] else {
            panic!("expected audio_data frame, got {:?}", frames[2]);
        };
        assert_eq!(BASE64.decode(data).unwrap(), b"second");
    }

    #[tokio::test]
    async fn cleanup_releases_name_and_notifies_remaining_members() {
        let state = test_state(true);
        let (leaver, _rx_leaver) = register(&state);
        let (remaining, mut remaining_rx) = register(&state);

        state.identities.bind_anonymous(leaver, "Echo".to_string()).unwrap();
        state.channels.attach("7", leaver).await;
        state.channels.attach("7", remaining).await;

        cleanup(&state, leaver, &Phase::InChannel { channel: "7".to_string() }).await;

        assert_eq!(state.channels.member_count("7").await, 1);
        assert!(!state.identities.is_name_in_use("Echo"));
        assert!(state.outboxes.get(&leaver).is_none());

        let frames = drain(&mut remaining_rx);
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerFrame::ParticipantLeft { participants: 1 })));
    }

    #[tokio::test]
    async fn name_uniqueness_holds_through_the_dispatch_path() {
        let dir = std::env::temp_dir().join(format!("walkie-relay-test-{}", Uuid::new_v4()));
        let private_path = dir.join("private.pem");
        let public_path = dir.join("public.pem");

        let mut config = test_config(true);
        config.auth.jwt_private_key_path = Some(private_path.to_string_lossy().to_string());
        config.auth.jwt_public_key_path = public_path.to_string_lossy().to_string();
        auth::ensure_keypair(&config.auth).expect("keypair generation requires a local openssl binary");

        let token_a = auth::create_token(&config.auth, Uuid::new_v4(), "dup").unwrap();
        let token_b = auth::create_token(&config.auth, Uuid::new_v4(), "dup").unwrap();

        let state = RelayState::new(test_db_pool(), config);
        let (conn_a, mut rx_a) = register(&state);
        let (conn_b, mut rx_b) = register(&state);

        let phase_a = dispatch(&state, conn_a, Phase::Unnamed, ClientFrame::Authenticate { token: token_a }).await;
        assert!(matches!(phase_a, Phase::Named));
        assert!(drain(&mut rx_a).iter().any(|f| matches!(f, ServerFrame::Authenticated { .. })));

        let phase_b = dispatch(&state, conn_b, Phase::Unnamed, ClientFrame::Authenticate { token: token_b }).await;
        assert!(matches!(phase_b, Phase::Unnamed));
        let frames_b = drain(&mut rx_b);
        assert_eq!(
            frames_b.iter().find_map(error_message),
            Some(ProtocolError::NameTaken.to_string().as_str())
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
