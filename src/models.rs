use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ─── Identity ───────────────────────────────────────────────────────────────

/// The name under which a connection acts in the protocol (§3 Identity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Unnamed,
    Authenticated { user_id: Uuid, screen_name: String },
    Anonymous { screen_name: String },
}

impl Identity {
    pub fn screen_name(&self) -> Option<&str> {
        match self {
            Identity::Unnamed => None,
            Identity::Authenticated { screen_name, .. } => Some(screen_name),
            Identity::Anonymous { screen_name } => Some(screen_name),
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Identity::Authenticated { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }
}

// ─── Accounts ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPublic {
    pub id: Uuid,
    pub username: String,
}

impl From<User> for UserPublic {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub refresh_token: String,
    pub user: UserPublic,
}

/// A passkey credential row. Persisted verbatim by the `Store`; the
/// cryptographic verification of an assertion is external to this core (§1/§9).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebauthnCredential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub credential_id: String,
    pub public_key: Vec<u8>,
    pub counter: i64,
    pub aaguid: Option<String>,
    pub transports: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub ip: Option<String>,
    pub ua: Option<String>,
    pub revoked: bool,
}

// ─── History ────────────────────────────────────────────────────────────────

/// A persisted, completed transmission (§3 Message / history row).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub channel: String,
    pub client_id: String,
    pub user_id: Option<Uuid>,
    pub screen_name: String,
    pub audio_data: String,
    pub sample_rate: i32,
    pub codec: String,
    pub bitrate: Option<i32>,
    pub duration_ms: i64,
    pub timestamp_ms: i64,
}

// ─── Welcome messages ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WelcomeTrigger {
    Connect,
    ChannelJoin,
    Both,
}

impl WelcomeTrigger {
    pub fn from_db(s: &str) -> Self {
        match s {
            "connect" => WelcomeTrigger::Connect,
            "channel_join" => WelcomeTrigger::ChannelJoin,
            _ => WelcomeTrigger::Both,
        }
    }

    pub fn matches_connect(&self) -> bool {
        matches!(self, WelcomeTrigger::Connect | WelcomeTrigger::Both)
    }

    pub fn matches_channel_join(&self) -> bool {
        matches!(self, WelcomeTrigger::ChannelJoin | WelcomeTrigger::Both)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WelcomeMessage {
    pub id: Uuid,
    pub name: String,
    pub audio_file: String,
    pub trigger_type: String,
    pub channel: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_played_at: Option<DateTime<Utc>>,
    pub play_count: i64,
}
