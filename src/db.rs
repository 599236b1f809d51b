use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Pool, Postgres};

use crate::config::DatabaseConfig;

pub type DbPool = Pool<Postgres>;

/// Initialize the database connection pool.
pub async fn init_pool(config: &DatabaseConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;

    Ok(pool)
}

/// Run embedded SQL migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ─── User / account queries ─────────────────────────────────────────────────

pub mod users {
    use sqlx::PgPool;
    use uuid::Uuid;

    use crate::error::AppResult;
    use crate::models::User;

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(user)
    }

    /// Active accounts only — this is what `IdentityRegistry` consults when
    /// checking whether a screen name is owned by a registered account (§4.3).
    pub async fn find_active_by_username(pool: &PgPool, username: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE LOWER(username) = LOWER($1) AND active",
        )
        .bind(username)
        .fetch_optional(pool)
        .await?;
        Ok(user)
    }

    pub async fn create(
        pool: &PgPool,
        id: Uuid,
        username: &str,
        password_hash: &str,
    ) -> AppResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, username, password_hash, created_at, active)
            VALUES ($1, $2, $3, NOW(), TRUE)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(username)
        .bind(password_hash)
        .fetch_one(pool)
        .await?;
        Ok(user)
    }

    pub async fn update_last_login(pool: &PgPool, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ─── Refresh tokens ──────────────────────────────────────────────────────────

pub mod refresh_tokens {
    use chrono::{DateTime, Utc};
    use sqlx::PgPool;
    use uuid::Uuid;

    use crate::error::AppResult;
    use crate::models::RefreshToken;

    pub async fn create(
        pool: &PgPool,
        id: Uuid,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        ip: Option<&str>,
        ua: Option<&str>,
    ) -> AppResult<RefreshToken> {
        let token = sqlx::query_as::<_, RefreshToken>(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at, ip, ua, revoked)
            VALUES ($1, $2, $3, $4, NOW(), $5, $6, FALSE)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .bind(ip)
        .bind(ua)
        .fetch_one(pool)
        .await?;
        Ok(token)
    }

    pub async fn find_valid_by_hash(pool: &PgPool, token_hash: &str) -> AppResult<Option<RefreshToken>> {
        let token = sqlx::query_as::<_, RefreshToken>(
            "SELECT * FROM refresh_tokens WHERE token_hash = $1 AND NOT revoked AND expires_at > NOW()",
        )
        .bind(token_hash)
        .fetch_optional(pool)
        .await?;
        Ok(token)
    }

    pub async fn revoke(pool: &PgPool, id: Uuid) -> AppResult<()> {
        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

// ─── Webauthn credentials ────────────────────────────────────────────────────

/// Persistence only. Verifying an assertion against a stored credential is
/// explicitly external to this core (§1, §9) — `AccountStore` just stores and
/// retrieves rows handed to it by that collaborator.
pub mod webauthn {
    use sqlx::PgPool;
    use uuid::Uuid;

    use crate::error::AppResult;
    use crate::models::WebauthnCredential;

    pub async fn store_credential(
        pool: &PgPool,
        id: Uuid,
        user_id: Uuid,
        credential_id: &str,
        public_key: &[u8],
        aaguid: Option<&str>,
        nickname: Option<&str>,
    ) -> AppResult<WebauthnCredential> {
        let cred = sqlx::query_as::<_, WebauthnCredential>(
            r#"
            INSERT INTO webauthn_credentials
                (id, user_id, credential_id, public_key, counter, aaguid, nickname, created_at)
            VALUES ($1, $2, $3, $4, 0, $5, $6, NOW())
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(credential_id)
        .bind(public_key)
        .bind(aaguid)
        .bind(nickname)
        .fetch_one(pool)
        .await?;
        Ok(cred)
    }

    pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> AppResult<Vec<WebauthnCredential>> {
        let creds = sqlx::query_as::<_, WebauthnCredential>(
            "SELECT * FROM webauthn_credentials WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(creds)
    }
}

// ─── Message history (raw rows) ─────────────────────────────────────────────
//
// Retention policy (insert + prune atomically, age/count bounds) lives in
// `history.rs`; this module is just the storage-shaped CRUD it composes.

pub mod messages {
    use sqlx::{Postgres, Transaction};
    use uuid::Uuid;

    use crate::error::AppResult;
    use crate::models::Message;

    use sqlx::PgPool;

    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        channel: &str,
        client_id: &str,
        user_id: Option<Uuid>,
        screen_name: &str,
        audio_data: &str,
        sample_rate: i32,
        codec: &str,
        bitrate: Option<i32>,
        duration_ms: i64,
        timestamp_ms: i64,
    ) -> AppResult<Message> {
        let row = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO message_history
                (channel, client_id, user_id, screen_name, audio_data, sample_rate, codec, bitrate, duration_ms, timestamp_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(channel)
        .bind(client_id)
        .bind(user_id)
        .bind(screen_name)
        .bind(audio_data)
        .bind(sample_rate)
        .bind(codec)
        .bind(bitrate)
        .bind(duration_ms)
        .bind(timestamp_ms)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row)
    }

    /// Delete rows too old, or outside the newest `max_count` for the channel.
    pub async fn prune(
        tx: &mut Transaction<'_, Postgres>,
        channel: &str,
        min_timestamp_ms: i64,
        max_count: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            DELETE FROM message_history
            WHERE channel = $1
              AND (
                timestamp_ms < $2
                OR id NOT IN (
                    SELECT id FROM message_history
                    WHERE channel = $1
                    ORDER BY timestamp_ms DESC, id DESC
                    LIMIT $3
                )
              )
            "#,
        )
        .bind(channel)
        .bind(min_timestamp_ms)
        .bind(max_count)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn fetch_for_channel(
        pool: &PgPool,
        channel: &str,
        min_timestamp_ms: i64,
        max_count: i64,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM (
                SELECT * FROM message_history
                WHERE channel = $1 AND timestamp_ms >= $2
                ORDER BY timestamp_ms DESC, id DESC
                LIMIT $3
            ) recent
            ORDER BY timestamp_ms ASC, id ASC
            "#,
        )
        .bind(channel)
        .bind(min_timestamp_ms)
        .bind(max_count)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

// ─── Welcome messages ────────────────────────────────────────────────────────

pub mod welcome {
    use sqlx::PgPool;
    use uuid::Uuid;

    use crate::error::AppResult;
    use crate::models::WelcomeMessage;

    pub async fn list_enabled(pool: &PgPool) -> AppResult<Vec<WelcomeMessage>> {
        let rows = sqlx::query_as::<_, WelcomeMessage>(
            "SELECT * FROM welcome_messages WHERE enabled ORDER BY created_at",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn record_play(pool: &PgPool, id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE welcome_messages SET play_count = play_count + 1, last_played_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

