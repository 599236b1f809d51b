use std::time::Duration;

use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::db::{messages, DbPool};
use crate::error::ProtocolError;
use crate::models::Message;

/// Retries a transient store failure exactly once, ~100ms later, before
/// surfacing `InternalStoreError` (§9.1 open-question decision).
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bounded, rolling per-channel transmission history (§4.5).
///
/// Every write is a single transaction: insert the new row, then prune
/// anything older than `max_age_secs` or beyond the newest `max_count`
/// rows for that channel. A reader never observes a channel that is
/// momentarily over-bound.
pub struct HistoryRetention {
    pool: DbPool,
    max_count_per_channel: i64,
    max_age_secs: i64,
}

impl HistoryRetention {
    pub fn new(pool: DbPool, config: &HistoryConfig) -> Self {
        Self {
            pool,
            max_count_per_channel: config.max_count_per_channel,
            max_age_secs: config.max_age_secs,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
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
    ) -> Result<Message, ProtocolError> {
        match self
            .try_record(
                channel,
                client_id,
                user_id,
                screen_name,
                audio_data,
                sample_rate,
                codec,
                bitrate,
                duration_ms,
                timestamp_ms,
            )
            .await
        {
            Ok(row) => Ok(row),
            Err(err) => {
                tracing::warn!(%channel, error = %err, "history write failed, retrying once");
                tokio::time::sleep(RETRY_DELAY).await;
                self.try_record(
                    channel,
                    client_id,
                    user_id,
                    screen_name,
                    audio_data,
                    sample_rate,
                    codec,
                    bitrate,
                    duration_ms,
                    timestamp_ms,
                )
                .await
                .map_err(|err| {
                    tracing::error!(%channel, error = %err, "history write failed after retry");
                    ProtocolError::InternalStoreError
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_record(
        &self,
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
    ) -> anyhow::Result<Message> {
        let mut tx = self.pool.begin().await?;

        let row = messages::insert(
            &mut tx,
            channel,
            client_id,
            user_id,
            screen_name,
            audio_data,
            sample_rate,
            codec,
            bitrate,
            duration_ms,
            timestamp_ms,
        )
        .await?;

        let min_timestamp_ms = timestamp_ms - self.max_age_secs * 1000;
        messages::prune(&mut tx, channel, min_timestamp_ms, self.max_count_per_channel).await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Fetch the channel's retained history, oldest first, as of `now_ms`.
    pub async fn fetch(&self, channel: &str, now_ms: i64) -> Result<Vec<Message>, ProtocolError> {
        let min_timestamp_ms = now_ms - self.max_age_secs * 1000;
        match self
            .try_fetch(channel, min_timestamp_ms, self.max_count_per_channel)
            .await
        {
            Ok(rows) => Ok(rows),
            Err(err) => {
                tracing::warn!(%channel, error = %err, "history read failed, retrying once");
                tokio::time::sleep(RETRY_DELAY).await;
                self.try_fetch(channel, min_timestamp_ms, self.max_count_per_channel)
                    .await
                    .map_err(|err| {
                        tracing::error!(%channel, error = %err, "history read failed after retry");
                        ProtocolError::InternalStoreError
                    })
            }
        }
    }

    async fn try_fetch(
        &self,
        channel: &str,
        min_timestamp_ms: i64,
        max_count: i64,
    ) -> anyhow::Result<Vec<Message>> {
        let rows = messages::fetch_for_channel(&self.pool, channel, min_timestamp_ms, max_count).await?;
        Ok(rows)
    }
}
