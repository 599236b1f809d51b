use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use uuid::Uuid;

use crate::db::{welcome, DbPool};
use crate::models::{WelcomeMessage, WelcomeTrigger};
use crate::protocol::ServerFrame;

/// The moment a WelcomeHook is invoked from (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WelcomeOccasion {
    Connect,
    ChannelJoin,
}

/// Synthetic, server-originated audio playback triggered on `connect` and
/// `channel_join` (§4.6). Disabled entirely when `relay.welcome_enabled` is
/// false.
pub struct WelcomeHook {
    pool: DbPool,
    enabled: bool,
}

impl WelcomeHook {
    pub fn new(pool: DbPool, enabled: bool) -> Self {
        Self { pool, enabled }
    }

    /// Build the synthetic frame sequence for every enabled welcome message
    /// matching `occasion` and `channel`, recording a play against each.
    /// Returns frames in playback order — `audio_start`, one `audio` chunk,
    /// `audio_end` per message.
    pub async fn play(
        &self,
        occasion: WelcomeOccasion,
        channel: Option<&str>,
        client_id_prefix: &str,
    ) -> Vec<ServerFrame> {
        if !self.enabled {
            return Vec::new();
        }

        let candidates = match welcome::list_enabled(&self.pool).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load welcome messages");
                return Vec::new();
            }
        };

        let mut frames = Vec::new();
        for (idx, row) in candidates
            .into_iter()
            .filter(|row| Self::matches(row, occasion, channel))
            .enumerate()
        {
            if let Some(sequence) = self.render(&row, channel, client_id_prefix, idx).await {
                frames.extend(sequence);
                if let Err(err) = welcome::record_play(&self.pool, row.id).await {
                    tracing::warn!(error = %err, welcome_id = %row.id, "failed to record welcome play");
                }
            }
        }
        frames
    }

    fn matches(row: &WelcomeMessage, occasion: WelcomeOccasion, channel: Option<&str>) -> bool {
        let trigger = WelcomeTrigger::from_db(&row.trigger_type);
        let trigger_matches = match occasion {
            WelcomeOccasion::Connect => trigger.matches_connect(),
            WelcomeOccasion::ChannelJoin => trigger.matches_channel_join(),
        };
        if !trigger_matches {
            return false;
        }

        match (&row.channel, channel) {
            (None, _) => true,
            (Some(pinned), Some(current)) => pinned == current,
            (Some(_), None) => false,
        }
    }

    async fn render(
        &self,
        row: &WelcomeMessage,
        channel: Option<&str>,
        client_id_prefix: &str,
        idx: usize,
    ) -> Option<Vec<ServerFrame>> {
        let bytes = match tokio::fs::read(&row.audio_file).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, file = %row.audio_file, "failed to read welcome audio file");
                return None;
            }
        };

        let channel = channel.unwrap_or("0").to_string();
        let screen_name = "Server".to_string();
        let client_id = format!("{client_id_prefix}-welcome-{idx}");

        Some(vec![
            ServerFrame::AudioStart {
                channel: channel.clone(),
                screen_name: screen_name.clone(),
                client_id: client_id.clone(),
                is_welcome: true,
            },
            ServerFrame::Audio {
                channel: channel.clone(),
                screen_name: screen_name.clone(),
                client_id: client_id.clone(),
                data: BASE64.encode(&bytes),
                is_welcome: true,
            },
            ServerFrame::AudioEnd {
                channel,
                screen_name,
                client_id,
                is_welcome: true,
            },
        ])
    }
}

/// A connection-scoped prefix for synthetic welcome `client_id`s, so two
/// concurrent playbacks never collide.
pub fn welcome_client_prefix(conn_id: Uuid) -> String {
    conn_id.simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(trigger: &str, channel: Option<&str>) -> WelcomeMessage {
        WelcomeMessage {
            id: Uuid::new_v4(),
            name: "greeting".to_string(),
            audio_file: "greeting.raw".to_string(),
            trigger_type: trigger.to_string(),
            channel: channel.map(str::to_string),
            enabled: true,
            created_at: Utc::now(),
            last_played_at: None,
            play_count: 0,
        }
    }

    #[test]
    fn global_message_matches_any_channel() {
        let row = row("both", None);
        assert!(WelcomeHook::matches(&row, WelcomeOccasion::Connect, Some("7")));
        assert!(WelcomeHook::matches(&row, WelcomeOccasion::Connect, None));
    }

    #[test]
    fn pinned_message_requires_matching_channel() {
        let row = row("channel_join", Some("7"));
        assert!(WelcomeHook::matches(&row, WelcomeOccasion::ChannelJoin, Some("7")));
        assert!(!WelcomeHook::matches(&row, WelcomeOccasion::ChannelJoin, Some("8")));
        assert!(!WelcomeHook::matches(&row, WelcomeOccasion::ChannelJoin, None));
    }

    #[test]
    fn connect_only_trigger_does_not_fire_on_channel_join() {
        let row = row("connect", None);
        assert!(WelcomeHook::matches(&row, WelcomeOccasion::Connect, None));
        assert!(!WelcomeHook::matches(&row, WelcomeOccasion::ChannelJoin, Some("7")));
    }
}
