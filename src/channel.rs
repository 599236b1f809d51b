use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::error::ProtocolError;
use crate::identity::ConnectionId;

/// A channel name is a bare decimal string between "1" and "999", with no
/// leading zeros (§4.2 — `"007"` is not the same channel id as `"7"`).
pub fn validate_channel_id(channel: &str) -> Result<(), ProtocolError> {
    if channel.is_empty() || !channel.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidChannel);
    }
    if channel.len() > 1 && channel.starts_with('0') {
        return Err(ProtocolError::InvalidChannel);
    }
    match channel.parse::<u32>() {
        Ok(n) if (1..=999).contains(&n) => Ok(()),
        _ => Err(ProtocolError::InvalidChannel),
    }
}

/// Tracks channel membership. Channels are created on first attach and
/// dropped on last detach — there is no standing set of "known" channels
/// (§4.2, §Glossary).
pub struct ChannelRegistry {
    channels: DashMap<String, RwLock<HashSet<ConnectionId>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub async fn attach(&self, channel: &str, conn_id: ConnectionId) {
        let members = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| RwLock::new(HashSet::new()));
        members.write().await.insert(conn_id);
    }

    /// Detach a connection from a channel, destroying the channel if that
    /// was its last member.
    pub async fn detach(&self, channel: &str, conn_id: ConnectionId) {
        let is_empty = if let Some(members) = self.channels.get(channel) {
            let mut guard = members.write().await;
            guard.remove(&conn_id);
            guard.is_empty()
        } else {
            return;
        };

        if is_empty {
            self.channels.remove_if(channel, |_, members| {
                // Re-check under the map's own lock to avoid racing a
                // concurrent attach that slipped in after we dropped `guard`.
                members.try_read().map(|g| g.is_empty()).unwrap_or(false)
            });
        }
    }

    /// Detach a connection from every channel it belongs to. Used on
    /// disconnect, where the connection's current channel is already known
    /// to the caller but this guards against any bookkeeping drift.
    pub async fn detach_all(&self, conn_id: ConnectionId) {
        let channel_names: Vec<String> = self
            .channels
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for channel in channel_names {
            self.detach(&channel, conn_id).await;
        }
    }

    pub async fn members(&self, channel: &str) -> Vec<ConnectionId> {
        match self.channels.get(channel) {
            Some(members) => members.read().await.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    pub async fn member_count(&self, channel: &str) -> usize {
        match self.channels.get(channel) {
            Some(members) => members.read().await.len(),
            None => 0,
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn rejects_non_numeric_and_out_of_range() {
        assert!(validate_channel_id("abc").is_err());
        assert!(validate_channel_id("0").is_err());
        assert!(validate_channel_id("1000").is_err());
        assert!(validate_channel_id("-1").is_err());
        assert!(validate_channel_id("").is_err());
    }

    #[test]
    fn accepts_the_full_inclusive_range() {
        assert!(validate_channel_id("1").is_ok());
        assert!(validate_channel_id("999").is_ok());
        assert!(validate_channel_id("42").is_ok());
    }

    #[test]
    fn rejects_leading_zeros() {
        assert!(validate_channel_id("007").is_err());
        assert!(validate_channel_id("01").is_err());
        assert!(validate_channel_id("0").is_err());
    }

    #[tokio::test]
    async fn attach_and_detach_tracks_membership() {
        let registry = ChannelRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        registry.attach("7", a).await;
        registry.attach("7", b).await;
        assert_eq!(registry.member_count("7").await, 2);

        registry.detach("7", a).await;
        let members = registry.members("7").await;
        assert_eq!(members, vec![b]);
    }

    #[tokio::test]
    async fn last_detach_destroys_the_channel() {
        let registry = ChannelRegistry::new();
        let a = Uuid::new_v4();

        registry.attach("3", a).await;
        registry.detach("3", a).await;

        assert_eq!(registry.member_count("3").await, 0);
        assert!(!registry.channels.contains_key("3"));
    }
}
