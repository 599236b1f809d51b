use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::identity::ConnectionId;
use crate::protocol::DeclaredCodec;

/// An in-progress push-to-talk transmission, accumulating chunks between
/// `push_to_talk_start` and `push_to_talk_end` (§4.4).
struct PendingTransmission {
    channel: String,
    client_id: String,
    user_id: Option<Uuid>,
    screen_name: String,
    sample_rate: i32,
    /// Normalized pcm16/opus classification, used for duration math and
    /// persistence — never re-serialized onto the wire.
    codec: String,
    /// Whichever of `codec`/`format` the sender actually used, relayed
    /// unchanged on every chunk (§9.1).
    declared: DeclaredCodec,
    bitrate: Option<i32>,
    chunks: Vec<Vec<u8>>,
    declared_duration_ms: i64,
}

/// The result of finalizing a transmission: a single base64 blob
/// reconstructed from every chunk the sender pushed, ready to persist and
/// fan out (§4.4, §4.5).
pub struct FinalizedTransmission {
    pub channel: String,
    pub client_id: String,
    pub user_id: Option<Uuid>,
    pub screen_name: String,
    pub audio_data: String,
    pub sample_rate: i32,
    pub codec: String,
    pub bitrate: Option<i32>,
    pub duration_ms: i64,
}

/// Tracks one pending transmission per connection. A connection can only
/// ever be mid-transmission on the one channel it is currently attached to,
/// so the connection id alone is a sufficient key.
pub struct TransmissionBuffer {
    pending: DashMap<ConnectionId, PendingTransmission>,
}

impl TransmissionBuffer {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        conn_id: ConnectionId,
        channel: String,
        client_id: String,
        user_id: Option<Uuid>,
        screen_name: String,
        sample_rate: i32,
        codec: String,
        declared: DeclaredCodec,
        bitrate: Option<i32>,
    ) {
        self.pending.insert(
            conn_id,
            PendingTransmission {
                channel,
                client_id,
                user_id,
                screen_name,
                sample_rate,
                codec,
                declared,
                bitrate,
                chunks: Vec::new(),
                declared_duration_ms: 0,
            },
        );
    }

    pub fn is_active(&self, conn_id: ConnectionId) -> bool {
        self.pending.contains_key(&conn_id)
    }

    /// Sample rate, declared codec/format field, and bitrate established for
    /// the connection's current transmission, used to tag relayed chunks
    /// consistently.
    pub fn params(&self, conn_id: ConnectionId) -> Option<(i32, DeclaredCodec, Option<i32>)> {
        self.pending
            .get(&conn_id)
            .map(|p| (p.sample_rate, p.declared.clone(), p.bitrate))
    }

    /// Decode an incoming base64 chunk and append its raw bytes. `chunk_duration_ms`
    /// is the sender's declared duration for this chunk, used for opus (whose
    /// frame size isn't derivable from byte count alone).
    pub fn push_chunk(
        &self,
        conn_id: ConnectionId,
        data: &str,
        chunk_duration_ms: Option<i64>,
    ) -> Result<(), ProtocolError> {
        let bytes = BASE64
            .decode(data)
            .map_err(|_| ProtocolError::InternalStoreError)?;

        let mut pending = self
            .pending
            .get_mut(&conn_id)
            .ok_or(ProtocolError::NotInChannel)?;
        pending.chunks.push(bytes);
        pending.declared_duration_ms += chunk_duration_ms.unwrap_or(0);
        Ok(())
    }

    /// Consume the pending transmission, reconstructing one contiguous
    /// base64 blob from its chunks (§4.4 — decode each chunk, concatenate
    /// raw bytes, re-encode once; never concatenate base64 text directly).
    pub fn finalize(&self, conn_id: ConnectionId) -> Option<FinalizedTransmission> {
        let (_, pending) = self.pending.remove(&conn_id)?;

        let mut raw = Vec::with_capacity(pending.chunks.iter().map(Vec::len).sum());
        for chunk in &pending.chunks {
            raw.extend_from_slice(chunk);
        }

        let duration_ms = if pending.codec == "opus" {
            pending.declared_duration_ms
        } else {
            // pcm16: 2 bytes per sample, mono.
            ((raw.len() / 2) as i64 * 1000) / pending.sample_rate.max(1) as i64
        };

        Some(FinalizedTransmission {
            channel: pending.channel,
            client_id: pending.client_id,
            user_id: pending.user_id,
            screen_name: pending.screen_name,
            audio_data: BASE64.encode(&raw),
            sample_rate: pending.sample_rate,
            codec: pending.codec,
            bitrate: pending.bitrate,
            duration_ms,
        })
    }

    /// Discard a pending transmission without finalizing it (disconnect
    /// mid-transmission).
    pub fn discard(&self, conn_id: ConnectionId) {
        self.pending.remove(&conn_id);
    }
}

impl Default for TransmissionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstructs_across_non_aligned_chunk_boundaries() {
        let buffer = TransmissionBuffer::new();
        let conn = Uuid::new_v4();

        // 5 raw bytes split 2/3 — neither chunk is a multiple of 3 bytes,
        // so naively concatenating the base64 text would corrupt the tail.
        let raw: Vec<u8> = vec![1, 2, 3, 4, 5];
        let chunk_a = BASE64.encode(&raw[..2]);
        let chunk_b = BASE64.encode(&raw[2..]);

        buffer.start(
            conn,
            "7".to_string(),
            "client-1".to_string(),
            None,
            "Echo".to_string(),
            16000,
            "pcm16".to_string(),
            DeclaredCodec::Codec {
                codec: "pcm16".to_string(),
            },
            None,
        );
        buffer.push_chunk(conn, &chunk_a, None).unwrap();
        buffer.push_chunk(conn, &chunk_b, None).unwrap();

        let finalized = buffer.finalize(conn).unwrap();
        let decoded = BASE64.decode(&finalized.audio_data).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn pcm16_duration_derives_from_byte_count_and_sample_rate() {
        let buffer = TransmissionBuffer::new();
        let conn = Uuid::new_v4();

        // 16000 Hz mono pcm16: one second == 32000 bytes.
        let raw = vec![0u8; 32000];
        let chunk = BASE64.encode(&raw);

        buffer.start(
            conn,
            "7".to_string(),
            "client-1".to_string(),
            None,
            "Echo".to_string(),
            16000,
            "pcm16".to_string(),
            DeclaredCodec::Codec {
                codec: "pcm16".to_string(),
            },
            None,
        );
        buffer.push_chunk(conn, &chunk, None).unwrap();

        let finalized = buffer.finalize(conn).unwrap();
        assert_eq!(finalized.duration_ms, 1000);
    }

    #[test]
    fn opus_duration_sums_declared_chunk_durations() {
        let buffer = TransmissionBuffer::new();
        let conn = Uuid::new_v4();

        buffer.start(
            conn,
            "7".to_string(),
            "client-1".to_string(),
            None,
            "Echo".to_string(),
            48000,
            "opus".to_string(),
            DeclaredCodec::Format {
                format: "opus".to_string(),
            },
            Some(64000),
        );
        buffer.push_chunk(conn, &BASE64.encode([0u8; 10]), Some(20)).unwrap();
        buffer.push_chunk(conn, &BASE64.encode([0u8; 10]), Some(20)).unwrap();

        let finalized = buffer.finalize(conn).unwrap();
        assert_eq!(finalized.duration_ms, 40);
    }

    #[test]
    fn params_returns_the_declared_field_the_sender_used() {
        let buffer = TransmissionBuffer::new();
        let conn = Uuid::new_v4();

        buffer.start(
            conn,
            "7".to_string(),
            "client-1".to_string(),
            None,
            "Echo".to_string(),
            48000,
            "opus".to_string(),
            DeclaredCodec::Format {
                format: "opus".to_string(),
            },
            None,
        );

        let (_, declared, _) = buffer.params(conn).unwrap();
        assert!(matches!(declared, DeclaredCodec::Format { format } if format == "opus"));
    }

    #[test]
    fn push_chunk_without_start_is_rejected() {
        let buffer = TransmissionBuffer::new();
        let conn = Uuid::new_v4();
        let result = buffer.push_chunk(conn, &BASE64.encode([0u8; 4]), None);
        assert_eq!(result, Err(ProtocolError::NotInChannel));
    }
}
