use serde::{Deserialize, Serialize};

/// Frames a client may send (§4.1). Tagged at the wire boundary the same way
/// the teacher's gateway events are — one discriminated union, never a family
/// of untagged message types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate {
        token: String,
    },
    SetScreenName {
        screen_name: String,
    },
    JoinChannel {
        channel: String,
    },
    LeaveChannel,
    PushToTalkStart {
        client_id: String,
        sample_rate: i32,
        #[serde(default)]
        codec: Option<String>,
        #[serde(default)]
        format: Option<String>,
        #[serde(default)]
        bitrate: Option<i32>,
    },
    AudioData {
        data: String,
        #[serde(default)]
        duration_ms: Option<i64>,
    },
    PushToTalkEnd,
    HistoryRequest {
        /// Defaults to the connection's current channel when omitted.
        #[serde(default)]
        channel: Option<String>,
    },
    ReloadWelcomeMessages,
}

impl ClientFrame {
    /// Back-compat rule (§6): absent `codec` and `format` both mean `pcm16`;
    /// `codec` wins when both are present. Used only to classify pcm16 vs.
    /// opus for the `TransmissionState`/duration math — never to decide what
    /// key name a relayed frame carries (see `declared_field` for that).
    pub fn declared_codec(codec: &Option<String>, format: &Option<String>) -> String {
        codec
            .as_deref()
            .or(format.as_deref())
            .filter(|c| *c == "opus")
            .map(|_| "opus".to_string())
            .unwrap_or_else(|| "pcm16".to_string())
    }

    /// Which field name (and value) the sender actually used, for relaying
    /// unchanged (§9.1 open-question decision: "an outbound relayed frame
    /// carries through whichever field the sender used"). `codec` wins when
    /// both are present; absent-both defaults to `codec: "pcm16"`.
    pub fn declared_field(codec: &Option<String>, format: &Option<String>) -> DeclaredCodec {
        match (codec, format) {
            (Some(c), _) => DeclaredCodec::Codec { codec: c.clone() },
            (None, Some(f)) => DeclaredCodec::Format { format: f.clone() },
            (None, None) => DeclaredCodec::Codec {
                codec: "pcm16".to_string(),
            },
        }
    }
}

/// The `format`/`codec` field on a wire frame, tracking which key name the
/// sender used so a relayed frame can carry it through unchanged (§9.1).
/// Flattened into `ServerFrame::AudioData` — never its own tagged frame.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DeclaredCodec {
    Codec { codec: String },
    Format { format: String },
}

/// The `user` object nested in an `authenticated` frame.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub username: String,
}

/// Frames the server may send (§4.1/§6). `error` frames never close the
/// connection (§7).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthenticationRequired,
    Authenticated {
        user: AuthenticatedUser,
    },
    ScreenNameSet {
        screen_name: String,
    },
    ChannelJoined {
        channel: String,
        participants: usize,
    },
    ChannelLeft {
        channel: String,
    },
    ParticipantJoined {
        screen_name: String,
        participants: usize,
    },
    ParticipantLeft {
        participants: usize,
    },
    UserSpeaking {
        speaking: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        screen_name: Option<String>,
    },
    AudioData {
        channel: String,
        data: String,
        #[serde(flatten)]
        declared: DeclaredCodec,
        #[serde(rename = "sampleRate")]
        sample_rate: i32,
        channels: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        bitrate: Option<i32>,
    },
    AudioStart {
        channel: String,
        screen_name: String,
        client_id: String,
        is_welcome: bool,
    },
    Audio {
        channel: String,
        screen_name: String,
        client_id: String,
        data: String,
        is_welcome: bool,
    },
    AudioEnd {
        channel: String,
        screen_name: String,
        client_id: String,
        is_welcome: bool,
    },
    HistoryResponse {
        channel: String,
        messages: Vec<HistoryEntry>,
    },
    WelcomeMessagesReloaded {
        count: usize,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<&'static str>,
    },
}

/// One history row as sent over the wire in a `history_response` frame.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub client_id: String,
    pub screen_name: String,
    pub data: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: i32,
    pub codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i32>,
    pub duration_ms: i64,
    pub timestamp_ms: i64,
}

impl From<crate::models::Message> for HistoryEntry {
    fn from(row: crate::models::Message) -> Self {
        Self {
            client_id: row.client_id,
            screen_name: row.screen_name,
            data: row.audio_data,
            sample_rate: row.sample_rate,
            codec: row.codec,
            bitrate: row.bitrate,
            duration_ms: row.duration_ms,
            timestamp_ms: row.timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_tag_round_trips() {
        let json = r#"{"type":"join_channel","channel":"7"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, ClientFrame::JoinChannel { channel } if channel == "7"));
    }

    #[test]
    fn declared_codec_defaults_to_pcm16_when_absent() {
        assert_eq!(ClientFrame::declared_codec(&None, &None), "pcm16");
    }

    #[test]
    fn declared_codec_honors_format_fallback() {
        assert_eq!(
            ClientFrame::declared_codec(&None, &Some("opus".to_string())),
            "opus"
        );
    }

    #[test]
    fn declared_codec_prefers_codec_over_format() {
        assert_eq!(
            ClientFrame::declared_codec(&Some("pcm16".to_string()), &Some("opus".to_string())),
            "pcm16"
        );
    }

    #[test]
    fn error_frame_omits_code_when_absent() {
        let frame = ServerFrame::Error {
            message: "boom".to_string(),
            code: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("code"));
    }

    #[test]
    fn error_frame_includes_code_when_present() {
        let frame = ServerFrame::Error {
            message: "taken".to_string(),
            code: Some("screen_name_taken"),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"code\":\"screen_name_taken\""));
    }

    #[test]
    fn audio_data_frame_uses_camel_case_sample_rate() {
        let frame = ServerFrame::AudioData {
            channel: "7".to_string(),
            data: "AAAA".to_string(),
            declared: DeclaredCodec::Codec {
                codec: "pcm16".to_string(),
            },
            sample_rate: 48000,
            channels: 1,
            bitrate: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"sampleRate\":48000"));
    }

    #[test]
    fn audio_data_frame_carries_through_whichever_field_the_sender_used() {
        let with_format = ServerFrame::AudioData {
            channel: "7".to_string(),
            data: "AAAA".to_string(),
            declared: DeclaredCodec::Format {
                format: "opus".to_string(),
            },
            sample_rate: 48000,
            channels: 1,
            bitrate: None,
        };
        let json = serde_json::to_string(&with_format).unwrap();
        assert!(json.contains("\"format\":\"opus\""));
        assert!(!json.contains("\"codec\""));
    }

    #[test]
    fn declared_field_prefers_codec_over_format() {
        let declared = ClientFrame::declared_field(
            &Some("pcm16".to_string()),
            &Some("opus".to_string()),
        );
        assert!(matches!(declared, DeclaredCodec::Codec { codec } if codec == "pcm16"));
    }

    #[test]
    fn declared_field_falls_back_to_format_when_codec_absent() {
        let declared = ClientFrame::declared_field(&None, &Some("opus".to_string()));
        assert!(matches!(declared, DeclaredCodec::Format { format } if format == "opus"));
    }

    #[test]
    fn declared_field_defaults_to_codec_pcm16_when_both_absent() {
        let declared = ClientFrame::declared_field(&None, &None);
        assert!(matches!(declared, DeclaredCodec::Codec { codec } if codec == "pcm16"));
    }
}
