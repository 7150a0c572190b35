//! Raw session events and the decoded message payload.
//!
//! The session hands over the provider's message object as loose JSON. It is
//! decoded exactly once into [`MessageContent`], a closed enum with an explicit
//! `Unknown` arm, and everything downstream matches on that.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::ContentKind;

/// Wrapper payloads whose inner `message` carries the real content.
const WRAPPER_KEYS: &[&str] = &[
    "ephemeralMessage",
    "viewOnceMessage",
    "viewOnceMessageV2",
    "viewOnceMessageV2Extension",
    "documentWithCaptionMessage",
];

/// Keys that ride along with real content and say nothing about it.
const CONTEXT_KEYS: &[&str] = &["messageContextInfo"];

/// Bounded unwrapping depth; wrappers never nest deeper in practice.
const MAX_WRAPPER_DEPTH: usize = 4;

/// A message event as delivered by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Provider message id
    pub id: String,
    /// Chat the message belongs to: the contact for 1:1 chats
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    /// Display name of the sender as set on their device
    #[serde(default)]
    pub push_name: Option<String>,
    /// Unix seconds
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Sender inside a group chat
    #[serde(default)]
    pub participant: Option<String>,
    /// Phone JID the session paired with an opaque `remote_jid`, when known
    #[serde(default)]
    pub remote_jid_alt: Option<String>,
    /// `"lid"` when the session addressed this chat by opaque id
    #[serde(default)]
    pub addressing_mode: Option<String>,
    /// Decrypted provider payload; absent when decryption failed
    #[serde(default)]
    pub message: Option<Value>,
}

impl RawEvent {
    /// True if the session explicitly flagged the contact id as opaque.
    pub fn opaque_hint(&self) -> bool {
        self.addressing_mode.as_deref() == Some("lid")
    }

    /// True if there is no payload to work with.
    pub fn is_undecryptable(&self) -> bool {
        match &self.message {
            None | Some(Value::Null) => true,
            Some(Value::Object(map)) => map.is_empty(),
            Some(_) => false,
        }
    }
}

/// Decoded message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Image {
        caption: Option<String>,
        mimetype: Option<String>,
        url: Option<String>,
    },
    Document {
        file_name: Option<String>,
        caption: Option<String>,
        mimetype: Option<String>,
        url: Option<String>,
    },
    Audio {
        voice_note: bool,
        seconds: Option<u64>,
        mimetype: Option<String>,
        url: Option<String>,
    },
    Video {
        caption: Option<String>,
        mimetype: Option<String>,
        url: Option<String>,
    },
    Sticker {
        url: Option<String>,
    },
    Contact {
        display_name: Option<String>,
        vcard: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    /// Emoji reaction to another message
    Reaction,
    /// Protocol housekeeping: revokes, key distribution, history sync
    Protocol,
    /// Nothing recognizable; keeps the payload keys for the log
    Unknown { keys: Vec<String> },
}

fn str_at(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn f64_at(v: &Value, key: &str) -> f64 {
    v.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Strip wrapper payloads until the real content is reached.
fn unwrap_payload(mut payload: &Value) -> &Value {
    for _ in 0..MAX_WRAPPER_DEPTH {
        let inner = WRAPPER_KEYS
            .iter()
            .find_map(|k| payload.get(*k).and_then(|w| w.get("message")));
        match inner {
            Some(next) => payload = next,
            None => break,
        }
    }
    payload
}

impl MessageContent {
    /// Decode a provider payload. Fields are checked in priority order; the
    /// first match wins.
    pub fn decode(payload: &Value) -> MessageContent {
        let p = unwrap_payload(payload);

        if let Some(text) = str_at(p, "conversation") {
            return MessageContent::Text(text);
        }
        if let Some(ext) = p.get("extendedTextMessage") {
            if let Some(text) = str_at(ext, "text") {
                return MessageContent::Text(text);
            }
        }
        if let Some(img) = p.get("imageMessage") {
            return MessageContent::Image {
                caption: str_at(img, "caption"),
                mimetype: str_at(img, "mimetype"),
                url: str_at(img, "url"),
            };
        }
        if let Some(doc) = p.get("documentMessage") {
            return MessageContent::Document {
                file_name: str_at(doc, "fileName").or_else(|| str_at(doc, "title")),
                caption: str_at(doc, "caption"),
                mimetype: str_at(doc, "mimetype"),
                url: str_at(doc, "url"),
            };
        }
        if let Some(audio) = p.get("audioMessage") {
            return MessageContent::Audio {
                voice_note: audio.get("ptt").and_then(Value::as_bool).unwrap_or(false),
                seconds: audio.get("seconds").and_then(Value::as_u64),
                mimetype: str_at(audio, "mimetype"),
                url: str_at(audio, "url"),
            };
        }
        if let Some(video) = p.get("videoMessage") {
            return MessageContent::Video {
                caption: str_at(video, "caption"),
                mimetype: str_at(video, "mimetype"),
                url: str_at(video, "url"),
            };
        }
        if let Some(sticker) = p.get("stickerMessage") {
            return MessageContent::Sticker {
                url: str_at(sticker, "url"),
            };
        }
        if let Some(contact) = p.get("contactMessage") {
            return MessageContent::Contact {
                display_name: str_at(contact, "displayName"),
                vcard: str_at(contact, "vcard"),
            };
        }
        if let Some(loc) = p
            .get("locationMessage")
            .or_else(|| p.get("liveLocationMessage"))
        {
            return MessageContent::Location {
                latitude: f64_at(loc, "degreesLatitude"),
                longitude: f64_at(loc, "degreesLongitude"),
                name: str_at(loc, "name"),
                address: str_at(loc, "address"),
            };
        }
        if p.get("reactionMessage").is_some() {
            return MessageContent::Reaction;
        }
        if p.get("protocolMessage").is_some()
            || p.get("senderKeyDistributionMessage").is_some()
        {
            return MessageContent::Protocol;
        }

        let keys: Vec<String> = match p.as_object() {
            Some(map) => map
                .keys()
                .filter(|k| !CONTEXT_KEYS.contains(&k.as_str()))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        MessageContent::Unknown { keys }
    }

    /// Events that carry no user-visible message.
    pub fn is_noise(&self) -> bool {
        matches!(self, MessageContent::Reaction | MessageContent::Protocol)
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            MessageContent::Text(_) => ContentKind::Text,
            MessageContent::Image { .. } => ContentKind::Image,
            MessageContent::Document { .. } => ContentKind::Document,
            MessageContent::Audio { .. } => ContentKind::Audio,
            MessageContent::Video { .. } => ContentKind::Video,
            MessageContent::Sticker { .. } => ContentKind::Sticker,
            MessageContent::Contact { .. } => ContentKind::Contact,
            MessageContent::Location { .. } => ContentKind::Location,
            MessageContent::Reaction | MessageContent::Protocol | MessageContent::Unknown { .. } => {
                ContentKind::Unknown
            }
        }
    }

    /// Text written to the message record and the CRM conversation.
    pub fn body(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Image { caption, .. } => {
                caption.clone().unwrap_or_else(|| "[Image]".to_string())
            }
            MessageContent::Document {
                file_name, caption, ..
            } => match (caption, file_name) {
                (Some(c), _) => c.clone(),
                (None, Some(name)) => format!("[Document: {}]", name),
                (None, None) => "[Document]".to_string(),
            },
            MessageContent::Audio { voice_note, .. } => {
                if *voice_note {
                    "[Voice message]".to_string()
                } else {
                    "[Audio]".to_string()
                }
            }
            MessageContent::Video { caption, .. } => {
                caption.clone().unwrap_or_else(|| "[Video]".to_string())
            }
            MessageContent::Sticker { .. } => "[Sticker]".to_string(),
            MessageContent::Contact { display_name, .. } => match display_name {
                Some(name) => format!("[Contact: {}]", name),
                None => "[Contact]".to_string(),
            },
            MessageContent::Location {
                latitude,
                longitude,
                name,
                ..
            } => match name {
                Some(n) => format!("[Location: {} ({}, {})]", n, latitude, longitude),
                None => format!("[Location: {}, {}]", latitude, longitude),
            },
            MessageContent::Reaction => "[Reaction]".to_string(),
            MessageContent::Protocol => "[Protocol]".to_string(),
            MessageContent::Unknown { .. } => "[Unsupported message]".to_string(),
        }
    }

    /// Remote media reference, for kinds that have one.
    pub fn media_url(&self) -> Option<&str> {
        match self {
            MessageContent::Image { url, .. }
            | MessageContent::Document { url, .. }
            | MessageContent::Audio { url, .. }
            | MessageContent::Video { url, .. }
            | MessageContent::Sticker { url } => url.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_conversation() {
        let c = MessageContent::decode(&json!({"conversation": "ciao"}));
        assert_eq!(c, MessageContent::Text("ciao".into()));
        assert_eq!(c.kind(), ContentKind::Text);
    }

    #[test]
    fn test_decode_extended_text() {
        let c = MessageContent::decode(&json!({
            "extendedTextMessage": {"text": "see https://example.com"}
        }));
        assert_eq!(c.body(), "see https://example.com");
    }

    #[test]
    fn test_conversation_wins_over_media() {
        let c = MessageContent::decode(&json!({
            "conversation": "caption-ish",
            "imageMessage": {"caption": "ignored"}
        }));
        assert_eq!(c, MessageContent::Text("caption-ish".into()));
    }

    #[test]
    fn test_decode_image_with_and_without_caption() {
        let c = MessageContent::decode(&json!({
            "imageMessage": {"caption": "menu", "mimetype": "image/jpeg", "url": "https://mmg/x"}
        }));
        assert_eq!(c.kind(), ContentKind::Image);
        assert_eq!(c.body(), "menu");
        assert_eq!(c.media_url(), Some("https://mmg/x"));

        let bare = MessageContent::decode(&json!({"imageMessage": {}}));
        assert_eq!(bare.body(), "[Image]");
    }

    #[test]
    fn test_decode_document_with_caption_wrapper() {
        let c = MessageContent::decode(&json!({
            "documentWithCaptionMessage": {
                "message": {
                    "documentMessage": {"fileName": "quote.pdf", "caption": "the quote"}
                }
            }
        }));
        match &c {
            MessageContent::Document {
                file_name, caption, ..
            } => {
                assert_eq!(file_name.as_deref(), Some("quote.pdf"));
                assert_eq!(caption.as_deref(), Some("the quote"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_nested_wrappers() {
        let c = MessageContent::decode(&json!({
            "ephemeralMessage": {"message": {
                "viewOnceMessageV2": {"message": {"videoMessage": {"caption": "once"}}}
            }}
        }));
        assert_eq!(c.kind(), ContentKind::Video);
        assert_eq!(c.body(), "once");
    }

    #[test]
    fn test_decode_audio_voice_note() {
        let c = MessageContent::decode(&json!({"audioMessage": {"ptt": true, "seconds": 7}}));
        assert_eq!(c.body(), "[Voice message]");
        assert!(c.kind().is_media());
    }

    #[test]
    fn test_decode_location_and_contact() {
        let loc = MessageContent::decode(&json!({
            "locationMessage": {"degreesLatitude": 45.46, "degreesLongitude": 9.19, "name": "Duomo"}
        }));
        assert_eq!(loc.kind(), ContentKind::Location);
        assert!(loc.body().starts_with("[Location: Duomo"));

        let contact = MessageContent::decode(&json!({
            "contactMessage": {"displayName": "Luca", "vcard": "BEGIN:VCARD"}
        }));
        assert_eq!(contact.body(), "[Contact: Luca]");
    }

    #[test]
    fn test_noise_payloads() {
        assert!(MessageContent::decode(&json!({"reactionMessage": {"text": "👍"}})).is_noise());
        assert!(MessageContent::decode(&json!({"protocolMessage": {"type": 0}})).is_noise());
        assert!(MessageContent::decode(&json!({
            "senderKeyDistributionMessage": {"groupId": "x"},
            "messageContextInfo": {}
        }))
        .is_noise());
    }

    #[test]
    fn test_unknown_keeps_keys() {
        let c = MessageContent::decode(&json!({
            "pollCreationMessageV3": {"name": "lunch?"},
            "messageContextInfo": {}
        }));
        assert_eq!(
            c,
            MessageContent::Unknown {
                keys: vec!["pollCreationMessageV3".into()]
            }
        );
        assert_eq!(c.body(), "[Unsupported message]");
        assert!(!c.is_noise());
    }

    #[test]
    fn test_raw_event_serde_and_flags() {
        let ev: RawEvent = serde_json::from_value(json!({
            "id": "wamid.1",
            "remoteJid": "250830569660605@lid",
            "fromMe": false,
            "pushName": "Giulia",
            "remoteJidAlt": "393806510543@s.whatsapp.net",
            "addressingMode": "lid",
            "message": {"conversation": "hi"}
        }))
        .unwrap();
        assert!(ev.opaque_hint());
        assert!(!ev.is_undecryptable());
        assert_eq!(ev.remote_jid_alt.as_deref(), Some("393806510543@s.whatsapp.net"));

        let empty: RawEvent = serde_json::from_value(json!({
            "id": "wamid.2", "remoteJid": "393806510543@s.whatsapp.net", "message": {}
        }))
        .unwrap();
        assert!(empty.is_undecryptable());
    }
}
