//! The chat envelope: one closed enum with one payload type per message kind.
//!
//! Envelopes travel adjacently tagged (`{"kind": "text", "payload": {...}}`)
//! both on the wire and in the store, so exactly one payload is present by
//! construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{PREVIEW_TEXT_LIMIT, WITHDRAWN_PREVIEW_PREFIX};
use crate::types::{MessageId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Text(TextMsg),
    Image(ImageMsg),
    Video(VideoMsg),
    File(FileMsg),
    Voice(VoiceMsg),
    Location(LocationMsg),
    Call(CallMsg),
    Withdraw(WithdrawMsg),
    Reply(ReplyMsg),
    Quote(QuoteMsg),
    Mention(MentionMsg),
    Tip(TipMsg),
    FriendOnline(FriendOnlineMsg),
}

/// Discriminant of [`Envelope`], stored alongside each message row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MsgKind {
    Text,
    Image,
    Video,
    File,
    Voice,
    Location,
    Call,
    Withdraw,
    Reply,
    Quote,
    Mention,
    Tip,
    FriendOnline,
}

impl MsgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::Text => "text",
            MsgKind::Image => "image",
            MsgKind::Video => "video",
            MsgKind::File => "file",
            MsgKind::Voice => "voice",
            MsgKind::Location => "location",
            MsgKind::Call => "call",
            MsgKind::Withdraw => "withdraw",
            MsgKind::Reply => "reply",
            MsgKind::Quote => "quote",
            MsgKind::Mention => "mention",
            MsgKind::Tip => "tip",
            MsgKind::FriendOnline => "friend_online",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s {
            "text" => MsgKind::Text,
            "image" => MsgKind::Image,
            "video" => MsgKind::Video,
            "file" => MsgKind::File,
            "voice" => MsgKind::Voice,
            "location" => MsgKind::Location,
            "call" => MsgKind::Call,
            "withdraw" => MsgKind::Withdraw,
            "reply" => MsgKind::Reply,
            "quote" => MsgKind::Quote,
            "mention" => MsgKind::Mention,
            "tip" => MsgKind::Tip,
            "friend_online" => MsgKind::FriendOnline,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for MsgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextMsg {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageMsg {
    #[serde(default)]
    pub title: String,
    pub src: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoMsg {
    #[serde(default)]
    pub title: String,
    pub src: String,
    #[serde(default)]
    pub duration_secs: u32,
}

/// A file reference. `title`, `size` and `mime_type` are filled in by the
/// server from the media service; whatever the client sent is overwritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMsg {
    pub src: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
}

impl FileMsg {
    /// The file id is the last path segment of `src`.
    pub fn file_id(&self) -> Option<&str> {
        self.src
            .rsplit('/')
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoiceMsg {
    pub src: String,
    #[serde(default)]
    pub duration_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationMsg {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub label: String,
}

/// Call signaling actions. The first group is sent by clients, the second
/// only by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallAction {
    Start,
    Accept,
    Offer,
    Answer,
    OfferIce,
    AnswerIce,
    Cancel,
    Reject,
    Leave,
    HangUp,

    Waiting,
    Incoming,
    CreateOffer,
    Cancelled,
    Rejected,
    PeerLeft,
    Ended,
    TimedOut,
}

impl CallAction {
    pub fn is_client_action(&self) -> bool {
        matches!(
            self,
            CallAction::Start
                | CallAction::Accept
                | CallAction::Offer
                | CallAction::Answer
                | CallAction::OfferIce
                | CallAction::AnswerIce
                | CallAction::Cancel
                | CallAction::Reject
                | CallAction::Leave
                | CallAction::HangUp
        )
    }

    /// Negotiation payloads forwarded verbatim to the other participant.
    pub fn is_relay(&self) -> bool {
        matches!(
            self,
            CallAction::Offer | CallAction::Answer | CallAction::OfferIce | CallAction::AnswerIce
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallMsg {
    pub action: CallAction,
    /// Opaque SDP / ICE payload for relay actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
}

impl CallMsg {
    pub fn signal(action: CallAction) -> Self {
        Self {
            action,
            data: None,
            notice: None,
            started_at: None,
            ended_at: None,
            duration_secs: None,
        }
    }

    pub fn with_notice(mut self, notice: impl Into<String>) -> Self {
        self.notice = Some(notice.into());
        self
    }

    pub fn with_data(mut self, data: Option<serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    /// The record persisted after a normal hang-up.
    pub fn record(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        let duration = (ended_at - started_at).num_seconds().max(0);
        Self {
            action: CallAction::Ended,
            data: None,
            notice: Some("call ended".to_string()),
            started_at: Some(started_at),
            ended_at: Some(ended_at),
            duration_secs: Some(duration),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WithdrawMsg {
    pub msg_id: MessageId,
    #[serde(default)]
    pub content: String,
    /// The envelope as it was before the withdrawal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Box<Envelope>>,
}

/// Snapshot of the message a reply or quote points at, resolved server-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadRef {
    pub msg_id: MessageId,
    pub user_id: UserId,
    pub nickname: String,
    pub original_at: DateTime<Utc>,
    pub preview: String,
    pub msg: Box<Envelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyMsg {
    pub msg_id: MessageId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuoteMsg {
    pub msg_id: MessageId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MentionMsg {
    pub user_ids: Vec<UserId>,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TipStatus {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TipMsg {
    pub status: TipStatus,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FriendOnlineMsg {
    pub friend_id: UserId,
    pub nickname: String,
    pub avatar: String,
    pub content: String,
}

impl Envelope {
    pub fn kind(&self) -> MsgKind {
        match self {
            Envelope::Text(_) => MsgKind::Text,
            Envelope::Image(_) => MsgKind::Image,
            Envelope::Video(_) => MsgKind::Video,
            Envelope::File(_) => MsgKind::File,
            Envelope::Voice(_) => MsgKind::Voice,
            Envelope::Location(_) => MsgKind::Location,
            Envelope::Call(_) => MsgKind::Call,
            Envelope::Withdraw(_) => MsgKind::Withdraw,
            Envelope::Reply(_) => MsgKind::Reply,
            Envelope::Quote(_) => MsgKind::Quote,
            Envelope::Mention(_) => MsgKind::Mention,
            Envelope::Tip(_) => MsgKind::Tip,
            Envelope::FriendOnline(_) => MsgKind::FriendOnline,
        }
    }

    pub fn error_tip(content: impl Into<String>) -> Self {
        Envelope::Tip(TipMsg {
            status: TipStatus::Error,
            content: content.into(),
        })
    }

    /// Short human-readable summary shown in conversation lists.
    pub fn preview(&self) -> String {
        match self {
            Envelope::Text(m) => truncate(&m.content),
            Envelope::Image(_) => "[image]".to_string(),
            Envelope::Video(_) => "[video]".to_string(),
            Envelope::File(m) if m.title.is_empty() => "[file]".to_string(),
            Envelope::File(m) => format!("[file] {}", m.title),
            Envelope::Voice(_) => "[voice]".to_string(),
            Envelope::Location(m) if m.label.is_empty() => "[location]".to_string(),
            Envelope::Location(m) => format!("[location] {}", truncate(&m.label)),
            Envelope::Call(m) => match m.duration_secs {
                Some(secs) => format!("[call] {}", format_duration(secs)),
                None => "[call]".to_string(),
            },
            Envelope::Withdraw(m) => format!("{WITHDRAWN_PREVIEW_PREFIX}{}", m.content),
            Envelope::Reply(m) => format!("[reply] {}", truncate(&m.content)),
            Envelope::Quote(m) => format!("[quote] {}", truncate(&m.content)),
            Envelope::Mention(m) => format!("[mention] {}", truncate(&m.content)),
            Envelope::Tip(m) => m.content.clone(),
            Envelope::FriendOnline(m) => m.content.clone(),
        }
    }

    /// Build the withdrawal that replaces `self` in storage. A nested origin
    /// is never carried over.
    pub fn into_withdrawn(self, msg_id: MessageId, content: String) -> Envelope {
        let origin = match self {
            Envelope::Withdraw(mut inner) => {
                inner.origin = None;
                Envelope::Withdraw(inner)
            }
            other => other,
        };
        Envelope::Withdraw(WithdrawMsg {
            msg_id,
            content,
            origin: Some(Box::new(origin)),
        })
    }
}

fn truncate(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= PREVIEW_TEXT_LIMIT {
        return text.to_string();
    }
    let mut short: String = text.chars().take(PREVIEW_TEXT_LIMIT).collect();
    short.push_str("...");
    short
}

fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
