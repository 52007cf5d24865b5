use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::types::{GroupId, MessageId, UserId, UserInfo};

/// A frame sent by a client over its live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InboundFrame {
    Direct(DirectRequest),
    Group(GroupRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectRequest {
    pub rev_user_id: UserId,
    pub msg: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupRequest {
    pub group_id: GroupId,
    pub msg: Envelope,
}

/// A frame pushed by the server to a live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum OutboundFrame {
    Direct(ChatResponse),
    Group(GroupChatResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    /// Stored id; absent for frames that were never persisted (tips,
    /// call signals, presence notices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub is_self: bool,
    pub sender: UserInfo,
    pub receiver: UserInfo,
    pub msg: Envelope,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupChatResponse {
    pub group_id: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub is_self: bool,
    pub sender: UserInfo,
    /// The sender's nickname inside the group, if set.
    #[serde(default)]
    pub member_nickname: String,
    pub msg: Envelope,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

impl OutboundFrame {
    /// An error tip addressed to `user` alone.
    pub fn tip(user: &UserInfo, content: impl Into<String>) -> Self {
        let msg = Envelope::error_tip(content);
        OutboundFrame::Direct(ChatResponse {
            id: None,
            is_self: true,
            sender: user.clone(),
            receiver: user.clone(),
            preview: msg.preview(),
            msg,
            created_at: Utc::now(),
        })
    }

    pub fn msg(&self) -> &Envelope {
        match self {
            OutboundFrame::Direct(r) => &r.msg,
            OutboundFrame::Group(r) => &r.msg,
        }
    }

    pub fn is_self(&self) -> bool {
        match self {
            OutboundFrame::Direct(r) => r.is_self,
            OutboundFrame::Group(r) => r.is_self,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One row of a history page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub id: MessageId,
    pub sender_id: UserId,
    pub is_self: bool,
    pub msg: Envelope,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    /// Set when more than an hour passed since the previous row.
    pub show_date: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryPage {
    pub items: Vec<HistoryEntry>,
    pub page: u32,
    pub limit: u32,
}

/// Body of the soft-delete endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HideRequest {
    pub ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HideResponse {
    pub hidden: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceStatus {
    pub user_id: UserId,
    pub online: bool,
    pub connections: usize,
}

/// One row of the direct conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectSessionEntry {
    pub peer: UserInfo,
    pub last_message_id: MessageId,
    pub preview: String,
    pub last_at: DateTime<Utc>,
    pub pinned: bool,
    pub online: bool,
}

/// One row of the group conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSessionEntry {
    pub group_id: GroupId,
    pub name: String,
    pub last_message_id: MessageId,
    pub preview: String,
    pub last_at: DateTime<Utc>,
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionPage<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
}

/// New pin state after a toggle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinResponse {
    pub pinned: bool,
}
