//! Row structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::envelope::{Envelope, MsgKind};
use courier_shared::types::{GroupId, GroupRole, MessageId, UserId};

// ---------------------------------------------------------------------------
// Direct messages
// ---------------------------------------------------------------------------

/// A message between two users. Updated in place only by a withdrawal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub kind: MsgKind,
    pub preview: String,
    pub envelope: Envelope,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn is_withdrawn(&self) -> bool {
        self.kind == MsgKind::Withdraw
    }

    /// True when the message belongs to the conversation between `a` and `b`,
    /// in either direction.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Group-wide mute. Applies to plain members only.
    pub muted: bool,
    pub created_at: DateTime<Utc>,
}

/// Membership of a user in a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    /// Row id, referenced by `group_messages.member_id`.
    pub id: i64,
    pub group_id: GroupId,
    pub user_id: UserId,
    /// Nickname inside the group; empty means "use the profile nickname".
    pub nickname: String,
    pub role: GroupRole,
    pub muted_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl GroupMember {
    pub fn is_muted_at(&self, now: DateTime<Utc>) -> bool {
        self.muted_until.map_or(false, |until| until > now)
    }
}

/// A message posted to a group. `member_id` is cleared when the sender
/// leaves the group; the row itself stays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredGroupMessage {
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub member_id: Option<i64>,
    pub kind: MsgKind,
    pub preview: String,
    pub envelope: Envelope,
    pub created_at: DateTime<Utc>,
}

impl StoredGroupMessage {
    pub fn is_withdrawn(&self) -> bool {
        self.kind == MsgKind::Withdraw
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// One entry of a user's direct conversation list: the latest message the
/// user has not hidden, per peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectSession {
    pub peer_id: UserId,
    pub last_message_id: MessageId,
    pub preview: String,
    pub last_at: DateTime<Utc>,
    pub pinned: bool,
}

/// One entry of a user's group conversation list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSession {
    pub group_id: GroupId,
    pub name: String,
    pub last_message_id: MessageId,
    pub preview: String,
    pub last_at: DateTime<Utc>,
    pub pinned: bool,
}
