use serde::{Deserialize, Serialize};

// Numeric identifiers assigned by the identity and persistence services.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-user preferences and restrictions, as reported by the identity service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UserSettings {
    /// Receive a notice when a friend comes online.
    pub friend_online_alerts: bool,
    /// Note appended to the content of this user's withdrawals.
    pub recall_note: Option<String>,
    /// Sending direct messages is blocked for this user.
    pub chat_restricted: bool,
    /// Sending group messages is blocked for this user.
    pub group_chat_restricted: bool,
}

/// Profile snapshot of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub nickname: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub settings: UserSettings,
}

impl UserProfile {
    pub fn info(&self) -> UserInfo {
        UserInfo {
            id: self.id,
            nickname: self.nickname.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

/// The public part of a profile, embedded in outbound frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: UserId,
    pub nickname: String,
    pub avatar: String,
}

/// Role of a member inside a group. The numeric codes are the stored values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Owner,
    Admin,
    Member,
}

impl GroupRole {
    pub fn code(&self) -> i64 {
        match self {
            GroupRole::Owner => 1,
            GroupRole::Admin => 2,
            GroupRole::Member => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Owner),
            2 => Some(Self::Admin),
            3 => Some(Self::Member),
            _ => None,
        }
    }

    pub fn is_privileged(&self) -> bool {
        matches!(self, GroupRole::Owner | GroupRole::Admin)
    }
}
