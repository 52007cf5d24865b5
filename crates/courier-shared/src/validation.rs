//! Structural checks run on every inbound envelope before any side effect.
//!
//! Checks that need the store or a collaborator (does the reply target
//! exist, does the file resolve) happen later in the dispatcher.

use crate::envelope::{CallAction, Envelope};
use crate::error::{ChatError, ChatResult};

/// Where an envelope was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Direct,
    Group,
}

pub fn validate(envelope: &Envelope, scope: Scope) -> ChatResult<()> {
    match envelope {
        Envelope::Text(m) => non_empty(&m.content, "text content must not be empty"),
        Envelope::Image(m) => non_empty(&m.src, "image source must not be empty"),
        Envelope::Video(m) => non_empty(&m.src, "video source must not be empty"),
        Envelope::Voice(m) => non_empty(&m.src, "voice source must not be empty"),
        Envelope::File(m) => match m.file_id() {
            Some(_) => Ok(()),
            None => Err(ChatError::validation("please upload the file first")),
        },
        Envelope::Location(m) => {
            if !(-90.0..=90.0).contains(&m.latitude) || !(-180.0..=180.0).contains(&m.longitude)
            {
                return Err(ChatError::validation("location is out of range"));
            }
            Ok(())
        }
        Envelope::Call(m) => {
            if scope != Scope::Direct {
                return Err(ChatError::validation("calls are only available in direct chats"));
            }
            if !m.action.is_client_action() {
                return Err(ChatError::validation("unsupported call action"));
            }
            if m.action.is_relay() && m.data.is_none() {
                return Err(ChatError::validation("call signal is missing its payload"));
            }
            Ok(())
        }
        Envelope::Withdraw(m) => {
            if m.msg_id.is_unset() {
                return Err(ChatError::validation("withdraw target id must not be empty"));
            }
            Ok(())
        }
        Envelope::Reply(m) => {
            if m.msg_id.is_unset() {
                return Err(ChatError::validation("reply target id must not be empty"));
            }
            non_empty(&m.content, "reply content must not be empty")
        }
        Envelope::Quote(m) => {
            if m.msg_id.is_unset() {
                return Err(ChatError::validation("please choose a message to quote"));
            }
            non_empty(&m.content, "quote content must not be empty")
        }
        Envelope::Mention(m) => {
            if scope != Scope::Group {
                return Err(ChatError::validation("mentions are only available in groups"));
            }
            if m.user_ids.is_empty() || m.user_ids.iter().any(|id| id.is_unset()) {
                return Err(ChatError::validation("mention needs at least one user"));
            }
            non_empty(&m.content, "mention content must not be empty")
        }
        Envelope::Tip(_) | Envelope::FriendOnline(_) => {
            Err(ChatError::validation("message kind cannot be sent by clients"))
        }
    }
}

fn non_empty(value: &str, msg: &str) -> ChatResult<()> {
    if value.trim().is_empty() {
        Err(ChatError::validation(msg))
    } else {
        Ok(())
    }
}
