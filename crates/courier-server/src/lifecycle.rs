//! Message lifecycle: persistence, withdrawal policy, reply/quote
//! resolution, per-user hiding and history.
//!
//! Every read-check-update sequence runs under a single acquisition of the
//! store lock, and the final update is conditional on the row not being
//! withdrawn yet, so a message can only ever be withdrawn once.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use courier_shared::constants::{
    DEFAULT_HISTORY_LIMIT, HISTORY_DATE_GAP_SECS, MAX_HISTORY_LIMIT, WITHDRAW_CONTENT,
};
use courier_shared::envelope::{Envelope, ThreadRef};
use courier_shared::error::{ChatError, ChatResult};
use courier_shared::protocol::{GroupSessionEntry, HistoryEntry, HistoryPage, SessionPage};
use courier_shared::types::{GroupId, GroupRole, MessageId, UserId, UserProfile};
use courier_store::{
    Database, DirectSession, Group, GroupMember, GroupSession, StoreError, StoredGroupMessage,
    StoredMessage,
};

use crate::collaborators::IdentityService;

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit
                .unwrap_or(DEFAULT_HISTORY_LIMIT)
                .clamp(1, MAX_HISTORY_LIMIT),
        }
    }

    fn offset(&self) -> u32 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Clone)]
pub struct MessageLifecycle {
    db: Arc<Mutex<Database>>,
    identity: Arc<dyn IdentityService>,
    withdraw_window: chrono::Duration,
}

impl MessageLifecycle {
    pub fn new(
        db: Arc<Mutex<Database>>,
        identity: Arc<dyn IdentityService>,
        withdraw_window: Duration,
    ) -> Self {
        Self {
            db,
            identity,
            withdraw_window: chrono::Duration::from_std(withdraw_window)
                .unwrap_or(chrono::Duration::minutes(2)),
        }
    }

    pub(crate) fn db(&self) -> ChatResult<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| ChatError::upstream("message store lock poisoned"))
    }

    // ------------------------------------------------------------------
    // Persist
    // ------------------------------------------------------------------

    /// Store a direct message. Withdrawals are never inserted.
    pub fn persist_direct(
        &self,
        sender: UserId,
        receiver: UserId,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> ChatResult<Option<StoredMessage>> {
        if matches!(envelope, Envelope::Withdraw(_)) {
            return Ok(None);
        }
        let stored = self
            .db()?
            .insert_direct_message(sender, receiver, envelope, now)
            .map_err(storage)?;
        debug!(id = %stored.id, sender = %sender, receiver = %receiver, kind = %stored.kind, "Stored direct message");
        Ok(Some(stored))
    }

    /// Store a group message. Withdrawals are never inserted.
    pub fn persist_group(
        &self,
        member: &GroupMember,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> ChatResult<Option<StoredGroupMessage>> {
        if matches!(envelope, Envelope::Withdraw(_)) {
            return Ok(None);
        }
        let stored = self
            .db()?
            .insert_group_message(member, envelope, now)
            .map_err(storage)?;
        debug!(id = %stored.id, group = %stored.group_id, sender = %member.user_id, kind = %stored.kind, "Stored group message");
        Ok(Some(stored))
    }

    // ------------------------------------------------------------------
    // Withdraw
    // ------------------------------------------------------------------

    /// Withdraw a direct message. Only the sender may, and only within the
    /// withdraw window. Returns the updated row.
    pub fn withdraw_direct(
        &self,
        requester: &UserProfile,
        target: MessageId,
        now: DateTime<Utc>,
    ) -> ChatResult<StoredMessage> {
        let db = self.db()?;
        let row = db
            .get_direct_message(target)
            .map_err(|e| missing(e, "the message does not exist"))?;

        if row.is_withdrawn() {
            return Err(ChatError::AlreadyWithdrawn(target));
        }
        if row.sender_id != requester.id {
            return Err(ChatError::forbidden("you can only withdraw your own messages"));
        }
        self.check_window(row.created_at, now)?;

        let withdrawn = row
            .envelope
            .clone()
            .into_withdrawn(target, withdraw_content(requester));
        if !db.withdraw_direct_message(target, &withdrawn).map_err(storage)? {
            return Err(ChatError::AlreadyWithdrawn(target));
        }
        info!(id = %target, user = %requester.id, "Direct message withdrawn");

        db.get_direct_message(target).map_err(storage)
    }

    /// Withdraw a group message.
    ///
    /// The owner may withdraw anything. Admins may withdraw their own
    /// messages and plain members' messages. Plain members may only withdraw
    /// their own, within the window. A sender who left the group counts as
    /// a plain member.
    pub fn withdraw_group(
        &self,
        requester: &GroupMember,
        requester_profile: &UserProfile,
        target: MessageId,
        now: DateTime<Utc>,
    ) -> ChatResult<StoredGroupMessage> {
        let db = self.db()?;
        let row = db
            .get_group_message(target)
            .map_err(|e| missing(e, "the message does not exist"))?;

        if row.group_id != requester.group_id {
            return Err(ChatError::not_found("the message does not exist"));
        }
        if row.is_withdrawn() {
            return Err(ChatError::AlreadyWithdrawn(target));
        }

        let own = row.sender_id == requester.user_id;
        match requester.role {
            GroupRole::Owner => {}
            GroupRole::Admin if own => {}
            GroupRole::Admin => {
                let sender_role = match row.member_id {
                    Some(id) => db
                        .get_group_member_by_id(id)
                        .map_err(storage)?
                        .map_or(GroupRole::Member, |m| m.role),
                    None => GroupRole::Member,
                };
                if sender_role.is_privileged() {
                    return Err(ChatError::forbidden(
                        "admins cannot withdraw messages of the owner or other admins",
                    ));
                }
            }
            GroupRole::Member => {
                if !own {
                    return Err(ChatError::forbidden("you can only withdraw your own messages"));
                }
                self.check_window(row.created_at, now)?;
            }
        }

        let withdrawn = row
            .envelope
            .clone()
            .into_withdrawn(target, withdraw_content(requester_profile));
        if !db.withdraw_group_message(target, &withdrawn).map_err(storage)? {
            return Err(ChatError::AlreadyWithdrawn(target));
        }
        info!(
            id = %target,
            group = %row.group_id,
            user = %requester.user_id,
            role = ?requester.role,
            "Group message withdrawn"
        );

        db.get_group_message(target).map_err(storage)
    }

    fn check_window(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> ChatResult<()> {
        if now - created_at >= self.withdraw_window {
            return Err(ChatError::forbidden(format!(
                "messages older than {} seconds cannot be withdrawn",
                self.withdraw_window.num_seconds()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reply / quote
    // ------------------------------------------------------------------

    /// Resolve the message a direct reply or quote points at. It must exist,
    /// not be withdrawn and belong to the conversation of `requester` and
    /// `peer`.
    pub async fn resolve_thread_direct(
        &self,
        requester: UserId,
        peer: UserId,
        target: MessageId,
    ) -> ChatResult<ThreadRef> {
        let row = {
            let db = self.db()?;
            db.get_direct_message(target)
                .map_err(|e| missing(e, "the referenced message does not exist"))?
        };
        if row.is_withdrawn() {
            return Err(ChatError::not_found("the referenced message has been withdrawn"));
        }
        if !row.is_between(requester, peer) {
            return Err(ChatError::forbidden(
                "the referenced message does not belong to this conversation",
            ));
        }

        let nickname = self.nickname_of(row.sender_id).await;
        Ok(ThreadRef {
            msg_id: row.id,
            user_id: row.sender_id,
            nickname,
            original_at: row.created_at,
            preview: row.preview,
            msg: Box::new(row.envelope),
        })
    }

    /// Resolve the message a group reply or quote points at.
    pub async fn resolve_thread_group(
        &self,
        group: GroupId,
        target: MessageId,
    ) -> ChatResult<ThreadRef> {
        let (row, member_nickname) = {
            let db = self.db()?;
            let row = db
                .get_group_message(target)
                .map_err(|e| missing(e, "the referenced message does not exist"))?;
            let nickname = match row.member_id {
                Some(id) => db
                    .get_group_member_by_id(id)
                    .map_err(storage)?
                    .map(|m| m.nickname)
                    .filter(|n| !n.is_empty()),
                None => None,
            };
            (row, nickname)
        };
        if row.group_id != group {
            return Err(ChatError::not_found("the referenced message does not exist"));
        }
        if row.is_withdrawn() {
            return Err(ChatError::not_found("the referenced message has been withdrawn"));
        }

        let nickname = match member_nickname {
            Some(n) => n,
            None => self.nickname_of(row.sender_id).await,
        };
        Ok(ThreadRef {
            msg_id: row.id,
            user_id: row.sender_id,
            nickname,
            original_at: row.created_at,
            preview: row.preview,
            msg: Box::new(row.envelope),
        })
    }

    async fn nickname_of(&self, user: UserId) -> String {
        match self.identity.profile(user).await {
            Ok(profile) => profile.nickname,
            Err(e) => {
                warn!(user = %user, error = %e, "Could not resolve nickname for thread reference");
                String::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// The group and `user`'s membership in it.
    pub fn group_membership(&self, group: GroupId, user: UserId) -> ChatResult<(Group, GroupMember)> {
        let db = self.db()?;
        let info = db
            .get_group(group)
            .map_err(|e| missing(e, "the group does not exist"))?;
        let member = db
            .get_group_member(group, user)
            .map_err(storage)?
            .ok_or_else(|| ChatError::forbidden("you are not a member of this group"))?;
        Ok((info, member))
    }

    pub fn group_members(&self, group: GroupId) -> ChatResult<Vec<UserId>> {
        self.db()?.group_member_ids(group).map_err(storage)
    }

    /// Remove `user` from `group`, keeping their messages detached.
    pub fn detach_member(&self, group: GroupId, user: UserId) -> ChatResult<usize> {
        let detached = self
            .db()?
            .remove_group_member(group, user)
            .map_err(|e| missing(e, "not a member of this group"))?;
        info!(group = %group, user = %user, detached, "Member removed from group");
        Ok(detached)
    }

    // ------------------------------------------------------------------
    // Hide / history
    // ------------------------------------------------------------------

    pub fn hide_direct(
        &self,
        user: UserId,
        ids: &[MessageId],
        now: DateTime<Utc>,
    ) -> ChatResult<usize> {
        let hidden = self
            .db()?
            .hide_direct_messages(user, ids, now)
            .map_err(storage)?;
        debug!(user = %user, requested = ids.len(), hidden, "Hid direct messages");
        Ok(hidden)
    }

    pub fn hide_group(
        &self,
        group: GroupId,
        user: UserId,
        ids: &[MessageId],
        now: DateTime<Utc>,
    ) -> ChatResult<usize> {
        self.group_membership(group, user)?;
        let hidden = self
            .db()?
            .hide_group_messages(group, user, ids, now)
            .map_err(storage)?;
        debug!(group = %group, user = %user, requested = ids.len(), hidden, "Hid group messages");
        Ok(hidden)
    }

    pub fn direct_history(
        &self,
        user: UserId,
        peer: UserId,
        page: PageRequest,
    ) -> ChatResult<HistoryPage> {
        let rows = self
            .db()?
            .direct_history(user, peer, page.limit, page.offset())
            .map_err(storage)?;
        let entries = rows
            .into_iter()
            .map(|m| (m.id, m.sender_id, m.envelope, m.preview, m.created_at));
        Ok(build_page(user, entries, page))
    }

    pub fn group_history(
        &self,
        group: GroupId,
        user: UserId,
        page: PageRequest,
    ) -> ChatResult<HistoryPage> {
        self.group_membership(group, user)?;
        let rows = self
            .db()?
            .group_history(group, user, page.limit, page.offset())
            .map_err(storage)?;
        let entries = rows
            .into_iter()
            .map(|m| (m.id, m.sender_id, m.envelope, m.preview, m.created_at));
        Ok(build_page(user, entries, page))
    }

    // ------------------------------------------------------------------
    // Sessions / pins
    // ------------------------------------------------------------------

    /// Latest visible message per peer. Peer profiles and online flags are
    /// filled in by the caller.
    pub fn direct_sessions(
        &self,
        user: UserId,
        page: PageRequest,
    ) -> ChatResult<Vec<DirectSession>> {
        self.db()?
            .direct_sessions(user, page.limit, page.offset())
            .map_err(storage)
    }

    pub fn group_sessions(
        &self,
        user: UserId,
        page: PageRequest,
    ) -> ChatResult<SessionPage<GroupSessionEntry>> {
        let rows: Vec<GroupSession> = self
            .db()?
            .group_sessions(user, page.limit, page.offset())
            .map_err(storage)?;
        let items = rows
            .into_iter()
            .map(|s| GroupSessionEntry {
                group_id: s.group_id,
                name: s.name,
                last_message_id: s.last_message_id,
                preview: s.preview,
                last_at: s.last_at,
                pinned: s.pinned,
            })
            .collect();
        Ok(SessionPage {
            items,
            page: page.page,
            limit: page.limit,
        })
    }

    /// Toggle the pin on the conversation with `peer`. The peer must be a
    /// known user other than `user`.
    pub async fn pin_peer(
        &self,
        user: UserId,
        peer: UserId,
        now: DateTime<Utc>,
    ) -> ChatResult<bool> {
        if peer == user || peer.is_unset() {
            return Err(ChatError::validation("cannot pin this conversation"));
        }
        self.identity.profile(peer).await?;
        let pinned = self
            .db()?
            .toggle_peer_pin(user, peer, now)
            .map_err(storage)?;
        debug!(user = %user, peer = %peer, pinned, "Toggled direct pin");
        Ok(pinned)
    }

    pub fn pin_group(&self, group: GroupId, user: UserId, now: DateTime<Utc>) -> ChatResult<bool> {
        self.group_membership(group, user)?;
        let pinned = self
            .db()?
            .toggle_group_pin(user, group, now)
            .map_err(storage)?;
        debug!(group = %group, user = %user, pinned, "Toggled group pin");
        Ok(pinned)
    }
}

/// Rows arrive newest first and are returned oldest first.
fn build_page(
    user: UserId,
    rows: impl DoubleEndedIterator<Item = (MessageId, UserId, Envelope, String, DateTime<Utc>)>,
    page: PageRequest,
) -> HistoryPage {
    let gap = chrono::Duration::seconds(HISTORY_DATE_GAP_SECS);
    let mut previous: Option<DateTime<Utc>> = None;
    let mut items = Vec::new();

    for (id, sender_id, msg, preview, created_at) in rows.rev() {
        let show_date = previous.map_or(true, |prev| created_at - prev > gap);
        previous = Some(created_at);
        items.push(HistoryEntry {
            id,
            sender_id,
            is_self: sender_id == user,
            msg,
            preview,
            created_at,
            show_date,
        });
    }

    HistoryPage {
        items,
        page: page.page,
        limit: page.limit,
    }
}

fn withdraw_content(requester: &UserProfile) -> String {
    match requester.settings.recall_note.as_deref().map(str::trim) {
        Some(note) if !note.is_empty() => format!("{WITHDRAW_CONTENT} {note}"),
        _ => WITHDRAW_CONTENT.to_string(),
    }
}

fn storage(err: StoreError) -> ChatError {
    warn!(error = %err, "Message store failure");
    ChatError::upstream(format!("message store: {err}"))
}

fn missing(err: StoreError, msg: &str) -> ChatError {
    match err {
        StoreError::NotFound => ChatError::not_found(msg),
        other => storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::StaticIdentity;
    use courier_shared::envelope::{MsgKind, TextMsg};
    use courier_shared::types::UserSettings;

    const A: UserId = UserId(1);
    const B: UserId = UserId(2);
    const C: UserId = UserId(3);

    fn text(content: &str) -> Envelope {
        Envelope::Text(TextMsg {
            content: content.into(),
        })
    }

    fn profile(id: UserId) -> UserProfile {
        UserProfile {
            id,
            nickname: format!("user{id}"),
            avatar: String::new(),
            settings: UserSettings::default(),
        }
    }

    fn lifecycle() -> (MessageLifecycle, Arc<Mutex<Database>>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let identity = Arc::new(
            StaticIdentity::new()
                .with_user(1, "ann")
                .with_user(2, "bob")
                .with_user(3, "cy"),
        );
        (
            MessageLifecycle::new(db.clone(), identity, Duration::from_secs(120)),
            db,
        )
    }

    fn group_with_roles(db: &Arc<Mutex<Database>>) -> (GroupId, GroupMember, GroupMember, GroupMember) {
        let db = db.lock().unwrap();
        let now = Utc::now();
        let group = db.create_group("crew", now).unwrap();
        let owner = db
            .add_group_member(group.id, A, "", GroupRole::Owner, now)
            .unwrap();
        let admin = db
            .add_group_member(group.id, B, "", GroupRole::Admin, now)
            .unwrap();
        let member = db
            .add_group_member(group.id, C, "cee", GroupRole::Member, now)
            .unwrap();
        (group.id, owner, admin, member)
    }

    #[test]
    fn test_withdraw_envelopes_are_not_persisted() {
        let (lc, _) = lifecycle();
        let env = text("x").into_withdrawn(MessageId(1), "w".into());
        assert!(lc.persist_direct(A, B, &env, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_withdraw_own_recent_message() {
        let (lc, _) = lifecycle();
        let now = Utc::now();
        let stored = lc
            .persist_direct(A, B, &text("oops"), now - chrono::Duration::seconds(30))
            .unwrap()
            .unwrap();

        let row = lc.withdraw_direct(&profile(A), stored.id, now).unwrap();
        assert_eq!(row.kind, MsgKind::Withdraw);
        assert_eq!(row.preview, "-[withdrawn]- withdrew a message");

        let err = lc.withdraw_direct(&profile(A), stored.id, now).unwrap_err();
        assert_eq!(err, ChatError::AlreadyWithdrawn(stored.id));
    }

    #[test]
    fn test_withdraw_appends_recall_note() {
        let (lc, _) = lifecycle();
        let now = Utc::now();
        let stored = lc.persist_direct(A, B, &text("oops"), now).unwrap().unwrap();
        let mut requester = profile(A);
        requester.settings.recall_note = Some("sorry!".into());

        let row = lc.withdraw_direct(&requester, stored.id, now).unwrap();
        assert_eq!(row.preview, "-[withdrawn]- withdrew a message sorry!");
    }

    #[test]
    fn test_withdraw_rules_for_direct_messages() {
        let (lc, _) = lifecycle();
        let now = Utc::now();
        let stored = lc.persist_direct(A, B, &text("hi"), now).unwrap().unwrap();

        let err = lc.withdraw_direct(&profile(B), stored.id, now).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let later = now + chrono::Duration::seconds(121);
        let err = lc.withdraw_direct(&profile(A), stored.id, later).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let err = lc.withdraw_direct(&profile(A), MessageId(999), now).unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn test_withdraw_window_is_exclusive() {
        let (lc, _) = lifecycle();
        let now = Utc::now();
        let window = chrono::Duration::seconds(120);
        let stored = lc.persist_direct(A, B, &text("edge"), now).unwrap().unwrap();

        let err = lc
            .withdraw_direct(&profile(A), stored.id, now + window)
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let just_inside = now + window - chrono::Duration::milliseconds(1);
        assert!(lc.withdraw_direct(&profile(A), stored.id, just_inside).is_ok());
    }

    #[test]
    fn test_group_withdraw_roles() {
        let (lc, db) = lifecycle();
        let (_, owner, admin, member) = group_with_roles(&db);
        let now = Utc::now();

        let by_owner = lc.persist_group(&owner, &text("owner"), now).unwrap().unwrap();
        let by_admin = lc.persist_group(&admin, &text("admin"), now).unwrap().unwrap();
        let by_member = lc.persist_group(&member, &text("member"), now).unwrap().unwrap();

        // A plain member cannot withdraw someone else's message.
        let err = lc
            .withdraw_group(&member, &profile(C), by_admin.id, now)
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        // Admins cannot touch the owner's messages.
        let err = lc
            .withdraw_group(&admin, &profile(B), by_owner.id, now)
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        // Admins can withdraw a plain member's message, even after the window.
        let later = now + chrono::Duration::minutes(10);
        let row = lc
            .withdraw_group(&admin, &profile(B), by_member.id, later)
            .unwrap();
        assert!(row.is_withdrawn());

        // ... but only once.
        let err = lc
            .withdraw_group(&owner, &profile(A), by_member.id, later)
            .unwrap_err();
        assert_eq!(err, ChatError::AlreadyWithdrawn(by_member.id));

        // The owner can withdraw an admin's message.
        assert!(lc
            .withdraw_group(&owner, &profile(A), by_admin.id, later)
            .is_ok());
    }

    #[test]
    fn test_plain_member_window_applies() {
        let (lc, db) = lifecycle();
        let (_, _, _, member) = group_with_roles(&db);
        let now = Utc::now();
        let msg = lc.persist_group(&member, &text("hey"), now).unwrap().unwrap();

        let later = now + chrono::Duration::minutes(3);
        let err = lc.withdraw_group(&member, &profile(C), msg.id, later).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        assert!(lc.withdraw_group(&member, &profile(C), msg.id, now).is_ok());
    }

    #[test]
    fn test_detached_sender_counts_as_member() {
        let (lc, db) = lifecycle();
        let (group, _, admin, member) = group_with_roles(&db);
        let now = Utc::now();
        let msg = lc.persist_group(&member, &text("bye"), now).unwrap().unwrap();

        assert_eq!(lc.detach_member(group, C).unwrap(), 1);
        assert!(lc.withdraw_group(&admin, &profile(B), msg.id, now).is_ok());
    }

    #[tokio::test]
    async fn test_resolve_thread_direct() {
        let (lc, _) = lifecycle();
        let now = Utc::now();
        let stored = lc.persist_direct(A, B, &text("original"), now).unwrap().unwrap();

        let thread = lc.resolve_thread_direct(B, A, stored.id).await.unwrap();
        assert_eq!(thread.user_id, A);
        assert_eq!(thread.nickname, "ann");
        assert_eq!(thread.preview, "original");

        let err = lc.resolve_thread_direct(C, A, stored.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let err = lc.resolve_thread_direct(A, B, MessageId(77)).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        lc.withdraw_direct(&profile(A), stored.id, now).unwrap();
        let err = lc.resolve_thread_direct(B, A, stored.id).await.unwrap_err();
        assert_eq!(
            err,
            ChatError::not_found("the referenced message has been withdrawn")
        );
    }

    #[tokio::test]
    async fn test_resolve_thread_group_prefers_member_nickname() {
        let (lc, db) = lifecycle();
        let (group, owner, _, member) = group_with_roles(&db);
        let now = Utc::now();
        let by_member = lc.persist_group(&member, &text("hi"), now).unwrap().unwrap();
        let by_owner = lc.persist_group(&owner, &text("yo"), now).unwrap().unwrap();

        let thread = lc.resolve_thread_group(group, by_member.id).await.unwrap();
        assert_eq!(thread.nickname, "cee");
        let thread = lc.resolve_thread_group(group, by_owner.id).await.unwrap();
        assert_eq!(thread.nickname, "ann");

        let err = lc
            .resolve_thread_group(GroupId(999), by_owner.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn test_hiding_is_per_user() {
        let (lc, _) = lifecycle();
        let now = Utc::now();
        let m = lc.persist_direct(A, B, &text("secret"), now).unwrap().unwrap();

        assert_eq!(lc.hide_direct(A, &[m.id], now).unwrap(), 1);
        assert!(lc
            .direct_history(A, B, PageRequest::default())
            .unwrap()
            .items
            .is_empty());
        assert_eq!(
            lc.direct_history(B, A, PageRequest::default()).unwrap().items.len(),
            1
        );
    }

    #[test]
    fn test_hide_group_requires_membership() {
        let (lc, db) = lifecycle();
        let (group, owner, _, _) = group_with_roles(&db);
        let m = lc
            .persist_group(&owner, &text("x"), Utc::now())
            .unwrap()
            .unwrap();

        let err = lc.hide_group(group, UserId(50), &[m.id], Utc::now()).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        assert_eq!(lc.hide_group(group, B, &[m.id], Utc::now()).unwrap(), 1);
    }

    #[test]
    fn test_history_order_and_date_markers() {
        let (lc, _) = lifecycle();
        let base = Utc::now() - chrono::Duration::hours(5);
        lc.persist_direct(A, B, &text("first"), base).unwrap();
        lc.persist_direct(B, A, &text("second"), base + chrono::Duration::minutes(5))
            .unwrap();
        lc.persist_direct(A, B, &text("third"), base + chrono::Duration::hours(3))
            .unwrap();

        let page = lc.direct_history(A, B, PageRequest::default()).unwrap();
        let previews: Vec<_> = page.items.iter().map(|e| e.preview.as_str()).collect();
        assert_eq!(previews, vec!["first", "second", "third"]);
        let markers: Vec<_> = page.items.iter().map(|e| e.show_date).collect();
        assert_eq!(markers, vec![true, false, true]);
        assert!(page.items[0].is_self);
        assert!(!page.items[1].is_self);
    }

    #[test]
    fn test_page_request_clamps() {
        let page = PageRequest::new(Some(0), Some(1000));
        assert_eq!(page.page, 1);
        assert_eq!(page.limit, MAX_HISTORY_LIMIT);
        assert_eq!(PageRequest::new(Some(3), Some(10)).offset(), 20);
    }
}
