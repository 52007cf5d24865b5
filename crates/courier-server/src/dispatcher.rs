//! Frame dispatch: parse, validate, authorize, then persist, signal or
//! resolve, and finally fan the result out through the presence registry.
//!
//! No failure here closes a connection. Every error becomes a tip sent to
//! the originating connection only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use courier_shared::constants::MAX_FRAME_SIZE;
use courier_shared::envelope::{CallAction, Envelope, FileMsg, FriendOnlineMsg};
use courier_shared::error::{ChatError, ChatResult, ErrorKind};
use courier_shared::protocol::{
    ChatResponse, DirectRequest, DirectSessionEntry, GroupChatResponse, GroupRequest,
    InboundFrame, OutboundFrame, SessionPage,
};
use courier_shared::types::{MessageId, UserId, UserInfo, UserProfile};
use courier_shared::validation::{validate, Scope};
use courier_store::{GroupMember, StoredMessage};

use crate::calls::{CallCoordinator, CallSignal};
use crate::collaborators::{IdentityService, MediaResolver};
use crate::lifecycle::{MessageLifecycle, PageRequest};
use crate::presence::{ConnectionHandle, ConnectionToken, PresenceRegistry};

/// The user and connection a frame arrived on.
#[derive(Debug, Clone)]
pub struct Session {
    pub profile: UserProfile,
    pub token: ConnectionToken,
}

impl Session {
    pub fn user(&self) -> UserId {
        self.profile.id
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    presence: PresenceRegistry,
    calls: CallCoordinator,
    lifecycle: MessageLifecycle,
    identity: Arc<dyn IdentityService>,
    media: Arc<dyn MediaResolver>,
}

impl Dispatcher {
    pub fn new(
        presence: PresenceRegistry,
        calls: CallCoordinator,
        lifecycle: MessageLifecycle,
        identity: Arc<dyn IdentityService>,
        media: Arc<dyn MediaResolver>,
    ) -> Self {
        Self {
            presence,
            calls,
            lifecycle,
            identity,
            media,
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn lifecycle(&self) -> &MessageLifecycle {
        &self.lifecycle
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Register a new connection and, when the user just came online,
    /// tell their friends.
    pub async fn on_connect(&self, session: &Session, handle: ConnectionHandle) {
        let came_online = self
            .presence
            .connect(session.profile.clone(), session.token.clone(), handle)
            .await;
        if came_online {
            self.announce_online(&session.profile).await;
        }
    }

    pub async fn on_disconnect(&self, session: &Session) {
        if self.presence.disconnect(session.user(), &session.token).await {
            let signals = self.calls.end_sessions_for(session.user()).await;
            for signal in signals {
                self.deliver_call_signal(signal, Utc::now()).await;
            }
        }
    }

    /// Best effort: failures are logged, never surfaced.
    async fn announce_online(&self, profile: &UserProfile) {
        let friends = match self.identity.friend_ids(profile.id).await {
            Ok(friends) => friends,
            Err(e) => {
                warn!(user = %profile.id, error = %e, "Could not load friends for online notice");
                return;
            }
        };

        let notice = Envelope::FriendOnline(FriendOnlineMsg {
            friend_id: profile.id,
            nickname: profile.nickname.clone(),
            avatar: profile.avatar.clone(),
            content: format!("your friend {} is online", profile.nickname),
        });

        let mut notified = 0;
        for friend in friends {
            if !self.presence.is_online(friend).await {
                continue;
            }
            let friend_profile = match self.identity.profile(friend).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(friend = %friend, error = %e, "Skipping online notice");
                    continue;
                }
            };
            if !friend_profile.settings.friend_online_alerts {
                continue;
            }
            let frame = OutboundFrame::Direct(ChatResponse {
                id: None,
                is_self: false,
                sender: profile.info(),
                receiver: friend_profile.info(),
                preview: notice.preview(),
                msg: notice.clone(),
                created_at: Utc::now(),
            });
            if let Some(json) = encode(&frame) {
                notified += self.presence.send_to_user(friend, &json).await;
            }
        }
        debug!(user = %profile.id, notified, "Sent friend online notices");
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Handle one raw inbound frame.
    pub async fn handle_frame(&self, session: &Session, raw: &str) {
        if let Err(err) = self.try_handle_frame(session, raw).await {
            self.send_tip(session, &err).await;
        }
    }

    async fn try_handle_frame(&self, session: &Session, raw: &str) -> ChatResult<()> {
        if raw.len() > MAX_FRAME_SIZE {
            return Err(ChatError::validation("message is too large"));
        }
        let frame: InboundFrame = serde_json::from_str(raw).map_err(|e| {
            debug!(user = %session.user(), error = %e, "Unparseable frame");
            ChatError::validation("invalid message format")
        })?;

        let now = Utc::now();
        match frame {
            InboundFrame::Direct(req) => self.handle_direct(session, req, now).await,
            InboundFrame::Group(req) => self.handle_group(session, req, now).await,
        }
    }

    async fn send_tip(&self, session: &Session, err: &ChatError) {
        match err.kind() {
            ErrorKind::Upstream => {
                warn!(user = %session.user(), error = %err, "Frame failed on an upstream dependency")
            }
            _ => debug!(user = %session.user(), error = %err, "Frame rejected"),
        }
        let frame = OutboundFrame::tip(&session.profile.info(), err.user_message());
        if let Some(json) = encode(&frame) {
            self.presence
                .send_to_connection(session.user(), &session.token, &json)
                .await;
        }
    }

    /// Current profile of the sender; falls back to the snapshot taken at
    /// connect time when the identity service is unavailable.
    async fn sender_profile(&self, session: &Session) -> UserProfile {
        match self.identity.profile(session.user()).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user = %session.user(), error = %e, "Using connect-time profile");
                session.profile.clone()
            }
        }
    }

    // ------------------------------------------------------------------
    // Direct
    // ------------------------------------------------------------------

    async fn handle_direct(
        &self,
        session: &Session,
        req: DirectRequest,
        now: DateTime<Utc>,
    ) -> ChatResult<()> {
        let DirectRequest {
            rev_user_id: receiver,
            mut msg,
        } = req;
        validate(&msg, Scope::Direct)?;
        if receiver.is_unset() {
            return Err(ChatError::validation("receiver must not be empty"));
        }

        let sender = self.sender_profile(session).await;
        // Frames of a call already in progress skip the relationship checks
        // so either side can always tear it down.
        let opens_conversation = match &msg {
            Envelope::Call(call) => call.action == CallAction::Start,
            _ => true,
        };
        if opens_conversation {
            if sender.settings.chat_restricted {
                return Err(ChatError::forbidden("you are currently restricted from chatting"));
            }
            if receiver != sender.id && !self.identity.is_friend(sender.id, receiver).await? {
                return Err(ChatError::forbidden("you are not friends with this user"));
            }
        }
        let receiver_profile = if receiver == sender.id {
            sender.clone()
        } else {
            self.identity.profile(receiver).await?
        };

        match &mut msg {
            Envelope::Call(call) => {
                if call.action == CallAction::Start && !self.presence.is_online(receiver).await {
                    return Err(ChatError::conflict("the other side is offline"));
                }
                let outcome = self.calls.handle(sender.id, receiver, call, now).await?;
                for signal in outcome.signals {
                    self.deliver_call_signal(signal, now).await;
                }
                if let Some(record) = outcome.record {
                    let (caller, callee) = if record.caller == sender.id {
                        (&sender, &receiver_profile)
                    } else {
                        (&receiver_profile, &sender)
                    };
                    let stored = self.lifecycle.persist_direct(
                        caller.id,
                        callee.id,
                        &Envelope::Call(record.msg),
                        now,
                    )?;
                    if let Some(stored) = stored {
                        self.fan_out_direct(&stored, caller, callee).await;
                    }
                }
                return Ok(());
            }
            Envelope::Withdraw(w) => {
                let row = self.lifecycle.withdraw_direct(&sender, w.msg_id, now)?;
                let other = if row.receiver_id == receiver {
                    receiver_profile
                } else {
                    self.identity.profile(row.receiver_id).await?
                };
                self.fan_out_direct(&row, &sender, &other).await;
                return Ok(());
            }
            Envelope::Reply(r) => {
                r.thread = Some(
                    self.lifecycle
                        .resolve_thread_direct(sender.id, receiver, r.msg_id)
                        .await?,
                );
            }
            Envelope::Quote(q) => {
                q.thread = Some(
                    self.lifecycle
                        .resolve_thread_direct(sender.id, receiver, q.msg_id)
                        .await?,
                );
            }
            Envelope::File(file) => self.enrich_file(file).await?,
            _ => {}
        }

        if let Some(stored) = self.lifecycle.persist_direct(sender.id, receiver, &msg, now)? {
            self.fan_out_direct(&stored, &sender, &receiver_profile).await;
        }
        Ok(())
    }

    /// Deliver a stored direct message: `is_self = true` to every sender
    /// connection, `is_self = false` to every receiver connection.
    async fn fan_out_direct(
        &self,
        stored: &StoredMessage,
        sender: &UserProfile,
        receiver: &UserProfile,
    ) {
        let frame_for = |is_self: bool| {
            OutboundFrame::Direct(ChatResponse {
                id: Some(stored.id),
                is_self,
                sender: sender.info(),
                receiver: receiver.info(),
                msg: stored.envelope.clone(),
                preview: stored.preview.clone(),
                created_at: stored.created_at,
            })
        };

        let mut delivered = 0;
        if let Some(json) = encode(&frame_for(true)) {
            delivered += self.presence.send_to_user(sender.id, &json).await;
        }
        if receiver.id != sender.id {
            if let Some(json) = encode(&frame_for(false)) {
                delivered += self.presence.send_to_user(receiver.id, &json).await;
            }
        }
        debug!(id = %stored.id, kind = %stored.kind, delivered, "Direct message fanned out");
    }

    async fn deliver_call_signal(&self, signal: CallSignal, now: DateTime<Utc>) {
        let msg = Envelope::Call(signal.msg);
        let frame = OutboundFrame::Direct(ChatResponse {
            id: None,
            is_self: signal.to == signal.actor,
            sender: self.user_info(signal.actor).await,
            receiver: self.user_info(signal.counterpart).await,
            preview: msg.preview(),
            msg,
            created_at: now,
        });
        if let Some(json) = encode(&frame) {
            self.presence.send_to_user(signal.to, &json).await;
        }
    }

    async fn user_info(&self, user: UserId) -> UserInfo {
        if let Some(profile) = self.presence.profile(user).await {
            return profile.info();
        }
        match self.identity.profile(user).await {
            Ok(profile) => profile.info(),
            Err(_) => UserInfo {
                id: user,
                ..UserInfo::default()
            },
        }
    }

    async fn enrich_file(&self, file: &mut FileMsg) -> ChatResult<()> {
        let file_id = file
            .file_id()
            .ok_or_else(|| ChatError::validation("please upload the file first"))?
            .to_string();
        let meta = self.media.resolve_file(&file_id).await?;
        file.title = meta.name;
        file.size = meta.size;
        file.mime_type = meta.mime_type;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Group
    // ------------------------------------------------------------------

    async fn handle_group(
        &self,
        session: &Session,
        req: GroupRequest,
        now: DateTime<Utc>,
    ) -> ChatResult<()> {
        let GroupRequest { group_id, mut msg } = req;
        validate(&msg, Scope::Group)?;

        let sender = self.sender_profile(session).await;
        let (group, member) = self.lifecycle.group_membership(group_id, sender.id)?;

        if sender.settings.group_chat_restricted {
            return Err(ChatError::forbidden("you are currently restricted from group chats"));
        }
        if member.is_muted_at(now) {
            return Err(ChatError::forbidden("you are muted in this group"));
        }
        if group.muted && !member.role.is_privileged() {
            return Err(ChatError::forbidden("this group is muted"));
        }

        match &mut msg {
            Envelope::Withdraw(w) => {
                let row = self.lifecycle.withdraw_group(&member, &sender, w.msg_id, now)?;
                let frame = group_frame(
                    &sender,
                    &member,
                    row.id,
                    row.envelope,
                    row.preview,
                    row.created_at,
                );
                return self.fan_out_group(frame).await;
            }
            Envelope::Reply(r) => {
                r.thread = Some(self.lifecycle.resolve_thread_group(group_id, r.msg_id).await?);
            }
            Envelope::Quote(q) => {
                q.thread = Some(self.lifecycle.resolve_thread_group(group_id, q.msg_id).await?);
            }
            Envelope::Mention(m) => {
                let members = self.lifecycle.group_members(group_id)?;
                if let Some(stranger) = m.user_ids.iter().find(|id| !members.contains(id)) {
                    return Err(ChatError::validation(format!(
                        "user {stranger} is not a member of this group"
                    )));
                }
            }
            Envelope::File(file) => self.enrich_file(file).await?,
            _ => {}
        }

        match self.lifecycle.persist_group(&member, &msg, now)? {
            Some(stored) => {
                let frame = group_frame(
                    &sender,
                    &member,
                    stored.id,
                    stored.envelope,
                    stored.preview,
                    stored.created_at,
                );
                self.fan_out_group(frame).await
            }
            None => Ok(()),
        }
    }

    /// Deliver to every connection of every online member, with `is_self`
    /// set per recipient.
    async fn fan_out_group(&self, template: GroupChatResponse) -> ChatResult<()> {
        let members = self.lifecycle.group_members(template.group_id)?;
        let mut delivered = 0;
        for user in members {
            if !self.presence.is_online(user).await {
                continue;
            }
            let frame = OutboundFrame::Group(GroupChatResponse {
                is_self: user == template.sender.id,
                ..template.clone()
            });
            if let Some(json) = encode(&frame) {
                delivered += self.presence.send_to_user(user, &json).await;
            }
        }
        debug!(group = %template.group_id, kind = %template.msg.kind(), delivered, "Group message fanned out");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// The direct conversation list of `user`, with each peer's public
    /// profile and online flag.
    pub async fn direct_sessions(
        &self,
        user: UserId,
        page: PageRequest,
    ) -> ChatResult<SessionPage<DirectSessionEntry>> {
        let rows = self.lifecycle.direct_sessions(user, page)?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(DirectSessionEntry {
                peer: self.user_info(row.peer_id).await,
                last_message_id: row.last_message_id,
                preview: row.preview,
                last_at: row.last_at,
                pinned: row.pinned,
                online: self.presence.is_online(row.peer_id).await,
            });
        }
        Ok(SessionPage {
            items,
            page: page.page,
            limit: page.limit,
        })
    }

    // ------------------------------------------------------------------
    // Background
    // ------------------------------------------------------------------

    /// Expire call sessions that never became active.
    pub async fn expire_calls(&self, now: DateTime<Utc>) -> usize {
        let signals = self.calls.purge_expired(now).await;
        let count = signals.len();
        for signal in signals {
            self.deliver_call_signal(signal, now).await;
        }
        if count > 0 {
            info!(notices = count, "Expired call sessions");
        }
        count
    }
}

fn group_frame(
    sender: &UserProfile,
    member: &GroupMember,
    id: MessageId,
    msg: Envelope,
    preview: String,
    created_at: DateTime<Utc>,
) -> GroupChatResponse {
    GroupChatResponse {
        group_id: member.group_id,
        id: Some(id),
        is_self: false,
        sender: sender.info(),
        member_nickname: member.nickname.clone(),
        msg,
        preview,
        created_at,
    }
}

fn encode(frame: &OutboundFrame) -> Option<String> {
    match frame.to_json() {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(error = %e, "Failed to encode outbound frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::collaborators::testing::{StaticIdentity, StaticMedia};
    use courier_shared::envelope::{
        CallMsg, MentionMsg, MsgKind, QuoteMsg, ReplyMsg, TextMsg, TipMsg, WithdrawMsg,
    };
    use courier_shared::types::{GroupId, GroupRole};
    use courier_store::Database;

    const A: UserId = UserId(1);
    const B: UserId = UserId(2);
    const C: UserId = UserId(3);

    struct Harness {
        dispatcher: Dispatcher,
        identity: Arc<StaticIdentity>,
        db: Arc<Mutex<Database>>,
    }

    fn harness() -> Harness {
        let identity = Arc::new(
            StaticIdentity::new()
                .with_user(1, "ann")
                .with_user(2, "bob")
                .with_user(3, "cy")
                .with_user(4, "dee")
                .with_friends(1, 2)
                .with_friends(1, 3),
        );
        let media = Arc::new(StaticMedia::new().with_file("f1", "report.pdf", 2048, "application/pdf"));
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let lifecycle = MessageLifecycle::new(db.clone(), identity.clone(), Duration::from_secs(120));
        let dispatcher = Dispatcher::new(
            PresenceRegistry::new(),
            CallCoordinator::new(Duration::from_secs(60)),
            lifecycle,
            identity.clone(),
            media,
        );
        Harness {
            dispatcher,
            identity,
            db,
        }
    }

    impl Harness {
        async fn connect(&self, user: UserId, token: &str) -> (Session, mpsc::Receiver<String>) {
            let profile = self.identity.profile(user).await.unwrap();
            let session = Session {
                profile,
                token: ConnectionToken::new(token),
            };
            let (handle, rx) = ConnectionHandle::channel(64);
            self.dispatcher.on_connect(&session, handle).await;
            (session, rx)
        }

        fn direct_count(&self) -> i64 {
            self.db
                .lock()
                .unwrap()
                .conn()
                .query_row("SELECT COUNT(*) FROM direct_messages", [], |r| r.get(0))
                .unwrap()
        }

        fn group(&self) -> GroupId {
            let db = self.db.lock().unwrap();
            let now = Utc::now();
            let group = db.create_group("crew", now).unwrap();
            db.add_group_member(group.id, A, "", GroupRole::Owner, now).unwrap();
            db.add_group_member(group.id, B, "bee", GroupRole::Member, now).unwrap();
            db.add_group_member(group.id, C, "", GroupRole::Member, now).unwrap();
            group.id
        }
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            frames.push(serde_json::from_str(&raw).unwrap());
        }
        frames
    }

    fn direct_text(to: UserId, content: &str) -> String {
        serde_json::json!({
            "scope": "direct",
            "rev_user_id": to.0,
            "msg": {"kind": "text", "payload": {"content": content}}
        })
        .to_string()
    }

    fn direct_msg(to: UserId, msg: Envelope) -> String {
        serde_json::json!({"scope": "direct", "rev_user_id": to.0, "msg": msg}).to_string()
    }

    fn group_msg(group: GroupId, msg: Envelope) -> String {
        serde_json::json!({"scope": "group", "group_id": group.0, "msg": msg}).to_string()
    }

    fn call(action: CallAction) -> Envelope {
        let msg = CallMsg::signal(action);
        let msg = if action.is_relay() {
            msg.with_data(Some(serde_json::json!({"sdp": "v=0"})))
        } else {
            msg
        };
        Envelope::Call(msg)
    }

    fn tip_text(frame: &OutboundFrame) -> Option<&str> {
        match frame.msg() {
            Envelope::Tip(TipMsg { content, .. }) => Some(content.as_str()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_direct_fan_out_to_all_connections() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (_a2, mut a2_rx) = h.connect(A, "a2").await;
        let (_b1, mut b1_rx) = h.connect(B, "b1").await;
        let (_b2, mut b2_rx) = h.connect(B, "b2").await;

        h.dispatcher.handle_frame(&a1, &direct_text(B, "hi")).await;

        for rx in [&mut a1_rx, &mut a2_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert!(frames[0].is_self());
            assert!(matches!(&frames[0], OutboundFrame::Direct(r) if r.id.is_some()));
        }
        for rx in [&mut b1_rx, &mut b2_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert!(!frames[0].is_self());
            assert_eq!(frames[0].msg().kind(), MsgKind::Text);
        }
        assert_eq!(h.direct_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_receiver_gets_nothing_but_row_exists() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;

        h.dispatcher.handle_frame(&a1, &direct_text(B, "later")).await;

        let frames = drain(&mut a1_rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_self());
        assert_eq!(h.direct_count(), 1);

        let history = h
            .dispatcher
            .lifecycle()
            .direct_history(B, A, Default::default())
            .unwrap();
        assert_eq!(history.items.len(), 1);
    }

    #[tokio::test]
    async fn test_self_chat_delivered_once_per_connection() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        h.dispatcher.handle_frame(&a1, &direct_text(A, "note to self")).await;

        let frames = drain(&mut a1_rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_self());
    }

    #[tokio::test]
    async fn test_invalid_frame_yields_tip_and_keeps_working() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;

        h.dispatcher.handle_frame(&a1, "{not json").await;
        let frames = drain(&mut a1_rx);
        assert_eq!(tip_text(&frames[0]), Some("invalid message format"));

        h.dispatcher.handle_frame(&a1, &direct_text(B, "")).await;
        let frames = drain(&mut a1_rx);
        assert!(tip_text(&frames[0]).is_some());
        assert_eq!(h.direct_count(), 0);

        h.dispatcher.handle_frame(&a1, &direct_text(B, "ok now")).await;
        let frames = drain(&mut a1_rx);
        assert!(tip_text(&frames[0]).is_none());
    }

    #[tokio::test]
    async fn test_tip_goes_to_originating_connection_only() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (_a2, mut a2_rx) = h.connect(A, "a2").await;

        h.dispatcher.handle_frame(&a1, "[]").await;
        assert_eq!(drain(&mut a1_rx).len(), 1);
        assert!(drain(&mut a2_rx).is_empty());
    }

    #[tokio::test]
    async fn test_non_friend_and_restricted_sender_are_rejected() {
        let h = harness();
        let (b1, mut b1_rx) = h.connect(B, "b1").await;

        h.dispatcher.handle_frame(&b1, &direct_text(C, "hey")).await;
        let frames = drain(&mut b1_rx);
        assert_eq!(tip_text(&frames[0]), Some("you are not friends with this user"));

        h.identity.update_settings(2, |s| s.chat_restricted = true);
        h.dispatcher.handle_frame(&b1, &direct_text(A, "hey")).await;
        let frames = drain(&mut b1_rx);
        assert_eq!(
            tip_text(&frames[0]),
            Some("you are currently restricted from chatting")
        );
        assert_eq!(h.direct_count(), 0);
    }

    #[tokio::test]
    async fn test_withdraw_notifies_both_parties() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (_b1, mut b1_rx) = h.connect(B, "b1").await;

        let stored = h
            .dispatcher
            .lifecycle()
            .persist_direct(
                A,
                B,
                &Envelope::Text(TextMsg {
                    content: "oops".into(),
                }),
                Utc::now() - chrono::Duration::seconds(30),
            )
            .unwrap()
            .unwrap();

        let withdraw = Envelope::Withdraw(WithdrawMsg {
            msg_id: stored.id,
            content: String::new(),
            origin: None,
        });
        h.dispatcher
            .handle_frame(&a1, &direct_msg(B, withdraw.clone()))
            .await;

        for rx in [&mut a1_rx, &mut b1_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].msg().kind(), MsgKind::Withdraw);
            match &frames[0] {
                OutboundFrame::Direct(r) => {
                    assert_eq!(r.id, Some(stored.id));
                    assert!(r.preview.starts_with("-[withdrawn]- "));
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }

        // A second withdraw fails and touches nobody else.
        h.dispatcher.handle_frame(&a1, &direct_msg(B, withdraw)).await;
        let frames = drain(&mut a1_rx);
        assert_eq!(
            tip_text(&frames[0]).map(str::to_string),
            Some(format!("message {} has already been withdrawn", stored.id))
        );
        assert!(drain(&mut b1_rx).is_empty());
        assert_eq!(h.direct_count(), 1);
    }

    #[tokio::test]
    async fn test_reply_to_missing_message_is_not_found() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (_b1, mut b1_rx) = h.connect(B, "b1").await;

        let reply = Envelope::Reply(ReplyMsg {
            msg_id: MessageId(404),
            content: "what?".into(),
            thread: None,
        });
        h.dispatcher.handle_frame(&a1, &direct_msg(B, reply)).await;

        let frames = drain(&mut a1_rx);
        assert_eq!(
            tip_text(&frames[0]),
            Some("the referenced message does not exist")
        );
        assert!(drain(&mut b1_rx).is_empty());
        assert_eq!(h.direct_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_carries_thread_reference() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (b1, mut b1_rx) = h.connect(B, "b1").await;

        h.dispatcher.handle_frame(&a1, &direct_text(B, "lunch?")).await;
        let original = match &drain(&mut a1_rx)[0] {
            OutboundFrame::Direct(r) => r.id.unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        drain(&mut b1_rx);

        let reply = Envelope::Reply(ReplyMsg {
            msg_id: original,
            content: "sure".into(),
            thread: None,
        });
        h.dispatcher.handle_frame(&b1, &direct_msg(A, reply)).await;

        let frames = drain(&mut a1_rx);
        match frames[0].msg() {
            Envelope::Reply(r) => {
                let thread = r.thread.as_ref().expect("thread");
                assert_eq!(thread.msg_id, original);
                assert_eq!(thread.user_id, A);
                assert_eq!(thread.nickname, "ann");
                assert_eq!(thread.preview, "lunch?");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_file_is_enriched_from_media() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;

        let file = Envelope::File(FileMsg {
            src: "/api/file/f1".into(),
            title: "spoofed".into(),
            size: 1,
            mime_type: String::new(),
        });
        h.dispatcher.handle_frame(&a1, &direct_msg(B, file)).await;
        match drain(&mut a1_rx)[0].msg() {
            Envelope::File(f) => {
                assert_eq!(f.title, "report.pdf");
                assert_eq!(f.size, 2048);
                assert_eq!(f.mime_type, "application/pdf");
            }
            other => panic!("unexpected envelope {other:?}"),
        }

        let missing = Envelope::File(FileMsg {
            src: "/api/file/nope".into(),
            title: String::new(),
            size: 0,
            mime_type: String::new(),
        });
        h.dispatcher.handle_frame(&a1, &direct_msg(B, missing)).await;
        assert_eq!(tip_text(&drain(&mut a1_rx)[0]), Some("file does not exist"));
    }

    #[tokio::test]
    async fn test_call_to_offline_user_creates_no_session() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;

        h.dispatcher
            .handle_frame(&a1, &direct_msg(B, call(CallAction::Start)))
            .await;
        assert_eq!(
            tip_text(&drain(&mut a1_rx)[0]),
            Some("the other side is offline")
        );
        assert_eq!(h.dispatcher.calls.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_call_persists_one_record() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (b1, mut b1_rx) = h.connect(B, "b1").await;

        h.dispatcher
            .handle_frame(&a1, &direct_msg(B, call(CallAction::Start)))
            .await;
        let waiting = drain(&mut a1_rx);
        let incoming = drain(&mut b1_rx);
        assert!(matches!(waiting[0].msg(), Envelope::Call(c) if c.action == CallAction::Waiting));
        assert!(matches!(incoming[0].msg(), Envelope::Call(c) if c.action == CallAction::Incoming));

        for (session, to, action) in [
            (&b1, A, CallAction::Accept),
            (&a1, B, CallAction::Offer),
            (&b1, A, CallAction::Answer),
            (&a1, B, CallAction::OfferIce),
        ] {
            h.dispatcher.handle_frame(session, &direct_msg(to, call(action))).await;
        }
        drain(&mut a1_rx);
        drain(&mut b1_rx);
        assert_eq!(h.direct_count(), 0);

        h.dispatcher
            .handle_frame(&a1, &direct_msg(B, call(CallAction::HangUp)))
            .await;
        for rx in [&mut a1_rx, &mut b1_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert!(matches!(frames[0].msg(), Envelope::Call(c) if c.action == CallAction::Ended));
        }
        assert_eq!(h.direct_count(), 1);

        for (user, peer) in [(A, B), (B, A)] {
            let history = h
                .dispatcher
                .lifecycle()
                .direct_history(user, peer, Default::default())
                .unwrap();
            assert_eq!(history.items.len(), 1);
            assert_eq!(history.items[0].msg.kind(), MsgKind::Call);
        }
    }

    #[tokio::test]
    async fn test_disconnect_ends_call_for_peer() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (b1, _b1_rx) = h.connect(B, "b1").await;

        h.dispatcher
            .handle_frame(&a1, &direct_msg(B, call(CallAction::Start)))
            .await;
        drain(&mut a1_rx);

        h.dispatcher.on_disconnect(&b1).await;
        let frames = drain(&mut a1_rx);
        assert!(matches!(frames[0].msg(), Envelope::Call(c) if c.action == CallAction::PeerLeft));
        assert_eq!(h.dispatcher.calls.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_expired_call_notifies_both() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (_b1, mut b1_rx) = h.connect(B, "b1").await;
        h.dispatcher
            .handle_frame(&a1, &direct_msg(B, call(CallAction::Start)))
            .await;
        drain(&mut a1_rx);
        drain(&mut b1_rx);

        let notices = h
            .dispatcher
            .expire_calls(Utc::now() + chrono::Duration::seconds(61))
            .await;
        assert_eq!(notices, 2);
        for rx in [&mut a1_rx, &mut b1_rx] {
            let frames = drain(rx);
            assert!(matches!(frames[0].msg(), Envelope::Call(c) if c.action == CallAction::TimedOut));
        }
    }

    #[tokio::test]
    async fn test_friend_online_notice_respects_setting() {
        let h = harness();
        h.identity.update_settings(2, |s| s.friend_online_alerts = true);
        let (_b1, mut b1_rx) = h.connect(B, "b1").await;
        let (_c1, mut c1_rx) = h.connect(C, "c1").await;

        let (_a1, _a1_rx) = h.connect(A, "a1").await;

        let frames = drain(&mut b1_rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0].msg(), Envelope::FriendOnline(n) if n.friend_id == A));
        assert!(drain(&mut c1_rx).is_empty());

        // A second connection does not announce again.
        let (_a2, _a2_rx) = h.connect(A, "a2").await;
        assert!(drain(&mut b1_rx).is_empty());
    }

    #[tokio::test]
    async fn test_group_fan_out_sets_is_self_per_member() {
        let h = harness();
        let group = h.group();
        let (_a1, mut a1_rx) = h.connect(A, "a1").await;
        let (b1, mut b1_rx) = h.connect(B, "b1").await;

        let text = Envelope::Text(TextMsg {
            content: "hello crew".into(),
        });
        h.dispatcher.handle_frame(&b1, &group_msg(group, text)).await;

        let mine = drain(&mut b1_rx);
        assert!(mine[0].is_self());
        let theirs = drain(&mut a1_rx);
        assert!(!theirs[0].is_self());
        match &theirs[0] {
            OutboundFrame::Group(r) => {
                assert_eq!(r.group_id, group);
                assert_eq!(r.member_nickname, "bee");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_group_rejects_strangers_and_muted_members() {
        let h = harness();
        let group = h.group();
        let (d1, mut d1_rx) = h.connect(UserId(4), "d1").await;
        let (b1, mut b1_rx) = h.connect(B, "b1").await;
        let text = Envelope::Text(TextMsg {
            content: "hi".into(),
        });

        h.dispatcher.handle_frame(&d1, &group_msg(group, text.clone())).await;
        assert_eq!(
            tip_text(&drain(&mut d1_rx)[0]),
            Some("you are not a member of this group")
        );

        h.db.lock().unwrap().set_group_muted(group, true).unwrap();
        h.dispatcher.handle_frame(&b1, &group_msg(group, text)).await;
        assert_eq!(tip_text(&drain(&mut b1_rx)[0]), Some("this group is muted"));
    }

    #[tokio::test]
    async fn test_group_member_cannot_withdraw_others_message() {
        let h = harness();
        let group = h.group();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (b1, mut b1_rx) = h.connect(B, "b1").await;

        let text = Envelope::Text(TextMsg {
            content: "owner speaking".into(),
        });
        h.dispatcher.handle_frame(&a1, &group_msg(group, text)).await;
        let id = match &drain(&mut a1_rx)[0] {
            OutboundFrame::Group(r) => r.id.unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        drain(&mut b1_rx);

        let withdraw = Envelope::Withdraw(WithdrawMsg {
            msg_id: id,
            content: String::new(),
            origin: None,
        });
        h.dispatcher
            .handle_frame(&b1, &group_msg(group, withdraw.clone()))
            .await;
        assert_eq!(
            tip_text(&drain(&mut b1_rx)[0]),
            Some("you can only withdraw your own messages")
        );
        assert!(drain(&mut a1_rx).is_empty());

        // The owner withdraws it; both members see the withdrawal.
        h.dispatcher.handle_frame(&a1, &group_msg(group, withdraw)).await;
        for rx in [&mut a1_rx, &mut b1_rx] {
            let frames = drain(rx);
            assert_eq!(frames[0].msg().kind(), MsgKind::Withdraw);
        }
    }

    #[tokio::test]
    async fn test_mention_must_target_members() {
        let h = harness();
        let group = h.group();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;

        let mention = Envelope::Mention(MentionMsg {
            user_ids: vec![UserId(4)],
            content: "@dee".into(),
        });
        h.dispatcher.handle_frame(&a1, &group_msg(group, mention)).await;
        assert_eq!(
            tip_text(&drain(&mut a1_rx)[0]),
            Some("user 4 is not a member of this group")
        );
    }

    #[tokio::test]
    async fn test_call_teardown_survives_unfriending() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (b1, mut b1_rx) = h.connect(B, "b1").await;

        h.dispatcher
            .handle_frame(&a1, &direct_msg(B, call(CallAction::Start)))
            .await;
        for (session, to, action) in [
            (&b1, A, CallAction::Accept),
            (&a1, B, CallAction::Offer),
            (&b1, A, CallAction::Answer),
        ] {
            h.dispatcher.handle_frame(session, &direct_msg(to, call(action))).await;
        }
        drain(&mut a1_rx);
        drain(&mut b1_rx);

        h.identity.remove_friends(1, 2);
        h.identity.update_settings(2, |s| s.chat_restricted = true);

        h.dispatcher
            .handle_frame(&b1, &direct_msg(A, call(CallAction::HangUp)))
            .await;
        for rx in [&mut a1_rx, &mut b1_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert!(matches!(frames[0].msg(), Envelope::Call(c) if c.action == CallAction::Ended));
        }
        assert_eq!(h.dispatcher.calls.session_count().await, 0);
        assert_eq!(h.direct_count(), 1);

        // A new call is subject to the checks again.
        h.dispatcher
            .handle_frame(&a1, &direct_msg(B, call(CallAction::Start)))
            .await;
        assert_eq!(
            tip_text(&drain(&mut a1_rx)[0]),
            Some("you are not friends with this user")
        );
        assert_eq!(h.dispatcher.calls.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_quote_resolves_or_rejects() {
        let h = harness();
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (b1, mut b1_rx) = h.connect(B, "b1").await;

        let missing = Envelope::Quote(QuoteMsg {
            msg_id: MessageId(404),
            content: "this?".into(),
            thread: None,
        });
        h.dispatcher.handle_frame(&b1, &direct_msg(A, missing)).await;
        assert_eq!(
            tip_text(&drain(&mut b1_rx)[0]),
            Some("the referenced message does not exist")
        );
        assert!(drain(&mut a1_rx).is_empty());

        h.dispatcher.handle_frame(&a1, &direct_text(B, "meet at 6")).await;
        let original = match &drain(&mut a1_rx)[0] {
            OutboundFrame::Direct(r) => r.id.unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };
        drain(&mut b1_rx);

        let quote = Envelope::Quote(QuoteMsg {
            msg_id: original,
            content: "+1".into(),
            thread: None,
        });
        h.dispatcher.handle_frame(&b1, &direct_msg(A, quote)).await;
        match drain(&mut a1_rx)[0].msg() {
            Envelope::Quote(q) => {
                assert_eq!(q.content, "+1");
                let thread = q.thread.as_ref().expect("thread");
                assert_eq!(thread.msg_id, original);
                assert_eq!(thread.nickname, "ann");
                assert_eq!(thread.preview, "meet at 6");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
        assert_eq!(h.direct_count(), 2);
    }

    #[tokio::test]
    async fn test_group_reply_to_other_group_is_rejected() {
        let h = harness();
        let crew = h.group();
        let elsewhere = {
            let db = h.db.lock().unwrap();
            let now = Utc::now();
            let other = db.create_group("other", now).unwrap();
            let owner = db.add_group_member(other.id, A, "", GroupRole::Owner, now).unwrap();
            let text = Envelope::Text(TextMsg {
                content: "private".into(),
            });
            db.insert_group_message(&owner, &text, now).unwrap().id
        };
        let (_a1, mut a1_rx) = h.connect(A, "a1").await;
        let (b1, mut b1_rx) = h.connect(B, "b1").await;

        let reply = Envelope::Reply(ReplyMsg {
            msg_id: elsewhere,
            content: "leaked".into(),
            thread: None,
        });
        h.dispatcher.handle_frame(&b1, &group_msg(crew, reply)).await;
        assert_eq!(
            tip_text(&drain(&mut b1_rx)[0]),
            Some("the referenced message does not exist")
        );
        assert!(drain(&mut a1_rx).is_empty());
    }

    #[tokio::test]
    async fn test_admin_group_withdraw_limits() {
        let h = harness();
        let group = h.group();
        {
            let db = h.db.lock().unwrap();
            db.add_group_member(group, UserId(4), "", GroupRole::Admin, Utc::now())
                .unwrap();
        }
        let (a1, mut a1_rx) = h.connect(A, "a1").await;
        let (c1, mut c1_rx) = h.connect(C, "c1").await;
        let (d1, mut d1_rx) = h.connect(UserId(4), "d1").await;

        let mut posted = Vec::new();
        for (session, rx, content) in [
            (&a1, &mut a1_rx, "owner here"),
            (&c1, &mut c1_rx, "leaving soon"),
        ] {
            let text = Envelope::Text(TextMsg {
                content: content.into(),
            });
            h.dispatcher.handle_frame(session, &group_msg(group, text)).await;
            match drain(rx).last() {
                Some(OutboundFrame::Group(r)) => posted.push(r.id.unwrap()),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        drain(&mut a1_rx);
        drain(&mut d1_rx);

        let withdraw = |msg_id| {
            Envelope::Withdraw(WithdrawMsg {
                msg_id,
                content: String::new(),
                origin: None,
            })
        };

        h.dispatcher
            .handle_frame(&d1, &group_msg(group, withdraw(posted[0])))
            .await;
        assert_eq!(
            tip_text(&drain(&mut d1_rx)[0]),
            Some("admins cannot withdraw messages of the owner or other admins")
        );
        assert!(drain(&mut a1_rx).is_empty());

        h.dispatcher.lifecycle().detach_member(group, C).unwrap();
        h.dispatcher
            .handle_frame(&d1, &group_msg(group, withdraw(posted[1])))
            .await;
        for rx in [&mut a1_rx, &mut d1_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].msg().kind(), MsgKind::Withdraw);
        }
        assert!(drain(&mut c1_rx).is_empty());
    }
}
