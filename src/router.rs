//! Gateway message routing.
//!
//! Chat delivery follows one three-step rule: locally connected peers
//! get the message forwarded on their connection; peers online on
//! another gateway get it published on their pub/sub channel; everyone
//! else gets it appended to their offline mailbox. Login, logout, and
//! the relation pass-throughs are thin orchestrations over the domain
//! service stubs.

use crate::envelope::{self, field_i32, field_str, MsgId};
use crate::pubsub::PubSub;
use crate::services::{MessageStub, RelationStub, UserStub};
use crate::session::{ClientHandle, Dispatcher, MsgHandler, SessionManager};
use crate::store::STATE_ONLINE;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Weak};

/// Where a message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Local,
    CrossGateway,
    Offline,
}

/// The gateway's routing brain; one per gateway process.
pub struct ChatRouter {
    sessions: Arc<SessionManager>,
    users: UserStub,
    messages: MessageStub,
    relations: RelationStub,
    pubsub: Arc<dyn PubSub>,
}

impl ChatRouter {
    pub fn new(
        sessions: Arc<SessionManager>,
        users: UserStub,
        messages: MessageStub,
        relations: RelationStub,
        pubsub: Arc<dyn PubSub>,
    ) -> Arc<Self> {
        let router = Arc::new(Self { sessions, users, messages, relations, pubsub });
        router.install_delivery_handler();
        router
    }

    /// Messages arriving on a subscribed channel: forward if the user is
    /// still here, otherwise persist. The handler captures a weak
    /// reference so the bridge does not keep the router alive.
    fn install_delivery_handler(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.pubsub.set_delivery_handler(Arc::new(move |user_id, payload| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(router) = weak.upgrade() else { return };
                if router.sessions.send_to(user_id, &payload) {
                    return;
                }
                if let Err(e) = router.messages.store_offline_message(user_id, &payload).await {
                    tracing::error!(user_id, error = %e, "failed to persist subscribed message");
                }
            })
        }));
    }

    /// Build the msgid→handler table.
    pub fn dispatcher(self: &Arc<Self>) -> Dispatcher {
        let mut d = Dispatcher::new();
        d.register(MsgId::Login, self.hook(|r, c, js| async move { r.handle_login(c, js).await }));
        d.register(MsgId::Register, self.hook(|r, c, js| async move { r.handle_register(c, js).await }));
        d.register(MsgId::Logout, self.hook(|r, c, js| async move { r.handle_logout(c, js).await }));
        d.register(MsgId::OneChat, self.hook(|r, c, js| async move { r.handle_one_chat(c, js).await }));
        d.register(MsgId::GroupChat, self.hook(|r, c, js| async move { r.handle_group_chat(c, js).await }));
        d.register(MsgId::AddFriend, self.hook(|r, c, js| async move { r.handle_add_friend(c, js).await }));
        d.register(MsgId::CreateGroup, self.hook(|r, c, js| async move { r.handle_create_group(c, js).await }));
        d.register(MsgId::AddGroup, self.hook(|r, c, js| async move { r.handle_add_group(c, js).await }));
        d
    }

    fn hook<F, Fut>(self: &Arc<Self>, f: F) -> MsgHandler
    where
        F: Fn(Arc<Self>, ClientHandle, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let router = self.clone();
        Arc::new(move |conn, js, _ts| Box::pin(f(router.clone(), conn, js)))
    }

    /// Disconnect bookkeeping: drop the table entry, unsubscribe, and
    /// fire-and-forget the presence update.
    pub async fn handle_disconnect(self: &Arc<Self>, conn_id: u64) {
        let Some(user_id) = self.sessions.unbind_conn(conn_id) else { return };
        tracing::info!(user_id, "client disconnected while logged in");
        if let Err(e) = self.pubsub.unsubscribe(user_id).await {
            tracing::error!(user_id, error = %e, "unsubscribe on disconnect failed");
        }
        let users = self.users.clone();
        tokio::spawn(async move {
            if let Err(e) = users.update_user_state(user_id, "offline").await {
                tracing::error!(user_id, error = %e, "offline state update failed");
            }
        });
    }

    /// The three-step delivery rule.
    pub async fn deliver(&self, to: i32, payload: &str) -> Result<Delivery, crate::rpc::RpcError> {
        if self.sessions.send_to(to, payload) {
            return Ok(Delivery::Local);
        }
        let online_elsewhere = match self.users.get_user_info(to).await {
            Ok(info) => info.result.is_ok() && info.state == STATE_ONLINE,
            Err(e) => {
                // Presence unknown: the mailbox is the safe destination.
                tracing::error!(to, error = %e, "presence lookup failed");
                false
            }
        };
        if online_elsewhere {
            if let Err(e) = self.pubsub.publish(to, payload).await {
                tracing::error!(to, error = %e, "cross-gateway publish failed, persisting");
                self.messages.store_offline_message(to, payload).await?;
                return Ok(Delivery::Offline);
            }
            return Ok(Delivery::CrossGateway);
        }
        self.messages.store_offline_message(to, payload).await?;
        Ok(Delivery::Offline)
    }

    async fn handle_login(&self, conn: ClientHandle, js: Value) {
        let (id, password) = match (field_i32(&js, "id"), field_str(&js, "password")) {
            (Ok(id), Ok(password)) => (id, password.to_string()),
            _ => {
                conn.send(envelope::error_reply("Invalid message format").to_string());
                return;
            }
        };

        let resp = match self.users.login(id, &password).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(id, error = %e, "login rpc failed");
                conn.send(
                    json!({"msgid": MsgId::LoginAck.as_i64(), "errno": 1, "errmsg": "user service unavailable"})
                        .to_string(),
                );
                return;
            }
        };
        if !resp.result.is_ok() {
            conn.send(
                json!({
                    "msgid": MsgId::LoginAck.as_i64(),
                    "errno": resp.result.errcode,
                    "errmsg": resp.result.errmsg,
                })
                .to_string(),
            );
            return;
        }

        self.sessions.bind(id, conn.clone());
        if let Err(e) = self.pubsub.subscribe(id).await {
            tracing::error!(id, error = %e, "subscribe on login failed");
        }

        let mut reply = json!({
            "msgid": MsgId::LoginAck.as_i64(),
            "errno": 0,
            "id": resp.id,
            "name": resp.name,
            "state": resp.state,
        });

        match self.messages.pull_offline_messages(id).await {
            Ok(pulled) if !pulled.messages.is_empty() => {
                reply["offlinemsg"] = json!(pulled.messages);
            }
            Ok(_) => {}
            Err(e) => tracing::error!(id, error = %e, "offline pull failed"),
        }

        match self.relations.get_friends(id).await {
            Ok(listing) if !listing.friends.is_empty() => {
                let dumped: Vec<String> = listing
                    .friends
                    .iter()
                    .map(|f| json!({"id": f.id, "name": f.name, "state": f.state}).to_string())
                    .collect();
                reply["friends"] = json!(dumped);
            }
            Ok(_) => {}
            Err(e) => tracing::error!(id, error = %e, "friends lookup failed"),
        }

        match self.relations.get_groups(id).await {
            Ok(listing) if !listing.groups.is_empty() => {
                let dumped: Vec<String> = listing
                    .groups
                    .iter()
                    .map(|g| {
                        let members: Vec<String> = g
                            .members
                            .iter()
                            .map(|m| {
                                json!({"id": m.id, "name": m.name, "state": m.state, "role": m.role})
                                    .to_string()
                            })
                            .collect();
                        json!({
                            "groupid": g.groupid,
                            "groupname": g.groupname,
                            "groupdesc": g.groupdesc,
                            "groupuser": members,
                        })
                        .to_string()
                    })
                    .collect();
                reply["groups"] = json!(dumped);
            }
            Ok(_) => {}
            Err(e) => tracing::error!(id, error = %e, "groups lookup failed"),
        }

        conn.send(reply.to_string());
    }

    async fn handle_register(&self, conn: ClientHandle, js: Value) {
        let (name, password) = match (field_str(&js, "name"), field_str(&js, "password")) {
            (Ok(name), Ok(password)) => (name.to_string(), password.to_string()),
            _ => {
                conn.send(envelope::error_reply("Invalid message format").to_string());
                return;
            }
        };
        let reply = match self.users.register(&name, &password).await {
            Ok(resp) if resp.result.is_ok() => {
                json!({"msgid": MsgId::RegisterAck.as_i64(), "errno": 0, "id": resp.id})
            }
            Ok(resp) => json!({
                "msgid": MsgId::RegisterAck.as_i64(),
                "errno": resp.result.errcode,
                "errmsg": resp.result.errmsg,
            }),
            Err(e) => {
                tracing::error!(error = %e, "register rpc failed");
                json!({"msgid": MsgId::RegisterAck.as_i64(), "errno": 1})
            }
        };
        conn.send(reply.to_string());
    }

    async fn handle_logout(&self, conn: ClientHandle, js: Value) {
        let Ok(id) = field_i32(&js, "id") else {
            conn.send(envelope::error_reply("Invalid message format").to_string());
            return;
        };
        self.sessions.unbind(id);
        if let Err(e) = self.pubsub.unsubscribe(id).await {
            tracing::error!(id, error = %e, "unsubscribe on logout failed");
        }
        let errno = match self.users.logout(id).await {
            Ok(resp) => resp.result.errcode,
            Err(e) => {
                tracing::error!(id, error = %e, "logout rpc failed");
                1
            }
        };
        conn.send(json!({"msgid": MsgId::LogoutAck.as_i64(), "errno": errno}).to_string());
    }

    async fn handle_one_chat(&self, conn: ClientHandle, js: Value) {
        let Ok(toid) = field_i32(&js, "toid") else {
            conn.send(envelope::error_reply("Invalid message format").to_string());
            return;
        };
        let payload = js.to_string();
        let errno = match self.deliver(toid, &payload).await {
            Ok(_) => 0,
            Err(e) => {
                tracing::error!(toid, error = %e, "one-chat delivery failed");
                1
            }
        };
        conn.send(json!({"msgid": MsgId::OneChatAck.as_i64(), "errno": errno}).to_string());
    }

    async fn handle_group_chat(&self, conn: ClientHandle, js: Value) {
        let (id, groupid) = match (field_i32(&js, "id"), field_i32(&js, "groupid")) {
            (Ok(id), Ok(groupid)) => (id, groupid),
            _ => {
                conn.send(envelope::error_reply("Invalid message format").to_string());
                return;
            }
        };
        let members = match self.relations.get_group_users(id, groupid).await {
            Ok(resp) if resp.result.is_ok() => resp.user_ids,
            Ok(resp) => {
                conn.send(
                    json!({
                        "msgid": MsgId::GroupChatAck.as_i64(),
                        "errno": resp.result.errcode,
                        "errmsg": resp.result.errmsg,
                    })
                    .to_string(),
                );
                return;
            }
            Err(e) => {
                tracing::error!(groupid, error = %e, "group membership lookup failed");
                conn.send(json!({"msgid": MsgId::GroupChatAck.as_i64(), "errno": 1}).to_string());
                return;
            }
        };

        let payload = js.to_string();
        let mut errno = 0;
        for member in members {
            if let Err(e) = self.deliver(member, &payload).await {
                tracing::error!(member, error = %e, "group fan-out delivery failed");
                errno = 1;
            }
        }
        conn.send(json!({"msgid": MsgId::GroupChatAck.as_i64(), "errno": errno}).to_string());
    }

    async fn handle_add_friend(&self, conn: ClientHandle, js: Value) {
        let (id, friendid) = match (field_i32(&js, "id"), field_i32(&js, "friendid")) {
            (Ok(id), Ok(friendid)) => (id, friendid),
            _ => {
                conn.send(envelope::error_reply("Invalid message format").to_string());
                return;
            }
        };
        let errno = match self.relations.add_friend(id, friendid).await {
            Ok(resp) => resp.result.errcode,
            Err(e) => {
                tracing::error!(id, friendid, error = %e, "add-friend rpc failed");
                1
            }
        };
        conn.send(json!({"msgid": MsgId::AddFriend.as_i64(), "errno": errno}).to_string());
    }

    async fn handle_create_group(&self, conn: ClientHandle, js: Value) {
        let parsed = (field_i32(&js, "id"), field_str(&js, "groupname"), field_str(&js, "groupdesc"));
        let (id, name, desc) = match parsed {
            (Ok(id), Ok(name), Ok(desc)) => (id, name.to_string(), desc.to_string()),
            _ => {
                conn.send(envelope::error_reply("Invalid message format").to_string());
                return;
            }
        };
        let reply = match self.relations.create_group(id, &name, &desc).await {
            Ok(resp) if resp.result.is_ok() => json!({
                "msgid": MsgId::CreateGroup.as_i64(),
                "errno": 0,
                "groupid": resp.groupid,
            }),
            Ok(resp) => json!({"msgid": MsgId::CreateGroup.as_i64(), "errno": resp.result.errcode}),
            Err(e) => {
                tracing::error!(id, error = %e, "create-group rpc failed");
                json!({"msgid": MsgId::CreateGroup.as_i64(), "errno": 1})
            }
        };
        conn.send(reply.to_string());
    }

    async fn handle_add_group(&self, conn: ClientHandle, js: Value) {
        let (id, groupid) = match (field_i32(&js, "id"), field_i32(&js, "groupid")) {
            (Ok(id), Ok(groupid)) => (id, groupid),
            _ => {
                conn.send(envelope::error_reply("Invalid message format").to_string());
                return;
            }
        };
        let errno = match self.relations.add_group(id, groupid).await {
            Ok(resp) => resp.result.errcode,
            Err(e) => {
                tracing::error!(id, groupid, error = %e, "add-group rpc failed");
                1
            }
        };
        conn.send(json!({"msgid": MsgId::AddGroup.as_i64(), "errno": errno}).to_string());
    }
}
