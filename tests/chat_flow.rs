//! End-to-end gateway flows over real sockets: login, one-to-one chat,
//! offline mailboxes, group fan-out, and cross-gateway delivery.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchboard::breaker::CircuitBreaker;
use switchboard::gateway::GatewayServer;
use switchboard::monitor::ServiceMonitor;
use switchboard::pubsub::{MemoryBus, MemoryPubSub};
use switchboard::registry::MemoryRegistry;
use switchboard::router::ChatRouter;
use switchboard::rpc::{RpcChannel, RpcProvider};
use switchboard::services::{
    MessageService, MessageStub, RelationService, RelationStub, UserService, UserStub,
};
use switchboard::session::SessionManager;
use switchboard::store::{
    MemoryFriendStore, MemoryGroupStore, MemoryOfflineStore, MemoryUserStore, OfflineStore,
    UserRecord, UserStore,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Backend {
    registry: Arc<MemoryRegistry>,
    users: Arc<MemoryUserStore>,
    offline: Arc<MemoryOfflineStore>,
    bus: Arc<MemoryBus>,
}

async fn start_backend() -> Backend {
    let registry = Arc::new(MemoryRegistry::new());
    let users = Arc::new(MemoryUserStore::new());
    let offline = Arc::new(MemoryOfflineStore::new());
    let friends = Arc::new(MemoryFriendStore::new(users.clone()));
    let groups = Arc::new(MemoryGroupStore::new(users.clone()));

    for (id, name) in [(1001, "zhang san"), (1002, "li si"), (1003, "wang wu")] {
        users
            .seed(UserRecord {
                id,
                name: name.into(),
                password: "abc".into(),
                state: "offline".into(),
            })
            .await;
    }

    let mut user_provider = RpcProvider::new();
    user_provider.notify_service(Arc::new(UserService::new(users.clone())));
    let mut message_provider = RpcProvider::new();
    message_provider.notify_service(Arc::new(MessageService::new(offline.clone())));
    let mut relation_provider = RpcProvider::new();
    relation_provider.notify_service(Arc::new(RelationService::new(friends, groups)));

    for provider in [user_provider, message_provider, relation_provider] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let registry = registry.clone();
        tokio::spawn(async move {
            provider.announce_and_serve(listener, &addr, registry).await.unwrap();
        });
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    Backend { registry, users, offline, bus: MemoryBus::new() }
}

async fn start_gateway(backend: &Backend) -> SocketAddr {
    let channel = RpcChannel::new(
        backend.registry.clone(),
        Arc::new(CircuitBreaker::new(5, Duration::from_millis(200), 1)),
        Arc::new(ServiceMonitor::new("GatewayService")),
    );
    let pubsub = Arc::new(MemoryPubSub::attach(backend.bus.clone()));
    let router = ChatRouter::new(
        Arc::new(SessionManager::new()),
        UserStub::new(channel.clone()),
        MessageStub::new(channel.clone()),
        RelationStub::new(channel),
        pubsub,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(GatewayServer::new(router).serve(listener));
    addr
}

struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self { stream: TcpStream::connect(addr).await.unwrap(), buf: Vec::new() }
    }

    async fn send(&mut self, msg: Value) {
        self.stream.write_all(msg.to_string().as_bytes()).await.unwrap();
    }

    /// Pop the next complete JSON value, reading more as needed.
    async fn next_json(&mut self) -> Value {
        loop {
            if !self.buf.is_empty() {
                let mut iter = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
                match iter.next() {
                    Some(Ok(value)) => {
                        let consumed = iter.byte_offset();
                        self.buf.drain(..consumed);
                        return value;
                    }
                    Some(Err(ref e)) if e.is_eof() => {}
                    Some(Err(e)) => panic!("garbled reply: {e}"),
                    None => {}
                }
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for a reply")
                .unwrap();
            assert!(n > 0, "gateway closed the connection");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn login(&mut self, id: i32, password: &str) -> Value {
        self.send(json!({"msgid": 1, "id": id, "password": password})).await;
        self.next_json().await
    }
}

#[tokio::test]
async fn login_success_marks_user_online() {
    let backend = start_backend().await;
    let addr = start_gateway(&backend).await;

    let mut client = TestClient::connect(addr).await;
    let reply = client.login(1001, "abc").await;

    assert_eq!(reply["msgid"], 2);
    assert_eq!(reply["errno"], 0);
    assert_eq!(reply["id"], 1001);
    assert_eq!(reply["state"], "online");
    assert_eq!(backend.users.query(1001).await.unwrap().unwrap().state, "online");
}

#[tokio::test]
async fn double_login_is_rejected_with_errno_2() {
    let backend = start_backend().await;
    let addr = start_gateway(&backend).await;

    let mut first = TestClient::connect(addr).await;
    assert_eq!(first.login(1001, "abc").await["errno"], 0);

    let mut second = TestClient::connect(addr).await;
    let reply = second.login(1001, "abc").await;
    assert_eq!(reply["msgid"], 2);
    assert_eq!(reply["errno"], 2);
    assert_eq!(reply["errmsg"], "this account is using, input another!");
}

#[tokio::test]
async fn one_chat_to_local_peer_is_forwarded_verbatim() {
    let backend = start_backend().await;
    let addr = start_gateway(&backend).await;

    let mut alice = TestClient::connect(addr).await;
    assert_eq!(alice.login(1001, "abc").await["errno"], 0);
    let mut bob = TestClient::connect(addr).await;
    assert_eq!(bob.login(1002, "abc").await["errno"], 0);

    let chat = json!({"msgid": 7, "id": 1001, "toid": 1002, "msg": "hi"});
    alice.send(chat.clone()).await;

    let delivered = bob.next_json().await;
    assert_eq!(delivered, chat);

    let ack = alice.next_json().await;
    assert_eq!(ack["msgid"], 8);
    assert_eq!(ack["errno"], 0);

    assert!(backend.offline.query(1002).await.unwrap().is_empty());
}

#[tokio::test]
async fn one_chat_to_offline_peer_lands_in_the_mailbox_and_drains_on_login() {
    let backend = start_backend().await;
    let addr = start_gateway(&backend).await;

    let mut alice = TestClient::connect(addr).await;
    assert_eq!(alice.login(1001, "abc").await["errno"], 0);

    let chat = json!({"msgid": 7, "id": 1001, "toid": 1002, "msg": "see you later"});
    alice.send(chat.clone()).await;
    assert_eq!(alice.next_json().await["errno"], 0);

    let stored = backend.offline.query(1002).await.unwrap();
    assert_eq!(stored, vec![chat.to_string()]);

    // The mailbox rides along on the next login, then is cleared.
    let mut bob = TestClient::connect(addr).await;
    let reply = bob.login(1002, "abc").await;
    assert_eq!(reply["errno"], 0);
    let offline: Vec<String> = reply["offlinemsg"]
        .as_array()
        .expect("offlinemsg present")
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(offline, vec![chat.to_string()]);
    assert!(backend.offline.query(1002).await.unwrap().is_empty());
}

#[tokio::test]
async fn group_chat_fans_out_locally_and_to_mailboxes() {
    let backend = start_backend().await;
    let addr = start_gateway(&backend).await;

    let mut alice = TestClient::connect(addr).await;
    assert_eq!(alice.login(1001, "abc").await["errno"], 0);
    let mut bob = TestClient::connect(addr).await;
    assert_eq!(bob.login(1002, "abc").await["errno"], 0);

    // Alice creates the group; bob and wang wu join; wang wu logs out.
    alice.send(json!({"msgid": 10, "id": 1001, "groupname": "dev", "groupdesc": "standup"})).await;
    let created = alice.next_json().await;
    assert_eq!(created["errno"], 0);
    let groupid = created["groupid"].as_i64().unwrap();

    bob.send(json!({"msgid": 11, "id": 1002, "groupid": groupid})).await;
    assert_eq!(bob.next_json().await["errno"], 0);

    let mut wang = TestClient::connect(addr).await;
    assert_eq!(wang.login(1003, "abc").await["errno"], 0);
    wang.send(json!({"msgid": 11, "id": 1003, "groupid": groupid})).await;
    assert_eq!(wang.next_json().await["errno"], 0);
    wang.send(json!({"msgid": 5, "id": 1003})).await;
    assert_eq!(wang.next_json().await["msgid"], 6);

    let chat = json!({"msgid": 12, "id": 1001, "groupid": groupid, "msg": "standup time"});
    alice.send(chat.clone()).await;

    assert_eq!(bob.next_json().await, chat);
    let ack = alice.next_json().await;
    assert_eq!(ack["msgid"], 13);
    assert_eq!(ack["errno"], 0);

    assert_eq!(backend.offline.query(1003).await.unwrap(), vec![chat.to_string()]);
}

#[tokio::test]
async fn one_chat_crosses_gateways_over_the_bridge() {
    let backend = start_backend().await;
    let addr_a = start_gateway(&backend).await;
    let addr_b = start_gateway(&backend).await;

    let mut alice = TestClient::connect(addr_a).await;
    assert_eq!(alice.login(1001, "abc").await["errno"], 0);
    let mut bob = TestClient::connect(addr_b).await;
    assert_eq!(bob.login(1002, "abc").await["errno"], 0);

    let chat = json!({"msgid": 7, "id": 1001, "toid": 1002, "msg": "across the mesh"});
    alice.send(chat.clone()).await;

    assert_eq!(bob.next_json().await, chat);
    assert_eq!(alice.next_json().await["errno"], 0);
    assert!(backend.offline.query(1002).await.unwrap().is_empty());
}

#[tokio::test]
async fn login_reply_carries_friends_and_groups_snapshots() {
    let backend = start_backend().await;
    let addr = start_gateway(&backend).await;

    let mut alice = TestClient::connect(addr).await;
    assert_eq!(alice.login(1001, "abc").await["errno"], 0);

    alice.send(json!({"msgid": 9, "id": 1001, "friendid": 1002})).await;
    assert_eq!(alice.next_json().await["errno"], 0);
    alice.send(json!({"msgid": 10, "id": 1001, "groupname": "dev", "groupdesc": "standup"})).await;
    assert_eq!(alice.next_json().await["errno"], 0);

    alice.send(json!({"msgid": 5, "id": 1001})).await;
    assert_eq!(alice.next_json().await["msgid"], 6);

    let mut back = TestClient::connect(addr).await;
    let reply = back.login(1001, "abc").await;
    assert_eq!(reply["errno"], 0);

    let friends = reply["friends"].as_array().expect("friends present");
    let friend: Value = serde_json::from_str(friends[0].as_str().unwrap()).unwrap();
    assert_eq!(friend["id"], 1002);
    assert_eq!(friend["name"], "li si");

    let groups = reply["groups"].as_array().expect("groups present");
    let group: Value = serde_json::from_str(groups[0].as_str().unwrap()).unwrap();
    assert_eq!(group["groupname"], "dev");
    let members = group["groupuser"].as_array().unwrap();
    let creator: Value = serde_json::from_str(members[0].as_str().unwrap()).unwrap();
    assert_eq!(creator["role"], "creator");
}

#[tokio::test]
async fn disconnect_without_logout_sets_user_offline() {
    let backend = start_backend().await;
    let addr = start_gateway(&backend).await;

    let mut alice = TestClient::connect(addr).await;
    assert_eq!(alice.login(1001, "abc").await["errno"], 0);
    drop(alice);

    // The disconnect path fires the presence update asynchronously.
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if backend.users.query(1001).await.unwrap().unwrap().state == "offline" {
            return;
        }
    }
    panic!("user never went offline after disconnect");
}
