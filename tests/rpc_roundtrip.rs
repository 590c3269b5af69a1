//! Provider/consumer round-trips over loopback TCP with the in-memory
//! registry standing in for the name service.

use std::sync::Arc;
use std::time::Duration;
use switchboard::breaker::CircuitBreaker;
use switchboard::monitor::ServiceMonitor;
use switchboard::registry::{MemoryRegistry, Registry};
use switchboard::rpc::{RpcChannel, RpcError, RpcProvider};
use switchboard::services::{MessageService, MessageStub, UserService, UserStub};
use switchboard::store::{MemoryOfflineStore, MemoryUserStore, UserRecord};
use tokio::net::TcpListener;

async fn spawn_provider(mut provider: RpcProvider, registry: Arc<MemoryRegistry>) {
    provider = provider.with_workers(4);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        provider.announce_and_serve(listener, &addr, registry).await.unwrap();
    });
    // Give the announcement a moment to land.
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn channel(registry: Arc<MemoryRegistry>) -> RpcChannel {
    RpcChannel::new(
        registry,
        Arc::new(CircuitBreaker::new(5, Duration::from_millis(200), 1)),
        Arc::new(ServiceMonitor::new("gateway")),
    )
}

async fn seeded_users() -> Arc<MemoryUserStore> {
    let users = Arc::new(MemoryUserStore::new());
    users
        .seed(UserRecord {
            id: 1001,
            name: "zhang san".into(),
            password: "abc".into(),
            state: "offline".into(),
        })
        .await;
    users
}

#[tokio::test]
async fn login_round_trip_through_the_wire() {
    let registry = Arc::new(MemoryRegistry::new());
    let users = seeded_users().await;

    let mut provider = RpcProvider::new();
    provider.notify_service(Arc::new(UserService::new(users.clone())));
    spawn_provider(provider, registry.clone()).await;

    let stub = UserStub::new(channel(registry));

    let resp = stub.login(1001, "abc").await.unwrap();
    assert!(resp.result.is_ok());
    assert_eq!(resp.id, 1001);
    assert_eq!(resp.state, "online");

    // Same credentials again: the account is now in use.
    let again = stub.login(1001, "abc").await.unwrap();
    assert_eq!(again.result.errcode, 2);

    let wrong = stub.login(1001, "nope").await.unwrap();
    assert_eq!(wrong.result.errcode, 1);
}

#[tokio::test]
async fn offline_mailbox_round_trip_through_the_wire() {
    let registry = Arc::new(MemoryRegistry::new());
    let mut provider = RpcProvider::new();
    provider.notify_service(Arc::new(MessageService::new(Arc::new(MemoryOfflineStore::new()))));
    spawn_provider(provider, registry.clone()).await;

    let stub = MessageStub::new(channel(registry));
    stub.store_offline_message(1002, r#"{"msgid":7,"msg":"hi"}"#).await.unwrap();
    stub.store_offline_message(1002, r#"{"msgid":7,"msg":"again"}"#).await.unwrap();

    let pulled = stub.pull_offline_messages(1002).await.unwrap();
    assert_eq!(pulled.messages.len(), 2);
    assert_eq!(pulled.messages[0], r#"{"msgid":7,"msg":"hi"}"#);

    let empty = stub.pull_offline_messages(1002).await.unwrap();
    assert!(empty.messages.is_empty());
}

#[tokio::test]
async fn two_services_coexist_in_one_registry() {
    let registry = Arc::new(MemoryRegistry::new());
    let users = seeded_users().await;

    let mut user_provider = RpcProvider::new();
    user_provider.notify_service(Arc::new(UserService::new(users)));
    spawn_provider(user_provider, registry.clone()).await;

    let mut message_provider = RpcProvider::new();
    message_provider
        .notify_service(Arc::new(MessageService::new(Arc::new(MemoryOfflineStore::new()))));
    spawn_provider(message_provider, registry.clone()).await;

    let user_stub = UserStub::new(channel(registry.clone()));
    let message_stub = MessageStub::new(channel(registry.clone()));

    assert!(user_stub.login(1001, "abc").await.unwrap().result.is_ok());
    assert!(message_stub.store_offline_message(7, "x").await.unwrap().result.is_ok());

    // The registry holds distinct ephemeral endpoints for each.
    let user_ep = registry.get_data("/UserService/Login").await.unwrap();
    let msg_ep = registry.get_data("/MessageService/StoreOfflineMessage").await.unwrap();
    assert_ne!(user_ep, msg_ep);
}

#[tokio::test]
async fn provider_session_loss_makes_services_unreachable() {
    let registry = Arc::new(MemoryRegistry::new());
    let users = seeded_users().await;

    let mut provider = RpcProvider::new();
    provider.notify_service(Arc::new(UserService::new(users)));
    spawn_provider(provider, registry.clone()).await;

    let stub = UserStub::new(channel(registry.clone()));
    assert!(stub.login(1001, "abc").await.is_ok());

    // Ephemeral nodes vanish with the session; the next resolution fails.
    registry.expire_session();
    let err = stub.get_user_info(1001).await.unwrap_err();
    assert!(matches!(err, RpcError::UnreachableService { .. }));
}
