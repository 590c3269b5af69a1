//! Convenient re-exports for common Switchboard types.
pub use crate::{
    balancer::{ConsistentHashBalancer, LoadBalancer, RoundRobinBalancer},
    breaker::{BreakerConfig, CircuitBreaker, CircuitState},
    clock::{Clock, MonotonicClock},
    config::{Config, ConfigError, PoolConfig},
    envelope::MsgId,
    gateway::GatewayServer,
    logging::{AsyncLogger, LogLevel},
    monitor::ServiceMonitor,
    pool::{ConnectionPool, PoolError, PoolHooks, PooledConn},
    pubsub::{MemoryBus, MemoryPubSub, PubSub, PubSubError},
    registry::{CreateMode, MemoryRegistry, Registry, RegistryError},
    router::ChatRouter,
    rpc::{ChannelConfig, RpcChannel, RpcError, RpcProvider, RpcService},
    service::{Lifecycle, Service, ServiceError, ServiceShell},
    services::{
        MessageService, MessageStub, RelationService, RelationStub, ResultCode, UserService,
        UserStub,
    },
    session::{ClientHandle, Dispatcher, SessionManager},
    store::{
        FriendStore, GroupStore, MemoryFriendStore, MemoryGroupStore, MemoryOfflineStore,
        MemoryUserStore, OfflineStore, UserRecord, UserStore,
    },
    wire::{FrameDecoder, FrameError, RpcHeader},
};
