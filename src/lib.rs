#![forbid(unsafe_code)]

//! # Switchboard
//!
//! Distributed instant-messaging backbone for async Rust: a gateway
//! terminating long-lived client sessions, stateless domain services
//! behind a length-prefixed RPC, registry-driven discovery, and the
//! resilience layer that makes the pieces behave as one system.
//!
//! ## Components
//!
//! - **Wire + RPC**: length-prefixed frames ([`wire`]), provider-side
//!   dispatch and consumer-side channel ([`rpc`])
//! - **Discovery**: registry contract with ephemeral liveness nodes
//!   ([`registry`]; etcd binding in `switchboard-etcd`)
//! - **Gateway**: per-user connection table and msgid dispatch
//!   ([`session`]), chat routing ([`router`]), TCP front door
//!   ([`gateway`])
//! - **Resilience**: generic connection pool ([`pool`]), circuit
//!   breaker ([`breaker`]), consistent-hash / round-robin balancing
//!   ([`balancer`])
//! - **Ambient**: `key=value` config ([`config`]), daily-file async
//!   logging ([`logging`]), per-service counters ([`monitor`])
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchboard::prelude::*;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
//!     let users = Arc::new(MemoryUserStore::new());
//!
//!     let mut provider = RpcProvider::new();
//!     provider.notify_service(Arc::new(UserService::new(users)));
//!
//!     let config = Config::parse("rpcserverip=127.0.0.1\nrpcserverport=8000\n");
//!     provider.start(&config, registry).await.unwrap();
//! }
//! ```

pub mod balancer;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod gateway;
pub mod logging;
pub mod monitor;
pub mod pool;
pub mod pubsub;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod service;
pub mod services;
pub mod session;
pub mod store;
pub mod wire;

// Re-exports
pub use balancer::{ConsistentHashBalancer, LoadBalancer, RoundRobinBalancer};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use config::{Config, ConfigError, PoolConfig};
pub use envelope::MsgId;
pub use gateway::GatewayServer;
pub use logging::{AsyncLogger, LogLevel};
pub use monitor::ServiceMonitor;
pub use pool::{ConnectionPool, PoolError, PoolHooks, PooledConn};
pub use pubsub::{MemoryBus, MemoryPubSub, PubSub, PubSubError};
pub use registry::{CreateMode, MemoryRegistry, Registry, RegistryError};
pub use router::ChatRouter;
pub use rpc::{RpcChannel, RpcError, RpcProvider, RpcService};
pub use service::{Lifecycle, Service, ServiceError, ServiceShell};
pub use session::{ClientHandle, Dispatcher, SessionManager};
pub use wire::{FrameDecoder, FrameError, RpcHeader};

pub mod prelude;
