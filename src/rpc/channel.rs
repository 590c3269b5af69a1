//! Calling side of the framed RPC.
//!
//! Each call resolves the target through the registry (or the load
//! balancer once nodes are known), passes the circuit breaker, opens a
//! fresh TCP connection, sends one frame, and performs a single bounded
//! read of the raw reply: the provider serializes and closes, so EOF or
//! a full buffer ends the read. Connect, send, and receive are each
//! bounded by the channel's I/O timeout.

use crate::balancer::LoadBalancer;
use crate::breaker::CircuitBreaker;
use crate::clock::{Clock, MonotonicClock};
use crate::monitor::ServiceMonitor;
use crate::registry::{self, Registry};
use crate::rpc::RpcError;
use crate::wire::encode_frame;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Per-operation socket timeout (connect, send, receive).
    pub io_timeout: Duration,
    /// Single-read reply cap. A reply filling the cap exactly is
    /// reported as oversize rather than silently truncated.
    pub reply_cap: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { io_timeout: Duration::from_secs(5), reply_cap: 1024 }
    }
}

/// Per-service balancers created on demand from one factory, so nodes
/// of different services never share a ring.
struct BalancerSet {
    factory: Arc<dyn Fn() -> Arc<dyn LoadBalancer> + Send + Sync>,
    per_service: std::sync::RwLock<std::collections::HashMap<String, Arc<dyn LoadBalancer>>>,
}

impl BalancerSet {
    fn for_service(&self, service: &str) -> Arc<dyn LoadBalancer> {
        if let Some(balancer) = self.per_service.read().expect("balancer set lock").get(service) {
            return balancer.clone();
        }
        self.per_service
            .write()
            .expect("balancer set lock")
            .entry(service.to_string())
            .or_insert_with(|| (self.factory)())
            .clone()
    }
}

/// Consumer channel shared by the stubs of every downstream service.
#[derive(Clone)]
pub struct RpcChannel {
    registry: Arc<dyn Registry>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<ServiceMonitor>,
    balancers: Option<Arc<BalancerSet>>,
    config: ChannelConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel").field("config", &self.config).finish()
    }
}

impl RpcChannel {
    pub fn new(
        registry: Arc<dyn Registry>,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<ServiceMonitor>,
    ) -> Self {
        Self {
            registry,
            breaker,
            monitor,
            balancers: None,
            config: ChannelConfig::default(),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Spread calls across provider nodes, keyed on the routing id. The
    /// factory builds one balancer per service; endpoints resolved from
    /// the registry feed that service's node set.
    pub fn with_balancing(
        mut self,
        factory: Arc<dyn Fn() -> Arc<dyn LoadBalancer> + Send + Sync>,
    ) -> Self {
        self.balancers = Some(Arc::new(BalancerSet {
            factory,
            per_service: std::sync::RwLock::new(std::collections::HashMap::new()),
        }));
        self
    }

    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Serialize `request`, perform the call, parse the reply.
    pub async fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        routing_id: i32,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let args = serde_json::to_vec(request).map_err(RpcError::Serialize)?;
        let reply = self.call_raw(service, method, routing_id, &args).await?;
        serde_json::from_slice(&reply).map_err(RpcError::Parse)
    }

    /// The raw call path: frame, gate, resolve, connect, send, read.
    pub async fn call_raw(
        &self,
        service: &str,
        method: &str,
        routing_id: i32,
        args: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let frame = encode_frame(service, method, args)?;

        if !self.breaker.can_pass() {
            self.monitor.record_error(method, "BreakerOpen");
            return Err(RpcError::BreakerOpen(format!("{service}.{method}")));
        }

        let endpoint = match self.pick_endpoint(service, method, routing_id).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                // Resolution failures count against the breaker too: a
                // missing ephemeral node means the provider is gone.
                self.breaker.on_failure();
                self.monitor.record_error(method, e.kind());
                return Err(e);
            }
        };

        let started = self.clock.now_millis();
        let result = self.exchange(&endpoint, &frame).await;
        let latency = self.clock.now_millis().saturating_sub(started);

        match result {
            Ok(reply) => {
                self.breaker.on_success();
                self.monitor.record_request(method, true, latency);
                Ok(reply)
            }
            Err(e) => {
                self.breaker.on_failure();
                self.monitor.record_request(method, false, latency);
                self.monitor.record_error(method, e.kind());
                Err(e)
            }
        }
    }

    async fn pick_endpoint(
        &self,
        service: &str,
        method: &str,
        routing_id: i32,
    ) -> Result<String, RpcError> {
        let balancer = self.balancers.as_ref().map(|set| set.for_service(service));
        if let Some(balancer) = &balancer {
            if let Some(node) = balancer.select_node(routing_id) {
                return Ok(node);
            }
        }
        let path = registry::method_path(service, method);
        let data = self.registry.get_data(&path).await.map_err(|e| RpcError::UnreachableService {
            service: service.to_string(),
            method: method.to_string(),
            reason: e.to_string(),
        })?;
        let (ip, port) = registry::parse_endpoint(&data).ok_or_else(|| RpcError::UnreachableService {
            service: service.to_string(),
            method: method.to_string(),
            reason: format!("malformed endpoint `{data}`"),
        })?;
        let endpoint = format!("{ip}:{port}");
        if let Some(balancer) = &balancer {
            balancer.add_node(&endpoint);
        }
        Ok(endpoint)
    }

    async fn exchange(&self, endpoint: &str, frame: &[u8]) -> Result<Vec<u8>, RpcError> {
        let io_timeout = self.config.io_timeout;
        let transport = |reason: String| RpcError::Transport {
            endpoint: endpoint.to_string(),
            reason,
        };

        let mut stream = tokio::time::timeout(io_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| transport("connect timed out".into()))?
            .map_err(|e| transport(format!("connect: {e}")))?;

        tokio::time::timeout(io_timeout, stream.write_all(frame))
            .await
            .map_err(|_| transport("send timed out".into()))?
            .map_err(|e| transport(format!("send: {e}")))?;

        // Single bounded read; the provider closes after writing.
        let mut reply = vec![0u8; self.config.reply_cap];
        let n = tokio::time::timeout(io_timeout, read_until_close(&mut stream, &mut reply))
            .await
            .map_err(|_| transport("receive timed out".into()))?
            .map_err(|e| transport(format!("receive: {e}")))?;

        if n == 0 {
            return Err(transport("connection closed without reply".into()));
        }
        if n >= self.config.reply_cap {
            return Err(RpcError::OversizeReply(self.config.reply_cap));
        }
        reply.truncate(n);
        Ok(reply)
    }
}

/// Fill `buf` from the stream until EOF or the buffer is full.
///
/// The reply is unframed, so "provider closed" is the only length
/// signal; short TCP segments must not truncate the reply.
async fn read_until_close(stream: &mut TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CreateMode, MemoryRegistry};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn channel(registry: Arc<MemoryRegistry>) -> RpcChannel {
        RpcChannel::new(
            registry,
            Arc::new(CircuitBreaker::new(3, Duration::from_millis(100), 1)),
            Arc::new(ServiceMonitor::new("test-channel")),
        )
    }

    async fn oneshot_server(reply: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(reply).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn resolves_via_registry_and_reads_reply() {
        let addr = oneshot_server(br#"{"ok":true}"#).await;
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .create("/Svc/Do", addr.as_bytes(), CreateMode::Ephemeral)
            .await
            .unwrap();

        let ch = channel(registry);
        let reply = ch.call_raw("Svc", "Do", 7, b"{}").await.unwrap();
        assert_eq!(reply, br#"{"ok":true}"#);

        let stats = ch.monitor.stats();
        assert_eq!(stats["total_requests"], "1");
        assert_eq!(stats["successful_requests"], "1");
    }

    #[tokio::test]
    async fn missing_registry_node_is_unreachable_service() {
        let registry = Arc::new(MemoryRegistry::new());
        let ch = channel(registry);
        let err = ch.call_raw("Ghost", "Do", 1, b"{}").await.unwrap_err();
        assert!(matches!(err, RpcError::UnreachableService { .. }));
        assert_eq!(ch.monitor.stats()["error_UnreachableService"], "1");
    }

    #[tokio::test]
    async fn malformed_endpoint_is_unreachable_service() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.create("/Svc/Do", b"not-an-endpoint", CreateMode::Ephemeral).await.unwrap();
        let ch = channel(registry);
        let err = ch.call_raw("Svc", "Do", 1, b"{}").await.unwrap_err();
        assert!(matches!(err, RpcError::UnreachableService { .. }));
    }

    #[tokio::test]
    async fn dead_endpoint_is_transport_error_and_feeds_the_breaker() {
        let registry = Arc::new(MemoryRegistry::new());
        // Reserve a port, then close the listener so connects are refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        registry.create("/Svc/Do", addr.as_bytes(), CreateMode::Ephemeral).await.unwrap();

        let ch = channel(registry);
        for _ in 0..3 {
            let err = ch.call_raw("Svc", "Do", 1, b"{}").await.unwrap_err();
            assert!(matches!(err, RpcError::Transport { .. }));
        }
        // Threshold reached: the breaker now rejects before dialing.
        let err = ch.call_raw("Svc", "Do", 1, b"{}").await.unwrap_err();
        assert!(matches!(err, RpcError::BreakerOpen(_)));
        assert_eq!(ch.monitor.stats()["error_BreakerOpen"], "1");
    }

    #[tokio::test]
    async fn reply_filling_the_cap_is_oversize() {
        static BIG: [u8; 64] = [b'x'; 64];
        let addr = oneshot_server(&BIG).await;
        let registry = Arc::new(MemoryRegistry::new());
        registry.create("/Svc/Do", addr.as_bytes(), CreateMode::Ephemeral).await.unwrap();

        let ch = channel(registry)
            .with_config(ChannelConfig { reply_cap: 64, ..ChannelConfig::default() });
        let err = ch.call_raw("Svc", "Do", 1, b"{}").await.unwrap_err();
        assert!(matches!(err, RpcError::OversizeReply(64)));
    }

    #[tokio::test]
    async fn balancers_learn_endpoints_per_service() {
        use crate::balancer::ConsistentHashBalancer;

        let addr_a = oneshot_server(b"ok").await;
        let addr_b = oneshot_server(b"ok").await;
        let registry = Arc::new(MemoryRegistry::new());
        registry.create("/SvcA/Do", addr_a.as_bytes(), CreateMode::Ephemeral).await.unwrap();
        registry.create("/SvcB/Do", addr_b.as_bytes(), CreateMode::Ephemeral).await.unwrap();

        let ch = channel(registry.clone()).with_balancing(Arc::new(|| {
            Arc::new(ConsistentHashBalancer::new()) as Arc<dyn crate::balancer::LoadBalancer>
        }));
        ch.call_raw("SvcA", "Do", 42, b"{}").await.unwrap();
        ch.call_raw("SvcB", "Do", 42, b"{}").await.unwrap();

        // Each service's ring holds only its own endpoint, so dropping
        // the registry nodes must not reroute anything.
        registry.expire_session();
        ch.call_raw("SvcA", "Do", 42, b"{}").await.unwrap();
        ch.call_raw("SvcB", "Do", 42, b"{}").await.unwrap();
        assert_eq!(ch.monitor.stats()["successful_requests"], "4");
    }
}
