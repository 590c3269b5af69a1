//! Domain service shell: lifecycle configuration and ordered startup.
//!
//! The original design expressed service setup as overridable lifecycle
//! hooks; here a service is a capability set (`start`, `stop`,
//! `describe_rpc_surface`) plus an injected [`Lifecycle`] saying which
//! of database / cache / monitor / breaker to bring up. The shell owns
//! the monitor and breaker instances and drives the provider loop.

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::config::{Config, ConfigError, PoolConfig};
use crate::monitor::ServiceMonitor;
use crate::pool::{ConnectionPool, PoolHooks};
use crate::registry::Registry;
use crate::rpc::{ProviderError, RpcProvider};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;

/// Which optional subsystems a service brings up.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    pub database: bool,
    pub cache: bool,
    pub monitor: bool,
    pub breaker: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self { database: false, cache: false, monitor: true, breaker: true }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("service init: {0}")]
    Init(String),
}

/// A runnable service node.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;
    /// `(service, methods)` pairs this node publishes over RPC.
    fn describe_rpc_surface(&self) -> Vec<(String, Vec<String>)>;
    /// Run until stopped.
    async fn start(&self) -> Result<(), ServiceError>;
    async fn stop(&self);
}

/// Shared plumbing for service nodes.
pub struct ServiceShell {
    name: String,
    lifecycle: Lifecycle,
    monitor: Arc<ServiceMonitor>,
    breaker: Arc<CircuitBreaker>,
    stop: Arc<Notify>,
}

impl ServiceShell {
    /// Monitor and breaker come up per the lifecycle; a disabled breaker
    /// never opens, a disabled monitor still exists but is simply never
    /// read.
    pub fn new(name: impl Into<String>, lifecycle: Lifecycle) -> Self {
        let name = name.into();
        let breaker = if lifecycle.breaker {
            CircuitBreaker::with_config(BreakerConfig::default())
        } else {
            CircuitBreaker::with_config(BreakerConfig::disabled())
        };
        if lifecycle.monitor {
            tracing::info!(service = %name, "monitor enabled");
        }
        Self {
            monitor: Arc::new(ServiceMonitor::new(name.clone())),
            breaker: Arc::new(breaker),
            name,
            lifecycle,
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn monitor(&self) -> Arc<ServiceMonitor> {
        self.monitor.clone()
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub fn stop_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
    }

    /// Bring up the database pool when the lifecycle asks for one.
    pub async fn init_database_pool<C: Send + 'static>(
        &self,
        config_path: impl AsRef<Path>,
        hooks: PoolHooks<C>,
    ) -> Result<Option<ConnectionPool<C>>, ServiceError> {
        if !self.lifecycle.database {
            return Ok(None);
        }
        let pool_config = PoolConfig::load(config_path)?;
        tracing::info!(service = %self.name, init = pool_config.init_size, max = pool_config.max_size, "database pool up");
        Ok(Some(ConnectionPool::new(pool_config, hooks).await))
    }

    /// Run the provider (bind, announce, serve) until `stop` fires.
    pub async fn run_provider(
        &self,
        provider: RpcProvider,
        config: &Config,
        registry: Arc<dyn Registry>,
    ) -> Result<(), ServiceError> {
        for (service, methods) in provider.rpc_surface() {
            tracing::info!(node = %self.name, service, ?methods, "rpc surface");
        }
        let stopped = self.stop.notified();
        tokio::select! {
            result = provider.start(config, registry) => Ok(result?),
            _ = stopped => {
                tracing::info!(service = %self.name, "service stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let shell = ServiceShell::new("svc", Lifecycle { breaker: false, ..Lifecycle::default() });
        let breaker = shell.breaker();
        for _ in 0..1000 {
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_pass());
    }

    #[tokio::test]
    async fn database_pool_skipped_unless_requested() {
        let shell = ServiceShell::new("svc", Lifecycle::default());
        let hooks: PoolHooks<()> = PoolHooks {
            factory: Arc::new(|| Box::pin(async { Ok(()) })),
            validate: Arc::new(|_| true),
            close: Arc::new(|_| {}),
        };
        let pool = shell.init_database_pool("/nonexistent/mysql.conf", hooks).await.unwrap();
        assert!(pool.is_none());
    }

    #[tokio::test]
    async fn stop_interrupts_run_provider() {
        let shell = Arc::new(ServiceShell::new("svc", Lifecycle::default()));
        let registry = Arc::new(crate::registry::MemoryRegistry::new());
        let config = crate::config::Config::parse("rpcserverip=127.0.0.1\nrpcserverport=0\n");

        let runner = {
            let shell = shell.clone();
            tokio::spawn(async move {
                shell.run_provider(RpcProvider::new(), &config, registry).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shell.stop();
        runner.await.unwrap().unwrap();
    }
}
