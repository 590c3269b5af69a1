//! Serving side of the framed RPC.
//!
//! The provider binds one TCP listener, announces every registered
//! `(service, method)` pair in the registry (`/service` persistent,
//! `/service/method` ephemeral carrying `ip:port`), and dispatches
//! decoded frames to the owning service. Responses are written raw and
//! the connection is closed: the consumer's single bounded read pairs
//! with this.

use crate::config::{Config, ConfigError};
use crate::registry::{self, CreateMode, Registry, RegistryError};
use crate::rpc::{DispatchError, RpcService};
use crate::wire::FrameDecoder;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Inability to bind the listening socket is fatal.
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// The provider's registration map plus its accept loop.
pub struct RpcProvider {
    services: HashMap<&'static str, Arc<dyn RpcService>>,
    workers: usize,
    stop: Arc<Notify>,
}

impl Default for RpcProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcProvider {
    pub fn new() -> Self {
        Self { services: HashMap::new(), workers: 4, stop: Arc::new(Notify::new()) }
    }

    /// Cap on concurrently served connections (default 4).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Record a service and its methods in the registration map.
    pub fn notify_service(&mut self, service: Arc<dyn RpcService>) {
        let name = service.service_name();
        tracing::info!(service = name, methods = ?service.method_names(), "rpc service registered");
        self.services.insert(name, service);
    }

    /// The `(service, [methods])` surface this provider will announce.
    pub fn rpc_surface(&self) -> Vec<(&'static str, &'static [&'static str])> {
        let mut surface: Vec<_> =
            self.services.values().map(|s| (s.service_name(), s.method_names())).collect();
        surface.sort_by_key(|(name, _)| *name);
        surface
    }

    /// Handle used to stop a running provider.
    pub fn stop_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    /// Bind, announce, serve. Runs until the stop handle fires.
    pub async fn start(self, config: &Config, registry: Arc<dyn Registry>) -> Result<(), ProviderError> {
        let addr = config.rpc_server_addr()?;
        let workers = config.rpc_workers()?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProviderError::Bind { addr: addr.clone(), source })?;
        self.with_workers(workers).announce_and_serve(listener, &addr, registry).await
    }

    /// Like [`Self::start`] but on an existing listener, announcing
    /// `advertised` as this node's address. Used when binding port 0.
    pub async fn announce_and_serve(
        self,
        listener: TcpListener,
        advertised: &str,
        registry: Arc<dyn Registry>,
    ) -> Result<(), ProviderError> {
        registry.start().await?;
        for (service, methods) in self.rpc_surface() {
            let service_node = registry::service_path(service);
            registry.create(&service_node, b"", CreateMode::Persistent).await?;
            for method in methods {
                let method_node = registry::method_path(service, method);
                registry
                    .create(&method_node, advertised.as_bytes(), CreateMode::Ephemeral)
                    .await?;
                tracing::info!(path = %method_node, advertised, "rpc method announced");
            }
        }
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop with the worker-concurrency cap.
    pub async fn serve(self, listener: TcpListener) {
        let services = Arc::new(self.services);
        let permits = Arc::new(Semaphore::new(self.workers));
        let stop = self.stop;
        tracing::info!(addr = ?listener.local_addr().ok(), workers = self.workers, "rpc provider serving");
        loop {
            tokio::select! {
                _ = stop.notified() => {
                    tracing::info!("rpc provider stopping");
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::error!(error = %e, "rpc accept failed");
                            continue;
                        }
                    };
                    let permit = match permits.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return,
                    };
                    let services = services.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(&services, stream).await {
                            tracing::error!(%peer, error = %e, "rpc connection closed on error");
                        }
                        drop(permit);
                    });
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnError {
    #[error(transparent)]
    Frame(#[from] crate::wire::FrameError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one frame, dispatch it, write the serialized response, close.
async fn serve_connection(
    services: &HashMap<&'static str, Arc<dyn RpcService>>,
    mut stream: TcpStream,
) -> Result<(), ConnError> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    let (header, args) = loop {
        if let Some(frame) = decoder.try_next()? {
            break frame;
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            decoder.finish()?;
            // Peer connected and went away without sending a frame.
            return Ok(());
        }
        decoder.extend(&buf[..n]);
    };

    tracing::info!(
        service = %header.service_name,
        method = %header.method_name,
        args_size = header.args_size,
        "rpc request"
    );

    let service = services
        .get(header.service_name.as_str())
        .ok_or_else(|| DispatchError::UnknownService(header.service_name.clone()))?;
    if !service.method_names().contains(&header.method_name.as_str()) {
        return Err(DispatchError::UnknownMethod(header.method_name.clone()).into());
    }

    let reply = service.dispatch(&header.method_name, &args).await?;
    stream.write_all(&reply).await?;
    stream.shutdown().await?;
    Ok(())
}
