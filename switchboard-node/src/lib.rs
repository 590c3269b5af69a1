//! Shared bootstrap for the switchboard service binaries: CLI surface,
//! logging/config init, registry construction, and the provider-node
//! runner.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use switchboard::config::Config;
use switchboard::logging::AsyncLogger;
use switchboard::registry::Registry;
use switchboard::rpc::RpcProvider;
use switchboard::service::{Service, ServiceError, ServiceShell};
use switchboard_etcd::EtcdRegistry;

/// Common CLI surface: `<binary> serverIP serverPort [-i config]`.
#[derive(Debug, Parser)]
pub struct NodeArgs {
    /// Address to listen on.
    pub server_ip: String,
    /// Port to listen on.
    pub server_port: u16,
    /// Path to the key=value config file.
    #[arg(short = 'i', long = "config", default_value = "mprpc.conf")]
    pub config: PathBuf,
}

/// Parse the CLI, exiting with -1 on bad arguments.
pub fn parse_args() -> NodeArgs {
    match NodeArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(-1);
        }
    }
}

/// Install the daily-file log sink as the tracing writer.
pub fn init_logging() -> AsyncLogger {
    let logger = AsyncLogger::new();
    logger.install_tracing();
    logger
}

/// Load the node config; an unreadable file is fatal.
pub fn load_config(args: &NodeArgs) -> Config {
    match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Load the config and point the RPC listener at the CLI positionals.
pub fn load_provider_config(args: &NodeArgs) -> Config {
    let mut config = load_config(args);
    config.set("rpcserverip", args.server_ip.clone());
    config.set("rpcserverport", args.server_port.to_string());
    config
}

/// Build the registry client from the config's registry address.
pub fn registry_from(config: &Config) -> Arc<dyn Registry> {
    match config.registry_addr() {
        Ok(addr) => Arc::new(EtcdRegistry::new([addr])),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Resolves when the process receives ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    tracing::info!("shutdown signal received");
}

/// A domain-service node: one shell, one provider, one registry.
pub struct ProviderNode {
    shell: ServiceShell,
    config: Config,
    registry: Arc<dyn Registry>,
    provider: tokio::sync::Mutex<Option<RpcProvider>>,
    surface: Vec<(String, Vec<String>)>,
}

impl ProviderNode {
    pub fn new(
        shell: ServiceShell,
        config: Config,
        registry: Arc<dyn Registry>,
        provider: RpcProvider,
    ) -> Self {
        let surface = provider
            .rpc_surface()
            .into_iter()
            .map(|(service, methods)| {
                (service.to_string(), methods.iter().map(|m| m.to_string()).collect())
            })
            .collect();
        Self { shell, config, registry, provider: tokio::sync::Mutex::new(Some(provider)), surface }
    }
}

#[async_trait::async_trait]
impl Service for ProviderNode {
    fn name(&self) -> &str {
        self.shell.name()
    }

    fn describe_rpc_surface(&self) -> Vec<(String, Vec<String>)> {
        self.surface.clone()
    }

    async fn start(&self) -> Result<(), ServiceError> {
        let provider = self
            .provider
            .lock()
            .await
            .take()
            .ok_or_else(|| ServiceError::Init("service already started".into()))?;
        self.shell.run_provider(provider, &self.config, self.registry.clone()).await
    }

    async fn stop(&self) {
        self.shell.stop();
    }
}

/// Run a provider node until the process is told to shut down.
pub async fn run_until_shutdown(node: Arc<ProviderNode>) -> Result<(), ServiceError> {
    let runner = {
        let node = node.clone();
        tokio::spawn(async move { node.start().await })
    };
    shutdown_signal().await;
    node.stop().await;
    runner.await.unwrap_or_else(|e| Err(ServiceError::Init(format!("service task panicked: {e}"))))
}
