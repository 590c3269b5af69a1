//! User service node: credentials and presence over the framed RPC.

use std::sync::Arc;
use switchboard::rpc::RpcProvider;
use switchboard::service::{Lifecycle, ServiceShell};
use switchboard::services::{UserService, USER_SERVICE};
use switchboard::store::{MemoryUserStore, UserStore};
use switchboard_node::{
    init_logging, load_provider_config, parse_args, registry_from, run_until_shutdown, ProviderNode,
};

#[tokio::main]
async fn main() {
    let args = parse_args();
    let _logger = init_logging();
    let config = load_provider_config(&args);
    let registry = registry_from(&config);

    let users = Arc::new(MemoryUserStore::new());
    let mut provider = RpcProvider::new();
    provider.notify_service(Arc::new(UserService::new(users.clone())));

    let shell = ServiceShell::new(USER_SERVICE, Lifecycle::default());
    let node = Arc::new(ProviderNode::new(shell, config, registry, provider));
    let result = run_until_shutdown(node).await;

    // Nobody is online once this process is gone.
    if let Err(e) = users.reset_all_online().await {
        tracing::error!(error = %e, "presence reset on shutdown failed");
    }

    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
