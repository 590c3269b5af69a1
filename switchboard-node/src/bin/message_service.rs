//! Message service node: the offline mailbox over the framed RPC.

use std::sync::Arc;
use switchboard::rpc::RpcProvider;
use switchboard::service::{Lifecycle, ServiceShell};
use switchboard::services::{MessageService, MESSAGE_SERVICE};
use switchboard::store::MemoryOfflineStore;
use switchboard_node::{
    init_logging, load_provider_config, parse_args, registry_from, run_until_shutdown, ProviderNode,
};

#[tokio::main]
async fn main() {
    let args = parse_args();
    let _logger = init_logging();
    let config = load_provider_config(&args);
    let registry = registry_from(&config);

    let mailboxes = Arc::new(MemoryOfflineStore::new());
    let mut provider = RpcProvider::new();
    provider.notify_service(Arc::new(MessageService::new(mailboxes)));

    let shell = ServiceShell::new(MESSAGE_SERVICE, Lifecycle::default());
    let node = Arc::new(ProviderNode::new(shell, config, registry, provider));
    if let Err(e) = run_until_shutdown(node).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
