//! Gateway node: terminates client TCP sessions and routes chat traffic
//! to the domain services and across gateways.

use std::sync::Arc;
use switchboard::balancer::{ConsistentHashBalancer, LoadBalancer};
use switchboard::gateway::GatewayServer;
use switchboard::pubsub::{MemoryBus, MemoryPubSub, PubSub};
use switchboard::router::ChatRouter;
use switchboard::rpc::RpcChannel;
use switchboard::service::{Lifecycle, ServiceShell};
use switchboard::services::{MessageStub, RelationStub, UserStub};
use switchboard::session::SessionManager;
use switchboard_nats::NatsPubSub;
use switchboard_node::{init_logging, load_config, parse_args, registry_from, shutdown_signal};
use tokio::net::TcpListener;

#[tokio::main(worker_threads = 4)]
async fn main() {
    let args = parse_args();
    let _logger = init_logging();
    let config = load_config(&args);

    let registry = registry_from(&config);
    if let Err(e) = registry.start().await {
        eprintln!("{e}");
        std::process::exit(1);
    }

    // cache = the cross-gateway channel; without a broker configured the
    // bridge stays process-local.
    let shell = ServiceShell::new("GatewayService", Lifecycle { cache: true, ..Lifecycle::default() });
    let broker_url = shell.lifecycle().cache.then(|| config.get("natsurl")).flatten();
    let pubsub: Arc<dyn PubSub> = match broker_url {
        Some(url) => match async_nats::connect(url).await {
            Ok(client) => Arc::new(NatsPubSub::new(client)),
            Err(e) => {
                eprintln!("nats connect {url}: {e}");
                std::process::exit(1);
            }
        },
        None => Arc::new(MemoryPubSub::attach(MemoryBus::new())),
    };

    let channel = RpcChannel::new(registry, shell.breaker(), shell.monitor())
        .with_balancing(Arc::new(|| {
            Arc::new(ConsistentHashBalancer::new()) as Arc<dyn LoadBalancer>
        }));
    let sessions = Arc::new(SessionManager::new());
    let router = ChatRouter::new(
        sessions,
        UserStub::new(channel.clone()),
        MessageStub::new(channel.clone()),
        RelationStub::new(channel),
        pubsub,
    );

    let listener = match TcpListener::bind((args.server_ip.as_str(), args.server_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("bind {}:{}: {e}", args.server_ip, args.server_port);
            std::process::exit(1);
        }
    };

    let server = GatewayServer::new(router);
    let stop = server.stop_handle();
    let serving = tokio::spawn(server.serve(listener));
    shutdown_signal().await;
    stop.notify_one();
    let _ = serving.await;
}
