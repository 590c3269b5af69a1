//! Hierarchical name-service client contract.
//!
//! Providers announce `/service` (persistent) and `/service/method`
//! (ephemeral, value `ip:port`); consumers resolve method paths before
//! every call; node-change events are logged but never drive cache
//! logic, so a re-read is always current enough.
//!
//! [`MemoryRegistry`] backs tests and single-process deployments; the
//! `switchboard-etcd` crate maps the same contract onto an etcd cluster
//! with lease-backed ephemerals.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// How long `start` waits for the session-connected signal.
pub const CONNECT_WAIT: Duration = Duration::from_secs(10);

/// Registry session TTL requested on connect.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Disappears when the creating session ends.
    Ephemeral,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The connected signal did not arrive within [`CONNECT_WAIT`].
    #[error("registry connect timed out after {0:?}")]
    Timeout(Duration),
    /// The path has no node or the node carries no data.
    #[error("registry path `{0}` has no data")]
    Missing(String),
    /// Session-level failure from the backing client.
    #[error("registry session: {0}")]
    Session(String),
}

/// Name-service operations used by the RPC provider and consumer.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Connect and block until the session is established.
    async fn start(&self) -> Result<(), RegistryError>;

    /// Create a node if absent; an existing node is left untouched.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), RegistryError>;

    /// Read a node's data.
    async fn get_data(&self, path: &str) -> Result<String, RegistryError>;

    /// Tear the session down and connect again. Ephemeral nodes are gone
    /// afterwards until their owners re-announce.
    async fn reconnect(&self) -> Result<(), RegistryError>;
}

/// `/service`
pub fn service_path(service: &str) -> String {
    format!("/{service}")
}

/// `/service/method`
pub fn method_path(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

/// Split a node value of the form `ip:port`.
pub fn parse_endpoint(data: &str) -> Option<(String, u16)> {
    let (ip, port) = data.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if ip.is_empty() {
        return None;
    }
    Some((ip.to_string(), port))
}

/// In-process registry: a plain map plus ephemeral bookkeeping.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    nodes: Mutex<MemoryNodes>,
}

#[derive(Debug, Default)]
struct MemoryNodes {
    data: HashMap<String, String>,
    ephemeral: HashSet<String>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every ephemeral node, as a session expiry would.
    pub fn expire_session(&self) {
        let mut nodes = self.nodes.lock().expect("registry lock");
        let ephemeral = std::mem::take(&mut nodes.ephemeral);
        for path in ephemeral {
            nodes.data.remove(&path);
            tracing::info!(path, "registry node expired");
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn start(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.lock().expect("registry lock");
        if nodes.data.contains_key(path) {
            return Ok(());
        }
        nodes.data.insert(path.to_string(), String::from_utf8_lossy(data).into_owned());
        if mode == CreateMode::Ephemeral {
            nodes.ephemeral.insert(path.to_string());
        }
        tracing::info!(path, ?mode, "registry node created");
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<String, RegistryError> {
        let nodes = self.nodes.lock().expect("registry lock");
        match nodes.data.get(path) {
            Some(data) if !data.is_empty() => Ok(data.clone()),
            _ => Err(RegistryError::Missing(path.to_string())),
        }
    }

    async fn reconnect(&self) -> Result<(), RegistryError> {
        self.expire_session();
        Ok(())
    }
}
