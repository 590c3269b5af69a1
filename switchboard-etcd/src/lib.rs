//! etcd-backed registry for `switchboard` (companion crate).
//!
//! Maps the registry contract onto an etcd cluster: persistent nodes are
//! plain keys, ephemeral nodes are keys bound to a session lease that a
//! background task keeps alive. When the process dies, the lease
//! expires and every ephemeral node disappears with it, which is the
//! liveness signal consumers rely on.

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, PutOptions};
use rand::Rng;
use std::time::Duration;
use switchboard::registry::{CreateMode, Registry, RegistryError, CONNECT_WAIT, SESSION_TIMEOUT};
use tokio::sync::Mutex;

struct EtcdSession {
    client: Client,
    lease_id: i64,
}

/// Registry client over a set of etcd endpoints.
pub struct EtcdRegistry {
    endpoints: Vec<String>,
    session: Mutex<Option<EtcdSession>>,
}

impl std::fmt::Debug for EtcdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdRegistry").field("endpoints", &self.endpoints).finish()
    }
}

impl EtcdRegistry {
    /// `endpoints` in `host:port` or URL form, e.g. from the
    /// `zookeeperip`/`zookeeperport` config keys.
    pub fn new(endpoints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            session: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<(Client, i64), RegistryError> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(s) => Ok((s.client.clone(), s.lease_id)),
            None => Err(RegistryError::Session("registry not started".into())),
        }
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn start(&self) -> Result<(), RegistryError> {
        let options = ConnectOptions::new()
            .with_connect_timeout(CONNECT_WAIT)
            .with_timeout(Duration::from_secs(5));

        // Connect counts as the session-established signal; give it the
        // same bounded wait the watcher semaphore had.
        let mut client =
            tokio::time::timeout(CONNECT_WAIT, Client::connect(&self.endpoints, Some(options)))
                .await
                .map_err(|_| RegistryError::Timeout(CONNECT_WAIT))?
                .map_err(|e| RegistryError::Session(e.to_string()))?;

        let lease = client
            .lease_grant(SESSION_TIMEOUT.as_secs() as i64, None)
            .await
            .map_err(|e| RegistryError::Session(e.to_string()))?;
        let lease_id = lease.id();

        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| RegistryError::Session(e.to_string()))?;
        tokio::spawn(async move {
            // A third of the TTL keeps the lease comfortably alive.
            let mut ticker = tokio::time::interval(SESSION_TIMEOUT / 3);
            loop {
                ticker.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    tracing::error!(lease_id, error = %e, "lease keep-alive failed");
                    return;
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        tracing::warn!(lease_id, "lease keep-alive stream closed");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(lease_id, error = %e, "lease keep-alive stream error");
                        return;
                    }
                }
            }
        });

        *self.session.lock().await = Some(EtcdSession { client, lease_id });
        tracing::info!(endpoints = ?self.endpoints, lease_id, "registry session established");
        Ok(())
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), RegistryError> {
        let (mut client, lease_id) = self.client().await?;

        // Create-if-absent: an existing node is left untouched.
        let existing = client
            .get(path, None)
            .await
            .map_err(|e| RegistryError::Session(e.to_string()))?;
        if !existing.kvs().is_empty() {
            return Ok(());
        }

        let options = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(PutOptions::new().with_lease(lease_id)),
        };
        client
            .put(path, data.to_vec(), options)
            .await
            .map_err(|e| RegistryError::Session(e.to_string()))?;
        tracing::info!(path, ?mode, "registry node created");
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<String, RegistryError> {
        let (mut client, _) = self.client().await?;
        let resp = client
            .get(path, None)
            .await
            .map_err(|e| RegistryError::Session(e.to_string()))?;
        match resp.kvs().first() {
            Some(kv) => {
                let value = kv
                    .value_str()
                    .map_err(|e| RegistryError::Session(e.to_string()))?;
                if value.is_empty() {
                    Err(RegistryError::Missing(path.to_string()))
                } else {
                    Ok(value.to_string())
                }
            }
            None => Err(RegistryError::Missing(path.to_string())),
        }
    }

    async fn reconnect(&self) -> Result<(), RegistryError> {
        if let Some(mut session) = self.session.lock().await.take() {
            // Best effort: let the old lease (and its ephemerals) go.
            let _ = session.client.lease_revoke(session.lease_id).await;
        }
        // Brief jittered pause so a flapping cluster is not hammered.
        let backoff = Duration::from_millis(rand::rng().random_range(100..500));
        tokio::time::sleep(backoff).await;
        self.start().await
    }
}
