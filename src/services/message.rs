//! Message service: the persisted offline mailbox.

use crate::rpc::{decode_args, encode_reply, DispatchError, RpcChannel, RpcError, RpcService};
use crate::services::{store_err, ResultCode};
use crate::store::OfflineStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MESSAGE_SERVICE: &str = "MessageService";

pub mod methods {
    pub const STORE_OFFLINE_MESSAGE: &str = "StoreOfflineMessage";
    pub const PULL_OFFLINE_MESSAGES: &str = "PullOfflineMessages";

    pub const ALL: &[&str] = &[STORE_OFFLINE_MESSAGE, PULL_OFFLINE_MESSAGES];
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreOfflineMessageRequest {
    pub id: i32,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreOfflineMessageResponse {
    pub result: ResultCode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullOfflineMessagesRequest {
    pub id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullOfflineMessagesResponse {
    pub result: ResultCode,
    pub messages: Vec<String>,
}

/// Provider-side implementation over an [`OfflineStore`].
pub struct MessageService {
    mailboxes: Arc<dyn OfflineStore>,
}

impl MessageService {
    pub fn new(mailboxes: Arc<dyn OfflineStore>) -> Self {
        Self { mailboxes }
    }

    async fn store(&self, req: StoreOfflineMessageRequest) -> StoreOfflineMessageResponse {
        match self.mailboxes.insert(req.id, &req.message).await {
            Ok(()) => StoreOfflineMessageResponse { result: ResultCode::ok() },
            Err(e) => StoreOfflineMessageResponse { result: store_err(e) },
        }
    }

    /// Read-then-clear: the reply owns the mailbox contents.
    async fn pull(&self, req: PullOfflineMessagesRequest) -> PullOfflineMessagesResponse {
        let messages = match self.mailboxes.query(req.id).await {
            Ok(messages) => messages,
            Err(e) => return PullOfflineMessagesResponse { result: store_err(e), messages: vec![] },
        };
        if !messages.is_empty() {
            if let Err(e) = self.mailboxes.remove(req.id).await {
                return PullOfflineMessagesResponse { result: store_err(e), messages: vec![] };
            }
        }
        PullOfflineMessagesResponse { result: ResultCode::ok(), messages }
    }
}

#[async_trait]
impl RpcService for MessageService {
    fn service_name(&self) -> &'static str {
        MESSAGE_SERVICE
    }

    fn method_names(&self) -> &'static [&'static str] {
        methods::ALL
    }

    async fn dispatch(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, DispatchError> {
        match method {
            methods::STORE_OFFLINE_MESSAGE => encode_reply(&self.store(decode_args(args)?).await),
            methods::PULL_OFFLINE_MESSAGES => encode_reply(&self.pull(decode_args(args)?).await),
            other => Err(DispatchError::UnknownMethod(other.to_string())),
        }
    }
}

/// Consumer-side stub.
#[derive(Debug, Clone)]
pub struct MessageStub {
    channel: RpcChannel,
}

impl MessageStub {
    pub fn new(channel: RpcChannel) -> Self {
        Self { channel }
    }

    pub async fn store_offline_message(
        &self,
        id: i32,
        message: &str,
    ) -> Result<StoreOfflineMessageResponse, RpcError> {
        self.channel
            .call(
                MESSAGE_SERVICE,
                methods::STORE_OFFLINE_MESSAGE,
                id,
                &StoreOfflineMessageRequest { id, message: message.into() },
            )
            .await
    }

    pub async fn pull_offline_messages(
        &self,
        id: i32,
    ) -> Result<PullOfflineMessagesResponse, RpcError> {
        self.channel
            .call(
                MESSAGE_SERVICE,
                methods::PULL_OFFLINE_MESSAGES,
                id,
                &PullOfflineMessagesRequest { id },
            )
            .await
    }
}
