//! Domain services published over the framed RPC, plus their
//! consumer-side stubs.
//!
//! Each service is a thin shell over a store contract; the gateway never
//! touches a store directly, it goes through a stub and the RPC channel.

pub mod message;
pub mod relation;
pub mod user;

pub use message::{MessageService, MessageStub, MESSAGE_SERVICE};
pub use relation::{RelationService, RelationStub, RELATION_SERVICE};
pub use user::{UserService, UserStub, USER_SERVICE};

use serde::{Deserialize, Serialize};

/// Outcome carried by every service response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCode {
    pub errcode: i32,
    pub errmsg: String,
}

impl ResultCode {
    pub fn ok() -> Self {
        Self { errcode: 0, errmsg: String::new() }
    }

    pub fn err(errcode: i32, errmsg: impl Into<String>) -> Self {
        Self { errcode, errmsg: errmsg.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.errcode == 0
    }
}

/// Store failures surface as `errcode 1` on the reply.
pub(crate) fn store_err(e: crate::store::StoreError) -> ResultCode {
    ResultCode::err(1, e.to_string())
}
