//! User service: credentials, presence state, account lookup.

use crate::rpc::{decode_args, encode_reply, DispatchError, RpcChannel, RpcError, RpcService};
use crate::services::{store_err, ResultCode};
use crate::store::{UserStore, STATE_OFFLINE, STATE_ONLINE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const USER_SERVICE: &str = "UserService";

pub mod methods {
    pub const LOGIN: &str = "Login";
    pub const REGISTER: &str = "Register";
    pub const LOGOUT: &str = "Logout";
    pub const GET_USER_INFO: &str = "GetUserInfo";
    pub const UPDATE_USER_STATE: &str = "UpdateUserState";

    pub const ALL: &[&str] = &[LOGIN, REGISTER, LOGOUT, GET_USER_INFO, UPDATE_USER_STATE];
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub id: i32,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub result: ResultCode,
    pub id: i32,
    pub name: String,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub result: ResultCode,
    pub id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetUserInfoRequest {
    pub id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetUserInfoResponse {
    pub result: ResultCode,
    pub id: i32,
    pub name: String,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateUserStateRequest {
    pub id: i32,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub result: ResultCode,
}

/// Provider-side implementation over a [`UserStore`].
pub struct UserService {
    users: Arc<dyn UserStore>,
}

impl UserService {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    async fn login(&self, req: LoginRequest) -> LoginResponse {
        let denied = |result| LoginResponse { result, id: 0, name: String::new(), state: String::new() };
        let user = match self.users.query(req.id).await {
            Ok(user) => user,
            Err(e) => return denied(store_err(e)),
        };
        match user {
            Some(user) if user.password == req.password => {
                if user.state == STATE_ONLINE {
                    denied(ResultCode::err(2, "this account is using, input another!"))
                } else if let Err(e) = self.users.update_state(user.id, STATE_ONLINE).await {
                    denied(store_err(e))
                } else {
                    tracing::info!(id = user.id, "user logged in");
                    LoginResponse {
                        result: ResultCode::ok(),
                        id: user.id,
                        name: user.name,
                        state: STATE_ONLINE.to_string(),
                    }
                }
            }
            _ => denied(ResultCode::err(1, "id or password is invalid!")),
        }
    }

    async fn register(&self, req: RegisterRequest) -> RegisterResponse {
        match self.users.insert(&req.name, &req.password).await {
            Ok(user) => {
                tracing::info!(id = user.id, name = %user.name, "user registered");
                RegisterResponse { result: ResultCode::ok(), id: user.id }
            }
            Err(e) => RegisterResponse { result: store_err(e), id: 0 },
        }
    }

    async fn logout(&self, req: LogoutRequest) -> StatusResponse {
        match self.users.update_state(req.id, STATE_OFFLINE).await {
            Ok(()) => StatusResponse { result: ResultCode::ok() },
            Err(e) => StatusResponse { result: store_err(e) },
        }
    }

    async fn get_user_info(&self, req: GetUserInfoRequest) -> GetUserInfoResponse {
        match self.users.query(req.id).await {
            Ok(Some(user)) => GetUserInfoResponse {
                result: ResultCode::ok(),
                id: user.id,
                name: user.name,
                state: user.state,
            },
            Ok(None) => GetUserInfoResponse {
                result: ResultCode::err(1, "user not found"),
                id: req.id,
                name: String::new(),
                state: String::new(),
            },
            Err(e) => GetUserInfoResponse {
                result: store_err(e),
                id: req.id,
                name: String::new(),
                state: String::new(),
            },
        }
    }

    async fn update_user_state(&self, req: UpdateUserStateRequest) -> StatusResponse {
        match self.users.update_state(req.id, &req.state).await {
            Ok(()) => StatusResponse { result: ResultCode::ok() },
            Err(e) => StatusResponse { result: store_err(e) },
        }
    }
}

#[async_trait]
impl RpcService for UserService {
    fn service_name(&self) -> &'static str {
        USER_SERVICE
    }

    fn method_names(&self) -> &'static [&'static str] {
        methods::ALL
    }

    async fn dispatch(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, DispatchError> {
        match method {
            methods::LOGIN => encode_reply(&self.login(decode_args(args)?).await),
            methods::REGISTER => encode_reply(&self.register(decode_args(args)?).await),
            methods::LOGOUT => encode_reply(&self.logout(decode_args(args)?).await),
            methods::GET_USER_INFO => encode_reply(&self.get_user_info(decode_args(args)?).await),
            methods::UPDATE_USER_STATE => {
                encode_reply(&self.update_user_state(decode_args(args)?).await)
            }
            other => Err(DispatchError::UnknownMethod(other.to_string())),
        }
    }
}

/// Consumer-side stub.
#[derive(Debug, Clone)]
pub struct UserStub {
    channel: RpcChannel,
}

impl UserStub {
    pub fn new(channel: RpcChannel) -> Self {
        Self { channel }
    }

    pub async fn login(&self, id: i32, password: &str) -> Result<LoginResponse, RpcError> {
        self.channel
            .call(USER_SERVICE, methods::LOGIN, id, &LoginRequest { id, password: password.into() })
            .await
    }

    pub async fn register(&self, name: &str, password: &str) -> Result<RegisterResponse, RpcError> {
        self.channel
            .call(
                USER_SERVICE,
                methods::REGISTER,
                0,
                &RegisterRequest { name: name.into(), password: password.into() },
            )
            .await
    }

    pub async fn logout(&self, id: i32) -> Result<StatusResponse, RpcError> {
        self.channel.call(USER_SERVICE, methods::LOGOUT, id, &LogoutRequest { id }).await
    }

    pub async fn get_user_info(&self, id: i32) -> Result<GetUserInfoResponse, RpcError> {
        self.channel.call(USER_SERVICE, methods::GET_USER_INFO, id, &GetUserInfoRequest { id }).await
    }

    pub async fn update_user_state(&self, id: i32, state: &str) -> Result<StatusResponse, RpcError> {
        self.channel
            .call(
                USER_SERVICE,
                methods::UPDATE_USER_STATE,
                id,
                &UpdateUserStateRequest { id, state: state.into() },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryUserStore, UserRecord};

    async fn service_with_user(state: &str) -> UserService {
        let store = Arc::new(MemoryUserStore::new());
        store
            .seed(UserRecord {
                id: 1001,
                name: "zhang san".into(),
                password: "abc".into(),
                state: state.into(),
            })
            .await;
        UserService::new(store)
    }

    #[tokio::test]
    async fn login_success_marks_online() {
        let svc = service_with_user(STATE_OFFLINE).await;
        let resp = svc.login(LoginRequest { id: 1001, password: "abc".into() }).await;
        assert!(resp.result.is_ok());
        assert_eq!(resp.id, 1001);
        assert_eq!(resp.state, STATE_ONLINE);

        let info = svc.get_user_info(GetUserInfoRequest { id: 1001 }).await;
        assert_eq!(info.state, STATE_ONLINE);
    }

    #[tokio::test]
    async fn login_wrong_password_is_errno_1() {
        let svc = service_with_user(STATE_OFFLINE).await;
        let resp = svc.login(LoginRequest { id: 1001, password: "nope".into() }).await;
        assert_eq!(resp.result.errcode, 1);
        assert_eq!(resp.result.errmsg, "id or password is invalid!");
    }

    #[tokio::test]
    async fn login_while_online_is_errno_2() {
        let svc = service_with_user(STATE_ONLINE).await;
        let resp = svc.login(LoginRequest { id: 1001, password: "abc".into() }).await;
        assert_eq!(resp.result.errcode, 2);
        assert_eq!(resp.result.errmsg, "this account is using, input another!");
    }

    #[tokio::test]
    async fn register_assigns_id_and_logout_goes_offline() {
        let store = Arc::new(MemoryUserStore::new());
        let svc = UserService::new(store.clone());

        let reg = svc.register(RegisterRequest { name: "li si".into(), password: "pw".into() }).await;
        assert!(reg.result.is_ok());

        store.update_state(reg.id, STATE_ONLINE).await.unwrap();
        let out = svc.logout(LogoutRequest { id: reg.id }).await;
        assert!(out.result.is_ok());
        assert_eq!(store.query(reg.id).await.unwrap().unwrap().state, STATE_OFFLINE);
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_method() {
        let svc = service_with_user(STATE_OFFLINE).await;
        let err = svc.dispatch("Nope", b"{}").await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownMethod(_)));
    }

    #[tokio::test]
    async fn dispatch_round_trips_json() {
        let svc = service_with_user(STATE_OFFLINE).await;
        let args = serde_json::to_vec(&LoginRequest { id: 1001, password: "abc".into() }).unwrap();
        let reply = svc.dispatch(methods::LOGIN, &args).await.unwrap();
        let resp: LoginResponse = serde_json::from_slice(&reply).unwrap();
        assert!(resp.result.is_ok());
    }
}
