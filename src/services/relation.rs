//! Relation service: friends, groups, memberships.

use crate::rpc::{decode_args, encode_reply, DispatchError, RpcChannel, RpcError, RpcService};
use crate::services::{store_err, ResultCode};
use crate::store::{FriendStore, GroupMember, GroupStore, ROLE_CREATOR, ROLE_NORMAL};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const RELATION_SERVICE: &str = "RelationService";

pub mod methods {
    pub const ADD_FRIEND: &str = "AddFriend";
    pub const CREATE_GROUP: &str = "CreateGroup";
    pub const ADD_GROUP: &str = "AddGroup";
    pub const GET_FRIENDS: &str = "GetFriends";
    pub const GET_GROUPS: &str = "GetGroups";
    pub const GET_GROUP_USERS: &str = "GetGroupUsers";

    pub const ALL: &[&str] =
        &[ADD_FRIEND, CREATE_GROUP, ADD_GROUP, GET_FRIENDS, GET_GROUPS, GET_GROUP_USERS];
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddFriendRequest {
    pub id: i32,
    pub friendid: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub id: i32,
    pub groupname: String,
    pub groupdesc: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGroupResponse {
    pub result: ResultCode,
    pub groupid: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddGroupRequest {
    pub id: i32,
    pub groupid: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetFriendsRequest {
    pub id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FriendInfo {
    pub id: i32,
    pub name: String,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetFriendsResponse {
    pub result: ResultCode,
    pub friends: Vec<FriendInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetGroupsRequest {
    pub id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupInfo {
    pub groupid: i32,
    pub groupname: String,
    pub groupdesc: String,
    pub members: Vec<GroupMember>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetGroupsResponse {
    pub result: ResultCode,
    pub groups: Vec<GroupInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetGroupUsersRequest {
    pub id: i32,
    pub groupid: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetGroupUsersResponse {
    pub result: ResultCode,
    pub user_ids: Vec<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub result: ResultCode,
}

/// Provider-side implementation over friend and group stores.
pub struct RelationService {
    friends: Arc<dyn FriendStore>,
    groups: Arc<dyn GroupStore>,
}

impl RelationService {
    pub fn new(friends: Arc<dyn FriendStore>, groups: Arc<dyn GroupStore>) -> Self {
        Self { friends, groups }
    }

    async fn add_friend(&self, req: AddFriendRequest) -> StatusResponse {
        match self.friends.insert(req.id, req.friendid).await {
            Ok(()) => StatusResponse { result: ResultCode::ok() },
            Err(e) => StatusResponse { result: store_err(e) },
        }
    }

    /// Creates the group and enrolls the creator with the creator role.
    async fn create_group(&self, req: CreateGroupRequest) -> CreateGroupResponse {
        let group = match self.groups.create_group(&req.groupname, &req.groupdesc).await {
            Ok(group) => group,
            Err(e) => return CreateGroupResponse { result: store_err(e), groupid: 0 },
        };
        match self.groups.add_member(req.id, group.id, ROLE_CREATOR).await {
            Ok(()) => CreateGroupResponse { result: ResultCode::ok(), groupid: group.id },
            Err(e) => CreateGroupResponse { result: store_err(e), groupid: group.id },
        }
    }

    async fn add_group(&self, req: AddGroupRequest) -> StatusResponse {
        match self.groups.add_member(req.id, req.groupid, ROLE_NORMAL).await {
            Ok(()) => StatusResponse { result: ResultCode::ok() },
            Err(e) => StatusResponse { result: store_err(e) },
        }
    }

    async fn get_friends(&self, req: GetFriendsRequest) -> GetFriendsResponse {
        match self.friends.query(req.id).await {
            Ok(users) => GetFriendsResponse {
                result: ResultCode::ok(),
                friends: users
                    .into_iter()
                    .map(|u| FriendInfo { id: u.id, name: u.name, state: u.state })
                    .collect(),
            },
            Err(e) => GetFriendsResponse { result: store_err(e), friends: vec![] },
        }
    }

    async fn get_groups(&self, req: GetGroupsRequest) -> GetGroupsResponse {
        match self.groups.groups_for(req.id).await {
            Ok(listing) => GetGroupsResponse {
                result: ResultCode::ok(),
                groups: listing
                    .into_iter()
                    .map(|(group, members)| GroupInfo {
                        groupid: group.id,
                        groupname: group.name,
                        groupdesc: group.desc,
                        members,
                    })
                    .collect(),
            },
            Err(e) => GetGroupsResponse { result: store_err(e), groups: vec![] },
        }
    }

    async fn get_group_users(&self, req: GetGroupUsersRequest) -> GetGroupUsersResponse {
        match self.groups.members_excluding(req.id, req.groupid).await {
            Ok(user_ids) => GetGroupUsersResponse { result: ResultCode::ok(), user_ids },
            Err(e) => GetGroupUsersResponse { result: store_err(e), user_ids: vec![] },
        }
    }
}

#[async_trait]
impl RpcService for RelationService {
    fn service_name(&self) -> &'static str {
        RELATION_SERVICE
    }

    fn method_names(&self) -> &'static [&'static str] {
        methods::ALL
    }

    async fn dispatch(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, DispatchError> {
        match method {
            methods::ADD_FRIEND => encode_reply(&self.add_friend(decode_args(args)?).await),
            methods::CREATE_GROUP => encode_reply(&self.create_group(decode_args(args)?).await),
            methods::ADD_GROUP => encode_reply(&self.add_group(decode_args(args)?).await),
            methods::GET_FRIENDS => encode_reply(&self.get_friends(decode_args(args)?).await),
            methods::GET_GROUPS => encode_reply(&self.get_groups(decode_args(args)?).await),
            methods::GET_GROUP_USERS => {
                encode_reply(&self.get_group_users(decode_args(args)?).await)
            }
            other => Err(DispatchError::UnknownMethod(other.to_string())),
        }
    }
}

/// Consumer-side stub.
#[derive(Debug, Clone)]
pub struct RelationStub {
    channel: RpcChannel,
}

impl RelationStub {
    pub fn new(channel: RpcChannel) -> Self {
        Self { channel }
    }

    pub async fn add_friend(&self, id: i32, friendid: i32) -> Result<StatusResponse, RpcError> {
        self.channel
            .call(RELATION_SERVICE, methods::ADD_FRIEND, id, &AddFriendRequest { id, friendid })
            .await
    }

    pub async fn create_group(
        &self,
        id: i32,
        groupname: &str,
        groupdesc: &str,
    ) -> Result<CreateGroupResponse, RpcError> {
        self.channel
            .call(
                RELATION_SERVICE,
                methods::CREATE_GROUP,
                id,
                &CreateGroupRequest {
                    id,
                    groupname: groupname.into(),
                    groupdesc: groupdesc.into(),
                },
            )
            .await
    }

    pub async fn add_group(&self, id: i32, groupid: i32) -> Result<StatusResponse, RpcError> {
        self.channel
            .call(RELATION_SERVICE, methods::ADD_GROUP, id, &AddGroupRequest { id, groupid })
            .await
    }

    pub async fn get_friends(&self, id: i32) -> Result<GetFriendsResponse, RpcError> {
        self.channel
            .call(RELATION_SERVICE, methods::GET_FRIENDS, id, &GetFriendsRequest { id })
            .await
    }

    pub async fn get_groups(&self, id: i32) -> Result<GetGroupsResponse, RpcError> {
        self.channel.call(RELATION_SERVICE, methods::GET_GROUPS, id, &GetGroupsRequest { id }).await
    }

    pub async fn get_group_users(
        &self,
        id: i32,
        groupid: i32,
    ) -> Result<GetGroupUsersResponse, RpcError> {
        self.channel
            .call(
                RELATION_SERVICE,
                methods::GET_GROUP_USERS,
                id,
                &GetGroupUsersRequest { id, groupid },
            )
            .await
    }
}
