//! Domain store contracts.
//!
//! The SQL layer itself is an external collaborator; these traits are
//! its contract, and the in-memory implementations here back tests and
//! single-process deployments. Production bindings sit behind the
//! connection pool and implement the same traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::sync::Mutex;

pub const STATE_ONLINE: &str = "online";
pub const STATE_OFFLINE: &str = "offline";

pub const ROLE_CREATOR: &str = "creator";
pub const ROLE_NORMAL: &str = "normal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i32,
    pub name: String,
    pub password: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: i32,
    pub name: String,
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: i32,
    pub name: String,
    pub state: String,
    pub role: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record not found")]
    NotFound,
    #[error("duplicate record")]
    Duplicate,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user, assigning its id.
    async fn insert(&self, name: &str, password: &str) -> Result<UserRecord, StoreError>;
    async fn query(&self, id: i32) -> Result<Option<UserRecord>, StoreError>;
    async fn update_state(&self, id: i32, state: &str) -> Result<(), StoreError>;
    /// Flip every online user back to offline (crash/shutdown reset).
    async fn reset_all_online(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FriendStore: Send + Sync {
    async fn insert(&self, user_id: i32, friend_id: i32) -> Result<(), StoreError>;
    /// Friend list with live user state.
    async fn query(&self, user_id: i32) -> Result<Vec<UserRecord>, StoreError>;
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn create_group(&self, name: &str, desc: &str) -> Result<GroupRecord, StoreError>;
    async fn add_member(&self, user_id: i32, group_id: i32, role: &str) -> Result<(), StoreError>;
    /// Every group the user belongs to, with the member roster.
    async fn groups_for(&self, user_id: i32) -> Result<Vec<(GroupRecord, Vec<GroupMember>)>, StoreError>;
    /// Member ids of a group, excluding `user_id` (the sender).
    async fn members_excluding(&self, user_id: i32, group_id: i32) -> Result<Vec<i32>, StoreError>;
}

#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn insert(&self, user_id: i32, message: &str) -> Result<(), StoreError>;
    async fn query(&self, user_id: i32) -> Result<Vec<String>, StoreError>;
    async fn remove(&self, user_id: i32) -> Result<(), StoreError>;
}

/// In-memory user table.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<i32, UserRecord>>,
    next_id: AtomicI32,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self { users: Mutex::new(HashMap::new()), next_id: AtomicI32::new(1000) }
    }

    /// Install a record verbatim (test fixtures).
    pub async fn seed(&self, record: UserRecord) {
        let mut users = self.users.lock().await;
        self.next_id.fetch_max(record.id + 1, Ordering::SeqCst);
        users.insert(record.id, record);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn insert(&self, name: &str, password: &str) -> Result<UserRecord, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = UserRecord {
            id,
            name: name.to_string(),
            password: password.to_string(),
            state: STATE_OFFLINE.to_string(),
        };
        self.users.lock().await.insert(id, record.clone());
        Ok(record)
    }

    async fn query(&self, id: i32) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.lock().await.get(&id).cloned())
    }

    async fn update_state(&self, id: i32, state: &str) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        let user = users.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.state = state.to_string();
        Ok(())
    }

    async fn reset_all_online(&self) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        for user in users.values_mut() {
            if user.state == STATE_ONLINE {
                user.state = STATE_OFFLINE.to_string();
            }
        }
        Ok(())
    }
}

/// In-memory friend edges. Edges are stored one-directional.
#[derive(Debug)]
pub struct MemoryFriendStore {
    edges: Mutex<HashMap<i32, Vec<i32>>>,
    users: std::sync::Arc<MemoryUserStore>,
}

impl MemoryFriendStore {
    pub fn new(users: std::sync::Arc<MemoryUserStore>) -> Self {
        Self { edges: Mutex::new(HashMap::new()), users }
    }
}

#[async_trait]
impl FriendStore for MemoryFriendStore {
    async fn insert(&self, user_id: i32, friend_id: i32) -> Result<(), StoreError> {
        if self.users.query(friend_id).await?.is_none() {
            return Err(StoreError::NotFound);
        }
        let mut edges = self.edges.lock().await;
        let list = edges.entry(user_id).or_default();
        if list.contains(&friend_id) {
            return Err(StoreError::Duplicate);
        }
        list.push(friend_id);
        Ok(())
    }

    async fn query(&self, user_id: i32) -> Result<Vec<UserRecord>, StoreError> {
        let ids = self.edges.lock().await.get(&user_id).cloned().unwrap_or_default();
        let mut friends = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.users.query(id).await? {
                friends.push(user);
            }
        }
        Ok(friends)
    }
}

/// In-memory groups and memberships.
#[derive(Debug)]
pub struct MemoryGroupStore {
    groups: Mutex<HashMap<i32, GroupRecord>>,
    members: Mutex<HashMap<i32, Vec<(i32, String)>>>,
    users: std::sync::Arc<MemoryUserStore>,
    next_id: AtomicI32,
}

impl MemoryGroupStore {
    pub fn new(users: std::sync::Arc<MemoryUserStore>) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
            users,
            next_id: AtomicI32::new(1),
        }
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn create_group(&self, name: &str, desc: &str) -> Result<GroupRecord, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = GroupRecord { id, name: name.to_string(), desc: desc.to_string() };
        self.groups.lock().await.insert(id, record.clone());
        Ok(record)
    }

    async fn add_member(&self, user_id: i32, group_id: i32, role: &str) -> Result<(), StoreError> {
        if !self.groups.lock().await.contains_key(&group_id) {
            return Err(StoreError::NotFound);
        }
        let mut members = self.members.lock().await;
        let roster = members.entry(group_id).or_default();
        if roster.iter().any(|(id, _)| *id == user_id) {
            return Err(StoreError::Duplicate);
        }
        roster.push((user_id, role.to_string()));
        Ok(())
    }

    async fn groups_for(&self, user_id: i32) -> Result<Vec<(GroupRecord, Vec<GroupMember>)>, StoreError> {
        let groups = self.groups.lock().await.clone();
        let members = self.members.lock().await.clone();
        let mut out = Vec::new();
        for (group_id, roster) in &members {
            if !roster.iter().any(|(id, _)| *id == user_id) {
                continue;
            }
            let Some(group) = groups.get(group_id) else { continue };
            let mut full_roster = Vec::with_capacity(roster.len());
            for (id, role) in roster {
                if let Some(user) = self.users.query(*id).await? {
                    full_roster.push(GroupMember {
                        id: user.id,
                        name: user.name,
                        state: user.state,
                        role: role.clone(),
                    });
                }
            }
            out.push((group.clone(), full_roster));
        }
        out.sort_by_key(|(g, _)| g.id);
        Ok(out)
    }

    async fn members_excluding(&self, user_id: i32, group_id: i32) -> Result<Vec<i32>, StoreError> {
        let members = self.members.lock().await;
        let roster = members.get(&group_id).ok_or(StoreError::NotFound)?;
        Ok(roster.iter().map(|(id, _)| *id).filter(|id| *id != user_id).collect())
    }
}

/// In-memory offline mailbox.
#[derive(Debug, Default)]
pub struct MemoryOfflineStore {
    mailboxes: Mutex<HashMap<i32, Vec<String>>>,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn insert(&self, user_id: i32, message: &str) -> Result<(), StoreError> {
        self.mailboxes.lock().await.entry(user_id).or_default().push(message.to_string());
        Ok(())
    }

    async fn query(&self, user_id: i32) -> Result<Vec<String>, StoreError> {
        Ok(self.mailboxes.lock().await.get(&user_id).cloned().unwrap_or_default())
    }

    async fn remove(&self, user_id: i32) -> Result<(), StoreError> {
        self.mailboxes.lock().await.remove(&user_id);
        Ok(())
    }
}
