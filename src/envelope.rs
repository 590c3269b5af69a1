//! Client-facing JSON envelope: message ids and field helpers.
//!
//! Clients send complete JSON objects; the `msgid` field selects the
//! handler. The id table below is frozen: wire stability matters more
//! than contiguity.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgId {
    Login = 1,
    LoginAck = 2,
    Register = 3,
    RegisterAck = 4,
    Logout = 5,
    LogoutAck = 6,
    OneChat = 7,
    OneChatAck = 8,
    AddFriend = 9,
    CreateGroup = 10,
    AddGroup = 11,
    GroupChat = 12,
    GroupChatAck = 13,
    Error = 14,
}

impl MsgId {
    pub fn from_i64(raw: i64) -> Option<Self> {
        Some(match raw {
            1 => Self::Login,
            2 => Self::LoginAck,
            3 => Self::Register,
            4 => Self::RegisterAck,
            5 => Self::Logout,
            6 => Self::LogoutAck,
            7 => Self::OneChat,
            8 => Self::OneChatAck,
            9 => Self::AddFriend,
            10 => Self::CreateGroup,
            11 => Self::AddGroup,
            12 => Self::GroupChat,
            13 => Self::GroupChatAck,
            14 => Self::Error,
            _ => return None,
        })
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Missing or mistyped envelope fields.
#[derive(Debug, thiserror::Error)]
#[error("envelope field `{0}` missing or wrong type")]
pub struct FieldError(pub &'static str);

pub fn field_i64(js: &Value, key: &'static str) -> Result<i64, FieldError> {
    js.get(key).and_then(Value::as_i64).ok_or(FieldError(key))
}

pub fn field_i32(js: &Value, key: &'static str) -> Result<i32, FieldError> {
    Ok(field_i64(js, key)? as i32)
}

pub fn field_str<'a>(js: &'a Value, key: &'static str) -> Result<&'a str, FieldError> {
    js.get(key).and_then(Value::as_str).ok_or(FieldError(key))
}

/// `{"msgid": 14, "errmsg": ...}`
pub fn error_reply(errmsg: &str) -> Value {
    serde_json::json!({ "msgid": MsgId::Error.as_i64(), "errmsg": errmsg })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_table_is_frozen() {
        assert_eq!(MsgId::Login.as_i64(), 1);
        assert_eq!(MsgId::LoginAck.as_i64(), 2);
        assert_eq!(MsgId::Logout.as_i64(), 5);
        assert_eq!(MsgId::OneChat.as_i64(), 7);
        assert_eq!(MsgId::AddFriend.as_i64(), 9);
        assert_eq!(MsgId::GroupChat.as_i64(), 12);
        assert_eq!(MsgId::GroupChatAck.as_i64(), 13);
        assert_eq!(MsgId::Error.as_i64(), 14);
        for raw in 1..=14 {
            assert_eq!(MsgId::from_i64(raw).unwrap().as_i64(), raw);
        }
        assert!(MsgId::from_i64(0).is_none());
        assert!(MsgId::from_i64(15).is_none());
    }

    #[test]
    fn field_extraction() {
        let js = serde_json::json!({"msgid": 1, "id": 1001, "password": "abc"});
        assert_eq!(field_i64(&js, "msgid").unwrap(), 1);
        assert_eq!(field_i32(&js, "id").unwrap(), 1001);
        assert_eq!(field_str(&js, "password").unwrap(), "abc");
        assert!(field_str(&js, "name").is_err());
        assert!(field_i64(&js, "password").is_err());
    }
}
