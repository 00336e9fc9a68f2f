use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::ConstructionError;

/// Store-assigned row identifier.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Id(pub i64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for Id {
    fn from(raw: i64) -> Self {
        Id(raw)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: Option<Id>,
    pub name: String,
    pub password_hash: String,
}

impl User {
    pub fn new(name: impl Into<String>, password_hash: impl Into<String>) -> Self {
        User {
            id: None,
            name: name.into(),
            password_hash: password_hash.into(),
        }
    }

    pub fn is_saved(&self) -> bool {
        self.id.is_some()
    }
}

/// A chat message. Fields stay public for the repositories and transport;
/// the store re-checks [`Message::validate`] before every insert.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "RawMessage")]
pub struct Message {
    pub id: Option<Id>,
    pub chat_id: Id,
    pub sender_id: Id,
    pub text: String,
    /// Set by the store on insert.
    pub sent_at: Option<NaiveDateTime>,
    pub read: bool,
}

impl Message {
    pub fn new(chat_id: Id, sender_id: Id, text: impl Into<String>) -> Result<Self, ConstructionError> {
        let message = Message {
            id: None,
            chat_id,
            sender_id,
            text: text.into(),
            sent_at: None,
            read: false,
        };
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), ConstructionError> {
        if self.text.is_empty() {
            return Err(ConstructionError::EmptyMessageText);
        }
        Ok(())
    }

    pub fn is_saved(&self) -> bool {
        self.id.is_some()
    }
}

#[derive(Deserialize)]
struct RawMessage {
    id: Option<Id>,
    chat_id: Id,
    sender_id: Id,
    text: String,
    sent_at: Option<NaiveDateTime>,
    read: bool,
}

impl TryFrom<RawMessage> for Message {
    type Error = ConstructionError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let message = Message {
            id: raw.id,
            chat_id: raw.chat_id,
            sender_id: raw.sender_id,
            text: raw.text,
            sent_at: raw.sent_at,
            read: raw.read,
        };
        message.validate()?;
        Ok(message)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Personal,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Personal => "personal",
            ChatKind::Group => "group",
        }
    }
}

impl fmt::Display for ChatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChatKind(pub String);

impl fmt::Display for UnknownChatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown chat type '{}'", self.0)
    }
}

impl std::error::Error for UnknownChatKind {}

impl FromStr for ChatKind {
    type Err = UnknownChatKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "personal" => Ok(ChatKind::Personal),
            "group" => Ok(ChatKind::Group),
            other => Err(UnknownChatKind(other.to_string())),
        }
    }
}

/// A personal or group chat. Members are kept as a set ordered by id, which
/// is also the order the store hands them back in.
///
/// The fields are private so every `Chat` in existence has passed
/// [`Chat::new`]'s checks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "RawChat")]
pub struct Chat {
    id: Option<Id>,
    kind: ChatKind,
    name: Option<String>,
    members: BTreeSet<Id>,
}

impl Chat {
    pub fn new<I>(kind: ChatKind, name: Option<String>, members: I) -> Result<Self, ConstructionError>
    where
        I: IntoIterator<Item = Id>,
    {
        let members: BTreeSet<Id> = members.into_iter().collect();
        validate(kind, name.as_deref(), members.len())?;
        Ok(Chat {
            id: None,
            kind,
            name,
            members,
        })
    }

    pub fn personal(first: Id, second: Id) -> Result<Self, ConstructionError> {
        Chat::new(ChatKind::Personal, None, [first, second])
    }

    pub fn group<I>(name: impl Into<String>, members: I) -> Result<Self, ConstructionError>
    where
        I: IntoIterator<Item = Id>,
    {
        Chat::new(ChatKind::Group, Some(name.into()), members)
    }

    pub fn id(&self) -> Option<Id> {
        self.id
    }

    pub fn kind(&self) -> ChatKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn members(&self) -> &BTreeSet<Id> {
        &self.members
    }

    pub fn has_member(&self, user_id: Id) -> bool {
        self.members.contains(&user_id)
    }

    pub fn is_saved(&self) -> bool {
        self.id.is_some()
    }

    pub(crate) fn set_id(&mut self, id: Id) {
        self.id = Some(id);
    }

    /// Rebuilds a chat read back from the store, revalidating it.
    pub(crate) fn restore(
        id: Id,
        kind: ChatKind,
        name: Option<String>,
        members: BTreeSet<Id>,
    ) -> Result<Self, ConstructionError> {
        let mut chat = Chat::new(kind, name, members)?;
        chat.id = Some(id);
        Ok(chat)
    }
}

#[derive(Deserialize)]
struct RawChat {
    id: Option<Id>,
    kind: ChatKind,
    name: Option<String>,
    members: BTreeSet<Id>,
}

impl TryFrom<RawChat> for Chat {
    type Error = ConstructionError;

    fn try_from(raw: RawChat) -> Result<Self, Self::Error> {
        let mut chat = Chat::new(raw.kind, raw.name, raw.members)?;
        chat.id = raw.id;
        Ok(chat)
    }
}

/// Checks the member-count and naming rules for a chat of `kind`.
pub fn validate(kind: ChatKind, name: Option<&str>, member_count: usize) -> Result<(), ConstructionError> {
    if member_count == 0 {
        return Err(ConstructionError::NoMembers);
    }
    match kind {
        ChatKind::Personal => {
            if member_count != 2 {
                return Err(ConstructionError::PersonalMemberCount(member_count));
            }
            if name.is_some() {
                return Err(ConstructionError::PersonalChatNamed);
            }
        }
        ChatKind::Group => {
            if name.map_or(true, str::is_empty) {
                return Err(ConstructionError::GroupChatUnnamed);
            }
        }
    }
    Ok(())
}
