use std::collections::BTreeSet;

use log::{debug, warn};
use rusqlite::types::Value;

use crate::error::{ConstructionError, StorageError, StorageResult};
use crate::models::{self, Chat, ChatKind, Id, User};
use crate::params;
use crate::repository::{reported, UserRepository};
use crate::storage::{Engine, Executor, Param, RowStream};

const CHAT_EXISTS: &str = "SELECT 1 FROM Chats WHERE id = ?1";
const USER_EXISTS: &str = "SELECT 1 FROM Users WHERE id = ?1";
const INSERT_CHAT: &str = "INSERT INTO Chats (name, type) VALUES (?1, ?2)";
const INSERT_MEMBER: &str = "INSERT INTO ChatMembers (chat_id, user_id) VALUES (?1, ?2)";
const SELECT_KIND: &str = "SELECT type FROM Chats WHERE id = ?1";
const COUNT_MEMBERS: &str = "SELECT COUNT(*) FROM ChatMembers WHERE chat_id = ?1";

// One row per member; ordering by member id keeps reconstruction deterministic.
const SELECT_CHAT: &str = "
    SELECT c.id, c.name, c.type, m.user_id
    FROM Chats c
    JOIN ChatMembers m ON m.chat_id = c.id
    JOIN Users u ON u.id = m.user_id";

pub struct ChatRepository<'e> {
    engine: &'e Engine,
}

impl<'e> ChatRepository<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        ChatRepository { engine }
    }

    /// Builds a chat from full user records, saving any user that has no id
    /// yet. The chat itself is not saved.
    ///
    /// The chat rules are checked against `users` before anything touches
    /// the store.
    pub fn create_from_users(
        &self,
        kind: ChatKind,
        name: Option<String>,
        users: &mut [User],
    ) -> Result<Chat, ConstructionError> {
        models::validate(kind, name.as_deref(), users.len())?;
        let repo = UserRepository::new(self.engine);
        for user in users.iter_mut().filter(|user| !user.is_saved()) {
            if !repo.save(user) {
                return Err(ConstructionError::UnresolvedMember(user.name.clone()));
            }
        }
        Chat::new(kind, name, users.iter().filter_map(|user| user.id))
    }

    /// Inserts the chat row and one membership row per member in a single
    /// transaction. A chat whose id is already stored is left as is.
    pub fn try_save(&self, chat: &mut Chat) -> StorageResult<Id> {
        let id = self.engine.transaction(|exec| {
            if let Some(id) = chat.id() {
                if exec.exists(CHAT_EXISTS, &params![id])? {
                    debug!("chat {} already stored", id);
                    return Ok(id);
                }
            }
            insert_chat(exec, chat)
        })?;
        chat.set_id(id);
        Ok(id)
    }

    pub fn save(&self, chat: &mut Chat) -> bool {
        reported("save chat", self.try_save(chat)).is_some()
    }

    pub fn try_find(&self, id: Id) -> StorageResult<Option<Chat>> {
        self.find_where("c.id = ?1", id.into())
    }

    pub fn find(&self, id: Id) -> Option<Chat> {
        reported("find chat", self.try_find(id)).flatten()
    }

    /// Looks a chat up by name. Personal chats have none, so this only ever
    /// finds group chats; among equal names the oldest wins.
    pub fn try_find_by_name(&self, name: &str) -> StorageResult<Option<Chat>> {
        self.find_where("c.name = ?1", name.into())
    }

    pub fn find_by_name(&self, name: &str) -> Option<Chat> {
        reported("find chat", self.try_find_by_name(name)).flatten()
    }

    /// Adds `user_id` to a stored group chat. Personal chats keep exactly
    /// two members, and a user already in the chat is refused by the store.
    pub fn try_add_member(&self, chat_id: Id, user_id: Id) -> StorageResult<()> {
        self.engine.transaction(|exec| {
            let kind: Option<String> = exec.query(SELECT_KIND, &params![chat_id], |rows| {
                rows.next().map(|row| row?.get(0)).transpose()
            })?;
            let Some(kind) = kind else {
                return Err(StorageError::UnknownChat(chat_id));
            };
            match kind.parse::<ChatKind>() {
                Ok(ChatKind::Group) => {}
                Ok(ChatKind::Personal) => {
                    let count = exec.scalar(COUNT_MEMBERS, &params![chat_id])?;
                    return Err(ConstructionError::PersonalMemberCount(count as usize + 1).into());
                }
                Err(err) => {
                    return Err(StorageError::Column {
                        index: 0,
                        message: err.to_string(),
                    })
                }
            }
            if !exec.exists(USER_EXISTS, &params![user_id])? {
                return Err(StorageError::UnknownMember(user_id));
            }
            exec.execute(INSERT_MEMBER, &params![chat_id, user_id])?;
            debug!("user {} joined chat {}", user_id, chat_id);
            Ok(())
        })
    }

    pub fn add_member(&self, chat_id: Id, user_id: Id) -> bool {
        reported("add chat member", self.try_add_member(chat_id, user_id)).is_some()
    }

    pub fn try_exists(&self, id: Id) -> StorageResult<bool> {
        self.engine.with_executor(|exec| exec.exists(CHAT_EXISTS, &params![id]))
    }

    /// Ids of the chats `user_id` belongs to, ascending.
    pub fn try_chats_of(&self, user_id: Id) -> StorageResult<Vec<Id>> {
        self.engine.query(
            "SELECT chat_id FROM ChatMembers WHERE user_id = ?1 ORDER BY chat_id",
            &params![user_id],
            |rows| rows.map(|row| row?.id(0)).collect(),
        )
    }

    pub fn chats_of(&self, user_id: Id) -> Vec<Id> {
        reported("list chats", self.try_chats_of(user_id)).unwrap_or_default()
    }

    /// Removes the chat. Its memberships and messages go with it through
    /// the schema's cascading foreign keys.
    pub fn try_delete(&self, id: Id) -> StorageResult<bool> {
        let removed = self.engine.execute("DELETE FROM Chats WHERE id = ?1", &params![id])?;
        Ok(removed == 1)
    }

    pub fn delete(&self, id: Id) -> bool {
        reported("delete chat", self.try_delete(id)).unwrap_or(false)
    }

    fn find_where(&self, condition: &str, key: Param) -> StorageResult<Option<Chat>> {
        let sql = format!("{SELECT_CHAT} WHERE {condition} ORDER BY c.id, m.user_id");
        self.engine.query(&sql, &[key], assemble)
    }
}

fn insert_chat(exec: &Executor<'_>, chat: &Chat) -> StorageResult<Id> {
    let id = exec.insert(INSERT_CHAT, &params![chat.name(), chat.kind().as_str()])?;
    for &member in chat.members() {
        if !exec.exists(USER_EXISTS, &params![member])? {
            return Err(StorageError::UnknownMember(member));
        }
        exec.execute(INSERT_MEMBER, &params![id, member])?;
    }
    Ok(id)
}

/// Folds the joined rows of one chat back into a [`Chat`]. Rows belonging to
/// a later chat (possible when looking up by name) end the fold.
fn assemble(rows: &mut RowStream<'_>) -> StorageResult<Option<Chat>> {
    let mut header: Option<(Id, Option<String>, Value)> = None;
    let mut members = BTreeSet::new();

    for row in rows {
        let row = row?;
        let chat_id = row.id(0)?;
        match &header {
            None => header = Some((chat_id, row.get(1)?, row.get(2)?)),
            Some((first, _, _)) if *first != chat_id => break,
            Some(_) => {}
        }
        members.insert(row.id(3)?);
    }

    let Some((id, name, kind)) = header else {
        return Ok(None);
    };
    let kind = match kind {
        Value::Text(text) => text.parse::<ChatKind>(),
        other => {
            warn!("chat {} has unreadable type {:?}", id, other);
            return Ok(None);
        }
    };
    let kind = match kind {
        Ok(kind) => kind,
        Err(err) => {
            warn!("chat {}: {}", id, err);
            return Ok(None);
        }
    };
    match Chat::restore(id, kind, name, members) {
        Ok(chat) => Ok(Some(chat)),
        Err(err) => {
            warn!("chat {} violates its invariants in the store: {}", id, err);
            Ok(None)
        }
    }
}
