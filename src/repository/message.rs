use chrono::NaiveDateTime;

use crate::error::{StorageError, StorageResult};
use crate::models::{Id, Message};
use crate::params;
use crate::repository::reported;
use crate::storage::{Engine, Param, Record};

const CHAT_EXISTS: &str = "SELECT 1 FROM Chats WHERE id = ?1";
const INSERT_MESSAGE: &str = "INSERT INTO Messages (sender_id, chat_id, text) VALUES (?1, ?2, ?3)";
const SELECT_TIMESTAMP: &str = "SELECT timestamp FROM Messages WHERE id = ?1";
const COLUMNS: &str = "SELECT id, chat_id, sender_id, text, timestamp, is_read FROM Messages";

pub struct MessageRepository<'e> {
    engine: &'e Engine,
}

impl<'e> MessageRepository<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        MessageRepository { engine }
    }

    /// Saves the message if its chat exists. The chat check and the insert
    /// run in one transaction, so a missing chat means nothing was written.
    pub fn try_save(&self, message: &mut Message) -> StorageResult<Id> {
        message.validate()?;
        let (id, sent_at) = self.engine.transaction(|exec| {
            if !exec.exists(CHAT_EXISTS, &params![message.chat_id])? {
                return Err(StorageError::UnknownChat(message.chat_id));
            }
            let id = exec.insert(
                INSERT_MESSAGE,
                &params![message.sender_id, message.chat_id, &message.text],
            )?;
            let sent_at: Option<NaiveDateTime> = exec.query(SELECT_TIMESTAMP, &params![id], |rows| {
                rows.next().map(|row| row?.get(0)).transpose()
            })?;
            Ok((id, sent_at))
        })?;
        message.id = Some(id);
        message.sent_at = sent_at;
        Ok(id)
    }

    pub fn save(&self, message: &mut Message) -> bool {
        reported("save message", self.try_save(message)).is_some()
    }

    pub fn try_find_by_id(&self, chat_id: Id, msg_id: Id) -> StorageResult<Option<Message>> {
        let sql = format!("{COLUMNS} WHERE chat_id = ?1 AND id = ?2");
        self.first(&sql, chat_id, msg_id.into())
    }

    pub fn find_by_id(&self, chat_id: Id, msg_id: Id) -> Option<Message> {
        reported("find message", self.try_find_by_id(chat_id, msg_id)).flatten()
    }

    /// Earliest message in the chat whose text matches exactly.
    pub fn try_find_by_text(&self, chat_id: Id, text: &str) -> StorageResult<Option<Message>> {
        let sql = format!("{COLUMNS} WHERE chat_id = ?1 AND text = ?2 ORDER BY id");
        self.first(&sql, chat_id, text.into())
    }

    pub fn find_by_text(&self, chat_id: Id, text: &str) -> Option<Message> {
        reported("find message", self.try_find_by_text(chat_id, text)).flatten()
    }

    /// All messages of a chat, oldest first.
    pub fn try_history(&self, chat_id: Id) -> StorageResult<Vec<Message>> {
        let sql = format!("{COLUMNS} WHERE chat_id = ?1 ORDER BY id");
        self.engine.query(&sql, &params![chat_id], |rows| {
            rows.map(|row| message_from(&row?)).collect()
        })
    }

    pub fn history(&self, chat_id: Id) -> Vec<Message> {
        reported("load history", self.try_history(chat_id)).unwrap_or_default()
    }

    /// Returns whether a row was removed.
    pub fn try_delete(&self, chat_id: Id, msg_id: Id) -> StorageResult<bool> {
        let removed = self.engine.execute(
            "DELETE FROM Messages WHERE chat_id = ?1 AND id = ?2",
            &params![chat_id, msg_id],
        )?;
        Ok(removed == 1)
    }

    pub fn delete(&self, chat_id: Id, msg_id: Id) -> bool {
        reported("delete message", self.try_delete(chat_id, msg_id)).unwrap_or(false)
    }

    pub fn try_mark_read(&self, chat_id: Id, msg_id: Id) -> StorageResult<bool> {
        let updated = self.engine.execute(
            "UPDATE Messages SET is_read = 1 WHERE chat_id = ?1 AND id = ?2",
            &params![chat_id, msg_id],
        )?;
        Ok(updated == 1)
    }

    pub fn mark_read(&self, chat_id: Id, msg_id: Id) -> bool {
        reported("mark message read", self.try_mark_read(chat_id, msg_id)).unwrap_or(false)
    }

    fn first(&self, sql: &str, chat_id: Id, key: Param) -> StorageResult<Option<Message>> {
        self.engine.query(sql, &[chat_id.into(), key], |rows| {
            rows.next().map(|row| message_from(&row?)).transpose()
        })
    }
}

fn message_from(record: &Record) -> StorageResult<Message> {
    Ok(Message {
        id: Some(record.id(0)?),
        chat_id: record.id(1)?,
        sender_id: record.id(2)?,
        text: record.get(3)?,
        sent_at: record.get(4)?,
        read: record.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConstructionError;
    use crate::models::{Chat, User};
    use crate::storage::Table;

    fn setup_in_memory_db() -> Engine {
        Engine::open_in_memory().unwrap()
    }

    /// Two users and a personal chat between them.
    fn seed(engine: &Engine) -> (Id, Id, Id) {
        let mut alice = User::new("Alice", "pwA");
        let mut bob = User::new("Bob", "pwB");
        assert!(engine.users().save(&mut alice));
        assert!(engine.users().save(&mut bob));
        let mut chat = Chat::personal(alice.id.unwrap(), bob.id.unwrap()).unwrap();
        assert!(engine.chats().save(&mut chat));
        (chat.id().unwrap(), alice.id.unwrap(), bob.id.unwrap())
    }

    #[test]
    fn test_save_and_find_message() {
        let engine = setup_in_memory_db();
        let (chat_id, alice, _) = seed(&engine);
        let messages = engine.messages();

        let mut msg = Message::new(chat_id, alice, "hello").unwrap();
        assert!(messages.save(&mut msg));
        let id = msg.id.unwrap();
        assert!(msg.sent_at.is_some());

        assert_eq!(messages.find_by_id(chat_id, id), Some(msg.clone()));
        assert_eq!(messages.find_by_text(chat_id, "hello"), Some(msg));
        assert_eq!(messages.find_by_text(chat_id, "hell"), None);
    }

    #[test]
    fn test_message_for_missing_chat_is_not_saved() {
        let engine = setup_in_memory_db();
        let (_, alice, _) = seed(&engine);
        let messages = engine.messages();

        let mut msg = Message::new(Id(999), alice, "lost").unwrap();
        assert!(!messages.save(&mut msg));
        assert_eq!(msg.id, None);
        assert_eq!(engine.table_size(Table::Messages).unwrap(), 0);
        assert!(matches!(messages.try_save(&mut msg), Err(StorageError::UnknownChat(Id(999)))));
    }

    #[test]
    fn test_emptied_message_is_not_saved() {
        let engine = setup_in_memory_db();
        let (chat_id, alice, _) = seed(&engine);
        let mut msg = Message::new(chat_id, alice, "x").unwrap();
        msg.text.clear();

        assert!(!engine.messages().save(&mut msg));
        assert!(matches!(
            engine.messages().try_save(&mut msg),
            Err(StorageError::Rejected(ConstructionError::EmptyMessageText))
        ));
        assert_eq!(msg.id, None);
        assert_eq!(engine.table_size(Table::Messages).unwrap(), 0);
    }

    #[test]
    fn test_message_from_unknown_sender_is_rejected() {
        let engine = setup_in_memory_db();
        let (chat_id, _, _) = seed(&engine);
        let mut msg = Message::new(chat_id, Id(12345), "who?").unwrap();
        assert!(!engine.messages().save(&mut msg));
        assert_eq!(msg.id, None);
        assert_eq!(engine.table_size(Table::Messages).unwrap(), 0);
    }

    #[test]
    fn test_find_is_scoped_to_chat() {
        let engine = setup_in_memory_db();
        let (chat_id, alice, _) = seed(&engine);
        let mut msg = Message::new(chat_id, alice, "scoped").unwrap();
        engine.messages().save(&mut msg);
        let other_chat = Id(chat_id.0 + 1);
        assert_eq!(engine.messages().find_by_id(other_chat, msg.id.unwrap()), None);
        assert_eq!(engine.messages().find_by_text(other_chat, "scoped"), None);
    }

    #[test]
    fn test_delete_message() {
        let engine = setup_in_memory_db();
        let (chat_id, alice, bob) = seed(&engine);
        let messages = engine.messages();

        let mut first = Message::new(chat_id, alice, "one").unwrap();
        let mut second = Message::new(chat_id, bob, "two").unwrap();
        messages.save(&mut first);
        messages.save(&mut second);

        assert!(!messages.delete(chat_id, Id(777)));
        assert_eq!(engine.table_size(Table::Messages).unwrap(), 2);

        assert!(messages.delete(chat_id, first.id.unwrap()));
        assert_eq!(engine.table_size(Table::Messages).unwrap(), 1);
        assert!(!messages.delete(chat_id, first.id.unwrap()));
        assert_eq!(messages.find_by_id(chat_id, first.id.unwrap()), None);
    }

    #[test]
    fn test_history_and_mark_read() {
        let engine = setup_in_memory_db();
        let (chat_id, alice, bob) = seed(&engine);
        let messages = engine.messages();

        for (sender, text) in [(alice, "hi"), (bob, "hey"), (alice, "how are you")] {
            let mut msg = Message::new(chat_id, sender, text).unwrap();
            assert!(messages.save(&mut msg));
        }

        let history = messages.history(chat_id);
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["hi", "hey", "how are you"]);
        assert!(history.iter().all(|m| !m.read));

        let second = history[1].id.unwrap();
        assert!(messages.mark_read(chat_id, second));
        assert!(messages.find_by_id(chat_id, second).unwrap().read);
        assert!(!messages.mark_read(chat_id, Id(9999)));
    }

    #[test]
    fn test_deleting_chat_removes_its_messages() {
        let engine = setup_in_memory_db();
        let (chat_id, alice, _) = seed(&engine);
        let mut msg = Message::new(chat_id, alice, "bye").unwrap();
        engine.messages().save(&mut msg);

        assert!(engine.chats().delete(chat_id));
        assert_eq!(engine.table_size(Table::Messages).unwrap(), 0);
        assert!(engine.messages().history(chat_id).is_empty());
    }
}
