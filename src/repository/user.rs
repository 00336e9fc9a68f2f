use crate::error::StorageResult;
use crate::models::{Id, User};
use crate::params;
use crate::repository::reported;
use crate::storage::{Engine, Param, Record};

const INSERT_USER: &str = "INSERT INTO Users (name, password) VALUES (?1, ?2)";
const SELECT_BY_NAME: &str = "SELECT id, name, password FROM Users WHERE name = ?1";
const SELECT_BY_ID: &str = "SELECT id, name, password FROM Users WHERE id = ?1";

pub struct UserRepository<'e> {
    engine: &'e Engine,
}

impl<'e> UserRepository<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        UserRepository { engine }
    }

    /// Inserts the user and records the assigned id on it. A duplicate name
    /// is rejected by the store and leaves `user.id` untouched.
    pub fn try_save(&self, user: &mut User) -> StorageResult<Id> {
        let id = self
            .engine
            .with_executor(|exec| exec.insert(INSERT_USER, &params![&user.name, &user.password_hash]))?;
        user.id = Some(id);
        Ok(id)
    }

    pub fn save(&self, user: &mut User) -> bool {
        reported("save user", self.try_save(user)).is_some()
    }

    pub fn try_find_by_name(&self, name: &str) -> StorageResult<Option<User>> {
        self.find_one(SELECT_BY_NAME, name.into())
    }

    pub fn find_by_name(&self, name: &str) -> Option<User> {
        reported("find user", self.try_find_by_name(name)).flatten()
    }

    pub fn try_find_by_id(&self, id: Id) -> StorageResult<Option<User>> {
        self.find_one(SELECT_BY_ID, id.into())
    }

    pub fn find_by_id(&self, id: Id) -> Option<User> {
        reported("find user", self.try_find_by_id(id)).flatten()
    }

    fn find_one(&self, sql: &str, key: Param) -> StorageResult<Option<User>> {
        self.engine
            .query(sql, &[key], |rows| rows.next().map(|row| user_from(&row?)).transpose())
    }
}

fn user_from(record: &Record) -> StorageResult<User> {
    Ok(User {
        id: Some(record.id(0)?),
        name: record.get(1)?,
        password_hash: record.get(2)?,
    })
}
