//! The persistence engine: one SQLite connection behind one mutex.
//!
//! Every statement, and every multi-statement transaction, holds the mutex
//! for its whole duration, so callers on different threads never interleave
//! inside the store.

mod executor;
mod param;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{info, warn};
use rusqlite::Connection;

use crate::error::{InitError, StorageError, StorageResult};
use crate::repository::{ChatRepository, MessageRepository, UserRepository};

pub use executor::{Executor, Record, RowStream};
pub use param::Param;

pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(5);

const EMBEDDED_SCHEMA: &str = include_str!("../../assets/sql/create_db.sql");

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// Private to this engine and discarded when it closes.
    Memory,
    File(PathBuf),
}

impl StoreLocation {
    /// `:memory:` selects the ephemeral store, anything else is a path.
    pub fn parse(raw: &str) -> Self {
        if raw == ":memory:" {
            StoreLocation::Memory
        } else {
            StoreLocation::File(PathBuf::from(raw))
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::Memory => f.write_str(":memory:"),
            StoreLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Source of the `CREATE TABLE` statements run at init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schema {
    /// The copy of `assets/sql/create_db.sql` compiled into the crate.
    Embedded,
    File(PathBuf),
}

impl Schema {
    fn load(&self) -> Result<String, InitError> {
        match self {
            Schema::Embedded => Ok(EMBEDDED_SCHEMA.to_string()),
            Schema::File(path) => std::fs::read_to_string(path).map_err(|source| InitError::SchemaSource {
                path: path.clone(),
                source,
            }),
        }
    }
}

/// The persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Users,
    Chats,
    ChatMembers,
    Messages,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "Users",
            Table::Chats => "Chats",
            Table::ChatMembers => "ChatMembers",
            Table::Messages => "Messages",
        }
    }
}

pub struct Engine {
    conn: Mutex<Option<Connection>>,
    timeout: Duration,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::closed()
    }
}

impl Engine {
    /// An engine with no connection. Every operation on it fails with
    /// [`StorageError::Closed`] until [`Engine::init`] succeeds.
    pub fn closed() -> Self {
        Engine {
            conn: Mutex::new(None),
            timeout: DEFAULT_STATEMENT_TIMEOUT,
        }
    }

    pub fn open(location: &StoreLocation, schema: &Schema, timeout: Duration) -> Result<Self, InitError> {
        let mut engine = Engine::closed();
        engine.timeout = timeout;
        engine.init(location, schema)?;
        Ok(engine)
    }

    /// In-memory store with the embedded schema.
    pub fn open_in_memory() -> Result<Self, InitError> {
        Engine::open(&StoreLocation::Memory, &Schema::Embedded, DEFAULT_STATEMENT_TIMEOUT)
    }

    /// Opens a fresh connection, replacing (and closing) any current one.
    /// On failure the engine is left closed.
    pub fn init(&mut self, location: &StoreLocation, schema: &Schema) -> Result<(), InitError> {
        self.close();
        let sql = schema.load()?;
        let conn = connect(location, self.timeout)?;
        conn.execute_batch(&sql).map_err(InitError::Schema)?;
        info!("store opened at {}", location);
        *self.slot() = Some(conn);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.slot().is_none()
    }

    pub fn close(&mut self) {
        if let Some(conn) = self.slot().take() {
            if let Err((_, err)) = conn.close() {
                warn!("error while closing store: {}", err);
            }
            info!("store closed");
        }
    }

    /// Moves the connection into a new engine and leaves `self` closed.
    pub fn take(&mut self) -> Engine {
        Engine {
            conn: Mutex::new(self.slot().take()),
            timeout: self.timeout,
        }
    }

    pub fn statement_timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `f` with exclusive use of the connection.
    pub fn with_executor<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Executor<'_>) -> StorageResult<T>,
    {
        let guard = self.lock()?;
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        f(&Executor::new(conn, self.timeout))
    }

    /// Runs `f` inside one transaction: committed if `f` succeeds, rolled
    /// back otherwise.
    pub fn transaction<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Executor<'_>) -> StorageResult<T>,
    {
        let mut guard = self.lock()?;
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;
        let tx = conn.transaction()?;
        let value = f(&Executor::new(&tx, self.timeout))?;
        tx.commit()?;
        Ok(value)
    }

    pub fn execute(&self, sql: &str, params: &[Param]) -> StorageResult<usize> {
        self.with_executor(|exec| exec.execute(sql, params))
    }

    pub fn query<T, F>(&self, sql: &str, params: &[Param], consume: F) -> StorageResult<T>
    where
        F: FnOnce(&mut RowStream<'_>) -> StorageResult<T>,
    {
        self.with_executor(|exec| exec.query(sql, params, consume))
    }

    /// Row count of `table`.
    pub fn table_size(&self, table: Table) -> StorageResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        self.with_executor(|exec| exec.scalar(&sql, &[]))
    }

    pub fn users(&self) -> UserRepository<'_> {
        UserRepository::new(self)
    }

    pub fn messages(&self) -> MessageRepository<'_> {
        MessageRepository::new(self)
    }

    pub fn chats(&self) -> ChatRepository<'_> {
        ChatRepository::new(self)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Option<Connection>>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Slot access for the `&mut self` paths, where poisoning cannot block us.
    fn slot(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("closed", &self.is_closed())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn connect(location: &StoreLocation, timeout: Duration) -> Result<Connection, InitError> {
    let opened = match location {
        StoreLocation::Memory => Connection::open_in_memory(),
        StoreLocation::File(path) => Connection::open(Path::new(path)),
    };
    let conn = opened.map_err(|source| InitError::Open {
        location: location.to_string(),
        source,
    })?;
    conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(InitError::Pragma)?;
    conn.busy_timeout(timeout).map_err(InitError::Pragma)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;
    use std::sync::Arc;
    use std::thread;

    fn setup_in_memory_db() -> Engine {
        Engine::open_in_memory().unwrap()
    }

    #[test]
    fn test_init_creates_empty_tables() {
        let engine = setup_in_memory_db();
        assert!(!engine.is_closed());
        for table in [Table::Users, Table::Chats, Table::ChatMembers, Table::Messages] {
            assert_eq!(engine.table_size(table).unwrap(), 0, "{}", table.name());
        }
    }

    #[test]
    fn test_foreign_keys_are_enforced() {
        let engine = setup_in_memory_db();
        let err = engine
            .execute("INSERT INTO ChatMembers (chat_id, user_id) VALUES (?1, ?2)", &params![99_i64, 99_i64])
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_closed_engine_refuses_work() {
        let engine = Engine::closed();
        assert!(engine.is_closed());
        assert!(matches!(engine.table_size(Table::Users), Err(StorageError::Closed)));
        assert!(matches!(engine.transaction(|_| Ok(())), Err(StorageError::Closed)));
    }

    #[test]
    fn test_missing_schema_file_leaves_engine_closed() {
        let mut engine = Engine::closed();
        let err = engine
            .init(&StoreLocation::Memory, &Schema::File(PathBuf::from("/nonexistent/create_db.sql")))
            .unwrap_err();
        assert!(matches!(err, InitError::SchemaSource { .. }));
        assert!(engine.is_closed());
    }

    #[test]
    fn test_broken_schema_leaves_engine_closed() {
        let dir = tempfile::tempdir().unwrap();
        let schema = dir.path().join("broken.sql");
        std::fs::write(&schema, "CREATE TABLE (;").unwrap();
        let mut engine = Engine::closed();
        let err = engine.init(&StoreLocation::Memory, &Schema::File(schema)).unwrap_err();
        assert!(matches!(err, InitError::Schema(_)));
        assert!(engine.is_closed());
    }

    #[test]
    fn test_unopenable_location_is_an_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let location = StoreLocation::File(dir.path().join("missing").join("chat.db"));
        let err = Engine::open(&location, &Schema::Embedded, DEFAULT_STATEMENT_TIMEOUT).unwrap_err();
        assert!(matches!(err, InitError::Open { .. }));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let location = StoreLocation::File(dir.path().join("chat.db"));
        {
            let engine = Engine::open(&location, &Schema::Embedded, DEFAULT_STATEMENT_TIMEOUT).unwrap();
            engine
                .execute("INSERT INTO Users (name, password) VALUES (?1, ?2)", &params!["Alice", "pw"])
                .unwrap();
        }
        let engine = Engine::open(&location, &Schema::Embedded, DEFAULT_STATEMENT_TIMEOUT).unwrap();
        assert_eq!(engine.table_size(Table::Users).unwrap(), 1);
    }

    #[test]
    fn test_take_leaves_source_closed_and_reusable() {
        let mut source = setup_in_memory_db();
        source
            .execute("INSERT INTO Users (name, password) VALUES (?1, ?2)", &params!["Alice", "pw"])
            .unwrap();

        let moved = source.take();
        assert!(source.is_closed());
        assert_eq!(moved.table_size(Table::Users).unwrap(), 1);

        source.init(&StoreLocation::Memory, &Schema::Embedded).unwrap();
        assert_eq!(source.table_size(Table::Users).unwrap(), 0);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let engine = setup_in_memory_db();
        let result: StorageResult<()> = engine.transaction(|exec| {
            exec.execute("INSERT INTO Users (name, password) VALUES (?1, ?2)", &params!["Alice", "pw"])?;
            exec.execute("INSERT INTO Users (name, password) VALUES (?1, ?2)", &params!["Alice", "pw"])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(engine.table_size(Table::Users).unwrap(), 0);
    }

    #[test]
    fn test_parallel_writers_are_serialized() {
        let engine = Arc::new(setup_in_memory_db());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    engine
                        .execute(
                            "INSERT INTO Users (name, password) VALUES (?1, ?2)",
                            &params![format!("user-{n}"), "pw"],
                        )
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
        assert_eq!(engine.table_size(Table::Users).unwrap(), 8);
    }

    #[test]
    fn test_store_location_parse() {
        assert_eq!(StoreLocation::parse(":memory:"), StoreLocation::Memory);
        assert_eq!(
            StoreLocation::parse("./chat.db"),
            StoreLocation::File(PathBuf::from("./chat.db"))
        );
    }
}
