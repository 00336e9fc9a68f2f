pub mod config;
pub mod error;
pub mod hash;
pub mod models;
pub mod protocol;
pub mod repository;
pub mod server;
pub mod storage;

pub use error::{ConstructionError, InitError, StorageError};
pub use models::{Chat, ChatKind, Id, Message, User};
pub use storage::{Engine, Schema, StoreLocation, Table};
