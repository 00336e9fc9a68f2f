//! Entity facades over the [`Engine`](crate::storage::Engine).
//!
//! Each operation comes in two shapes: `try_*` returns the full
//! [`StorageResult`], the plain form collapses a storage failure into
//! `false` / `None` after logging it.

mod chat;
mod message;
mod user;

use log::warn;

use crate::error::StorageResult;

pub use chat::ChatRepository;
pub use message::MessageRepository;
pub use user::UserRepository;

fn reported<T>(operation: &str, result: StorageResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("{} failed: {}", operation, err);
            None
        }
    }
}
