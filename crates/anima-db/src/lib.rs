pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::Database;
pub use error::{DbError, Result};
pub use types::{Conversation, ConversationKind, MessageRecord, MessageRole, NewMessage};
