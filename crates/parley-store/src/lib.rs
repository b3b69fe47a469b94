pub mod conversations;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;

pub use conversations::{ConversationRepo, ConversationStore};
pub use database::Database;
pub use error::StoreError;
