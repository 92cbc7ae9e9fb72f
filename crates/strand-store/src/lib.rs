pub mod store;

pub use store::{ConversationTotals, SqliteStore};
